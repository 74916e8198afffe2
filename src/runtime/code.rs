//! Native implementations bound to emulated code addresses.
//!
//! Compiler-emitted metadata refers to code by address: cleanup funclets, catch handlers,
//! copy constructors, destructors and frame handler thunks. The [`CodeMap`] binds each of
//! those addresses to the Rust closure or runtime routine that implements it, and the
//! dispatcher looks the address up whenever the metadata tells it to call one.

use std::sync::Arc;

use dashmap::DashMap;
use strum::IntoStaticStr;

use crate::{
    exception::ExceptionRecord,
    runtime::{
        thread::Entry,
        transfer::{ContinueSearch, Flow},
        Thread,
    },
    Error, Result,
};

/// A cleanup funclet: runs the destructors of one scope.
///
/// Receives the frame pointer (i386) or the establisher frame (table architectures).
pub type CleanupFn = Arc<dyn Fn(&mut Thread, u64) -> Flow<()> + Send + Sync>;

/// A catch handler body.
///
/// Returns the code address execution continues at once the handler finishes.
pub type CatchFn = Arc<dyn Fn(&mut Thread, Entry) -> Flow<u64> + Send + Sync>;

/// A copy constructor: `(destination, source, has_virtual_bases)`.
pub type CopyConstructorFn = Arc<dyn Fn(&mut Thread, u64, u64, bool) -> Flow<()> + Send + Sync>;

/// A destructor of a thrown object.
pub type DestructorFn = Arc<dyn Fn(&mut Thread, u64) -> Flow<()> + Send + Sync>;

/// A custom frame handler named by a throw info.
///
/// Receives the record, the frame (registration record or establisher), and the function
/// descriptor, and decides alone whether the frame handles the exception.
pub type CustomHandlerFn =
    Arc<dyn Fn(&mut Thread, &mut ExceptionRecord, u64, u64) -> Flow<ContinueSearch> + Send + Sync>;

/// What is bound at a code address.
#[derive(Clone, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum NativeCode {
    /// The C++ frame handler thunk of one function
    FrameHandler {
        /// The function's descriptor
        descriptor: u64,
    },
    /// The handler of the guard frame installed around a running catch handler
    NestedGuard,
    /// The local unwind routine recorded in i386 jump buffers
    LongjmpUnwind,
    /// The consolidation callback that runs a catch handler from inside an unwind
    Consolidate,
    /// A cleanup funclet
    Cleanup(CleanupFn),
    /// A catch handler body
    Catch(CatchFn),
    /// A copy constructor
    CopyConstructor(CopyConstructorFn),
    /// A destructor
    Destructor(DestructorFn),
    /// A custom frame handler
    CustomHandler(CustomHandlerFn),
}

impl NativeCode {
    /// Short name of the binding kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Debug for NativeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeCode::FrameHandler { descriptor } => f
                .debug_struct("FrameHandler")
                .field("descriptor", &format_args!("0x{descriptor:X}"))
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// Code address bindings of an emulated process.
#[derive(Debug, Default)]
pub struct CodeMap {
    bindings: DashMap<u64, NativeCode>,
}

impl CodeMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `code` at `address`, replacing any previous binding.
    pub fn bind(&self, address: u64, code: NativeCode) {
        self.bindings.insert(address, code);
    }

    /// Returns the binding at `address`.
    ///
    /// The binding is cloned out of the map, so it may be invoked while other
    /// bindings are added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnboundCode`] if nothing is bound there.
    pub fn get(&self, address: u64) -> Result<NativeCode> {
        self.bindings
            .get(&address)
            .map(|entry| entry.value().clone())
            .ok_or(Error::UnboundCode(address))
    }

    /// Checks whether `address` is bound.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.bindings.contains_key(&address)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns `true` if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Builds the error for a binding of the wrong kind.
pub(crate) fn mismatch(address: u64, expected: &'static str, found: &NativeCode) -> Error {
    Error::CodeKindMismatch {
        address,
        expected,
        found: found.kind(),
    }
}
