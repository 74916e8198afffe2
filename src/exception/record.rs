//! OS-level exception records.
//!
//! An [`ExceptionRecord`] is what the host dispatcher hands to every frame handler. A
//! C++ exception is recognised by its code, [`CXX_EXCEPTION`], and carries the thrown
//! object and its throw info in its parameters:
//!
//! | Index | Content |
//! |-------|---------|
//! | 0 | version tag, [`MAGIC_V1`] |
//! | 1 | address of the thrown object |
//! | 2 | address of the [`ThrowInfo`](crate::metadata::ThrowInfo) |
//! | 3 | image base of the throwing module (table architectures only) |
//!
//! A rethrow (`throw;`) raises a record whose object and throw info are both null; the
//! frame handlers substitute the record of the exception currently being handled.

use bitflags::bitflags;

use crate::{
    arch::{Arch, DispatchModel},
    metadata::{Addressing, MAGIC_V1, MAGIC_V3},
};

/// Exception code of C++ exceptions (`'msc'` | 0xE0000000).
pub const CXX_EXCEPTION: u32 = 0xE06D_7363;
/// Exception code of unwind requests that re-enter a frame to run a catch handler.
pub const STATUS_UNWIND_CONSOLIDATE: u32 = 0x8000_0029;
/// Exception code of unwind requests issued by a long jump.
pub const STATUS_LONGJUMP: u32 = 0x8000_0026;
/// Exception code of plain unwind requests without an exception record.
pub const STATUS_UNWIND: u32 = 0xC000_0027;

bitflags! {
    /// Exception record flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
    pub struct ExceptionFlags: u32 {
        /// Execution cannot continue after the faulting instruction.
        const NONCONTINUABLE = 0x01;
        /// The record is delivered during the unwind phase.
        const UNWINDING = 0x02;
        /// The unwind has no target frame: the thread is exiting.
        const EXIT_UNWIND = 0x04;
        /// The stack is invalid.
        const STACK_INVALID = 0x08;
        /// The record was raised while another one was being dispatched.
        const NESTED_CALL = 0x10;
        /// The receiving frame is the unwind target.
        const TARGET_UNWIND = 0x20;
        /// A collided unwind.
        const COLLIDED_UNWIND = 0x40;
    }
}

/// An exception record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Exception code
    pub code: u32,
    /// Dispatch flags
    pub flags: ExceptionFlags,
    /// Address the exception was raised at
    pub address: u64,
    /// Exception parameters
    pub params: Vec<u64>,
    /// Chained record
    pub nested: Option<Box<ExceptionRecord>>,
}

impl ExceptionRecord {
    /// Creates a record without parameters.
    #[must_use]
    pub fn new(code: u32, flags: ExceptionFlags) -> Self {
        Self {
            code,
            flags,
            address: 0,
            params: Vec::new(),
            nested: None,
        }
    }

    /// Creates the record of a C++ `throw`.
    ///
    /// A null `object` together with a null `throw_info` is a rethrow.
    #[must_use]
    pub fn cxx(arch: Arch, object: u64, throw_info: u64, image_base: u64) -> Self {
        let mut params = vec![u64::from(MAGIC_V1), object, throw_info];
        if arch.dispatch_model() == DispatchModel::Table {
            params.push(image_base);
        }

        Self {
            code: CXX_EXCEPTION,
            flags: ExceptionFlags::NONCONTINUABLE,
            address: 0,
            params,
            nested: None,
        }
    }

    /// Returns parameter `index`, or zero if absent.
    #[must_use]
    pub fn param(&self, index: usize) -> u64 {
        self.params.get(index).copied().unwrap_or(0)
    }

    /// Returns `true` for a C++ exception.
    #[must_use]
    pub fn is_cxx(&self) -> bool {
        self.code == CXX_EXCEPTION && self.params.len() >= 3
    }

    /// Returns `true` for a C++ exception whose version tag lies in the range this
    /// runtime understands.
    #[must_use]
    pub fn has_known_magic(&self) -> bool {
        self.is_cxx() && (u64::from(MAGIC_V1)..=u64::from(MAGIC_V3)).contains(&self.param(0))
    }

    /// Returns the version tag of a C++ exception.
    #[must_use]
    pub fn magic(&self) -> u32 {
        self.param(0) as u32
    }

    /// Returns the thrown object.
    #[must_use]
    pub fn object(&self) -> u64 {
        self.param(1)
    }

    /// Returns the throw info address.
    #[must_use]
    pub fn throw_info(&self) -> u64 {
        self.param(2)
    }

    /// Returns the image base of the throwing module.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.param(3)
    }

    /// Returns `true` for a rethrow: a C++ record without object and throw info.
    #[must_use]
    pub fn is_rethrow(&self) -> bool {
        self.code == CXX_EXCEPTION && self.object() == 0 && self.throw_info() == 0
    }

    /// Checks whether `self` and `other` carry the same thrown object and throw info.
    #[must_use]
    pub fn same_object(&self, other: &ExceptionRecord) -> bool {
        other.code == CXX_EXCEPTION
            && self.object() == other.object()
            && self.throw_info() == other.throw_info()
    }

    /// How references inside the record's throw info are encoded.
    #[must_use]
    pub fn throw_addressing(&self, arch: Arch) -> Addressing {
        Addressing::for_arch(arch, self.image_base())
    }

    /// Returns `true` if the record is delivered during an unwind.
    #[must_use]
    pub fn is_unwinding(&self) -> bool {
        self.flags
            .intersects(ExceptionFlags::UNWINDING | ExceptionFlags::EXIT_UNWIND)
    }
}
