//! Emulated module images.
//!
//! A [`Module`] is one loaded image of the emulated process. It owns a slice of the
//! address space starting at its image base: the lower half holds metadata written by
//! the [`emit`](crate::metadata::emit) builders, the upper half is the code address range
//! that native closures are bound into. Image-relative metadata references on table
//! architectures are resolved against the module's base.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    arch::Arch,
    exception::ExceptionRecord,
    memory::{AddressSpace, MemoryProtection},
    metadata::{emit_type_descriptor, EmittedFunction, FunctionDescriptorBuilder, ImageWriter},
    runtime::{
        code::NativeCode,
        thread::Entry,
        transfer::{ContinueSearch, Flow},
        Runtime, Thread,
    },
    Error, Result,
};

/// Default size of an emulated function's stack frame.
pub const DEFAULT_FRAME_SIZE: usize = 128;

const DATA_ALIGN: u64 = 8;
const CODE_ALIGN: u64 = 4;

/// Bump allocation within one image.
#[derive(Debug)]
pub(crate) struct ImageSpace {
    base: u64,
    size: u64,
    data_cursor: AtomicU64,
    code_cursor: AtomicU64,
}

impl ImageSpace {
    /// Maps the image at `base`.
    pub(crate) fn map(space: &AddressSpace, base: u64, size: usize, label: &str) -> Result<Self> {
        space.map(base, size, MemoryProtection::READ_WRITE_EXECUTE, label)?;

        let size = size as u64;
        // Offset zero stays unused: an image-relative reference of zero is null
        Ok(Self {
            base,
            size,
            data_cursor: AtomicU64::new(base + DATA_ALIGN),
            code_cursor: AtomicU64::new(base + size / 2),
        })
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn reserve(&self, size: usize) -> Result<u64> {
        let rounded = (size.max(1) as u64).div_ceil(DATA_ALIGN) * DATA_ALIGN;
        let address = self.data_cursor.fetch_add(rounded, Ordering::Relaxed);
        if address + rounded > self.base + self.size / 2 {
            return Err(Error::OutOfMemory(format!(
                "image data at 0x{:X} exhausted",
                self.base
            )));
        }
        Ok(address)
    }

    pub(crate) fn reserve_code(&self, size: usize) -> Result<u64> {
        let rounded = (size.max(1) as u64).div_ceil(CODE_ALIGN) * CODE_ALIGN;
        let address = self.code_cursor.fetch_add(rounded, Ordering::Relaxed);
        if address + rounded > self.base + self.size {
            return Err(Error::OutOfMemory(format!(
                "image code at 0x{:X} exhausted",
                self.base
            )));
        }
        Ok(address)
    }
}

/// How to call an emulated function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionSpec {
    /// Name for diagnostics
    pub name: String,
    /// Entry point
    pub entry: u64,
    /// Function descriptor, if the function has exception state
    pub descriptor: Option<u64>,
    /// Frame handler thunk, if the function has exception state
    pub handler: Option<u64>,
    /// Image base of the owning module
    pub image_base: u64,
    /// Stack frame size in bytes
    pub frame_size: usize,
}

impl FunctionSpec {
    /// Overrides the stack frame size.
    #[must_use]
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Returns `true` if the function has a frame handler.
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

/// A loaded module image.
///
/// # Examples
///
/// ```rust
/// use cxxframe::{Runtime, RuntimeConfig};
///
/// let runtime = Runtime::new(RuntimeConfig::x86_64())?;
/// let module = runtime.load_module("app.exe")?;
/// let destructor = module.bind_destructor(|_thread, _object| Ok(()))?;
/// assert!(module.contains(destructor));
/// # Ok::<(), cxxframe::Error>(())
/// ```
pub struct Module {
    name: String,
    runtime: Arc<Runtime>,
    image: ImageSpace,
}

impl Module {
    pub(crate) fn new(name: String, runtime: Arc<Runtime>, image: ImageSpace) -> Self {
        Self {
            name,
            runtime,
            image,
        }
    }

    /// Name of the module.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime the module is loaded into.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Checks whether `address` lies inside the image.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.image.base && address < self.image.base + self.image.size
    }

    fn bind(&self, code: NativeCode) -> Result<u64> {
        let address = self.image.reserve_code(16)?;
        log::trace!(
            "{}: bound {} at 0x{:X}",
            self.name,
            code.kind(),
            address
        );
        self.runtime.code().bind(address, code);
        Ok(address)
    }

    /// Binds a cleanup funclet and returns its code address.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's code range is exhausted.
    pub fn bind_cleanup<F>(&self, cleanup: F) -> Result<u64>
    where
        F: Fn(&mut Thread, u64) -> Flow<()> + Send + Sync + 'static,
    {
        self.bind(NativeCode::Cleanup(Arc::new(cleanup)))
    }

    /// Binds a catch handler body and returns its code address.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's code range is exhausted.
    pub fn bind_catch<F>(&self, handler: F) -> Result<u64>
    where
        F: Fn(&mut Thread, Entry) -> Flow<u64> + Send + Sync + 'static,
    {
        self.bind(NativeCode::Catch(Arc::new(handler)))
    }

    /// Binds a copy constructor and returns its code address.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's code range is exhausted.
    pub fn bind_copy_constructor<F>(&self, constructor: F) -> Result<u64>
    where
        F: Fn(&mut Thread, u64, u64, bool) -> Flow<()> + Send + Sync + 'static,
    {
        self.bind(NativeCode::CopyConstructor(Arc::new(constructor)))
    }

    /// Binds a destructor and returns its code address.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's code range is exhausted.
    pub fn bind_destructor<F>(&self, destructor: F) -> Result<u64>
    where
        F: Fn(&mut Thread, u64) -> Flow<()> + Send + Sync + 'static,
    {
        self.bind(NativeCode::Destructor(Arc::new(destructor)))
    }

    /// Binds a custom frame handler and returns its code address.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's code range is exhausted.
    pub fn bind_custom_handler<F>(&self, handler: F) -> Result<u64>
    where
        F: Fn(&mut Thread, &mut ExceptionRecord, u64, u64) -> Flow<ContinueSearch>
            + Send
            + Sync
            + 'static,
    {
        self.bind(NativeCode::CustomHandler(Arc::new(handler)))
    }

    /// Writes a type descriptor for the decorated name `mangled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is full.
    pub fn type_descriptor(&self, mangled: &str) -> Result<u64> {
        emit_type_descriptor(self, mangled)
    }

    /// Emits `descriptor` and returns a function with a frame handler for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is full.
    pub fn function(&self, name: &str, descriptor: &FunctionDescriptorBuilder) -> Result<FunctionSpec> {
        let EmittedFunction { descriptor, entry } = descriptor.build(self)?;
        let handler = self.bind(NativeCode::FrameHandler { descriptor })?;
        log::debug!(
            "{}: function '{}' entry 0x{:X} descriptor 0x{:X}",
            self.name,
            name,
            entry,
            descriptor
        );

        Ok(FunctionSpec {
            name: name.to_string(),
            entry,
            descriptor: Some(descriptor),
            handler: Some(handler),
            image_base: self.image.base,
            frame_size: DEFAULT_FRAME_SIZE,
        })
    }

    /// Returns a function without exception state.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's code range is exhausted.
    pub fn plain_function(&self, name: &str) -> Result<FunctionSpec> {
        Ok(FunctionSpec {
            name: name.to_string(),
            entry: self.image.reserve_code(16)?,
            descriptor: None,
            handler: None,
            image_base: self.image.base,
            frame_size: DEFAULT_FRAME_SIZE,
        })
    }
}

impl ImageWriter for Module {
    fn arch(&self) -> Arch {
        self.runtime.arch()
    }

    fn image_base(&self) -> u64 {
        self.image.base
    }

    fn space(&self) -> &AddressSpace {
        self.runtime.space()
    }

    fn reserve(&self, size: usize) -> Result<u64> {
        self.image.reserve(size)
    }

    fn reserve_code(&self, size: usize) -> Result<u64> {
        self.image.reserve_code(size)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("image_base", &format_args!("0x{:X}", self.image.base))
            .finish()
    }
}
