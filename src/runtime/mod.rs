//! The emulated process: address space, code bindings, modules and threads.
//!
//! A [`Runtime`] is the process-wide half of the emulation. It owns the
//! [`AddressSpace`] every structure lives in, the [`CodeMap`] that binds code addresses
//! to native closures, and the runtime's own image holding the thunks the dispatcher
//! installs (the nested-exception guard, the i386 long jump unwinder and the catch
//! consolidation callback). Modules are loaded into consecutive images above it, and each
//! [`Thread`] gets its own stack and exception state.
//!
//! # Key Components
//!
//! - [`Runtime`] - The process
//! - [`Module`] - A loaded image with bindings and emitted metadata
//! - [`Thread`] - An emulated thread; calls functions, throws, long-jumps
//! - [`ControlTransfer`] - Per-architecture register capture for jump buffers
//!
//! # Example
//!
//! ```rust
//! use cxxframe::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::i386())?;
//! let module = runtime.load_module("app.exe")?;
//! let mut thread = runtime.spawn_thread()?;
//!
//! let function = module.plain_function("main")?;
//! let result = thread.call(&function, |_thread, _entry| Ok(42));
//! assert_eq!(result, Ok(42));
//! # Ok::<(), cxxframe::Error>(())
//! ```

mod code;
mod host;
mod module;
mod thread;
mod transfer;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, RwLock,
};

pub use code::{
    CatchFn, CleanupFn, CodeMap, CopyConstructorFn, CustomHandlerFn, DestructorFn, NativeCode,
};
pub(crate) use code::mismatch;
pub(crate) use host::{raise, unwind, unwind_frames, DispatchContext, FRAME_LIST_END};
pub use module::{FunctionSpec, Module, DEFAULT_FRAME_SIZE};
pub use thread::{Activation, ActivationKind, Entry, Resume, Thread};
pub(crate) use thread::{frame_offset, i386_frame};
pub use transfer::{
    control_transfer, Arm64Context, ArmContext, ContinueSearch, ControlTransfer, Escape, Flow,
    I386Context, JumpContext, Registers, Transfer, X64Context, CALLEE_SAVED, JUMP_COOKIE,
};

use crate::{
    arch::Arch, config::RuntimeConfig, memory::AddressSpace, runtime::module::ImageSpace,
    Error, Result, TerminateReason,
};

/// Callback invoked whenever the emulated process takes the terminate path.
pub type TerminateHook = Arc<dyn Fn(TerminateReason) + Send + Sync>;

/// Code addresses of the routines the dispatcher installs itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeThunks {
    /// Handler of the guard frame around running catch handlers
    pub nested_guard: u64,
    /// Local unwind routine recorded in i386 jump buffers
    pub longjmp_unwind: u64,
    /// Consolidation callback that runs a catch handler from inside an unwind
    pub consolidate: u64,
}

/// An emulated process.
pub struct Runtime {
    config: RuntimeConfig,
    space: AddressSpace,
    code: CodeMap,
    image: ImageSpace,
    thunks: RuntimeThunks,
    terminate_hook: RwLock<Option<TerminateHook>>,
    next_image: AtomicU64,
    next_thread: AtomicU32,
}

impl Runtime {
    /// Creates a process and maps the runtime image at the configured image base.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime image cannot be mapped.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Runtime>> {
        let space = AddressSpace::new(&config.memory);
        let image = ImageSpace::map(
            &space,
            config.memory.image_base,
            config.memory.image_size,
            "image:runtime",
        )?;

        let code = CodeMap::new();
        let thunks = RuntimeThunks {
            nested_guard: image.reserve_code(16)?,
            longjmp_unwind: image.reserve_code(16)?,
            consolidate: image.reserve_code(16)?,
        };
        code.bind(thunks.nested_guard, NativeCode::NestedGuard);
        code.bind(thunks.longjmp_unwind, NativeCode::LongjmpUnwind);
        code.bind(thunks.consolidate, NativeCode::Consolidate);

        log::debug!(
            "created {} runtime, image base 0x{:X}",
            config.arch,
            image.base()
        );

        Ok(Arc::new(Runtime {
            config,
            space,
            code,
            image,
            thunks,
            terminate_hook: RwLock::new(None),
            next_image: AtomicU64::new(1),
            next_thread: AtomicU32::new(1),
        }))
    }

    /// The configuration the process was created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Architecture of the process.
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.config.arch
    }

    /// The process address space.
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// The code address bindings.
    #[must_use]
    pub fn code(&self) -> &CodeMap {
        &self.code
    }

    /// Addresses of the dispatcher's own routines.
    #[must_use]
    pub fn thunks(&self) -> RuntimeThunks {
        self.thunks
    }

    /// Base of the runtime's own image.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.image.base()
    }

    /// Maps a new module image above the previously loaded ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be mapped.
    pub fn load_module(self: &Arc<Self>, name: &str) -> Result<Module> {
        let memory = &self.config.memory;
        let index = self.next_image.fetch_add(1, Ordering::Relaxed);
        let base = index
            .checked_mul(memory.image_size as u64)
            .and_then(|offset| memory.image_base.checked_add(offset))
            .ok_or_else(|| Error::OutOfMemory(format!("no room for module '{name}'")))?;

        let image = ImageSpace::map(&self.space, base, memory.image_size, &format!("image:{name}"))?;
        log::debug!("loaded module '{}' at 0x{:X}", name, base);
        Ok(Module::new(name.to_string(), Arc::clone(self), image))
    }

    /// Returns the base of the image containing `address`.
    #[must_use]
    pub fn image_base_of(&self, address: u64) -> Option<u64> {
        let memory = &self.config.memory;
        let offset = address.checked_sub(memory.image_base)?;
        let index = offset / memory.image_size as u64;
        if index >= self.next_image.load(Ordering::Relaxed) {
            return None;
        }
        Some(memory.image_base + index * memory.image_size as u64)
    }

    /// Creates a new thread with its own stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack cannot be allocated.
    pub fn spawn_thread(self: &Arc<Self>) -> Result<Thread> {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        Thread::new(Arc::clone(self), id)
    }

    /// Installs the callback run on every terminate.
    pub fn set_terminate_hook<F>(&self, hook: F)
    where
        F: Fn(TerminateReason) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.terminate_hook.write() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Takes the terminate path: logs, runs the hook and returns the fatal error.
    pub fn terminate(&self, reason: TerminateReason) -> Error {
        log::error!("terminate: {}", reason);
        let hook = self
            .terminate_hook
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(Arc::clone));
        if let Some(hook) = hook {
            hook(reason);
        }
        Error::Terminated(reason)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("arch", &self.config.arch)
            .field("image_base", &format_args!("0x{:X}", self.image.base()))
            .field("bindings", &self.code.len())
            .finish()
    }
}
