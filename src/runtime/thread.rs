//! Emulated threads.
//!
//! A [`Thread`] owns a stack in the process address space, its register state, its
//! exception state and, on table architectures, the list of active frames the unwinder
//! walks. Emulated functions are Rust closures run through [`Thread::call`], which lays
//! out the frame the way the architecture's compiler would before running the body:
//!
//! - **i386** - `[locals][saved esp][prev][handler][try level][saved ebp]`, with the frame
//!   pointer at the saved `ebp` slot and the registration record linked into the
//!   thread's frame list for the duration of the call.
//! - **Table architectures** - the establisher frame is the stack pointer after the
//!   prologue, and the persisted scope slot at `establisher + unwind_help` is set to
//!   [`UNWIND_HELP_UNSET`].
//!
//! # Resumable bodies
//!
//! When a catch handler of a function finishes, execution continues inside that function
//! at the handler's return address. The host stack cannot be rewound to the middle of a
//! closure, so instead the closure is called again with [`Entry::resume`] set; it
//! dispatches on the resume address to continue where the emulated code would. Bodies
//! therefore look like this:
//!
//! ```rust,ignore
//! thread.call(&function, |thread, entry| {
//!     match entry.resume {
//!         None => { /* normal entry: set up scopes, call, throw ... */ }
//!         Some(resume) if resume.ip == AFTER_CATCH => { /* continuation */ }
//!         Some(_) => { /* other continuations */ }
//!     }
//! })
//! ```

use std::{convert::Infallible, sync::Arc};

use crate::{
    arch::{Arch, DispatchModel},
    exception::{
        framelist, ExceptionFlags, ExceptionRecord, ExceptionState, STATUS_LONGJUMP, STATUS_UNWIND,
    },
    metadata::{Addressing, FunctionDescriptor, MetadataContext, SCOPE_NONE, UNWIND_HELP_UNSET},
    runtime::{
        code::{mismatch, NativeCode},
        host::{self, FRAME_LIST_END},
        module::FunctionSpec,
        transfer::{control_transfer, ContinueSearch, Escape, Flow, JumpContext, Registers},
        Runtime,
    },
    Error, Result, TerminateReason,
};

/// Smallest frame [`Thread::call`] lays out.
const MIN_FRAME_SIZE: usize = 32;

/// Offsets of the i386 frame fields, relative to the frame pointer.
pub(crate) mod i386_frame {
    /// Saved stack pointer slot
    pub const SAVED_ESP: u64 = 16;
    /// Registration record (`prev`, `handler`)
    pub const REGISTRATION: u64 = 12;
    /// Try level slot
    pub const TRY_LEVEL: u64 = 4;
}

/// Returns `base + offset` for a signed frame offset.
pub(crate) fn frame_offset(base: u64, offset: i32) -> u64 {
    base.wrapping_add_signed(i64::from(offset))
}

/// The address a resumed body continues at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resume {
    /// Code address to continue at
    pub ip: u64,
    /// Value delivered by the transfer (the `setjmp` return value for long jumps)
    pub value: u64,
}

/// How a body is entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Frame pointer (i386) or establisher frame (table architectures) of the body.
    ///
    /// Catch handlers receive the frame of the function they belong to.
    pub frame: u64,
    /// Set when the body is re-entered after a non-local transfer
    pub resume: Option<Resume>,
}

impl Entry {
    /// Returns `true` for a re-entry.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resume.is_some()
    }

    /// Returns the code address of a re-entry.
    #[must_use]
    pub fn resume_ip(&self) -> Option<u64> {
        self.resume.map(|resume| resume.ip)
    }

    /// Address of the object a catch clause stored at `offset` from the frame.
    #[must_use]
    pub fn local(&self, offset: i32) -> u64 {
        frame_offset(self.frame, offset)
    }
}

/// What kind of code an activation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationKind {
    /// A function body
    Function,
    /// A catch handler funclet of a function
    Funclet {
        /// Index of the try block owning the handler
        try_index: usize,
        /// Address of the catch block descriptor
        catch_block: u64,
    },
    /// The guard frame around a running catch handler
    Guard,
}

/// An active frame on a table architecture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Activation {
    /// Stack pointer after the prologue; identifies the frame
    pub key: u64,
    /// What the frame runs
    pub kind: ActivationKind,
    /// Current code address inside the frame
    pub control_pc: u64,
    /// Image base of the module owning the code
    pub image_base: u64,
    /// Function descriptor of the owning function
    pub descriptor: Option<u64>,
    /// Frame handler thunk, if the frame has one
    pub handler: Option<u64>,
}

/// An emulated thread.
pub struct Thread {
    id: u32,
    runtime: Arc<Runtime>,
    registers: Registers,
    teb: u64,
    stack_base: u64,
    stack_top: u64,
    activations: Vec<Activation>,
    exceptions: ExceptionState,
    depth: usize,
}

impl Thread {
    pub(crate) fn new(runtime: Arc<Runtime>, id: u32) -> Result<Thread> {
        let memory = &runtime.config().memory;
        let space = runtime.space();
        let stack_base = space.alloc(memory.stack_size, format!("stack:{id}"))?;
        let stack_top = stack_base + memory.stack_size as u64;
        let teb = space.alloc(64, format!("teb:{id}"))?;
        space.write_u32(teb, FRAME_LIST_END as u32)?;

        log::debug!(
            "thread {}: stack 0x{:X}-0x{:X}",
            id,
            stack_base,
            stack_top
        );

        Ok(Thread {
            id,
            runtime,
            registers: Registers {
                sp: stack_top,
                fp: stack_top,
                ..Registers::default()
            },
            teb,
            stack_base,
            stack_top,
            activations: Vec::new(),
            exceptions: ExceptionState::new(),
            depth: 0,
        })
    }

    /// Thread identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The process the thread belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Architecture of the process.
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.runtime.arch()
    }

    /// Current register state.
    #[must_use]
    pub fn registers(&self) -> Registers {
        self.registers
    }

    pub(crate) fn set_registers(&mut self, registers: Registers) {
        self.registers = registers;
    }

    /// Address of the thread environment block; its first word heads the frame list.
    #[must_use]
    pub fn teb(&self) -> u64 {
        self.teb
    }

    /// Lowest and one-past-highest address of the stack.
    #[must_use]
    pub fn stack_range(&self) -> (u64, u64) {
        (self.stack_base, self.stack_top)
    }

    /// Active frames, oldest first (table architectures).
    #[must_use]
    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    pub(crate) fn push_activation(&mut self, activation: Activation) {
        self.activations.push(activation);
    }

    pub(crate) fn truncate_activations(&mut self, len: usize) {
        self.activations.truncate(len);
    }

    /// Exception handling state.
    #[must_use]
    pub fn exceptions(&self) -> &ExceptionState {
        &self.exceptions
    }

    pub(crate) fn exceptions_mut(&mut self) -> &mut ExceptionState {
        &mut self.exceptions
    }

    /// The record of the exception whose handler is running, if any.
    #[must_use]
    pub fn current_exception(&self) -> Option<&ExceptionRecord> {
        self.exceptions.current()
    }

    /// Returns `true` while an exception is looking for its handler.
    ///
    /// This is what `std::uncaught_exception()` reports: destructors run by the unwind
    /// before a catch handler starts see `true`.
    #[must_use]
    pub fn uncaught_exception(&self) -> bool {
        self.exceptions.uncaught_exception()
    }

    /// Current emulated call depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Head of the registration record list (i386).
    ///
    /// # Errors
    ///
    /// Returns an error if the thread environment block cannot be read.
    pub fn frame_list_head(&self) -> Result<u64> {
        Ok(u64::from(self.runtime.space().read_u32(self.teb)?))
    }

    pub(crate) fn set_frame_list_head(&self, registration: u64) -> Result<()> {
        self.runtime.space().write_u32(self.teb, registration as u32)
    }

    /// Allocates `size` bytes on the heap, for thrown objects and jump buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation cannot be mapped.
    pub fn alloc(&self, size: usize) -> Result<u64> {
        self.runtime.space().alloc(size, format!("heap:{}", self.id))
    }

    /// Moves the stack pointer down by `size` bytes (rounded to 16) and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] on stack overflow.
    pub(crate) fn reserve_stack(&mut self, size: usize) -> Result<u64> {
        let rounded = (size.max(1) as u64).div_ceil(16) * 16;
        let sp = (self.registers.sp & !0xF)
            .checked_sub(rounded)
            .filter(|sp| *sp >= self.stack_base)
            .ok_or_else(|| Error::OutOfMemory(format!("stack overflow on thread {}", self.id)))?;
        self.registers.sp = sp;
        Ok(sp)
    }

    /// Takes the terminate path.
    pub fn terminate(&self, reason: TerminateReason) -> Escape {
        Escape::Fault(self.runtime.terminate(reason))
    }

    fn enter(&mut self) -> Result<()> {
        let limit = self.runtime.config().limits.max_call_depth;
        if self.depth >= limit {
            return Err(Error::RecursionLimit(limit));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Calls an emulated function.
    ///
    /// Lays out the function's frame, runs `body` and tears the frame down again. If
    /// the function has a frame handler it is active for the duration of the call. A
    /// transfer targeting this frame (a catch handler finishing, a long jump) re-enters
    /// `body` with [`Entry::resume`] set.
    ///
    /// # Errors
    ///
    /// Returns an [`Escape`] if the body raised an exception that was caught by an
    /// older frame, long-jumped out, or faulted.
    pub fn call<F>(&mut self, function: &FunctionSpec, body: F) -> Flow<u64>
    where
        F: Fn(&mut Thread, Entry) -> Flow<u64>,
    {
        self.enter()?;
        let saved = self.registers;
        let activations = self.activations.len();
        log::trace!("thread {}: call '{}'", self.id, function.name);

        let result = match self.arch().dispatch_model() {
            DispatchModel::FrameList => self.call_frame_list(function, &body),
            DispatchModel::Table => self.call_table(function, &body),
        };

        self.activations.truncate(activations);
        self.leave();
        if matches!(result, Ok(_) | Err(Escape::Fault(_))) {
            self.registers = saved;
        }
        result
    }

    fn call_frame_list(
        &mut self,
        function: &FunctionSpec,
        body: &dyn Fn(&mut Thread, Entry) -> Flow<u64>,
    ) -> Flow<u64> {
        let runtime = Arc::clone(&self.runtime);
        let space = runtime.space();

        let size = function.frame_size.max(MIN_FRAME_SIZE);
        let key = self.reserve_stack(size)?;
        let fp = key + (size as u64).div_ceil(16) * 16 - 4;
        space.write_u32(fp, self.registers.fp as u32)?;

        let registration = fp - i386_frame::REGISTRATION;
        if let Some(handler) = function.handler {
            space.write_u32(fp - i386_frame::SAVED_ESP, key as u32)?;
            space.write_u32(registration, self.frame_list_head()? as u32)?;
            space.write_u32(registration + 4, handler as u32)?;
            space.write_i32(fp - i386_frame::TRY_LEVEL, SCOPE_NONE)?;
            self.set_frame_list_head(registration)?;
        }

        self.registers.ip = function.entry;
        self.registers.fp = fp;
        let result = self.run_resumable(key, fp, body);

        // A transfer has already unlinked the record; a fault leaves it as the head
        let unlink = match &result {
            Ok(_) => true,
            Err(Escape::Fault(_)) => self.frame_list_head()? == registration,
            Err(Escape::Transfer(_)) => false,
        };
        if function.handler.is_some() && unlink {
            let prev = space.read_u32(registration)?;
            self.set_frame_list_head(u64::from(prev))?;
        }
        result
    }

    fn call_table(
        &mut self,
        function: &FunctionSpec,
        body: &dyn Fn(&mut Thread, Entry) -> Flow<u64>,
    ) -> Flow<u64> {
        let runtime = Arc::clone(&self.runtime);
        let space = runtime.space();
        let arch = runtime.arch();

        let key = self.reserve_stack(function.frame_size.max(MIN_FRAME_SIZE))?;
        if let Some(address) = function.descriptor {
            let ctx = MetadataContext::new(space, arch, Addressing::for_arch(arch, function.image_base));
            match FunctionDescriptor::read(&ctx, address) {
                Ok(descriptor) => {
                    space.write_i32(frame_offset(key, descriptor.unwind_help), UNWIND_HELP_UNSET)?;
                }
                // The frame handler declines such frames
                Err(Error::UnsupportedVersion(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }

        self.activations.push(Activation {
            key,
            kind: ActivationKind::Function,
            control_pc: function.entry,
            image_base: function.image_base,
            descriptor: function.descriptor,
            handler: function.handler,
        });
        self.registers.ip = function.entry;
        self.registers.fp = key;
        self.run_resumable(key, key, body)
    }

    /// Runs `body` until it returns, re-entering it for every transfer aimed at `key`.
    pub(crate) fn run_resumable(
        &mut self,
        key: u64,
        frame: u64,
        body: &dyn Fn(&mut Thread, Entry) -> Flow<u64>,
    ) -> Flow<u64> {
        let limit = self.runtime.config().limits.max_resumptions;
        let mut entry = Entry { frame, resume: None };
        let mut resumptions = 0;

        loop {
            match body(self, entry) {
                Err(Escape::Transfer(transfer)) if transfer.registers.sp == key => {
                    resumptions += 1;
                    if resumptions > limit {
                        return Err(self.terminate(TerminateReason::ResumeLimit(limit)));
                    }

                    log::trace!(
                        "thread {}: resuming frame 0x{:X} at 0x{:X}",
                        self.id,
                        key,
                        transfer.registers.ip
                    );
                    self.registers = transfer.registers;
                    if let Some(activation) = self.activations.iter_mut().rev().find(|a| a.key == key) {
                        activation.control_pc = transfer.registers.ip;
                    }
                    entry = Entry {
                        frame: transfer.registers.fp,
                        resume: Some(Resume {
                            ip: transfer.registers.ip,
                            value: transfer.value,
                        }),
                    };
                }
                other => return other,
            }
        }
    }

    /// Sets the current code address of the running frame.
    ///
    /// On table architectures the code address is what the frame handler maps to the
    /// current scope.
    pub fn set_ip(&mut self, ip: u64) {
        self.registers.ip = ip;
        if let Some(activation) = self.activations.last_mut() {
            activation.control_pc = ip;
        }
    }

    /// Enters scope `level` of the running function.
    ///
    /// On i386 this stores the level in the frame's try level slot. On table
    /// architectures it moves the code address to the first address the ip map assigns
    /// to `level`.
    ///
    /// # Errors
    ///
    /// Returns an error if the running frame has no descriptor or no code address maps
    /// to `level`.
    pub fn set_try_level(&mut self, level: i32) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        match self.arch().dispatch_model() {
            DispatchModel::FrameList => runtime
                .space()
                .write_i32(self.registers.fp - i386_frame::TRY_LEVEL, level),
            DispatchModel::Table => {
                let (ctx, descriptor) = self.running_descriptor(&runtime)?;
                let ip = descriptor.state_ip(&ctx, level)?.ok_or_else(|| {
                    malformed_error!("No code address maps to scope {}", level)
                })?;
                self.set_ip(ip);
                Ok(())
            }
        }
    }

    /// Returns the scope the running function is in.
    ///
    /// # Errors
    ///
    /// Returns an error if the running frame has no descriptor.
    pub fn try_level(&self) -> Result<i32> {
        match self.arch().dispatch_model() {
            DispatchModel::FrameList => self
                .runtime
                .space()
                .read_i32(self.registers.fp - i386_frame::TRY_LEVEL),
            DispatchModel::Table => {
                let (ctx, descriptor) = self.running_descriptor(&self.runtime)?;
                let pc = self.activations.last().map_or(self.registers.ip, |a| a.control_pc);
                descriptor.ip_to_state(&ctx, pc)
            }
        }
    }

    fn running_descriptor<'a>(
        &self,
        runtime: &'a Runtime,
    ) -> Result<(MetadataContext<'a>, FunctionDescriptor)> {
        let activation = self
            .activations
            .last()
            .ok_or_else(|| malformed_error!("No active frame on thread {}", self.id))?;
        let address = activation
            .descriptor
            .ok_or_else(|| malformed_error!("Frame 0x{:X} has no descriptor", activation.key))?;
        let ctx = MetadataContext::new(
            runtime.space(),
            runtime.arch(),
            Addressing::for_arch(runtime.arch(), activation.image_base),
        );
        let descriptor = FunctionDescriptor::read(&ctx, address)?;
        Ok((ctx, descriptor))
    }

    /// Raises a C++ exception (`throw object;`).
    ///
    /// On table architectures the throwing module's image base is derived from the
    /// throw info's address.
    ///
    /// # Errors
    ///
    /// Always returns an [`Escape`]: the transfer to the catching frame, or the fault or
    /// terminate that ended the dispatch.
    pub fn throw<T>(&mut self, object: u64, throw_info: u64) -> Flow<T> {
        let image_base = match self.arch().dispatch_model() {
            DispatchModel::FrameList => 0,
            DispatchModel::Table => self.runtime.image_base_of(throw_info).unwrap_or(0),
        };
        let mut record = ExceptionRecord::cxx(self.arch(), object, throw_info, image_base);
        record.address = self.registers.ip;
        log::debug!(
            "thread {}: throw object 0x{:X} with throw info 0x{:X}",
            self.id,
            object,
            throw_info
        );
        self.raise_exception(record)
    }

    /// Rethrows the exception currently being handled (`throw;`).
    ///
    /// # Errors
    ///
    /// Always returns an [`Escape`].
    pub fn rethrow<T>(&mut self) -> Flow<T> {
        let mut record = ExceptionRecord::cxx(self.arch(), 0, 0, 0);
        record.address = self.registers.ip;
        log::debug!("thread {}: rethrow", self.id);
        self.raise_exception(record)
    }

    /// Raises a non-C++ exception.
    ///
    /// # Errors
    ///
    /// Always returns an [`Escape`].
    pub fn raise<T>(&mut self, code: u32, params: &[u64]) -> Flow<T> {
        let mut record = ExceptionRecord::new(code, ExceptionFlags::empty());
        record.address = self.registers.ip;
        record.params = params.to_vec();
        self.raise_exception(record)
    }

    /// Dispatches `record`.
    ///
    /// # Errors
    ///
    /// Always returns an [`Escape`].
    pub fn raise_exception<T>(&mut self, record: ExceptionRecord) -> Flow<T> {
        let never: Infallible = host::raise(self, record)?;
        match never {}
    }

    /// Saves the register state into the jump buffer at `buffer` (`setjmp`).
    ///
    /// On i386, if the running function has a C++ frame handler the buffer also records
    /// its try level and the runtime's local unwind routine, so that a later long jump
    /// runs the function's pending cleanups.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be written.
    pub fn set_jump(&self, buffer: u64) -> Result<()> {
        let runtime = &self.runtime;
        let space = runtime.space();

        let context = match self.arch().dispatch_model() {
            DispatchModel::FrameList => {
                let head = self.frame_list_head()?;
                let fp = self.registers.fp;
                let mut context = JumpContext {
                    registers: self.registers,
                    frame: head,
                    try_level: SCOPE_NONE,
                    ..JumpContext::default()
                };

                if head != FRAME_LIST_END && head == fp.wrapping_sub(i386_frame::REGISTRATION) {
                    let handler = u64::from(space.read_u32(head + 4)?);
                    if let Ok(NativeCode::FrameHandler { descriptor }) = runtime.code().get(handler) {
                        context.unwind_func = runtime.thunks().longjmp_unwind;
                        context.unwind_data = descriptor;
                        context.try_level = space.read_i32(fp - i386_frame::TRY_LEVEL)?;
                    }
                }
                context
            }
            DispatchModel::Table => JumpContext {
                registers: self.registers,
                frame: self.activations.last().map_or(0, |activation| activation.key),
                ..JumpContext::default()
            },
        };

        log::trace!(
            "thread {}: setjmp 0x{:X} frame 0x{:X}",
            self.id,
            buffer,
            context.frame
        );
        control_transfer(self.arch()).capture_context(space, buffer, &context)
    }

    /// Transfers control back to the `setjmp` that filled `buffer` (`longjmp`).
    ///
    /// Every frame between the current one and the `setjmp` caller is unwound first, and
    /// the caller's own scopes are unwound down to the scope `setjmp` was called in. A
    /// `value` of zero is delivered as one.
    ///
    /// # Errors
    ///
    /// Always returns an [`Escape`]: the transfer to the `setjmp` caller, or a fault.
    pub fn long_jump<T>(&mut self, buffer: u64, value: u64) -> Flow<T> {
        let runtime = Arc::clone(&self.runtime);
        let transfer = control_transfer(self.arch());
        let context = transfer.restore_context(runtime.space(), buffer)?;
        let value = if value == 0 { 1 } else { value };
        log::debug!(
            "thread {}: longjmp 0x{:X} to frame 0x{:X}",
            self.id,
            buffer,
            context.frame
        );

        match self.arch().dispatch_model() {
            DispatchModel::FrameList => {
                if self.frame_list_head()? != context.frame {
                    let record = ExceptionRecord::new(STATUS_UNWIND, ExceptionFlags::UNWINDING);
                    host::unwind_frames(self, context.frame, record)?;
                }

                if context.frame != FRAME_LIST_END && context.cookie && context.unwind_func != 0 {
                    match runtime.code().get(context.unwind_func)? {
                        NativeCode::LongjmpUnwind => framelist::longjmp_unwind(self, buffer)?,
                        other => {
                            return Err(mismatch(context.unwind_func, "longjmp_unwind", &other).into())
                        }
                    }
                }
                Err(transfer.transfer(context.registers, value))
            }
            DispatchModel::Table => {
                if context.frame == 0 {
                    return Err(transfer.transfer(context.registers, value));
                }

                let mut record = ExceptionRecord::new(STATUS_LONGJUMP, ExceptionFlags::empty());
                record.params = vec![buffer];
                let never: Infallible =
                    host::unwind(self, context.frame, context.registers.ip, record, value)?;
                match never {}
            }
        }
    }

    /// Runs native code invoked by the unwinder, mapping its faults to terminate.
    fn run_native<R>(
        &mut self,
        address: u64,
        native: impl FnOnce(&mut Thread) -> Flow<R>,
    ) -> Flow<R> {
        self.enter()?;
        let saved = self.registers;
        let result = native(self);
        self.leave();

        match result {
            Ok(value) => {
                self.registers = saved;
                Ok(value)
            }
            Err(Escape::Fault(error)) if !error.is_fatal() => {
                log::error!("native code at 0x{:X} faulted: {}", address, error);
                Err(self.terminate(TerminateReason::CleanupFailed(address)))
            }
            Err(escape) => Err(escape),
        }
    }

    pub(crate) fn call_cleanup(&mut self, address: u64, frame: u64) -> Flow<()> {
        let code = self.runtime.code().get(address)?;
        let NativeCode::Cleanup(cleanup) = code else {
            return Err(mismatch(address, "cleanup", &code).into());
        };
        self.run_native(address, |thread| cleanup(thread, frame))
    }

    pub(crate) fn call_destructor(&mut self, address: u64, object: u64) -> Flow<()> {
        let code = self.runtime.code().get(address)?;
        let NativeCode::Destructor(destructor) = code else {
            return Err(mismatch(address, "destructor", &code).into());
        };
        self.run_native(address, |thread| destructor(thread, object))
    }

    pub(crate) fn call_copy_constructor(
        &mut self,
        address: u64,
        dest: u64,
        src: u64,
        virtual_bases: bool,
    ) -> Flow<()> {
        let code = self.runtime.code().get(address)?;
        let NativeCode::CopyConstructor(constructor) = code else {
            return Err(mismatch(address, "copy_constructor", &code).into());
        };
        self.run_native(address, |thread| constructor(thread, dest, src, virtual_bases))
    }

    pub(crate) fn call_custom_handler(
        &mut self,
        address: u64,
        record: &mut ExceptionRecord,
        frame: u64,
        descriptor: u64,
    ) -> Flow<ContinueSearch> {
        let code = self.runtime.code().get(address)?;
        let NativeCode::CustomHandler(handler) = code else {
            return Err(mismatch(address, "custom_handler", &code).into());
        };
        self.enter()?;
        let result = handler(self, record, frame, descriptor);
        self.leave();
        result
    }

    /// Runs the catch handler at `address` with its own stack frame at `key`.
    pub(crate) fn call_catch(&mut self, address: u64, key: u64, frame: u64) -> Flow<u64> {
        let code = self.runtime.code().get(address)?;
        let NativeCode::Catch(body) = code else {
            return Err(mismatch(address, "catch", &code).into());
        };

        self.enter()?;
        self.registers.ip = address;
        self.registers.sp = key;
        self.registers.fp = frame;
        let result = self.run_resumable(key, frame, body.as_ref());
        self.leave();
        result
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("registers", &self.registers)
            .field("activations", &self.activations.len())
            .field("depth", &self.depth)
            .finish()
    }
}
