//! The i386 frame handler.
//!
//! Every C++ function with exception metadata links a registration record into the
//! thread's frame list on entry. The record sits inside the function's frame, below the
//! saved frame pointer:
//!
//! ```text
//! fp - 16   saved stack pointer (the body's stack pointer, resumed after a catch)
//! fp - 12   registration record: prev
//! fp - 8    registration record: handler
//! fp - 4    try level
//! fp        saved frame pointer
//! ```
//!
//! The try level word is the frame's current scope. The handler reads it on every
//! invocation:
//!
//! - **Unwinding**: the frame is being torn down; all its scopes are unwound.
//! - **Searching**: the try blocks enclosing the current scope are searched. A matching
//!   clause unwinds every newer frame, unwinds this frame down to the try block, runs
//!   the handler, and resumes the function body at the address the handler returned.

use std::{convert::Infallible, sync::Arc};

use crate::{
    exception::{
        invoker::{self, run_catch_body, CatchCommit, CatchSite, CatchStrategy},
        unwind::{local_unwind, ScopeSlot, TryLevelSlot},
        ExceptionRecord,
    },
    metadata::{Addressing, FunctionDescriptor, MetadataContext, SCOPE_NONE},
    runtime::{
        control_transfer, i386_frame, unwind_frames, ContinueSearch, Flow, Registers, Thread,
    },
    Error, TerminateReason,
};

/// A search made on behalf of a running catch handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NestedSearch {
    /// Registration record of the handler's guard frame
    pub guard: u64,
    /// Lowest scope a try block may start at to be nested in the handler
    pub floor: i32,
}

/// Handles `record` for the frame registered at `registration`.
///
/// # Arguments
///
/// * `thread` - The dispatching thread
/// * `record` - The exception; a rethrow is patched in place to the exception it rethrows
/// * `registration` - Registration record of the frame
/// * `descriptor` - Function descriptor of the frame
/// * `nested` - Set when called by the guard frame of a running catch handler
///
/// # Errors
///
/// Returns the transfer of a committed catch, a fault, or a terminate.
pub(crate) fn frame_handler(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    registration: u64,
    descriptor: u64,
    nested: Option<NestedSearch>,
) -> Flow<ContinueSearch> {
    let runtime = Arc::clone(thread.runtime());
    let space = runtime.space();
    let ctx = MetadataContext::new(space, runtime.arch(), Addressing::Absolute);

    let descr = match FunctionDescriptor::read(&ctx, descriptor) {
        Ok(descr) => descr,
        Err(Error::UnsupportedVersion(magic)) => {
            log::warn!(
                "descriptor 0x{:X} has unknown magic 0x{:08X}, frame ignored",
                descriptor,
                magic
            );
            return Ok(ContinueSearch);
        }
        Err(error) => return Err(error.into()),
    };

    let fp = registration + i386_frame::REGISTRATION;
    let slot = TryLevelSlot {
        address: fp - i386_frame::TRY_LEVEL,
    };

    log::trace!(
        "frame handler: registration 0x{:X} code 0x{:08X} flags {:?} nested {:?}",
        registration,
        record.code,
        record.flags,
        nested
    );

    if record.is_unwinding() {
        if descr.unwind_count > 0 && nested.is_none() {
            local_unwind(thread, &ctx, &descr, fp, &slot, SCOPE_NONE)?;
        }
        return Ok(ContinueSearch);
    }

    if descr.is_synchronous() && !record.is_cxx() {
        return Ok(ContinueSearch);
    }

    if descr.try_count > 0 {
        invoker::patch_rethrow(thread, record);
        if let Some(result) = invoker::custom_handler(thread, record, registration, descriptor)? {
            return Ok(result);
        }

        let level = slot.load(space)?;
        let strategy = FrameListCatch {
            registration,
            fp,
            descriptor: descr.clone(),
            nested,
        };
        let floor = nested.map_or(i32::MIN, |nested| nested.floor);
        invoker::find_catch_block(thread, &strategy, &ctx, &descr, record, level, floor)?;
    }

    if descr.is_noexcept() && record.is_cxx() && nested.is_none() {
        log::error!(
            "exception 0x{:08X} left noexcept function 0x{:X}",
            record.code,
            descriptor
        );
        return Err(thread.terminate(TerminateReason::NoexceptViolation));
    }
    Ok(ContinueSearch)
}

struct FrameListCatch {
    registration: u64,
    fp: u64,
    descriptor: FunctionDescriptor,
    nested: Option<NestedSearch>,
}

impl CatchStrategy for FrameListCatch {
    fn frame(&self) -> u64 {
        self.fp
    }

    fn commit(&self, thread: &mut Thread, commit: CatchCommit) -> Flow<Infallible> {
        let runtime = Arc::clone(thread.runtime());
        let space = runtime.space();
        let arch = runtime.arch();
        let ctx = MetadataContext::new(space, arch, Addressing::Absolute);

        let target = self.nested.map_or(self.registration, |nested| nested.guard);
        unwind_frames(thread, target, commit.record.clone())?;

        let slot = TryLevelSlot {
            address: self.fp - i386_frame::TRY_LEVEL,
        };
        local_unwind(
            thread,
            &ctx,
            &self.descriptor,
            self.fp,
            &slot,
            commit.try_block.start,
        )?;
        let catch_level = commit.try_block.end + 1;
        slot.store(space, catch_level)?;

        let handler = commit.catch.handler.ok_or_else(|| {
            malformed_error!("Catch block 0x{:X} has no handler", commit.catch.address)
        })?;
        let site = CatchSite::FrameList {
            registration: self.registration,
            fp: self.fp,
            descriptor: self.descriptor.address,
            try_level: catch_level,
        };
        let continuation = run_catch_body(thread, site, commit.record, commit.frame_info, handler)?;

        let sp = u64::from(space.read_u32(self.fp - i386_frame::SAVED_ESP)?);
        log::debug!(
            "resuming frame 0x{:X} at 0x{:X} (esp 0x{:X})",
            self.fp,
            continuation,
            sp
        );
        let registers = Registers {
            ip: continuation,
            sp,
            fp: self.fp,
            ..thread.registers()
        };
        Err(control_transfer(arch).transfer(registers, 0))
    }
}

/// Unwinds the frame a long jump lands in down to the scope `setjmp` was called at.
///
/// This is the routine recorded in i386 jump buffers taken inside C++ functions. The
/// buffer names the frame's registration record, the saved try level and the frame's
/// descriptor.
///
/// # Errors
///
/// Returns the escape of a cleanup, or terminates on an inconsistent scope chain.
pub(crate) fn longjmp_unwind(thread: &mut Thread, buffer: u64) -> Flow<()> {
    let runtime = Arc::clone(thread.runtime());
    let space = runtime.space();
    let ctx = MetadataContext::new(space, runtime.arch(), Addressing::Absolute);

    let context = control_transfer(runtime.arch()).restore_context(space, buffer)?;
    let descr = match FunctionDescriptor::read(&ctx, context.unwind_data) {
        Ok(descr) => descr,
        Err(Error::UnsupportedVersion(_)) => return Ok(()),
        Err(error) => return Err(error.into()),
    };

    let fp = context.frame + i386_frame::REGISTRATION;
    log::debug!(
        "long jump unwind of frame 0x{:X} to try level {}",
        fp,
        context.try_level
    );
    let slot = TryLevelSlot {
        address: fp - i386_frame::TRY_LEVEL,
    };
    local_unwind(thread, &ctx, &descr, fp, &slot, context.try_level)
}
