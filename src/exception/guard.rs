//! Handlers of the guard frame installed around a running catch handler.
//!
//! The guard sits between the catch handler and the function owning it. It has two jobs:
//!
//! - When an exception raised inside the handler is searched for, it lets the try blocks
//!   nested in the handler see the exception first, with a rethrow resolved to the
//!   exception being handled.
//! - When the handler is unwound (an exception or long jump leaves it), it ends the
//!   handler: the previous exception becomes current again and the caught object is
//!   released. The object is only destroyed if no other handler still owns it, which is
//!   what keeps a rethrown object alive.

use std::sync::Arc;

use crate::{
    exception::{
        framelist::{self, NestedSearch},
        invoker::release_object,
        ExceptionFlags, ExceptionRecord, NestedGuard,
    },
    runtime::{i386_frame, ContinueSearch, DispatchContext, Flow, Thread},
};

/// Guard handler for the i386 frame list; `registration` is the guard's own record.
pub(crate) fn frame_list_guard(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    registration: u64,
) -> Flow<ContinueSearch> {
    let Some(guard) = thread.exceptions().guard(registration).cloned() else {
        log::warn!("no catch handler guarded by 0x{:X}", registration);
        return Ok(ContinueSearch);
    };

    if record.is_unwinding() {
        let runtime = Arc::clone(thread.runtime());
        let fp = guard.parent + i386_frame::REGISTRATION;
        runtime
            .space()
            .write_u32(fp - i386_frame::SAVED_ESP, guard.saved_stack as u32)?;
        end_handler(thread, registration)?;
        return Ok(ContinueSearch);
    }

    patch_rethrow(&guard, record);
    framelist::frame_handler(
        thread,
        record,
        guard.parent,
        guard.descriptor,
        Some(NestedSearch {
            guard: registration,
            floor: guard.try_level,
        }),
    )
}

/// Guard handler for the table architectures.
///
/// The handler's own funclet frame searches the try blocks nested in it, so during a
/// search the guard only resolves rethrows.
pub(crate) fn table_guard(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    dispatch: &DispatchContext,
) -> Flow<ContinueSearch> {
    let handle = dispatch.activation.key;
    let Some(guard) = thread.exceptions().guard(handle).cloned() else {
        log::warn!("no catch handler guarded by 0x{:X}", handle);
        return Ok(ContinueSearch);
    };

    if record.is_unwinding() {
        end_handler(thread, handle)?;
    } else {
        patch_rethrow(&guard, record);
    }
    Ok(ContinueSearch)
}

fn patch_rethrow(guard: &NestedGuard, record: &mut ExceptionRecord) {
    if record.is_rethrow() {
        log::debug!(
            "rethrow from catch handler of object 0x{:X}",
            guard.caught.object()
        );
        *record = guard.caught.clone();
        record.flags.remove(ExceptionFlags::UNWINDING);
    }
}

fn end_handler(thread: &mut Thread, handle: u64) -> Flow<()> {
    let Some(guard) = thread.exceptions_mut().remove_guard(handle) else {
        return Ok(());
    };
    log::trace!(
        "catch handler guarded by 0x{:X} left by unwind",
        handle
    );
    thread.exceptions_mut().replace_current(guard.previous);
    release_object(thread, guard.frame_info, &guard.caught)
}
