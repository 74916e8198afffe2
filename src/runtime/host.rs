//! The OS half of exception dispatch.
//!
//! This module plays the part of the operating system's dispatcher and unwinder: it
//! walks the active frames, calls their handlers, and carries out unwind requests. The
//! C++ half (what a frame handler does with a record) lives in
//! [`exception`](crate::exception).
//!
//! # Frame list (i386)
//!
//! Frames are registration records linked from the thread environment block. A search
//! calls each record's handler from the head outward; an unwind to a target record calls
//! each handler above the target with [`ExceptionFlags::UNWINDING`] and unlinks it.
//!
//! # Table (x86-64, ARM, ARM64)
//!
//! Frames are the thread's [`Activation`]s. A search walks them newest first. An unwind to
//! a target frame calls every handler above it with [`ExceptionFlags::UNWINDING`], pops
//! those frames, calls the target's handler with [`ExceptionFlags::TARGET_UNWIND`] added,
//! and then resumes the target: at the address the consolidation callback returns for
//! [`STATUS_UNWIND_CONSOLIDATE`], with the jump buffer's registers for
//! [`STATUS_LONGJUMP`], or at the requested address otherwise.

use std::{convert::Infallible, sync::Arc};

use crate::{
    arch::DispatchModel,
    exception::{
        framelist, guard, table, ExceptionFlags, ExceptionRecord, STATUS_LONGJUMP,
        STATUS_UNWIND_CONSOLIDATE,
    },
    runtime::{
        code::{mismatch, NativeCode},
        thread::{Activation, Thread},
        transfer::{control_transfer, ContinueSearch, Flow, Registers},
    },
    TerminateReason,
};

/// Link value terminating the frame list.
pub const FRAME_LIST_END: u64 = 0xFFFF_FFFF;

/// The frame a table-model handler is called for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchContext {
    /// Position of the frame in the thread's activation list
    pub index: usize,
    /// Snapshot of the frame
    pub activation: Activation,
}

/// Dispatches `record` to the thread's frames until one of them transfers control.
///
/// # Errors
///
/// Returns the transfer of the frame that handled the exception, or the terminate
/// raised when no frame did.
pub(crate) fn raise(thread: &mut Thread, record: ExceptionRecord) -> Flow<Infallible> {
    log::debug!(
        "thread {}: dispatching exception 0x{:08X}",
        thread.id(),
        record.code
    );

    match thread.arch().dispatch_model() {
        DispatchModel::FrameList => dispatch_frame_list(thread, record),
        DispatchModel::Table => dispatch_table(thread, record),
    }
}

fn dispatch_frame_list(thread: &mut Thread, mut record: ExceptionRecord) -> Flow<Infallible> {
    let runtime = Arc::clone(thread.runtime());
    let mut registration = thread.frame_list_head()?;

    while registration != FRAME_LIST_END {
        let ContinueSearch = call_frame_handler(thread, &mut record, registration)?;
        registration = u64::from(runtime.space().read_u32(registration)?);
    }

    log::warn!(
        "thread {}: no frame handled exception 0x{:08X}",
        thread.id(),
        record.code
    );
    Err(thread.terminate(TerminateReason::Unhandled { code: record.code }))
}

fn call_frame_handler(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    registration: u64,
) -> Flow<ContinueSearch> {
    let handler = u64::from(thread.runtime().space().read_u32(registration + 4)?);
    let code = thread.runtime().code().get(handler)?;

    match code {
        NativeCode::FrameHandler { descriptor } => {
            framelist::frame_handler(thread, record, registration, descriptor, None)
        }
        NativeCode::NestedGuard => guard::frame_list_guard(thread, record, registration),
        other => Err(mismatch(handler, "frame_handler", &other).into()),
    }
}

/// Unwinds the frame list down to `target`, which stays linked.
///
/// `target` may be [`FRAME_LIST_END`] to unwind every frame.
///
/// # Errors
///
/// Returns an escape raised by a handler, or terminates if `target` is not on the list.
pub(crate) fn unwind_frames(thread: &mut Thread, target: u64, record: ExceptionRecord) -> Flow<()> {
    let runtime = Arc::clone(thread.runtime());
    let mut record = record;
    record.flags |= ExceptionFlags::UNWINDING;
    if target == FRAME_LIST_END {
        record.flags |= ExceptionFlags::EXIT_UNWIND;
    }

    loop {
        let registration = thread.frame_list_head()?;
        if registration == target {
            return Ok(());
        }
        if registration == FRAME_LIST_END {
            return Err(thread.terminate(TerminateReason::UnwindTargetNotFound(target)));
        }

        log::trace!(
            "thread {}: unwinding registration 0x{:X}",
            thread.id(),
            registration
        );
        let mut delivered = record.clone();
        call_frame_handler(thread, &mut delivered, registration)?;

        let prev = runtime.space().read_u32(registration)?;
        thread.set_frame_list_head(u64::from(prev))?;
    }
}

fn dispatch_table(thread: &mut Thread, mut record: ExceptionRecord) -> Flow<Infallible> {
    let mut index = thread.activations().len();

    while index > 0 {
        index -= 1;
        let Some(activation) = thread.activations().get(index).cloned() else {
            continue;
        };
        let Some(handler) = activation.handler else {
            continue;
        };

        let dispatch = DispatchContext { index, activation };
        let ContinueSearch = call_table_handler(thread, &mut record, &dispatch, handler)?;
    }

    log::warn!(
        "thread {}: no frame handled exception 0x{:08X}",
        thread.id(),
        record.code
    );
    Err(thread.terminate(TerminateReason::Unhandled { code: record.code }))
}

fn call_table_handler(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    dispatch: &DispatchContext,
    handler: u64,
) -> Flow<ContinueSearch> {
    let code = thread.runtime().code().get(handler)?;

    match code {
        NativeCode::FrameHandler { descriptor } => {
            table::frame_handler(thread, record, dispatch, descriptor)
        }
        NativeCode::NestedGuard => guard::table_guard(thread, record, dispatch),
        other => Err(mismatch(handler, "frame_handler", &other).into()),
    }
}

/// Unwinds the activations down to the frame keyed `target` and resumes it.
///
/// # Arguments
///
/// * `thread` - The unwinding thread
/// * `target` - Key of the frame to resume
/// * `target_ip` - Address to resume at for plain unwind requests
/// * `record` - The unwind request
/// * `value` - Value delivered with the transfer
///
/// # Errors
///
/// Always returns an [`Escape`](crate::runtime::Escape): the transfer into the target,
/// or a fault or terminate raised along the way.
pub(crate) fn unwind(
    thread: &mut Thread,
    target: u64,
    target_ip: u64,
    record: ExceptionRecord,
    value: u64,
) -> Flow<Infallible> {
    let runtime = Arc::clone(thread.runtime());
    let arch = runtime.arch();

    let Some(target_index) = thread.activations().iter().rposition(|a| a.key == target) else {
        return Err(thread.terminate(TerminateReason::UnwindTargetNotFound(target)));
    };

    log::debug!(
        "thread {}: unwinding to frame 0x{:X} (code 0x{:08X})",
        thread.id(),
        target,
        record.code
    );

    let mut record = record;
    record.flags |= ExceptionFlags::UNWINDING;

    let mut index = thread.activations().len();
    while index > target_index {
        index -= 1;
        let Some(activation) = thread.activations().get(index).cloned() else {
            continue;
        };

        if let Some(handler) = activation.handler {
            let mut delivered = record.clone();
            if index == target_index {
                delivered.flags |= ExceptionFlags::TARGET_UNWIND;
            }
            let dispatch = DispatchContext { index, activation };
            call_table_handler(thread, &mut delivered, &dispatch, handler)?;
        }

        if index > target_index {
            thread.truncate_activations(index);
        }
    }

    let Some(activation) = thread.activations().get(target_index).cloned() else {
        return Err(thread.terminate(TerminateReason::UnwindTargetNotFound(target)));
    };
    let frame = table::frame_base(runtime.space(), arch, &activation)?;
    let current = thread.registers();

    let registers = match record.code {
        STATUS_UNWIND_CONSOLIDATE => {
            let callback = record.param(0);
            let ip = match runtime.code().get(callback)? {
                NativeCode::Consolidate => table::call_catch_block(thread, &record)?,
                other => return Err(mismatch(callback, "consolidate", &other).into()),
            };
            Registers {
                ip,
                sp: target,
                fp: frame,
                ..current
            }
        }
        STATUS_LONGJUMP => {
            control_transfer(arch)
                .restore_context(runtime.space(), record.param(0))?
                .registers
        }
        _ => Registers {
            ip: target_ip,
            sp: target,
            fp: frame,
            ..current
        },
    };

    thread.truncate_activations(target_index + 1);
    Err(control_transfer(arch).transfer(registers, value))
}
