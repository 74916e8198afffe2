//! The frame handler of the table architectures (x86-64, ARM, ARM64).
//!
//! There is no try level register on these architectures. A frame's current scope is
//! recovered from its code address through the descriptor's ip map, except once the
//! frame has started handling an exception: from then on the scope is persisted in the
//! frame's unwind help slot (`establisher + unwind_help`), which holds
//! [`UNWIND_HELP_UNSET`] until then.
//!
//! Catch handlers are funclets: they run in a frame of their own, receive the
//! establisher frame of their function, and are entered from inside the unwind that
//! tears down the frames above the function. Committing to a catch therefore requests a
//! [`STATUS_UNWIND_CONSOLIDATE`] unwind whose record carries everything needed to run the
//! handler afterwards:
//!
//! | Index | Content |
//! |-------|---------|
//! | 0 | consolidation callback |
//! | 1 | establisher frame |
//! | 2 | function descriptor |
//! | 3 | scope to unwind the target frame to (try block start) |
//! | 4 | catch handler |
//! | 5 | scope the handler runs at (try block end + 1) |
//! | 6 | image base |
//! | 7 | non-zero if the target frame is itself a catch funclet |
//! | 8 | try block index |
//! | 9 | catch block |
//! | 10 | caught-object registration |
//! | 11 | frame handler thunk of the function |

use std::{convert::Infallible, sync::Arc};

use crate::{
    arch::Arch,
    exception::{
        invoker::{self, run_catch_body, CatchCommit, CatchSite, CatchStrategy},
        unwind::{chain_floor, local_unwind, IpStateSlot, ScopeSlot, UnwindHelpSlot},
        ExceptionFlags, ExceptionRecord, STATUS_LONGJUMP, STATUS_UNWIND_CONSOLIDATE,
    },
    memory::AddressSpace,
    metadata::{
        Addressing, CatchBlock, FunctionDescriptor, Layout, MetadataContext, SCOPE_NONE,
        UNWIND_HELP_UNSET,
    },
    runtime::{
        control_transfer, frame_offset, unwind, Activation, ActivationKind, ContinueSearch,
        DispatchContext, Flow, Thread,
    },
    Error, Result, TerminateReason,
};

/// Number of parameters of a consolidation record.
const CONSOLIDATE_PARAMS: usize = 12;

/// Handles `record` for the frame `dispatch` describes.
///
/// # Errors
///
/// Returns the transfer of a committed catch, a fault, or a terminate.
pub(crate) fn frame_handler(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    dispatch: &DispatchContext,
    descriptor: u64,
) -> Flow<ContinueSearch> {
    let runtime = Arc::clone(thread.runtime());
    let space = runtime.space();
    let arch = runtime.arch();
    let activation = &dispatch.activation;
    let ctx = MetadataContext::new(space, arch, Addressing::for_arch(arch, activation.image_base));

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

    let establisher = frame_base(space, arch, activation)?;
    let ip_state = descr.ip_to_state(&ctx, activation.control_pc)?;
    let floor = match activation.kind {
        ActivationKind::Funclet { try_index, .. } => Some(descr.try_block(&ctx, try_index)?.end + 1),
        _ => None,
    };

    log::trace!(
        "frame handler: frame 0x{:X} pc 0x{:X} state {} code 0x{:08X} flags {:?}",
        activation.key,
        activation.control_pc,
        ip_state,
        record.code,
        record.flags
    );

    let help_slot = UnwindHelpSlot {
        address: frame_offset(establisher, descr.unwind_help),
        ip_state,
    };
    let funclet_slot = IpStateSlot { level: ip_state };
    let slot: &dyn ScopeSlot = if floor.is_some() {
        &funclet_slot
    } else {
        &help_slot
    };

    if record.is_unwinding() {
        if descr.unwind_count == 0 {
            return Ok(ContinueSearch);
        }

        let target = if record.flags.contains(ExceptionFlags::TARGET_UNWIND) {
            match record.code {
                STATUS_UNWIND_CONSOLIDATE if record.param(2) == descriptor => record.param(3) as i32,
                STATUS_LONGJUMP => {
                    let context = control_transfer(arch).restore_context(space, record.param(0))?;
                    descr.ip_to_state(&ctx, context.registers.ip)?
                }
                _ => SCOPE_NONE,
            }
        } else if let Some(floor) = floor {
            // Scopes at or below the catch level belong to the parent frame
            let max_steps = runtime.config().limits.max_unwind_steps;
            chain_floor(&ctx, &descr, ip_state, floor, max_steps)?
        } else {
            SCOPE_NONE
        };

        local_unwind(thread, &ctx, &descr, establisher, slot, target)?;
        return Ok(ContinueSearch);
    }

    if descr.is_synchronous() && !record.is_cxx() {
        return Ok(ContinueSearch);
    }

    if descr.try_count > 0 {
        invoker::patch_rethrow(thread, record);
        if let Some(result) = invoker::custom_handler(thread, record, establisher, descriptor)? {
            return Ok(result);
        }

        let level = slot.load(space)?;
        let strategy = TableCatch {
            dispatch: dispatch.clone(),
            establisher,
            descriptor,
            funclet: floor.is_some(),
        };
        invoker::find_catch_block(
            thread,
            &strategy,
            &ctx,
            &descr,
            record,
            level,
            floor.unwrap_or(i32::MIN),
        )?;
    }

    if descr.is_noexcept() && record.is_cxx() && floor.is_none() {
        log::error!(
            "exception 0x{:08X} left noexcept function 0x{:X}",
            record.code,
            descriptor
        );
        return Err(thread.terminate(TerminateReason::NoexceptViolation));
    }
    Ok(ContinueSearch)
}

struct TableCatch {
    dispatch: DispatchContext,
    establisher: u64,
    descriptor: u64,
    funclet: bool,
}

impl CatchStrategy for TableCatch {
    fn frame(&self) -> u64 {
        self.establisher
    }

    fn commit(&self, thread: &mut Thread, commit: CatchCommit) -> Flow<Infallible> {
        let runtime = Arc::clone(thread.runtime());
        let activation = &self.dispatch.activation;

        let handler = commit.catch.handler.ok_or_else(|| {
            malformed_error!("Catch block 0x{:X} has no handler", commit.catch.address)
        })?;

        let mut consolidate =
            ExceptionRecord::new(STATUS_UNWIND_CONSOLIDATE, ExceptionFlags::NONCONTINUABLE);
        consolidate.address = activation.control_pc;
        consolidate.params = vec![
            runtime.thunks().consolidate,
            self.establisher,
            self.descriptor,
            commit.try_block.start as i64 as u64,
            handler,
            (commit.try_block.end + 1) as i64 as u64,
            activation.image_base,
            u64::from(self.funclet),
            commit.try_index as u64,
            commit.catch.address,
            commit.frame_info,
            activation.handler.unwrap_or(0),
        ];
        consolidate.nested = Some(Box::new(commit.record));

        log::debug!(
            "consolidating unwind to frame 0x{:X} for catch handler 0x{:X}",
            activation.key,
            handler
        );
        let never = unwind(thread, activation.key, activation.control_pc, consolidate, 0)?;
        match never {}
    }
}

/// Runs the catch handler described by a consolidation record.
///
/// Called by the unwinder once every frame above the target has been unwound. While the
/// handler runs, the function's unwind help slot holds the handler's scope; afterwards it
/// is reset so the function's scope follows its code address again, unless the target
/// frame is an enclosing catch funclet that is still running.
///
/// # Returns
///
/// The continuation address the handler returned.
///
/// # Errors
///
/// Returns the handler's escape, or [`Error::Malformed`] for an inconsistent record.
pub(crate) fn call_catch_block(thread: &mut Thread, record: &ExceptionRecord) -> Flow<u64> {
    if record.params.len() < CONSOLIDATE_PARAMS {
        return Err(malformed_error!(
            "Consolidation record has {} parameters",
            record.params.len()
        )
        .into());
    }
    let caught = record
        .nested
        .as_deref()
        .cloned()
        .ok_or_else(|| malformed_error!("Consolidation record carries no exception"))?;

    let runtime = Arc::clone(thread.runtime());
    let space = runtime.space();
    let arch = runtime.arch();

    let establisher = record.param(1);
    let descriptor = record.param(2);
    let handler = record.param(4);
    let catch_level = record.param(5) as i32;
    let image_base = record.param(6);
    let nested = record.param(7) != 0;

    let ctx = MetadataContext::new(space, arch, Addressing::for_arch(arch, image_base));
    let descr = FunctionDescriptor::read(&ctx, descriptor)?;
    let catch = CatchBlock::read(&ctx, record.param(9))?;

    let help = frame_offset(establisher, descr.unwind_help);
    let previous = space.read_i32(help)?;
    space.write_i32(help, catch_level)?;

    let site = CatchSite::Table {
        establisher,
        image_base,
        descriptor,
        handler: record.param(11),
        try_index: record.param(8) as usize,
        catch,
        try_level: catch_level,
    };
    let continuation = run_catch_body(thread, site, caught, record.param(10), handler)?;

    space.write_i32(help, if nested { previous } else { UNWIND_HELP_UNSET })?;
    Ok(continuation)
}

/// Returns the establisher frame of `activation`.
///
/// A catch funclet finds its function's establisher frame in the slot the catch block
/// names inside the funclet's own frame.
///
/// # Errors
///
/// Returns an error if the catch block or the slot cannot be read.
pub(crate) fn frame_base(space: &AddressSpace, arch: Arch, activation: &Activation) -> Result<u64> {
    match activation.kind {
        ActivationKind::Funclet { catch_block, .. } => {
            let ctx = MetadataContext::new(space, arch, Addressing::for_arch(arch, activation.image_base));
            let catch = CatchBlock::read(&ctx, catch_block)?;
            space.read_ptr(frame_offset(activation.key, catch.frame), arch)
        }
        ActivationKind::Function | ActivationKind::Guard => Ok(activation.key),
    }
}
