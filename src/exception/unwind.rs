//! Local unwind: running the cleanups of one frame down to a target scope.
//!
//! Scopes form a tree through the unwind table's `prev` links. Unwinding from the
//! current scope to a target walks that chain, calling each scope's cleanup funclet,
//! and finally records the target as the frame's current scope. Where the current scope
//! lives differs per dispatch model, so it is read and written through a [`ScopeSlot`].

use crate::{
    memory::AddressSpace,
    metadata::{FunctionDescriptor, MetadataContext, UNWIND_HELP_UNSET},
    runtime::{Flow, Thread},
    Result, TerminateReason,
};

/// Storage of a frame's current scope.
pub(crate) trait ScopeSlot {
    /// Reads the current scope.
    fn load(&self, space: &AddressSpace) -> Result<i32>;

    /// Records `level` as the current scope.
    fn store(&self, space: &AddressSpace, level: i32) -> Result<()>;
}

/// The try level word of an i386 C++ frame.
pub(crate) struct TryLevelSlot {
    pub address: u64,
}

impl ScopeSlot for TryLevelSlot {
    fn load(&self, space: &AddressSpace) -> Result<i32> {
        space.read_i32(self.address)
    }

    fn store(&self, space: &AddressSpace, level: i32) -> Result<()> {
        space.write_i32(self.address, level)
    }
}

/// The persisted scope slot of a table-model function frame.
///
/// While the slot holds [`UNWIND_HELP_UNSET`] the scope is the one the ip map assigns to
/// the frame's code address.
pub(crate) struct UnwindHelpSlot {
    pub address: u64,
    pub ip_state: i32,
}

impl ScopeSlot for UnwindHelpSlot {
    fn load(&self, space: &AddressSpace) -> Result<i32> {
        let value = space.read_i32(self.address)?;
        Ok(if value == UNWIND_HELP_UNSET {
            self.ip_state
        } else {
            value
        })
    }

    fn store(&self, space: &AddressSpace, level: i32) -> Result<()> {
        space.write_i32(self.address, level)
    }
}

/// The scope of a catch funclet, derived from its code address only.
///
/// Stores are dropped: a funclet must not overwrite its parent's persisted scope.
pub(crate) struct IpStateSlot {
    pub level: i32,
}

impl ScopeSlot for IpStateSlot {
    fn load(&self, _space: &AddressSpace) -> Result<i32> {
        Ok(self.level)
    }

    fn store(&self, _space: &AddressSpace, _level: i32) -> Result<()> {
        Ok(())
    }
}

/// Unwinds a frame from its current scope down to `target`.
///
/// Every scope on the way runs its cleanup with `frame` (the frame pointer on i386, the
/// establisher frame on table architectures). A scope outside the unwind table, or a
/// `prev` chain longer than the configured step limit, takes the terminate path.
///
/// # Errors
///
/// Returns the escape of a cleanup, or terminates on an inconsistent scope chain.
pub(crate) fn local_unwind(
    thread: &mut Thread,
    ctx: &MetadataContext<'_>,
    descriptor: &FunctionDescriptor,
    frame: u64,
    slot: &dyn ScopeSlot,
    target: i32,
) -> Flow<()> {
    let max_steps = thread.runtime().config().limits.max_unwind_steps;
    let mut level = slot.load(ctx.space)?;
    let mut steps = 0;

    log::trace!(
        "local unwind of frame 0x{:X} from {} to {}",
        frame,
        level,
        target
    );

    while level != target {
        if !descriptor.is_valid_level(level) || steps >= max_steps {
            log::error!(
                "invalid try level {} in descriptor 0x{:X}",
                level,
                descriptor.address
            );
            return Err(thread.terminate(TerminateReason::InvalidTryLevel {
                level,
                count: descriptor.unwind_count as usize,
            }));
        }
        steps += 1;

        let entry = descriptor.unwind_entry(ctx, level)?;
        // An exception raised by the cleanup must see the scope as already left
        slot.store(ctx.space, entry.prev)?;
        if let Some(cleanup) = entry.cleanup {
            log::trace!("calling cleanup 0x{:X} of scope {}", cleanup, level);
            thread.call_cleanup(cleanup, frame)?;
        }
        level = entry.prev;
    }

    slot.store(ctx.space, target)?;
    Ok(())
}

/// Follows the `prev` chain from `from` to the first scope not above `ceiling`.
///
/// Stops early at a scope outside the unwind table, leaving it to [`local_unwind`] to
/// reject.
pub(crate) fn chain_floor(
    ctx: &MetadataContext<'_>,
    descriptor: &FunctionDescriptor,
    from: i32,
    ceiling: i32,
    max_steps: usize,
) -> Result<i32> {
    let mut level = from;
    let mut steps = 0;
    while level > ceiling && descriptor.is_valid_level(level) && steps < max_steps {
        level = descriptor.unwind_entry(ctx, level)?.prev;
        steps += 1;
    }
    Ok(level)
}
