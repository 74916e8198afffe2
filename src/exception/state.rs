//! Per-thread exception handling state.
//!
//! Every emulated thread owns one [`ExceptionState`]. It tracks:
//!
//! - The record of the exception currently being handled, used for rethrow detection
//! - The number of searches in progress, which drives `uncaught_exception()`
//! - The registry of caught objects ([`FrameInfo`]), which decides whether an object may
//!   be destroyed when a catch handler finishes
//! - The stack of nested-exception guards installed around running catch handlers
//!
//! # State Transitions
//!
//! 1. **Normal execution** - no current record, no guards
//! 2. **Search** - `processing_throw > 0` while frame handlers look for a catch clause
//! 3. **Handler running** - the caught record is current, a guard and a frame info are live
//! 4. **Handler finished** - the previous record is current again, the guard and frame info
//!    are gone, the object was destroyed unless another frame info still owns it
//!
//! # Thread Safety
//!
//! The state is owned by exactly one emulated thread and needs no synchronisation.

use crate::exception::record::ExceptionRecord;

/// Identifier of a caught-object registration.
pub type FrameInfoId = u64;

/// A caught-object registration.
///
/// A committed catch registers the object it is about to hand to its handler. The object
/// may only be destroyed once no registration references it any more.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Registration identifier
    pub id: FrameInfoId,
    /// The caught object
    pub object: u64,
}

/// A nested-exception guard installed for the duration of a catch handler.
#[derive(Clone, Debug)]
pub struct NestedGuard {
    /// Registration record address (frame list) or guard activation key (table)
    pub handle: u64,
    /// The record being handled
    pub caught: ExceptionRecord,
    /// The record that was current before the handler started
    pub previous: Option<ExceptionRecord>,
    /// The caught-object registration of the handler
    pub frame_info: FrameInfoId,
    /// Registration record of the function owning the handler (frame list)
    pub parent: u64,
    /// Function descriptor of the function owning the handler
    pub descriptor: u64,
    /// Scope index the handler runs at
    pub try_level: i32,
    /// Value of the owning frame's saved stack slot before the handler started
    pub saved_stack: u64,
}

/// Exception handling state of one thread.
#[derive(Debug, Default)]
pub struct ExceptionState {
    current: Option<ExceptionRecord>,
    processing_throw: u32,
    frame_infos: Vec<FrameInfo>,
    next_frame_info: FrameInfoId,
    guards: Vec<NestedGuard>,
}

impl ExceptionState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of the exception currently being handled.
    #[must_use]
    pub fn current(&self) -> Option<&ExceptionRecord> {
        self.current.as_ref()
    }

    /// Replaces the current record, returning the previous one.
    pub fn replace_current(&mut self, record: Option<ExceptionRecord>) -> Option<ExceptionRecord> {
        std::mem::replace(&mut self.current, record)
    }

    /// Marks the start of a catch clause search.
    pub fn begin_search(&mut self) {
        self.processing_throw += 1;
    }

    /// Marks the end of a catch clause search.
    pub fn end_search(&mut self) {
        self.processing_throw = self.processing_throw.saturating_sub(1);
    }

    /// Returns the number of searches in progress.
    #[must_use]
    pub fn processing_throw(&self) -> u32 {
        self.processing_throw
    }

    /// Returns `true` while an exception is looking for its handler.
    #[must_use]
    pub fn uncaught_exception(&self) -> bool {
        self.processing_throw > 0
    }

    /// Registers a caught object.
    pub fn register_object(&mut self, object: u64) -> FrameInfoId {
        self.next_frame_info += 1;
        let id = self.next_frame_info;
        self.frame_infos.push(FrameInfo { id, object });
        id
    }

    /// Removes a caught-object registration.
    ///
    /// Returns the removed registration, or `None` if it was already gone.
    pub fn unregister_object(&mut self, id: FrameInfoId) -> Option<FrameInfo> {
        let index = self.frame_infos.iter().rposition(|info| info.id == id)?;
        Some(self.frame_infos.remove(index))
    }

    /// Checks whether any registration still references `object`.
    #[must_use]
    pub fn is_object_owned(&self, object: u64) -> bool {
        self.frame_infos.iter().any(|info| info.object == object)
    }

    /// Returns the live registrations, oldest first.
    #[must_use]
    pub fn frame_infos(&self) -> &[FrameInfo] {
        &self.frame_infos
    }

    /// Installs a nested-exception guard.
    pub fn push_guard(&mut self, guard: NestedGuard) {
        self.guards.push(guard);
    }

    /// Looks up a guard by its handle.
    #[must_use]
    pub fn guard(&self, handle: u64) -> Option<&NestedGuard> {
        self.guards.iter().rev().find(|guard| guard.handle == handle)
    }

    /// Removes a guard by its handle.
    pub fn remove_guard(&mut self, handle: u64) -> Option<NestedGuard> {
        let index = self.guards.iter().rposition(|guard| guard.handle == handle)?;
        Some(self.guards.remove(index))
    }

    /// Returns the number of installed guards.
    #[must_use]
    pub fn guard_depth(&self) -> usize {
        self.guards.len()
    }
}
