//! C++ exception dispatch.
//!
//! This module is the C++ half of exception handling: the frame handlers the compiler
//! registers for every function with exception metadata, and everything they share.
//! The OS half, which walks frames and carries out unwind requests, is in
//! [`runtime`](crate::runtime).
//!
//! # Architecture
//!
//! ```text
//! record / state          exception records, per-thread exception state
//! matcher                 thrown type vs. catch clause
//! unwind                  running the cleanups of one frame
//! invoker                 catch clause search, object copy, handler invocation
//! framelist  |  table     per-dispatch-model frame handlers (i386 | x64, ARM, ARM64)
//! guard                   the frame around a running catch handler
//! api                     queries for runtime library code
//! ```
//!
//! # Key Components
//!
//! - [`ExceptionRecord`] - What the dispatcher hands to each frame handler
//! - [`ExceptionState`] - The exception being handled and the caught-object registry
//! - [`find_caught_type`] - The type matcher
//! - [`exception_filter`] / [`detect_rethrow`] - Queries used outside the frame handlers

mod api;
pub(crate) mod framelist;
pub(crate) mod guard;
mod invoker;
mod matcher;
mod record;
mod state;
pub(crate) mod table;
mod unwind;

pub use api::{
    destruct_exception_object, detect_rethrow, exception_filter,
    is_exception_object_to_be_destroyed, query_exception_size, FilterAction,
};
pub use matcher::find_caught_type;
pub use record::{
    ExceptionFlags, ExceptionRecord, CXX_EXCEPTION, STATUS_LONGJUMP, STATUS_UNWIND,
    STATUS_UNWIND_CONSOLIDATE,
};
pub use state::{ExceptionState, FrameInfo, FrameInfoId, NestedGuard};
