//! Memory model for the emulated process.
//!
//! The exception ABI is defined entirely in terms of in-memory layouts, so the emulator
//! keeps a byte-addressable view of the process rather than Rust-side object graphs.
//!
//! # Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`AddressSpace`] | Unified view of all memory (images, stacks, heap objects) |
//! | [`MemoryRegion`] | A contiguous mapped block with protection and a label |
//! | [`MemoryProtection`] | Access flags modeled after Windows `PAGE_*` constants |

mod addressspace;
mod region;

pub use addressspace::AddressSpace;
pub use region::{MemoryProtection, MemoryRegion};
