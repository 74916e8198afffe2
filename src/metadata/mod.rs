//! Compiler-emitted exception metadata.
//!
//! This module provides read-only navigation over the structures a compiler emits for
//! C++ exception handling, and builders that write the same layouts into an emulated
//! image.
//!
//! # Key Components
//!
//! - [`FunctionDescriptor`] - Per-function unwind, try and ip-map tables
//! - [`ThrowInfo`] / [`CatchableType`] / [`TypeDescriptor`] - Thrown-object type information
//! - [`Resolvable`] / [`Addressing`] - Architecture-neutral 32-bit references
//! - [`FunctionDescriptorBuilder`] / [`ThrowInfoBuilder`] - Metadata emission
//!
//! # Layout
//!
//! All references are 32 bits wide. On i386 they are absolute pointers, on the table
//! architectures they are relative to the emitting image's base; see [`Addressing`].

mod demangle;
pub mod descriptor;
pub mod emit;
pub mod resolvable;
pub mod rtti;

pub use demangle::demangle_type_name;
pub use descriptor::{
    CatchBlock, DescriptorVersion, FunctionDescriptor, FunctionFlags, IpMapEntry, TryBlock,
    UnwindEntry, MAGIC_V1, MAGIC_V2, MAGIC_V3, SCOPE_NONE, UNWIND_HELP_UNSET,
};
pub use emit::{
    emit_type_descriptor, CatchSpec, CatchableTypeSpec, EmittedFunction,
    FunctionDescriptorBuilder, ImageWriter, ThrowInfoBuilder, TryBlockSpec,
};
pub use resolvable::{Addressing, Layout, MetadataContext, Resolvable};
pub use rtti::{
    CatchableFlags, CatchableType, CatchableTypeTable, ThisPtrOffsets, ThrowInfo,
    TypeDescriptor, TypeQualifiers,
};
