// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
#![deny(unsafe_code)]

//! # cxxframe
//!
//! An emulated implementation of the MSVC C++ exception handling ABI: the frame handlers
//! compiled C++ code registers, the catch clause matching and object copying they
//! perform, local unwinding of try scopes, and the interaction with `setjmp`/`longjmp`.
//!
//! All ABI structures (function descriptors, throw infos, type descriptors, registration
//! records, jump buffers) live byte for byte in an emulated address space, and every code
//! address the ABI calls (cleanup funclets, catch handlers, copy constructors,
//! destructors) is bound to a Rust closure. This makes the dispatcher executable and
//! testable on any host while keeping the layouts exact.
//!
//! ## Features
//!
//! - **Four architectures** - i386 (frame-list dispatch) and x86-64, ARM and ARM64
//!   (table dispatch), sharing one matcher, one local unwinder and one catch invoker
//! - **Three descriptor versions** - including synchronous and `noexcept` functions
//! - **Nested exceptions** - rethrow detection and caught-object ownership across nested
//!   catch handlers
//! - **Non-local jumps** - `longjmp` runs the cleanups of every scope it leaves
//!
//! ## Quick Start
//!
//! ```rust
//! use cxxframe::{
//!     metadata::{CatchSpec, DescriptorVersion, FunctionDescriptorBuilder, TryBlockSpec},
//!     Runtime, RuntimeConfig,
//! };
//!
//! let runtime = Runtime::new(RuntimeConfig::x86_64())?;
//! let module = runtime.load_module("app.exe")?;
//!
//! // catch (...) { return 7; }
//! let handler = module.bind_catch(|_thread, _entry| Ok(0x7))?;
//! let function = module.function(
//!     "main",
//!     &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
//!         .unwind(-1, None)
//!         .unwind(-1, None)
//!         .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(handler))),
//! )?;
//!
//! let mut thread = runtime.spawn_thread()?;
//! let result = thread.call(&function, |thread, entry| {
//!     if let Some(continuation) = entry.resume_ip() {
//!         return Ok(continuation);
//!     }
//!     thread.set_try_level(0)?;
//!     thread.raise(0xC000_0005, &[])
//! });
//! assert_eq!(result, Ok(0x7));
//! # Ok::<(), cxxframe::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - Compiler-emitted structures: reading and emitting them
//! - [`exception`] - Frame handlers, type matching, local unwind, catch invocation
//! - [`runtime`] - The emulated process: threads, modules, the host dispatcher
//! - [`memory`] - The emulated address space
//! - [`Error`] and [`Result`] - Error handling

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Target architectures and their dispatch models.
pub mod arch;

/// Runtime configuration.
pub mod config;

/// C++ exception dispatch: frame handlers, the type matcher, local unwind and the
/// catch invoker.
///
/// # Key Types
///
/// - [`exception::ExceptionRecord`] - The record every frame handler receives
/// - [`exception::ExceptionState`] - Per-thread state of the exception being handled
pub mod exception;

/// The emulated address space.
pub mod memory;

/// Compiler-emitted exception metadata.
///
/// # Examples
///
/// ```rust
/// use cxxframe::{metadata::ThrowInfoBuilder, metadata::ImageWriter, Runtime, RuntimeConfig};
///
/// let runtime = Runtime::new(RuntimeConfig::arm64())?;
/// let module = runtime.load_module("lib.dll")?;
/// let throw_info = ThrowInfoBuilder::new().build(&module)?;
/// assert!(module.contains(throw_info));
/// # Ok::<(), cxxframe::Error>(())
/// ```
pub mod metadata;

/// The emulated process: runtime, modules, threads and the host dispatcher.
pub mod runtime;

/// `cxxframe` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cxxframe` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust
/// use cxxframe::{Error, TerminateReason};
///
/// fn describe(error: &Error) -> &'static str {
///     match error {
///         Error::Terminated(TerminateReason::Unhandled { .. }) => "uncaught exception",
///         Error::Terminated(_) => "terminated",
///         Error::UnsupportedVersion(_) => "unknown descriptor",
///         _ => "emulation error",
///     }
/// }
/// assert_eq!(describe(&Error::UnsupportedVersion(0)), "unknown descriptor");
/// ```
pub use error::{Error, TerminateReason};

pub use arch::{Arch, DispatchModel};
pub use config::{MemoryConfig, RuntimeConfig, RuntimeLimits};
pub use exception::{ExceptionFlags, ExceptionRecord};
pub use memory::{AddressSpace, MemoryProtection};
pub use runtime::{Entry, Escape, Flow, FunctionSpec, Module, Runtime, Thread, Transfer};
