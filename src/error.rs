use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most variants describe a problem with the emulated process (a bad address, corrupt
/// compiler-emitted metadata, a code address without a bound implementation). The one
/// exception is [`Error::Terminated`], which is the fatal path of the exception ABI itself:
/// once a frame handler has committed to a target it must complete, and any inconsistency
/// discovered after that point ends the emulated process instead of being reported as a
/// recoverable failure.
///
/// # Error Categories
///
/// ## Memory Errors
/// - [`Error::InvalidAddress`] - Access outside any mapped region
/// - [`Error::OutOfMemory`] - A region or allocator ran out of space
///
/// ## Metadata Errors
/// - [`Error::Malformed`] - Corrupted or inconsistent compiler-emitted structures
/// - [`Error::UnsupportedVersion`] - Function descriptor magic outside the supported range
///
/// ## Native Code Errors
/// - [`Error::UnboundCode`] - A code address without an implementation
/// - [`Error::CodeKindMismatch`] - A code address bound to the wrong kind of code
///
/// ## Execution Errors
/// - [`Error::RecursionLimit`] - Emulated call depth exceeded
/// - [`Error::Terminated`] - The runtime's terminate path was taken
/// - [`Error::LockError`] - Poisoned lock in the shared address space
///
/// # Examples
///
/// ```rust
/// use cxxframe::{Error, TerminateReason};
///
/// let err = Error::Terminated(TerminateReason::InvalidTryLevel { level: 7, count: 3 });
/// assert!(err.is_fatal());
/// assert!(!Error::UnsupportedVersion(0x1234).is_fatal());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An access touched memory outside every mapped region.
    #[error("Invalid memory access at 0x{address:X} ({len} bytes)")]
    InvalidAddress {
        /// The first address of the access
        address: u64,
        /// The number of bytes accessed
        len: usize,
    },

    /// Compiler-emitted metadata is damaged and could not be navigated.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A function descriptor carries a magic number this runtime does not understand.
    ///
    /// Frame handlers treat this exactly like a frame without a handler: they decline
    /// and the search continues with the next frame.
    #[error("Unsupported function descriptor magic 0x{0:08X}")]
    UnsupportedVersion(u32),

    /// A code address has no native implementation bound to it.
    #[error("No native code bound at 0x{0:X}")]
    UnboundCode(u64),

    /// A code address is bound, but to a different kind of code than the caller needs.
    #[error("Native code at 0x{address:X} is a {found}, expected a {expected}")]
    CodeKindMismatch {
        /// The code address
        address: u64,
        /// What the caller expected to find
        expected: &'static str,
        /// What is actually bound there
        found: &'static str,
    },

    /// A region or allocator ran out of space.
    #[error("Out of emulated memory - {0}")]
    OutOfMemory(String),

    /// The emulated call depth limit was reached.
    #[error("Reach the maximum call depth allowed - {0}")]
    RecursionLimit(usize),

    /// The runtime's terminate path was taken.
    ///
    /// This is the emulated equivalent of `std::terminate`: the terminate hook has
    /// already been invoked by the time this error is observed.
    #[error("Terminated - {0}")]
    Terminated(TerminateReason),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Returns `true` if this error ends the emulated process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Terminated(_))
    }
}

/// Why the runtime's terminate path was taken.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// Local unwind found a scope index outside the unwind table.
    #[error("invalid try level {level} (unwind table holds {count} entries)")]
    InvalidTryLevel {
        /// The offending scope index
        level: i32,
        /// Number of unwind table entries
        count: usize,
    },

    /// No frame accepted the exception.
    #[error("unhandled exception 0x{code:08X}")]
    Unhandled {
        /// The exception code
        code: u32,
    },

    /// A C++ exception tried to leave a function declared `noexcept`.
    #[error("exception escaped a noexcept function")]
    NoexceptViolation,

    /// An unwind request named a frame that is not on the current stack.
    #[error("unwind target 0x{0:X} is not on the stack")]
    UnwindTargetNotFound(u64),

    /// A resumable body was re-entered more often than the configured limit.
    #[error("resumption limit {0} exceeded")]
    ResumeLimit(usize),

    /// A cleanup funclet, destructor or copy constructor failed while unwinding.
    #[error("cleanup code at 0x{0:X} failed during unwinding")]
    CleanupFailed(u64),
}
