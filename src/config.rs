//! Runtime configuration types.
//!
//! Configuration is organized into three structures:
//!
//! - [`RuntimeConfig`] - Top-level configuration container
//! - [`MemoryConfig`] - Placement and sizing of images, heap and stacks
//! - [`RuntimeLimits`] - Safety boundaries for the emulated execution
//!
//! # Configuration Presets
//!
//! One preset exists per supported architecture, with an address layout that fits the
//! architecture's pointer width:
//!
//! - [`RuntimeConfig::i386()`]
//! - [`RuntimeConfig::x86_64()`]
//! - [`RuntimeConfig::arm()`]
//! - [`RuntimeConfig::arm64()`]
//!
//! # Example
//!
//! ```rust
//! use cxxframe::{RuntimeConfig, RuntimeLimits};
//!
//! let config = RuntimeConfig {
//!     limits: RuntimeLimits::new()
//!         .with_max_call_depth(64)
//!         .with_max_resumptions(16),
//!     ..RuntimeConfig::x86_64()
//! };
//! assert_eq!(config.limits.max_call_depth, 64);
//! ```

use crate::arch::Arch;

/// Complete runtime configuration.
///
/// # Default Configuration
///
/// The default configuration is the [`i386()`](Self::i386) preset.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Target architecture of the emulated process.
    pub arch: Arch,

    /// Memory layout settings.
    pub memory: MemoryConfig,

    /// Execution limits.
    pub limits: RuntimeLimits,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::i386()
    }
}

impl RuntimeConfig {
    /// Creates a configuration for `arch` with its default memory layout.
    #[must_use]
    pub fn for_arch(arch: Arch) -> Self {
        Self {
            arch,
            memory: MemoryConfig::for_arch(arch),
            limits: RuntimeLimits::default(),
        }
    }

    /// Preset for 32-bit x86 (frame-list dispatch).
    #[must_use]
    pub fn i386() -> Self {
        Self::for_arch(Arch::I386)
    }

    /// Preset for 64-bit x86 (table dispatch).
    #[must_use]
    pub fn x86_64() -> Self {
        Self::for_arch(Arch::X86_64)
    }

    /// Preset for 32-bit ARM (table dispatch).
    #[must_use]
    pub fn arm() -> Self {
        Self::for_arch(Arch::Arm)
    }

    /// Preset for 64-bit ARM (table dispatch).
    #[must_use]
    pub fn arm64() -> Self {
        Self::for_arch(Arch::Arm64)
    }

    /// Sets the memory configuration.
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Sets the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: RuntimeLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Memory layout configuration.
///
/// # Default Values
///
/// | Setting | 32-bit targets | 64-bit targets |
/// |---------|----------------|----------------|
/// | `image_base` | `0x0040_0000` | `0x1_4000_0000` |
/// | `image_size` | 1 MB | 1 MB |
/// | `heap_base` | `0x1000_0000` | `0x2_0000_0000` |
/// | `stack_size` | 256 KB | 256 KB |
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Address of the first mapped image.
    ///
    /// The runtime's own image (frame-handler thunks and callbacks) is mapped here,
    /// modules follow at `image_size` strides.
    pub image_base: u64,

    /// Size reserved for every image.
    ///
    /// Image-relative references are 32 bits wide, so an image must not exceed 4 GB.
    pub image_size: usize,

    /// First address handed out by the heap allocator.
    ///
    /// Thread stacks, environment blocks and thrown objects are allocated from here.
    pub heap_base: u64,

    /// Stack size per emulated thread in bytes.
    pub stack_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::for_arch(Arch::I386)
    }
}

impl MemoryConfig {
    /// Returns the default layout for `arch`.
    #[must_use]
    pub fn for_arch(arch: Arch) -> Self {
        let (image_base, heap_base) = match arch.pointer_size() {
            4 => (0x0040_0000, 0x1000_0000),
            _ => (0x1_4000_0000, 0x2_0000_0000),
        };

        Self {
            image_base,
            image_size: 0x10_0000,
            heap_base,
            stack_size: 0x4_0000,
        }
    }

    /// Sets the base address of the first image.
    #[must_use]
    pub fn with_image_base(mut self, image_base: u64) -> Self {
        self.image_base = image_base;
        self
    }

    /// Sets the per-image reservation.
    #[must_use]
    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = image_size;
        self
    }

    /// Sets the first heap address.
    #[must_use]
    pub fn with_heap_base(mut self, heap_base: u64) -> Self {
        self.heap_base = heap_base;
        self
    }

    /// Sets the per-thread stack size.
    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

/// Limits for the emulated execution.
///
/// When a limit is reached the operation fails instead of exhausting host resources.
///
/// # Default Values
///
/// | Limit | Default Value |
/// |-------|---------------|
/// | `max_call_depth` | 256 |
/// | `max_resumptions` | 1,024 |
/// | `max_unwind_steps` | 65,536 |
#[derive(Clone, Debug)]
pub struct RuntimeLimits {
    /// Maximum number of nested emulated calls per thread.
    ///
    /// Calls, catch bodies and cleanup funclets all count towards this limit.
    pub max_call_depth: usize,

    /// Maximum number of times a single body may be re-entered by control transfers.
    ///
    /// Exceeding it takes the terminate path, as a body that keeps catching and
    /// re-throwing would otherwise never finish.
    pub max_resumptions: usize,

    /// Maximum number of scopes a single local unwind may step through.
    pub max_unwind_steps: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_resumptions: 1024,
            max_unwind_steps: 65_536,
        }
    }
}

impl RuntimeLimits {
    /// Creates limits with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum call depth.
    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Sets the maximum number of resumptions per body.
    #[must_use]
    pub fn with_max_resumptions(mut self, resumptions: usize) -> Self {
        self.max_resumptions = resumptions;
        self
    }

    /// Sets the maximum number of local unwind steps.
    #[must_use]
    pub fn with_max_unwind_steps(mut self, steps: usize) -> Self {
        self.max_unwind_steps = steps;
        self
    }
}
