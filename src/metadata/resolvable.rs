//! Architecture-neutral references inside compiler-emitted metadata.
//!
//! Every reference stored in a function descriptor, a throw info or a catchable type is
//! a 32-bit word. On the frame-list architecture it is an absolute pointer; on the table
//! architectures it is an offset from the base of the image that emitted the structure.
//! [`Addressing`] captures which of the two applies, and [`Resolvable`] wraps a raw
//! reference together with the type it points at, so navigation code never branches on
//! the architecture.

use std::{fmt, marker::PhantomData};

use crate::{arch::Arch, memory::AddressSpace, Result};

/// How raw 32-bit metadata references map to addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// References are absolute pointers.
    Absolute,
    /// References are offsets from an image base.
    ImageRelative {
        /// Base address of the image owning the referencing structure
        image_base: u64,
    },
}

impl Addressing {
    /// Returns the addressing mode `arch` uses for structures emitted by an image
    /// loaded at `image_base`.
    #[must_use]
    pub fn for_arch(arch: Arch, image_base: u64) -> Self {
        if arch.uses_image_relative_references() {
            Addressing::ImageRelative { image_base }
        } else {
            Addressing::Absolute
        }
    }

    /// Resolves a raw reference. A zero reference is null in both modes.
    #[must_use]
    pub fn resolve(self, raw: u32) -> Option<u64> {
        if raw == 0 {
            return None;
        }

        match self {
            Addressing::Absolute => Some(u64::from(raw)),
            Addressing::ImageRelative { image_base } => Some(image_base + u64::from(raw)),
        }
    }

    /// Encodes `address` as a raw reference; `None` encodes as zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`](crate::Error::Malformed) if the address cannot be represented, either because
    /// it lies below the image base or is more than 4 GB away from it.
    pub fn encode(self, address: Option<u64>) -> Result<u32> {
        let Some(address) = address else {
            return Ok(0);
        };

        let raw = match self {
            Addressing::Absolute => address,
            Addressing::ImageRelative { image_base } => {
                address.checked_sub(image_base).ok_or_else(|| {
                    malformed_error!(
                        "Address 0x{:X} lies below image base 0x{:X}",
                        address,
                        image_base
                    )
                })?
            }
        };

        u32::try_from(raw)
            .map_err(|_| malformed_error!("Address 0x{:X} is not encodable as a reference", address))
    }
}

/// Shared state needed to navigate metadata.
#[derive(Clone, Copy)]
pub struct MetadataContext<'a> {
    /// The address space holding the metadata
    pub space: &'a AddressSpace,
    /// Architecture the metadata was emitted for
    pub arch: Arch,
    /// How references inside the metadata resolve
    pub addressing: Addressing,
}

impl<'a> MetadataContext<'a> {
    /// Creates a navigation context.
    #[must_use]
    pub fn new(space: &'a AddressSpace, arch: Arch, addressing: Addressing) -> Self {
        Self {
            space,
            arch,
            addressing,
        }
    }

    /// Returns a context for the same space and architecture with different addressing.
    #[must_use]
    pub fn with_addressing(self, addressing: Addressing) -> Self {
        Self { addressing, ..self }
    }
}

/// A metadata structure that can be read from the address space.
pub trait Layout: Sized {
    /// Size of one instance in bytes on `arch`.
    fn size(arch: Arch) -> usize;

    /// Reads one instance located at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory is unmapped or the structure is inconsistent.
    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self>;
}

/// A typed raw reference to a `T` stored in metadata.
pub struct Resolvable<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Resolvable<T> {
    /// Wraps a raw reference.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Returns the raw 32-bit value.
    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.raw
    }

    /// Returns `true` if the reference is null.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// Resolves the reference to an address.
    #[must_use]
    pub fn address(&self, addressing: Addressing) -> Option<u64> {
        addressing.resolve(self.raw)
    }
}

impl<T: Layout> Resolvable<T> {
    /// Reads the referenced structure, or `None` for a null reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the referenced memory cannot be read.
    pub fn load(&self, ctx: &MetadataContext<'_>) -> Result<Option<T>> {
        match self.address(ctx.addressing) {
            Some(address) => T::read(ctx, address).map(Some),
            None => Ok(None),
        }
    }

    /// Reads element `index` of the array the reference points at.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`](crate::Error::Malformed) for a null array reference.
    pub fn load_at(&self, ctx: &MetadataContext<'_>, index: usize) -> Result<T> {
        let base = self
            .address(ctx.addressing)
            .ok_or_else(|| malformed_error!("Null array reference"))?;
        T::read(ctx, base + (index * T::size(ctx.arch)) as u64)
    }
}

impl<T> Clone for Resolvable<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Resolvable<T> {}

impl<T> PartialEq for Resolvable<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Resolvable<T> {}

impl<T> Default for Resolvable<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> fmt::Debug for Resolvable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resolvable(0x{:08X})", self.raw)
    }
}

/// Reads the 32-bit reference stored at `address`.
pub(crate) fn read_ref<T>(space: &AddressSpace, address: u64) -> Result<Resolvable<T>> {
    space.read_u32(address).map(Resolvable::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute() {
        let addressing = Addressing::for_arch(Arch::I386, 0x40_0000);
        assert_eq!(addressing, Addressing::Absolute);
        assert_eq!(addressing.resolve(0x40_1000), Some(0x40_1000));
        assert_eq!(addressing.resolve(0), None);
        assert_eq!(addressing.encode(Some(0x40_1000)).unwrap(), 0x40_1000);
        assert!(addressing.encode(Some(0x1_0000_0000)).is_err());
    }

    #[test]
    fn test_image_relative() {
        let addressing = Addressing::for_arch(Arch::X86_64, 0x1_4000_0000);
        assert_eq!(addressing.resolve(0x1234), Some(0x1_4000_1234));
        assert_eq!(addressing.encode(Some(0x1_4000_1234)).unwrap(), 0x1234);
        assert_eq!(addressing.encode(None).unwrap(), 0);
        assert!(addressing.encode(Some(0x1000)).is_err());
    }

    #[test]
    fn test_resolvable() {
        let reference: Resolvable<u32> = Resolvable::new(0x20);
        assert!(!reference.is_null());
        assert_eq!(
            reference.address(Addressing::ImageRelative { image_base: 0x1000 }),
            Some(0x1020)
        );
        assert!(Resolvable::<u32>::default().is_null());
    }
}
