//! Memory region types for address space management.
//!
//! A [`MemoryRegion`] is a contiguous, labelled block of emulated memory. Regions back
//! module images (code and compiler-emitted metadata), thread stacks and heap
//! allocations for thrown objects.
//!
//! # Thread Safety
//!
//! All operations take `&self` and use interior mutability through a per-region
//! `RwLock`, so a region can be read by one thread while another thread writes to a
//! different region of the same address space.

use std::sync::RwLock;

use bitflags::bitflags;

use crate::{Error, Result};

bitflags! {
    /// Memory protection flags for address space regions.
    ///
    /// These flags control what operations are permitted on a memory region.
    /// They are modeled after Windows `PAGE_*` protection constants.
    ///
    /// # Common Combinations
    ///
    /// - [`READ_WRITE`](Self::READ_WRITE) - Stacks, heap objects, `.data`
    /// - [`READ_EXECUTE`](Self::READ_EXECUTE) - Code
    /// - [`READ`](Self::READ) - Read-only metadata (`.rdata`)
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

/// A memory region in the emulated address space.
#[derive(Debug)]
pub struct MemoryRegion {
    /// Base virtual address of this region.
    base: u64,
    /// Backing bytes of the region.
    data: RwLock<Vec<u8>>,
    /// Size of the region in bytes, fixed at creation.
    size: usize,
    /// Memory protection for the region.
    protection: MemoryProtection,
    /// Human-readable label for debugging.
    label: String,
}

impl MemoryRegion {
    /// Creates a zero-filled region.
    ///
    /// # Arguments
    ///
    /// * `base` - The base address of the region
    /// * `size` - Size in bytes
    /// * `protection` - Access rights
    /// * `label` - Human-readable name for debugging
    #[must_use]
    pub fn new(base: u64, size: usize, protection: MemoryProtection, label: impl Into<String>) -> Self {
        Self {
            base,
            data: RwLock::new(vec![0; size]),
            size,
            protection,
            label: label.into(),
        }
    }

    /// Returns the base address of the region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the first address past the end of the region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size as u64
    }

    /// Returns the region's protection flags.
    #[must_use]
    pub fn protection(&self) -> MemoryProtection {
        self.protection
    }

    /// Returns the region's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Checks whether `[address, address + len)` lies entirely inside this region.
    #[must_use]
    pub fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end())
    }

    /// Reads bytes starting at `address` into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not inside this region.
    pub fn read(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        if !self.contains(address, buffer.len()) {
            return Err(Error::InvalidAddress {
                address,
                len: buffer.len(),
            });
        }

        let start = (address - self.base) as usize;
        with_read!(self.data, |data: &Vec<u8>| {
            buffer.copy_from_slice(&data[start..start + buffer.len()]);
        });
        Ok(())
    }

    /// Writes `bytes` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not inside this region or the
    /// region is not writable.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        if !self.contains(address, bytes.len()) || !self.protection.contains(MemoryProtection::WRITE)
        {
            return Err(Error::InvalidAddress {
                address,
                len: bytes.len(),
            });
        }

        let start = (address - self.base) as usize;
        with_write!(self.data, |data: &mut Vec<u8>| {
            data[start..start + bytes.len()].copy_from_slice(bytes);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_bounds() {
        let region = MemoryRegion::new(0x1000, 0x100, MemoryProtection::READ_WRITE, "test");
        assert!(region.contains(0x1000, 0x100));
        assert!(!region.contains(0x10FF, 2));
        assert!(!region.contains(0x0FFF, 1));
        assert_eq!(region.end(), 0x1100);
    }

    #[test]
    fn test_region_read_write() {
        let region = MemoryRegion::new(0x1000, 0x10, MemoryProtection::READ_WRITE, "test");
        region.write(0x1004, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 4];
        region.read(0x1003, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn test_region_read_only() {
        let region = MemoryRegion::new(0x1000, 0x10, MemoryProtection::READ, "rdata");
        assert!(matches!(
            region.write(0x1000, &[1]),
            Err(Error::InvalidAddress { address: 0x1000, .. })
        ));
    }
}
