//! Unified address space management for the emulated process.
//!
//! [`AddressSpace`] owns every [`MemoryRegion`] of an emulated process: module images,
//! thread stacks and heap allocations. All ABI structures (registration records, jump
//! buffers, function descriptors, throw information, thrown objects) are read and written
//! through it in their exact binary layout.
//!
//! # Example
//!
//! ```rust
//! use cxxframe::{AddressSpace, MemoryConfig, MemoryProtection};
//!
//! let space = AddressSpace::new(&MemoryConfig::default());
//! space.map(0x1000, 0x100, MemoryProtection::READ_WRITE, "test_data").unwrap();
//! space.write_u32(0x1000, 0xDEAD_BEEF).unwrap();
//! assert_eq!(space.read_u32(0x1000).unwrap(), 0xDEAD_BEEF);
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::{
    arch::Arch,
    config::MemoryConfig,
    memory::region::{MemoryProtection, MemoryRegion},
    Error, Result,
};

/// Longest string [`AddressSpace::read_cstr`] will scan before giving up.
const MAX_CSTR_LEN: usize = 4096;

/// Alignment of every bump allocation.
const ALLOC_ALIGN: u64 = 16;

/// Unified address space for an emulated process.
///
/// # Thread Safety
///
/// The region map is guarded by an `RwLock` and each region guards its own bytes, so an
/// `AddressSpace` can be shared between emulated threads through an `Arc`.
#[derive(Debug)]
pub struct AddressSpace {
    /// Mapped regions keyed by base address.
    regions: RwLock<BTreeMap<u64, Arc<MemoryRegion>>>,
    /// Next address handed out by the bump allocator.
    next_alloc: AtomicU64,
}

impl AddressSpace {
    /// Creates an empty address space.
    ///
    /// # Arguments
    ///
    /// * `config` - Memory configuration; `heap_base` seeds the bump allocator
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            next_alloc: AtomicU64::new(config.heap_base),
        }
    }

    /// Maps a zero-filled region at a fixed address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the region would overlap an existing one.
    pub fn map(
        &self,
        base: u64,
        size: usize,
        protection: MemoryProtection,
        label: impl Into<String>,
    ) -> Result<()> {
        let label = label.into();
        let end = base
            .checked_add(size as u64)
            .ok_or_else(|| Error::OutOfMemory(format!("region '{label}' wraps the address space")))?;

        let mut regions = write_lock!(self.regions);
        let overlaps = regions
            .range(..end)
            .next_back()
            .is_some_and(|(_, region)| region.end() > base);
        if overlaps {
            return Err(Error::OutOfMemory(format!(
                "region '{label}' at 0x{base:X} overlaps an existing mapping"
            )));
        }

        regions.insert(base, Arc::new(MemoryRegion::new(base, size, protection, label)));
        Ok(())
    }

    /// Allocates and maps a fresh read/write region from the bump allocator.
    ///
    /// # Arguments
    ///
    /// * `size` - Size in bytes (rounded up to the allocation alignment)
    /// * `label` - Human-readable name for debugging
    ///
    /// # Returns
    ///
    /// The base address of the new region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocation cannot be mapped.
    pub fn alloc(&self, size: usize, label: impl Into<String>) -> Result<u64> {
        let rounded = (size.max(1) as u64).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        // A guard gap keeps neighbouring allocations from being read as one.
        let base = self
            .next_alloc
            .fetch_add(rounded + ALLOC_ALIGN, Ordering::Relaxed);
        self.map(base, rounded as usize, MemoryProtection::READ_WRITE, label)?;
        Ok(base)
    }

    /// Returns the region containing `address`, if any.
    #[must_use]
    pub fn region_at(&self, address: u64) -> Option<Arc<MemoryRegion>> {
        let regions = self.regions.read().ok()?;
        regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(address, 1))
            .cloned()
    }

    /// Checks whether `address` is mapped.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.region_at(address).is_some()
    }

    fn region_for(&self, address: u64, len: usize) -> Result<Arc<MemoryRegion>> {
        self.region_at(address)
            .filter(|region| region.contains(address, len))
            .ok_or(Error::InvalidAddress { address, len })
    }

    /// Reads `buffer.len()` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not inside a single region.
    pub fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        self.region_for(address, buffer.len())?.read(address, buffer)
    }

    /// Reads `len` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not inside a single region.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0; len];
        self.read_into(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Writes `bytes` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not inside a single writable
    /// region.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        self.region_for(address, bytes.len())?.write(address, bytes)
    }

    /// Copies `len` bytes from `src` to `dest`; the ranges may overlap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if either range is unmapped.
    pub fn copy(&self, dest: u64, src: u64, len: usize) -> Result<()> {
        let bytes = self.read(src, len)?;
        self.write(dest, &bytes)
    }

    /// Fills `len` bytes at `address` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is unmapped.
    pub fn fill(&self, address: u64, value: u8, len: usize) -> Result<()> {
        self.write(address, &vec![value; len])
    }

    /// Reads a little-endian `u8`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is unmapped.
    pub fn read_u8(&self, address: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_into(address, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is unmapped.
    pub fn read_u16(&self, address: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_into(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is unmapped.
    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_into(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is unmapped.
    pub fn read_i32(&self, address: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_into(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is unmapped.
    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a native pointer of the given architecture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is unmapped.
    pub fn read_ptr(&self, address: u64, arch: Arch) -> Result<u64> {
        match arch.pointer_size() {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }

    /// Writes a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is not writable.
    pub fn write_u16(&self, address: u64, value: u16) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is not writable.
    pub fn write_u32(&self, address: u64, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is not writable.
    pub fn write_i32(&self, address: u64, value: i32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is not writable.
    pub fn write_u64(&self, address: u64, value: u64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a native pointer of the given architecture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is not writable.
    pub fn write_ptr(&self, address: u64, arch: Arch, value: u64) -> Result<()> {
        match arch.pointer_size() {
            4 => self.write_u32(address, arch.truncate(value) as u32),
            _ => self.write_u64(address, value),
        }
    }

    /// Reads a NUL-terminated string.
    ///
    /// Invalid UTF-8 is replaced lossily; mangled names are plain ASCII.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the string runs into unmapped memory and
    /// [`Error::Malformed`] if no terminator is found within a sane length.
    pub fn read_cstr(&self, address: u64) -> Result<String> {
        let region = self.region_for(address, 1)?;
        let available = (region.end() - address) as usize;
        let bytes = self.read(address, available.min(MAX_CSTR_LEN))?;

        match bytes.iter().position(|&b| b == 0) {
            Some(len) => Ok(String::from_utf8_lossy(&bytes[..len]).into_owned()),
            None => Err(malformed_error!(
                "Unterminated string at 0x{:X}",
                address
            )),
        }
    }

    /// Writes `value` followed by a NUL terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the range is not writable.
    pub fn write_cstr(&self, address: u64, value: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.write(address, &bytes)
    }

    /// Allocates a region holding a NUL-terminated copy of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocation fails.
    pub fn alloc_cstr(&self, value: &str, label: impl Into<String>) -> Result<u64> {
        let address = self.alloc(value.len() + 1, label)?;
        self.write_cstr(address, value)?;
        Ok(address)
    }

    /// Returns the number of mapped regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.read().map(|r| r.len()).unwrap_or(0)
    }
}
