//! Function exception descriptors and their nested tables.
//!
//! The compiler emits one [`FunctionDescriptor`] for every function that contains a
//! `try` block or an object with a destructor. It is immutable and is navigated
//! read-only by the frame handlers:
//!
//! ```text
//! FunctionDescriptor
//! ├── unwind table   [UnwindEntry; unwind_count]   scope -> (enclosing scope, cleanup)
//! ├── try table      [TryBlock; try_count]         scope range -> [CatchBlock; catch_count]
//! └── ip map         [IpMapEntry; ipmap_count]     code address -> scope (table model only)
//! ```
//!
//! # Versions
//!
//! | Magic | Version | Adds |
//! |-------|---------|------|
//! | `0x19930520` | [`DescriptorVersion::V1`] | |
//! | `0x19930521` | [`DescriptorVersion::V2`] | expected-exceptions list |
//! | `0x19930522` | [`DescriptorVersion::V3`] | [`FunctionFlags`] |
//!
//! On i386 the upper three bits of the magic word are used for other purposes and are
//! masked off before the version is determined. A magic outside the table is reported as
//! [`Error::UnsupportedVersion`], which frame handlers treat as "no handler here".

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::{
    arch::{Arch, DispatchModel},
    metadata::{
        resolvable::{read_ref, Layout, MetadataContext, Resolvable},
        rtti::{TypeDescriptor, TypeQualifiers},
    },
    Error, Result,
};

/// Magic number of version 1 descriptors, also the version tag of every C++ exception record.
pub const MAGIC_V1: u32 = 0x1993_0520;
/// Magic number of version 2 descriptors.
pub const MAGIC_V2: u32 = 0x1993_0521;
/// Magic number of version 3 descriptors.
pub const MAGIC_V3: u32 = 0x1993_0522;
/// Bits of the i386 magic word that hold the magic number.
pub const MAGIC_MASK_I386: u32 = 0x1FFF_FFFF;

/// Scope index of code outside every `try` and destructor scope.
pub const SCOPE_NONE: i32 = -1;
/// Value of the persisted scope slot before any unwinding started (table model).
pub const UNWIND_HELP_UNSET: i32 = -2;

/// Function descriptor version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum DescriptorVersion {
    /// Base layout
    V1,
    /// Adds the expected-exceptions list
    V2,
    /// Adds function flags
    V3,
}

impl DescriptorVersion {
    /// Returns the magic number of this version.
    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            DescriptorVersion::V1 => MAGIC_V1,
            DescriptorVersion::V2 => MAGIC_V2,
            DescriptorVersion::V3 => MAGIC_V3,
        }
    }

    /// Maps a (masked) magic number to its version.
    #[must_use]
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_V1 => Some(DescriptorVersion::V1),
            MAGIC_V2 => Some(DescriptorVersion::V2),
            MAGIC_V3 => Some(DescriptorVersion::V3),
            _ => None,
        }
    }

    /// Size in bytes of a descriptor of this version on `arch`.
    #[must_use]
    pub fn descriptor_size(self, arch: Arch) -> usize {
        let mut size = 7 * 4;
        if arch.dispatch_model() == DispatchModel::Table {
            size += 4;
        }
        if self >= DescriptorVersion::V2 {
            size += 4;
        }
        if self >= DescriptorVersion::V3 {
            size += 4;
        }
        size
    }
}

bitflags! {
    /// Function flags carried by version 3 descriptors.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u32 {
        /// Compiled with synchronous exception handling: only C++ exceptions are caught.
        const SYNCHRONOUS = 0x1;
        /// The function is `noexcept`.
        const NOEXCEPT = 0x4;
    }
}

/// One entry of the unwind table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindEntry {
    /// Scope index entered after this scope has been left
    pub prev: i32,
    /// Cleanup funclet run when the scope is unwound
    pub cleanup: Option<u64>,
}

impl Layout for UnwindEntry {
    fn size(_arch: Arch) -> usize {
        8
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        Ok(UnwindEntry {
            prev: ctx.space.read_i32(address)?,
            cleanup: ctx.addressing.resolve(ctx.space.read_u32(address + 4)?),
        })
    }
}

/// A catch clause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchBlock {
    /// Address of this catch block descriptor
    pub address: u64,
    /// Qualifiers of the declared type
    pub qualifiers: TypeQualifiers,
    /// Declared type; null for `catch(...)`
    pub type_descriptor: Resolvable<TypeDescriptor>,
    /// Where the caught object is stored, relative to the handler's frame
    pub offset: i32,
    /// Catch handler entry point
    pub handler: Option<u64>,
    /// Offset of the parent frame slot inside the handler's own frame (table model)
    pub frame: i32,
}

impl CatchBlock {
    /// Returns `true` for a `catch(...)` clause.
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.type_descriptor.is_null()
    }

    /// Reads the declared type, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the type descriptor cannot be read.
    pub fn declared_type(&self, ctx: &MetadataContext<'_>) -> Result<Option<TypeDescriptor>> {
        self.type_descriptor.load(ctx)
    }
}

impl Layout for CatchBlock {
    fn size(arch: Arch) -> usize {
        arch.catch_block_size()
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let space = ctx.space;
        let frame = match ctx.arch.dispatch_model() {
            DispatchModel::FrameList => 0,
            DispatchModel::Table => space.read_i32(address + 16)?,
        };

        Ok(CatchBlock {
            address,
            qualifiers: TypeQualifiers::from_bits_retain(space.read_u32(address)?),
            type_descriptor: read_ref(space, address + 4)?,
            offset: space.read_i32(address + 8)?,
            handler: ctx.addressing.resolve(space.read_u32(address + 12)?),
            frame,
        })
    }
}

/// A `try` block and its catch clauses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TryBlock {
    /// First scope index covered by the try block
    pub start: i32,
    /// Last scope index covered by the try block
    pub end: i32,
    /// Highest scope index used inside the catch handlers
    pub catch_level: i32,
    /// Number of catch clauses
    pub catch_count: u32,
    /// The catch clauses, in declaration order
    pub catches: Resolvable<CatchBlock>,
}

impl TryBlock {
    /// Checks whether `level` falls in `[start, end]`.
    #[must_use]
    pub fn contains(&self, level: i32) -> bool {
        self.start <= level && level <= self.end
    }

    /// Reads catch clause `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if `index` is out of range.
    pub fn catch_block(&self, ctx: &MetadataContext<'_>, index: usize) -> Result<CatchBlock> {
        if index >= self.catch_count as usize {
            return Err(malformed_error!(
                "Catch block {} out of range ({} entries)",
                index,
                self.catch_count
            ));
        }
        self.catches.load_at(ctx, index)
    }

    /// Reads all catch clauses in declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error if a catch block cannot be read.
    pub fn catch_blocks(&self, ctx: &MetadataContext<'_>) -> Result<Vec<CatchBlock>> {
        (0..self.catch_count as usize)
            .map(|index| self.catches.load_at(ctx, index))
            .collect()
    }
}

impl Layout for TryBlock {
    fn size(_arch: Arch) -> usize {
        20
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let space = ctx.space;
        Ok(TryBlock {
            start: space.read_i32(address)?,
            end: space.read_i32(address + 4)?,
            catch_level: space.read_i32(address + 8)?,
            catch_count: space.read_u32(address + 12)?,
            catches: read_ref(space, address + 16)?,
        })
    }
}

/// One entry of the instruction-pointer-to-scope map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpMapEntry {
    /// First code address of the range
    pub ip: u64,
    /// Scope index of the range
    pub state: i32,
}

impl Layout for IpMapEntry {
    fn size(_arch: Arch) -> usize {
        8
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let raw = ctx.space.read_u32(address)?;
        Ok(IpMapEntry {
            ip: ctx.addressing.resolve(raw).unwrap_or(0),
            state: ctx.space.read_i32(address + 4)?,
        })
    }
}

/// A function exception descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Magic number (masked on i386)
    pub magic: u32,
    /// Version derived from the magic
    pub version: DescriptorVersion,
    /// Number of unwind table entries
    pub unwind_count: u32,
    /// The unwind table
    pub unwind_table: Resolvable<UnwindEntry>,
    /// Number of try blocks
    pub try_count: u32,
    /// The try table
    pub try_table: Resolvable<TryBlock>,
    /// Number of ip map entries
    pub ipmap_count: u32,
    /// The ip map, sorted ascending by address
    pub ipmap: Resolvable<IpMapEntry>,
    /// Offset of the persisted scope slot in the establisher frame (table model)
    pub unwind_help: i32,
    /// Expected exceptions list (version 2 and later)
    pub expect_list: u32,
    /// Function flags (version 3)
    pub flags: FunctionFlags,
}

impl FunctionDescriptor {
    /// Reads the descriptor at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedVersion`] if the magic number is not recognised, or a
    /// memory error if the descriptor cannot be read.
    pub fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let space = ctx.space;
        let raw_magic = space.read_u32(address)?;
        let magic = match ctx.arch.dispatch_model() {
            DispatchModel::FrameList => raw_magic & MAGIC_MASK_I386,
            DispatchModel::Table => raw_magic,
        };
        let version =
            DescriptorVersion::from_magic(magic).ok_or(Error::UnsupportedVersion(raw_magic))?;

        let mut cursor = address + 28;
        let unwind_help = match ctx.arch.dispatch_model() {
            DispatchModel::FrameList => 0,
            DispatchModel::Table => {
                let value = space.read_i32(cursor)?;
                cursor += 4;
                value
            }
        };
        let expect_list = if version >= DescriptorVersion::V2 {
            let value = space.read_u32(cursor)?;
            cursor += 4;
            value
        } else {
            0
        };
        let flags = if version >= DescriptorVersion::V3 {
            FunctionFlags::from_bits_retain(space.read_u32(cursor)?)
        } else {
            FunctionFlags::empty()
        };

        Ok(FunctionDescriptor {
            address,
            magic,
            version,
            unwind_count: space.read_u32(address + 4)?,
            unwind_table: read_ref(space, address + 8)?,
            try_count: space.read_u32(address + 12)?,
            try_table: read_ref(space, address + 16)?,
            ipmap_count: space.read_u32(address + 20)?,
            ipmap: read_ref(space, address + 24)?,
            unwind_help,
            expect_list,
            flags,
        })
    }

    /// Returns `true` if only C++ exceptions may be caught by this function.
    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.version >= DescriptorVersion::V3 && self.flags.contains(FunctionFlags::SYNCHRONOUS)
    }

    /// Returns `true` if the function is `noexcept`.
    #[must_use]
    pub fn is_noexcept(&self) -> bool {
        self.version >= DescriptorVersion::V3 && self.flags.contains(FunctionFlags::NOEXCEPT)
    }

    /// Checks whether `level` indexes the unwind table.
    #[must_use]
    pub fn is_valid_level(&self, level: i32) -> bool {
        level >= 0 && (level as u32) < self.unwind_count
    }

    /// Reads the unwind entry of scope `level`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if `level` is outside the unwind table.
    pub fn unwind_entry(&self, ctx: &MetadataContext<'_>, level: i32) -> Result<UnwindEntry> {
        if !self.is_valid_level(level) {
            return Err(malformed_error!(
                "Scope {} outside the unwind table ({} entries)",
                level,
                self.unwind_count
            ));
        }
        self.unwind_table.load_at(ctx, level as usize)
    }

    /// Reads try block `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if `index` is out of range.
    pub fn try_block(&self, ctx: &MetadataContext<'_>, index: usize) -> Result<TryBlock> {
        if index >= self.try_count as usize {
            return Err(malformed_error!(
                "Try block {} out of range ({} entries)",
                index,
                self.try_count
            ));
        }
        self.try_table.load_at(ctx, index)
    }

    /// Reads all try blocks in table order.
    ///
    /// # Errors
    ///
    /// Returns an error if a try block cannot be read.
    pub fn try_blocks(&self, ctx: &MetadataContext<'_>) -> Result<Vec<TryBlock>> {
        (0..self.try_count as usize)
            .map(|index| self.try_table.load_at(ctx, index))
            .collect()
    }

    fn ipmap_entry(&self, ctx: &MetadataContext<'_>, index: usize) -> Result<IpMapEntry> {
        self.ipmap.load_at(ctx, index)
    }

    /// Maps a code address to the scope active there.
    ///
    /// The map is sorted ascending; the result is the state of the last entry whose
    /// address is not above `pc`, or [`SCOPE_NONE`] if `pc` precedes the first entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be read.
    pub fn ip_to_state(&self, ctx: &MetadataContext<'_>, pc: u64) -> Result<i32> {
        let (mut low, mut high) = (0usize, self.ipmap_count as usize);
        while low < high {
            let middle = low + (high - low) / 2;
            if self.ipmap_entry(ctx, middle)?.ip <= pc {
                low = middle + 1;
            } else {
                high = middle;
            }
        }

        if low == 0 {
            return Ok(SCOPE_NONE);
        }
        Ok(self.ipmap_entry(ctx, low - 1)?.state)
    }

    /// Finds the first code address mapped to `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be read.
    pub fn state_ip(&self, ctx: &MetadataContext<'_>, state: i32) -> Result<Option<u64>> {
        for index in 0..self.ipmap_count as usize {
            let entry = self.ipmap_entry(ctx, index)?;
            if entry.state == state {
                return Ok(Some(entry.ip));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::{
        config::MemoryConfig,
        memory::AddressSpace,
        metadata::resolvable::Addressing,
    };

    #[test]
    fn test_version_magic() {
        for version in DescriptorVersion::iter() {
            assert_eq!(DescriptorVersion::from_magic(version.magic()), Some(version));
        }
        assert_eq!(DescriptorVersion::from_magic(0x1993_0523), None);
        assert_eq!(DescriptorVersion::V1.descriptor_size(Arch::I386), 28);
        assert_eq!(DescriptorVersion::V3.descriptor_size(Arch::I386), 36);
        assert_eq!(DescriptorVersion::V3.descriptor_size(Arch::X86_64), 40);
    }

    #[test]
    fn test_i386_magic_is_masked() {
        let space = AddressSpace::new(&MemoryConfig::default());
        let base = space.alloc(64, "descriptor").unwrap();
        space.write_u32(base, MAGIC_V1 | 0xE000_0000).unwrap();

        let ctx = MetadataContext::new(&space, Arch::I386, Addressing::Absolute);
        let descriptor = FunctionDescriptor::read(&ctx, base).unwrap();
        assert_eq!(descriptor.version, DescriptorVersion::V1);

        let ctx = MetadataContext::new(
            &space,
            Arch::X86_64,
            Addressing::ImageRelative { image_base: 0 },
        );
        assert_eq!(
            FunctionDescriptor::read(&ctx, base),
            Err(Error::UnsupportedVersion(MAGIC_V1 | 0xE000_0000))
        );
    }

    #[test]
    fn test_ip_to_state() {
        let space = AddressSpace::new(&MemoryConfig::default());
        let base = space.alloc(128, "ipmap").unwrap();
        let map = base + 64;
        for (index, (ip, state)) in [(0x100u32, -1i32), (0x110, 0), (0x120, 1), (0x140, 0)]
            .iter()
            .enumerate()
        {
            space.write_u32(map + index as u64 * 8, *ip).unwrap();
            space.write_i32(map + index as u64 * 8 + 4, *state).unwrap();
        }

        space.write_u32(base, MAGIC_V1).unwrap();
        space.write_u32(base + 20, 4).unwrap();
        space.write_u32(base + 24, map as u32).unwrap();

        // Relative to zero, so raw values are plain addresses
        let ctx = MetadataContext::new(
            &space,
            Arch::Arm,
            Addressing::ImageRelative { image_base: 0 },
        );
        let descriptor = FunctionDescriptor::read(&ctx, base).unwrap();

        assert_eq!(descriptor.ip_to_state(&ctx, 0x50).unwrap(), SCOPE_NONE);
        assert_eq!(descriptor.ip_to_state(&ctx, 0x100).unwrap(), -1);
        assert_eq!(descriptor.ip_to_state(&ctx, 0x118).unwrap(), 0);
        assert_eq!(descriptor.ip_to_state(&ctx, 0x120).unwrap(), 1);
        assert_eq!(descriptor.ip_to_state(&ctx, 0x13F).unwrap(), 1);
        assert_eq!(descriptor.ip_to_state(&ctx, 0x9000).unwrap(), 0);
        assert_eq!(descriptor.state_ip(&ctx, 1).unwrap(), Some(0x120));
        assert_eq!(descriptor.state_ip(&ctx, 5).unwrap(), None);
    }

    #[test]
    fn test_try_block_contains() {
        let block = TryBlock {
            start: 1,
            end: 3,
            catch_level: 4,
            catch_count: 0,
            catches: Resolvable::default(),
        };
        assert!(!block.contains(0));
        assert!(block.contains(1));
        assert!(block.contains(3));
        assert!(!block.contains(4));
    }
}
