//! Runtime type information attached to thrown objects.
//!
//! A `throw` expression references a [`ThrowInfo`], which lists every type the thrown
//! object can be caught as:
//!
//! ```text
//! ThrowInfo
//! ├── qualifiers, destructor, custom handler
//! └── CatchableTypeTable
//!     └── [CatchableType]   most-derived first
//!         ├── TypeDescriptor   {vtable, name cache, decorated name}
//!         ├── ThisPtrOffsets   adjustment to the base sub-object
//!         └── size, copy constructor
//! ```
//!
//! Type identity is decided by comparing descriptor addresses first and decorated names
//! second, so that the same type emitted by two independently compiled images still
//! matches.

use bitflags::bitflags;

use crate::{
    arch::Arch,
    metadata::{
        demangle::demangle_type_name,
        resolvable::{read_ref, Layout, MetadataContext, Resolvable},
    },
    Result,
};

bitflags! {
    /// Qualifiers of a thrown type or of a catch clause's declared type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
    pub struct TypeQualifiers: u32 {
        /// `const`
        const CONST = 0x1;
        /// `volatile`
        const VOLATILE = 0x2;
        /// `__unaligned`
        const UNALIGNED = 0x4;
        /// Caught by reference
        const REFERENCE = 0x8;
    }
}

bitflags! {
    /// Properties of a catchable type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
    pub struct CatchableFlags: u32 {
        /// Trivially copyable (fundamental types and pointers)
        const SIMPLE_TYPE = 0x1;
        /// May only be caught by reference
        const BY_REFERENCE_ONLY = 0x2;
        /// The type has a virtual base class
        const HAS_VIRTUAL_BASE = 0x4;
    }
}

/// A type descriptor (`type_info` object).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Address of the descriptor
    pub address: u64,
    /// Virtual table pointer of the `type_info` object
    pub vtable: u64,
    /// Cached demangled name, or zero if not computed yet
    pub name_cache: u64,
    /// Decorated name
    pub mangled: String,
}

impl TypeDescriptor {
    /// Offset of the decorated name inside the descriptor.
    #[must_use]
    pub fn name_offset(arch: Arch) -> usize {
        2 * arch.pointer_size()
    }

    /// Checks whether `self` and `other` denote the same type.
    #[must_use]
    pub fn same_type(&self, other: &TypeDescriptor) -> bool {
        self.address == other.address || self.mangled == other.mangled
    }

    /// Returns the readable type name, computing and caching it on first use.
    ///
    /// The demangled string is allocated in the address space and its address stored in
    /// the descriptor's name-cache field; names that cannot be demangled are cached as
    /// their decorated form.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read, allocated or written.
    pub fn name(&self, ctx: &MetadataContext<'_>) -> Result<String> {
        let cache_slot = self.address + ctx.arch.pointer_size() as u64;
        let cached = ctx.space.read_ptr(cache_slot, ctx.arch)?;
        if cached != 0 {
            return ctx.space.read_cstr(cached);
        }

        let name = demangle_type_name(&self.mangled).unwrap_or_else(|| self.mangled.clone());
        let address = ctx.space.alloc_cstr(&name, format!("type_name {}", self.mangled))?;
        ctx.space.write_ptr(cache_slot, ctx.arch, address)?;
        log::trace!("cached type name '{}' for {}", name, self.mangled);
        Ok(name)
    }
}

impl Layout for TypeDescriptor {
    fn size(arch: Arch) -> usize {
        Self::name_offset(arch)
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let pointer = ctx.arch.pointer_size() as u64;
        Ok(TypeDescriptor {
            address,
            vtable: ctx.space.read_ptr(address, ctx.arch)?,
            name_cache: ctx.space.read_ptr(address + pointer, ctx.arch)?,
            mangled: ctx.space.read_cstr(address + 2 * pointer)?,
        })
    }
}

/// How to get from the thrown object to one of its base sub-objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThisPtrOffsets {
    /// Offset added after the virtual base adjustment
    pub this_offset: i32,
    /// Offset of the virtual base table pointer, or negative if there is no virtual base
    pub vbase_descr: i32,
    /// Offset of the displacement inside the virtual base table
    pub vbase_offset: i32,
}

impl Default for ThisPtrOffsets {
    fn default() -> Self {
        Self {
            this_offset: 0,
            vbase_descr: -1,
            vbase_offset: 0,
        }
    }
}

impl ThisPtrOffsets {
    /// Adjusts `object` to the sub-object these offsets describe.
    ///
    /// With a virtual base, the pointer first moves to the virtual base table pointer
    /// and then by the displacement stored in that table; `this_offset` is added last.
    /// A null object stays null.
    ///
    /// # Errors
    ///
    /// Returns an error if the virtual base table cannot be read.
    pub fn apply(&self, ctx: &MetadataContext<'_>, object: u64) -> Result<u64> {
        if object == 0 {
            return Ok(0);
        }

        let mut object = object;
        if self.vbase_descr >= 0 {
            object = object.wrapping_add_signed(i64::from(self.vbase_descr));
            let table = ctx.space.read_ptr(object, ctx.arch)?;
            let displacement = ctx
                .space
                .read_i32(table.wrapping_add_signed(i64::from(self.vbase_offset)))?;
            object = object.wrapping_add_signed(i64::from(displacement));
        }

        Ok(ctx
            .arch
            .truncate(object.wrapping_add_signed(i64::from(self.this_offset))))
    }
}

/// One type a thrown object can be caught as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchableType {
    /// Address of this entry
    pub address: u64,
    /// Type properties
    pub flags: CatchableFlags,
    /// The type
    pub type_descriptor: Resolvable<TypeDescriptor>,
    /// Adjustment from the thrown object to this type's sub-object
    pub offsets: ThisPtrOffsets,
    /// Size of the sub-object in bytes
    pub size: u32,
    /// Copy constructor, if the type is not trivially copyable
    pub copy_ctor: Option<u64>,
}

impl CatchableType {
    /// Reads the type descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`](crate::Error::Malformed) if the reference is null.
    pub fn type_descriptor(&self, ctx: &MetadataContext<'_>) -> Result<TypeDescriptor> {
        self.type_descriptor
            .load(ctx)?
            .ok_or_else(|| malformed_error!("Catchable type at 0x{:X} has no type", self.address))
    }
}

impl Layout for CatchableType {
    fn size(_arch: Arch) -> usize {
        28
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let space = ctx.space;
        Ok(CatchableType {
            address,
            flags: CatchableFlags::from_bits_retain(space.read_u32(address)?),
            type_descriptor: read_ref(space, address + 4)?,
            offsets: ThisPtrOffsets {
                this_offset: space.read_i32(address + 8)?,
                vbase_descr: space.read_i32(address + 12)?,
                vbase_offset: space.read_i32(address + 16)?,
            },
            size: space.read_u32(address + 20)?,
            copy_ctor: ctx.addressing.resolve(space.read_u32(address + 24)?),
        })
    }
}

/// The list of catchable types of a thrown object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchableTypeTable {
    /// Address of the table
    pub address: u64,
    /// Entries, most-derived type first
    pub entries: Vec<Resolvable<CatchableType>>,
}

impl CatchableTypeTable {
    /// Reads every entry of the table.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is null or cannot be read.
    pub fn load_all(&self, ctx: &MetadataContext<'_>) -> Result<Vec<CatchableType>> {
        self.entries
            .iter()
            .map(|entry| {
                entry.load(ctx)?.ok_or_else(|| {
                    malformed_error!("Null entry in catchable type table 0x{:X}", self.address)
                })
            })
            .collect()
    }
}

impl Layout for CatchableTypeTable {
    fn size(_arch: Arch) -> usize {
        4
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let count = ctx.space.read_u32(address)?;
        let entries = (0..u64::from(count))
            .map(|index| read_ref(ctx.space, address + 4 + index * 4))
            .collect::<Result<Vec<_>>>()?;
        Ok(CatchableTypeTable { address, entries })
    }
}

/// Throw information: the static description of a thrown type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrowInfo {
    /// Address of the structure
    pub address: u64,
    /// Qualifiers of the thrown type
    pub qualifiers: TypeQualifiers,
    /// Destructor of the thrown object
    pub destructor: Option<u64>,
    /// Frame handler replacement used by newer compilers
    pub custom_handler: Option<u64>,
    /// The catchable types
    pub catchable_types: Resolvable<CatchableTypeTable>,
}

impl ThrowInfo {
    /// Size of a throw info structure, identical on every architecture.
    pub const SIZE: usize = 16;

    /// Reads all catchable types, most-derived first.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn catchable_types(&self, ctx: &MetadataContext<'_>) -> Result<Vec<CatchableType>> {
        match self.catchable_types.load(ctx)? {
            Some(table) => table.load_all(ctx),
            None => Ok(Vec::new()),
        }
    }
}

impl Layout for ThrowInfo {
    fn size(_arch: Arch) -> usize {
        Self::SIZE
    }

    fn read(ctx: &MetadataContext<'_>, address: u64) -> Result<Self> {
        let space = ctx.space;
        Ok(ThrowInfo {
            address,
            qualifiers: TypeQualifiers::from_bits_retain(space.read_u32(address)?),
            destructor: ctx.addressing.resolve(space.read_u32(address + 4)?),
            custom_handler: ctx.addressing.resolve(space.read_u32(address + 8)?),
            catchable_types: read_ref(space, address + 12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::MemoryConfig, memory::AddressSpace, metadata::Addressing};

    #[test]
    fn test_this_pointer_plain() {
        let space = AddressSpace::new(&MemoryConfig::default());
        let ctx = MetadataContext::new(&space, Arch::I386, Addressing::Absolute);
        let offsets = ThisPtrOffsets {
            this_offset: 8,
            ..Default::default()
        };
        assert_eq!(offsets.apply(&ctx, 0x1000).unwrap(), 0x1008);
        assert_eq!(offsets.apply(&ctx, 0).unwrap(), 0);
    }

    #[test]
    fn test_this_pointer_virtual_base() {
        let space = AddressSpace::new(&MemoryConfig::default());
        let ctx = MetadataContext::new(&space, Arch::I386, Addressing::Absolute);

        let object = space.alloc(32, "object").unwrap();
        let vbtable = space.alloc(16, "vbtable").unwrap();
        // vbtable pointer at +4, displacement 0x10 at vbtable+4
        space.write_u32(object + 4, vbtable as u32).unwrap();
        space.write_i32(vbtable + 4, 0x10).unwrap();

        let offsets = ThisPtrOffsets {
            this_offset: 2,
            vbase_descr: 4,
            vbase_offset: 4,
        };
        assert_eq!(offsets.apply(&ctx, object).unwrap(), object + 4 + 0x10 + 2);
    }

    #[test]
    fn test_type_name_cache() {
        let space = AddressSpace::new(&MemoryConfig::default());
        let ctx = MetadataContext::new(&space, Arch::I386, Addressing::Absolute);

        let address = space.alloc(32, "type").unwrap();
        space.write_cstr(address + 8, ".?AVwidget@ui@@").unwrap();

        let descriptor = TypeDescriptor::read(&ctx, address).unwrap();
        assert_eq!(descriptor.name_cache, 0);
        assert_eq!(descriptor.name(&ctx).unwrap(), "class ui::widget");

        let cached = space.read_u32(address + 4).unwrap();
        assert_ne!(cached, 0);
        assert_eq!(descriptor.name(&ctx).unwrap(), "class ui::widget");
        assert_eq!(space.read_u32(address + 4).unwrap(), cached);
    }

    #[test]
    fn test_same_type_by_name() {
        let a = TypeDescriptor {
            address: 0x1000,
            vtable: 0,
            name_cache: 0,
            mangled: ".?AVfoo@@".into(),
        };
        let b = TypeDescriptor {
            address: 0x2000,
            ..a.clone()
        };
        let c = TypeDescriptor {
            mangled: ".?AVbar@@".into(),
            ..b.clone()
        };
        assert!(a.same_type(&b));
        assert!(!a.same_type(&c));
    }
}
