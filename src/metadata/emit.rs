//! Emission of exception metadata into an image.
//!
//! The structures read by [`descriptor`](crate::metadata::descriptor) and
//! [`rtti`](crate::metadata::rtti) are normally produced by a compiler. The builders in
//! this module write the same bit-exact layouts into an emulated image, so that frame
//! handlers can be exercised against metadata of every version on every architecture.
//!
//! # Example
//!
//! ```rust,no_run
//! use cxxframe::metadata::{CatchSpec, DescriptorVersion, FunctionDescriptorBuilder, TryBlockSpec};
//! # fn emit(module: &cxxframe::Module, cleanup: u64, handler: u64) -> cxxframe::Result<()> {
//! let descriptor = FunctionDescriptorBuilder::new(DescriptorVersion::V3)
//!     .unwind(-1, Some(cleanup))
//!     .unwind(0, None)
//!     .try_block(TryBlockSpec::new(1, 1).catch(CatchSpec::catch_all(handler)))
//!     .build(module)?;
//! # Ok(())
//! # }
//! ```

use crate::{
    arch::{Arch, DispatchModel},
    memory::AddressSpace,
    metadata::{
        descriptor::{DescriptorVersion, FunctionFlags, SCOPE_NONE},
        resolvable::Addressing,
        rtti::{CatchableFlags, ThisPtrOffsets, TypeDescriptor, TypeQualifiers},
    },
    Result,
};

/// Distance between the synthetic code addresses of consecutive scopes.
const STATE_STRIDE: u64 = 4;

/// An image that metadata can be written into.
pub trait ImageWriter {
    /// Architecture of the image.
    fn arch(&self) -> Arch;

    /// Base address of the image.
    fn image_base(&self) -> u64;

    /// The address space the image lives in.
    fn space(&self) -> &AddressSpace;

    /// Reserves `size` bytes of data inside the image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the image is full.
    fn reserve(&self, size: usize) -> Result<u64>;

    /// Reserves `size` bytes of code address range inside the image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if the image is full.
    fn reserve_code(&self, size: usize) -> Result<u64>;

    /// How references emitted into this image are encoded.
    fn addressing(&self) -> Addressing {
        Addressing::for_arch(self.arch(), self.image_base())
    }
}

/// Writes a type descriptor for the decorated name `mangled` and returns its address.
///
/// # Errors
///
/// Returns an error if the image has no room left.
pub fn emit_type_descriptor<W: ImageWriter + ?Sized>(writer: &W, mangled: &str) -> Result<u64> {
    let arch = writer.arch();
    let offset = TypeDescriptor::name_offset(arch);
    let address = writer.reserve(offset + mangled.len() + 1)?;

    // vtable and name cache start out null
    writer.space().write_ptr(address, arch, 0)?;
    writer
        .space()
        .write_ptr(address + arch.pointer_size() as u64, arch, 0)?;
    writer.space().write_cstr(address + offset as u64, mangled)?;
    Ok(address)
}

/// Specification of one catchable type.
#[derive(Clone, Debug)]
pub struct CatchableTypeSpec {
    type_descriptor: u64,
    flags: CatchableFlags,
    offsets: ThisPtrOffsets,
    size: u32,
    copy_ctor: Option<u64>,
}

impl CatchableTypeSpec {
    /// A catchable type of `size` bytes described by the type descriptor at `type_descriptor`.
    #[must_use]
    pub fn new(type_descriptor: u64, size: u32) -> Self {
        Self {
            type_descriptor,
            flags: CatchableFlags::empty(),
            offsets: ThisPtrOffsets::default(),
            size,
            copy_ctor: None,
        }
    }

    /// Marks the type as trivially copyable.
    #[must_use]
    pub fn simple(mut self) -> Self {
        self.flags |= CatchableFlags::SIMPLE_TYPE;
        self
    }

    /// Marks the type as catchable by reference only.
    #[must_use]
    pub fn by_reference_only(mut self) -> Self {
        self.flags |= CatchableFlags::BY_REFERENCE_ONLY;
        self
    }

    /// Sets the offset from the thrown object to this type's sub-object.
    #[must_use]
    pub fn this_offset(mut self, offset: i32) -> Self {
        self.offsets.this_offset = offset;
        self
    }

    /// Places this type behind a virtual base.
    #[must_use]
    pub fn virtual_base(mut self, vbase_descr: i32, vbase_offset: i32) -> Self {
        self.flags |= CatchableFlags::HAS_VIRTUAL_BASE;
        self.offsets.vbase_descr = vbase_descr;
        self.offsets.vbase_offset = vbase_offset;
        self
    }

    /// Sets the copy constructor.
    #[must_use]
    pub fn copy_constructor(mut self, address: u64) -> Self {
        self.copy_ctor = Some(address);
        self
    }

    fn emit<W: ImageWriter + ?Sized>(&self, writer: &W) -> Result<u64> {
        let addressing = writer.addressing();
        let space = writer.space();
        let address = writer.reserve(28)?;

        space.write_u32(address, self.flags.bits())?;
        space.write_u32(address + 4, addressing.encode(Some(self.type_descriptor))?)?;
        space.write_i32(address + 8, self.offsets.this_offset)?;
        space.write_i32(address + 12, self.offsets.vbase_descr)?;
        space.write_i32(address + 16, self.offsets.vbase_offset)?;
        space.write_u32(address + 20, self.size)?;
        space.write_u32(address + 24, addressing.encode(self.copy_ctor)?)?;
        Ok(address)
    }
}

/// Builder for a throw info and its catchable type table.
#[derive(Clone, Debug, Default)]
pub struct ThrowInfoBuilder {
    qualifiers: TypeQualifiers,
    destructor: Option<u64>,
    custom_handler: Option<u64>,
    catchables: Vec<CatchableTypeSpec>,
}

impl ThrowInfoBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the qualifiers of the thrown type.
    #[must_use]
    pub fn qualifiers(mut self, qualifiers: TypeQualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    /// Sets the destructor of the thrown object.
    #[must_use]
    pub fn destructor(mut self, address: u64) -> Self {
        self.destructor = Some(address);
        self
    }

    /// Sets a custom frame handler.
    #[must_use]
    pub fn custom_handler(mut self, address: u64) -> Self {
        self.custom_handler = Some(address);
        self
    }

    /// Appends a catchable type; the first one appended is the most-derived type.
    #[must_use]
    pub fn catchable(mut self, spec: CatchableTypeSpec) -> Self {
        self.catchables.push(spec);
        self
    }

    /// Writes the structures and returns the throw info address.
    ///
    /// # Errors
    ///
    /// Returns an error if the image has no room left.
    pub fn build<W: ImageWriter + ?Sized>(&self, writer: &W) -> Result<u64> {
        let addressing = writer.addressing();
        let space = writer.space();

        let entries = self
            .catchables
            .iter()
            .map(|spec| spec.emit(writer))
            .collect::<Result<Vec<_>>>()?;

        let table = writer.reserve(4 + 4 * entries.len())?;
        space.write_u32(table, u32::try_from(entries.len()).unwrap_or(u32::MAX))?;
        for (index, entry) in entries.iter().enumerate() {
            space.write_u32(table + 4 + 4 * index as u64, addressing.encode(Some(*entry))?)?;
        }

        let address = writer.reserve(16)?;
        space.write_u32(address, self.qualifiers.bits())?;
        space.write_u32(address + 4, addressing.encode(self.destructor)?)?;
        space.write_u32(address + 8, addressing.encode(self.custom_handler)?)?;
        space.write_u32(address + 12, addressing.encode(Some(table))?)?;
        Ok(address)
    }
}

/// Specification of one catch clause.
#[derive(Clone, Debug)]
pub struct CatchSpec {
    handler: u64,
    type_descriptor: Option<u64>,
    qualifiers: TypeQualifiers,
    offset: i32,
    frame: i32,
}

impl CatchSpec {
    /// A `catch(...)` clause running `handler`.
    #[must_use]
    pub fn catch_all(handler: u64) -> Self {
        Self {
            handler,
            type_descriptor: None,
            qualifiers: TypeQualifiers::empty(),
            offset: 0,
            frame: 0,
        }
    }

    /// A clause catching the type described at `type_descriptor`.
    #[must_use]
    pub fn typed(handler: u64, type_descriptor: u64) -> Self {
        Self {
            type_descriptor: Some(type_descriptor),
            ..Self::catch_all(handler)
        }
    }

    /// Catches by reference.
    #[must_use]
    pub fn by_reference(mut self) -> Self {
        self.qualifiers |= TypeQualifiers::REFERENCE;
        self
    }

    /// Adds qualifiers to the declared type.
    #[must_use]
    pub fn qualifiers(mut self, qualifiers: TypeQualifiers) -> Self {
        self.qualifiers |= qualifiers;
        self
    }

    /// Stores the caught object at `offset` from the handler frame.
    #[must_use]
    pub fn offset(mut self, offset: i32) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the parent frame slot offset used by the table model.
    #[must_use]
    pub fn frame(mut self, frame: i32) -> Self {
        self.frame = frame;
        self
    }
}

/// Specification of one try block.
#[derive(Clone, Debug)]
pub struct TryBlockSpec {
    start: i32,
    end: i32,
    catch_level: i32,
    catches: Vec<CatchSpec>,
}

impl TryBlockSpec {
    /// A try block covering scopes `start..=end`.
    #[must_use]
    pub fn new(start: i32, end: i32) -> Self {
        Self {
            start,
            end,
            catch_level: end,
            catches: Vec::new(),
        }
    }

    /// Sets the highest scope used inside the handlers.
    #[must_use]
    pub fn catch_level(mut self, level: i32) -> Self {
        self.catch_level = level;
        self
    }

    /// Appends a catch clause; clauses are tried in the order they are appended.
    #[must_use]
    pub fn catch(mut self, spec: CatchSpec) -> Self {
        self.catches.push(spec);
        self
    }
}

/// Addresses produced by [`FunctionDescriptorBuilder::build`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmittedFunction {
    /// Address of the function descriptor
    pub descriptor: u64,
    /// Entry point of the function, mapped to [`SCOPE_NONE`]
    pub entry: u64,
}

/// Builder for a function descriptor.
///
/// On table architectures the builder also emits the ip map. Every scope `s` of the
/// unwind table gets a synthetic code address `entry + 4 * (s + 1)`, and every catch
/// handler entry point is mapped to the scope one past its try block's end.
#[derive(Clone, Debug)]
pub struct FunctionDescriptorBuilder {
    version: DescriptorVersion,
    unwind: Vec<(i32, Option<u64>)>,
    tries: Vec<TryBlockSpec>,
    flags: FunctionFlags,
    unwind_help: i32,
    expect_list: u32,
    raw_magic: Option<u32>,
}

impl FunctionDescriptorBuilder {
    /// Creates a builder for a descriptor of `version`.
    #[must_use]
    pub fn new(version: DescriptorVersion) -> Self {
        Self {
            version,
            unwind: Vec::new(),
            tries: Vec::new(),
            flags: FunctionFlags::empty(),
            unwind_help: 8,
            expect_list: 0,
            raw_magic: None,
        }
    }

    /// Appends an unwind entry; the first one appended is scope 0.
    #[must_use]
    pub fn unwind(mut self, prev: i32, cleanup: Option<u64>) -> Self {
        self.unwind.push((prev, cleanup));
        self
    }

    /// Appends a try block.
    #[must_use]
    pub fn try_block(mut self, spec: TryBlockSpec) -> Self {
        self.tries.push(spec);
        self
    }

    /// Sets the function flags (version 3 only).
    #[must_use]
    pub fn flags(mut self, flags: FunctionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the offset of the persisted scope slot in the establisher frame.
    #[must_use]
    pub fn unwind_help(mut self, offset: i32) -> Self {
        self.unwind_help = offset;
        self
    }

    /// Sets the expected exceptions list word (version 2 and later).
    #[must_use]
    pub fn expect_list(mut self, value: u32) -> Self {
        self.expect_list = value;
        self
    }

    /// Overrides the magic word, for descriptors a frame handler must decline.
    #[must_use]
    pub fn raw_magic(mut self, magic: u32) -> Self {
        self.raw_magic = Some(magic);
        self
    }

    /// Writes the descriptor and all of its tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the image has no room left or a reference cannot be encoded.
    pub fn build<W: ImageWriter + ?Sized>(&self, writer: &W) -> Result<EmittedFunction> {
        let arch = writer.arch();
        let addressing = writer.addressing();
        let space = writer.space();
        let count = |len: usize| u32::try_from(len).unwrap_or(u32::MAX);

        let entry = writer.reserve_code(STATE_STRIDE as usize * (self.unwind.len() + 2))?;

        let unwind_table = if self.unwind.is_empty() {
            None
        } else {
            let table = writer.reserve(8 * self.unwind.len())?;
            for (index, (prev, cleanup)) in self.unwind.iter().enumerate() {
                let slot = table + 8 * index as u64;
                space.write_i32(slot, *prev)?;
                space.write_u32(slot + 4, addressing.encode(*cleanup)?)?;
            }
            Some(table)
        };

        let try_table = if self.tries.is_empty() {
            None
        } else {
            let mut catch_tables = Vec::with_capacity(self.tries.len());
            for spec in &self.tries {
                catch_tables.push(self.emit_catches(writer, &spec.catches)?);
            }

            let table = writer.reserve(20 * self.tries.len())?;
            for (index, (spec, catches)) in self.tries.iter().zip(&catch_tables).enumerate() {
                let slot = table + 20 * index as u64;
                space.write_i32(slot, spec.start)?;
                space.write_i32(slot + 4, spec.end)?;
                space.write_i32(slot + 8, spec.catch_level)?;
                space.write_u32(slot + 12, count(spec.catches.len()))?;
                space.write_u32(slot + 16, addressing.encode(*catches)?)?;
            }
            Some(table)
        };

        let (ipmap_count, ipmap) = match arch.dispatch_model() {
            DispatchModel::FrameList => (0, None),
            DispatchModel::Table => {
                let entries = self.ip_map(entry);
                let table = writer.reserve(8 * entries.len())?;
                for (index, (ip, state)) in entries.iter().enumerate() {
                    let slot = table + 8 * index as u64;
                    space.write_u32(slot, addressing.encode(Some(*ip))?)?;
                    space.write_i32(slot + 4, *state)?;
                }
                (count(entries.len()), Some(table))
            }
        };

        let descriptor = writer.reserve(self.version.descriptor_size(arch))?;
        space.write_u32(
            descriptor,
            self.raw_magic.unwrap_or_else(|| self.version.magic()),
        )?;
        space.write_u32(descriptor + 4, count(self.unwind.len()))?;
        space.write_u32(descriptor + 8, addressing.encode(unwind_table)?)?;
        space.write_u32(descriptor + 12, count(self.tries.len()))?;
        space.write_u32(descriptor + 16, addressing.encode(try_table)?)?;
        space.write_u32(descriptor + 20, ipmap_count)?;
        space.write_u32(descriptor + 24, addressing.encode(ipmap)?)?;

        let mut cursor = descriptor + 28;
        if arch.dispatch_model() == DispatchModel::Table {
            space.write_i32(cursor, self.unwind_help)?;
            cursor += 4;
        }
        if self.version >= DescriptorVersion::V2 {
            space.write_u32(cursor, self.expect_list)?;
            cursor += 4;
        }
        if self.version >= DescriptorVersion::V3 {
            space.write_u32(cursor, self.flags.bits())?;
        }

        Ok(EmittedFunction { descriptor, entry })
    }

    fn emit_catches<W: ImageWriter + ?Sized>(
        &self,
        writer: &W,
        catches: &[CatchSpec],
    ) -> Result<Option<u64>> {
        if catches.is_empty() {
            return Ok(None);
        }

        let arch = writer.arch();
        let addressing = writer.addressing();
        let space = writer.space();
        let size = arch.catch_block_size() as u64;

        let table = writer.reserve(size as usize * catches.len())?;
        for (index, spec) in catches.iter().enumerate() {
            let slot = table + size * index as u64;
            space.write_u32(slot, spec.qualifiers.bits())?;
            space.write_u32(slot + 4, addressing.encode(spec.type_descriptor)?)?;
            space.write_i32(slot + 8, spec.offset)?;
            space.write_u32(slot + 12, addressing.encode(Some(spec.handler))?)?;
            if arch.dispatch_model() == DispatchModel::Table {
                space.write_i32(slot + 16, spec.frame)?;
            }
        }
        Ok(Some(table))
    }

    fn ip_map(&self, entry: u64) -> Vec<(u64, i32)> {
        let scopes = self.unwind.len() as i32;
        let mut entries: Vec<(u64, i32)> = (SCOPE_NONE..scopes)
            .map(|state| (entry + STATE_STRIDE * (state + 1) as u64, state))
            .collect();

        for spec in &self.tries {
            for catch in &spec.catches {
                entries.push((catch.handler, spec.end + 1));
            }
        }

        entries.sort_by_key(|(ip, _)| *ip);
        entries.dedup_by_key(|(ip, _)| *ip);
        entries
    }
}
