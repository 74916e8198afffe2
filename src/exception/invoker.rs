//! Catch clause search and catch handler invocation.
//!
//! These routines are shared by both dispatch models. The model-specific part of
//! committing to a catch (how frames are unwound, how the handler is reached) is behind
//! the [`CatchStrategy`] trait; the model-specific part of running a handler (which
//! guard frame is installed) is described by a [`CatchSite`].

use std::{convert::Infallible, sync::Arc};

use crate::{
    exception::{
        matcher::find_caught_type,
        record::{ExceptionFlags, ExceptionRecord},
        state::{FrameInfoId, NestedGuard},
    },
    metadata::{
        CatchBlock, CatchableFlags, CatchableType, FunctionDescriptor, Layout, MetadataContext,
        ThrowInfo, TryBlock, TypeQualifiers, MAGIC_V3,
    },
    runtime::{
        frame_offset, i386_frame, Activation, ActivationKind, ContinueSearch, Flow, Thread,
    },
};

/// Size of the stack frame reserved for a running catch handler.
const CATCH_FRAME_SIZE: usize = 64;

/// A catch clause chosen by [`find_catch_block`].
pub(crate) struct CatchCommit {
    /// Index of the try block in the descriptor's try table
    pub try_index: usize,
    /// The try block
    pub try_block: TryBlock,
    /// The accepting catch clause
    pub catch: CatchBlock,
    /// The exception being caught
    pub record: ExceptionRecord,
    /// Caught-object registration made for the handler
    pub frame_info: FrameInfoId,
}

/// How a dispatch model commits to a catch clause.
pub(crate) trait CatchStrategy {
    /// The frame caught objects are stored relative to.
    fn frame(&self) -> u64;

    /// Unwinds to the catching frame and runs the handler; never returns normally.
    fn commit(&self, thread: &mut Thread, commit: CatchCommit) -> Flow<Infallible>;
}

/// Searches the try blocks enclosing `level` for a clause accepting `record`.
///
/// Try blocks starting below `floor` are skipped; a search on behalf of a running catch
/// handler only considers the try blocks nested inside that handler. Try blocks are
/// scanned in table order and the catch clauses of each in declaration
/// order. A C++ exception is matched against each clause's declared type; any other
/// exception is accepted by `catch(...)` only. The first accepting clause is committed
/// through `strategy`, after the exception object has been copied into the handler's
/// frame and registered as caught.
///
/// # Errors
///
/// Returns the transfer of a committed catch, or a fault.
pub(crate) fn find_catch_block<S: CatchStrategy>(
    thread: &mut Thread,
    strategy: &S,
    ctx: &MetadataContext<'_>,
    descriptor: &FunctionDescriptor,
    record: &ExceptionRecord,
    level: i32,
    floor: i32,
) -> Flow<ContinueSearch> {
    thread.exceptions_mut().begin_search();

    let found = match search(ctx, descriptor, record, level, floor) {
        Ok(found) => found,
        Err(error) => {
            thread.exceptions_mut().end_search();
            return Err(error.into());
        }
    };
    let Some((try_index, try_block, catch, caught)) = found else {
        thread.exceptions_mut().end_search();
        return Ok(ContinueSearch);
    };

    log::debug!(
        "descriptor 0x{:X}: try block {} catch 0x{:X} accepts exception 0x{:08X}",
        descriptor.address,
        try_index,
        catch.address,
        record.code
    );

    if let Err(escape) = copy_exception(thread, ctx, record, strategy.frame(), &catch, caught.as_ref()) {
        thread.exceptions_mut().end_search();
        return Err(escape);
    }
    let frame_info = thread.exceptions_mut().register_object(record.object());

    let never = strategy.commit(
        thread,
        CatchCommit {
            try_index,
            try_block,
            catch,
            record: record.clone(),
            frame_info,
        },
    )?;
    match never {}
}

type Found = Option<(usize, TryBlock, CatchBlock, Option<CatchableType>)>;

fn search(
    ctx: &MetadataContext<'_>,
    descriptor: &FunctionDescriptor,
    record: &ExceptionRecord,
    level: i32,
    floor: i32,
) -> crate::Result<Found> {
    let throw_ctx = MetadataContext::new(ctx.space, ctx.arch, record.throw_addressing(ctx.arch));
    let throw_info = if record.is_cxx() && record.throw_info() != 0 {
        Some(ThrowInfo::read(&throw_ctx, record.throw_info())?)
    } else {
        None
    };

    for (try_index, try_block) in descriptor.try_blocks(ctx)?.into_iter().enumerate() {
        if try_block.start < floor || !try_block.contains(level) {
            continue;
        }

        for catch in try_block.catch_blocks(ctx)? {
            match &throw_info {
                Some(info) => {
                    let declared = catch.declared_type(ctx)?;
                    if let Some(caught) =
                        find_caught_type(&throw_ctx, info, declared.as_ref(), catch.qualifiers)?
                    {
                        return Ok(Some((try_index, try_block, catch, Some(caught))));
                    }
                }
                None if catch.is_catch_all() => {
                    return Ok(Some((try_index, try_block, catch, None)));
                }
                None => {}
            }
        }
    }
    Ok(None)
}

/// Initialises the catch clause's parameter from the thrown object.
///
/// Nothing is copied for `catch(...)`, for a declared type with an empty name, or when
/// the clause has no parameter slot (offset zero). Otherwise, with the object pointer
/// adjusted to the caught sub-object:
///
/// - a reference clause receives the adjusted pointer
/// - a simple type is copied bytewise; a pointer-sized simple type is a pointer and is
///   itself adjusted
/// - a type with a copy constructor is copy-constructed
/// - anything else is copied bytewise from the adjusted pointer
pub(crate) fn copy_exception(
    thread: &mut Thread,
    ctx: &MetadataContext<'_>,
    record: &ExceptionRecord,
    frame: u64,
    catch: &CatchBlock,
    caught: Option<&CatchableType>,
) -> Flow<()> {
    let Some(caught) = caught else {
        return Ok(());
    };
    let Some(declared) = catch.declared_type(ctx)? else {
        return Ok(());
    };
    if declared.mangled.is_empty() || catch.offset == 0 {
        return Ok(());
    }

    let throw_ctx = ctx.with_addressing(record.throw_addressing(ctx.arch));
    let dest = frame_offset(frame, catch.offset);
    copy_object(thread, &throw_ctx, record.object(), dest, catch.qualifiers, caught)
}

/// Stores the thrown `object`, viewed as the sub-object `caught`, at `dest`.
///
/// `ctx` navigates the throw info of the object.
pub(crate) fn copy_object(
    thread: &mut Thread,
    ctx: &MetadataContext<'_>,
    object: u64,
    dest: u64,
    qualifiers: TypeQualifiers,
    caught: &CatchableType,
) -> Flow<()> {
    let space = ctx.space;
    let arch = ctx.arch;
    let adjusted = caught.offsets.apply(ctx, object)?;

    if qualifiers.contains(TypeQualifiers::REFERENCE) {
        log::trace!("binding reference 0x{:X} at 0x{:X}", adjusted, dest);
        space.write_ptr(dest, arch, adjusted)?;
    } else if caught.flags.contains(CatchableFlags::SIMPLE_TYPE) {
        space.copy(dest, object, caught.size as usize)?;
        if caught.size as usize == arch.pointer_size() {
            let pointer = space.read_ptr(dest, arch)?;
            space.write_ptr(dest, arch, caught.offsets.apply(ctx, pointer)?)?;
        }
    } else if let Some(constructor) = caught.copy_ctor {
        log::trace!("copy constructing 0x{:X} from 0x{:X}", dest, adjusted);
        let virtual_bases = caught.flags.contains(CatchableFlags::HAS_VIRTUAL_BASE);
        thread.call_copy_constructor(constructor, dest, adjusted, virtual_bases)?;
    } else {
        space.copy(dest, adjusted, caught.size as usize)?;
    }
    Ok(())
}

/// Where a catch handler runs and which guard frame protects it.
pub(crate) enum CatchSite {
    /// i386: the handler shares its function's frame.
    FrameList {
        /// Registration record of the function
        registration: u64,
        /// Frame pointer of the function
        fp: u64,
        /// Function descriptor
        descriptor: u64,
        /// Try level the handler runs at
        try_level: i32,
    },
    /// Table architectures: the handler is a funclet with its own frame.
    Table {
        /// Establisher frame of the function
        establisher: u64,
        /// Image base of the function's module
        image_base: u64,
        /// Function descriptor
        descriptor: u64,
        /// Frame handler thunk of the function
        handler: u64,
        /// Index of the try block owning the handler
        try_index: usize,
        /// Catch block descriptor
        catch: CatchBlock,
        /// Scope the handler runs at
        try_level: i32,
    },
}

/// Runs the catch handler at `address` for the exception `caught`.
///
/// Installs a guard frame, makes `caught` the current exception and calls the handler.
/// When the handler returns, the guard is removed, the previous exception becomes
/// current again, and the caught object is destroyed unless another handler still owns
/// it. If the handler escapes instead, the guard's unwind handler does that cleanup.
///
/// # Returns
///
/// The continuation address the handler returned.
///
/// # Errors
///
/// Returns the handler's escape.
pub(crate) fn run_catch_body(
    thread: &mut Thread,
    site: CatchSite,
    caught: ExceptionRecord,
    frame_info: FrameInfoId,
    address: u64,
) -> Flow<u64> {
    thread.exceptions_mut().end_search();

    let runtime = Arc::clone(thread.runtime());
    let space = runtime.space();
    let arch = runtime.arch();
    let guard_thunk = runtime.thunks().nested_guard;
    let saved = thread.registers();

    let guard_key = thread.reserve_stack(16)?;
    let key = thread.reserve_stack(CATCH_FRAME_SIZE)?;
    let activations = thread.activations().len();

    let (frame, parent, descriptor, try_level, saved_stack) = match &site {
        CatchSite::FrameList {
            registration,
            fp,
            descriptor,
            try_level,
        } => {
            space.write_u32(guard_key, thread.frame_list_head()? as u32)?;
            space.write_u32(guard_key + 4, guard_thunk as u32)?;
            thread.set_frame_list_head(guard_key)?;

            let saved_stack = u64::from(space.read_u32(fp - i386_frame::SAVED_ESP)?);
            space.write_u32(fp - i386_frame::SAVED_ESP, key as u32)?;
            (*fp, *registration, *descriptor, *try_level, saved_stack)
        }
        CatchSite::Table {
            establisher,
            image_base,
            descriptor,
            handler,
            try_index,
            catch,
            try_level,
        } => {
            space.write_ptr(frame_offset(key, catch.frame), arch, *establisher)?;
            thread.push_activation(Activation {
                key: guard_key,
                kind: ActivationKind::Guard,
                control_pc: guard_thunk,
                image_base: runtime.image_base(),
                descriptor: None,
                handler: Some(guard_thunk),
            });
            thread.push_activation(Activation {
                key,
                kind: ActivationKind::Funclet {
                    try_index: *try_index,
                    catch_block: catch.address,
                },
                control_pc: address,
                image_base: *image_base,
                descriptor: Some(*descriptor),
                handler: Some(*handler),
            });
            (*establisher, *establisher, *descriptor, *try_level, 0)
        }
    };

    let previous = thread.exceptions_mut().replace_current(Some(caught.clone()));
    thread.exceptions_mut().push_guard(NestedGuard {
        handle: guard_key,
        caught: caught.clone(),
        previous,
        frame_info,
        parent,
        descriptor,
        try_level,
        saved_stack,
    });

    log::debug!(
        "thread {}: calling catch handler 0x{:X} for object 0x{:X}",
        thread.id(),
        address,
        caught.object()
    );
    let continuation = thread.call_catch(address, key, frame)?;
    log::debug!(
        "thread {}: catch handler 0x{:X} returned 0x{:X}",
        thread.id(),
        address,
        continuation
    );

    match &site {
        CatchSite::FrameList { fp, .. } => {
            let prev = space.read_u32(guard_key)?;
            thread.set_frame_list_head(u64::from(prev))?;
            space.write_u32(fp - i386_frame::SAVED_ESP, saved_stack as u32)?;
        }
        CatchSite::Table { .. } => thread.truncate_activations(activations),
    }

    if let Some(guard) = thread.exceptions_mut().remove_guard(guard_key) {
        thread.exceptions_mut().replace_current(guard.previous);
    }
    release_object(thread, frame_info, &caught)?;
    thread.set_registers(saved);
    Ok(continuation)
}

/// Drops the caught-object registration `frame_info`, destroying the object if no other
/// registration still references it.
pub(crate) fn release_object(
    thread: &mut Thread,
    frame_info: FrameInfoId,
    record: &ExceptionRecord,
) -> Flow<()> {
    let Some(info) = thread.exceptions_mut().unregister_object(frame_info) else {
        return Ok(());
    };
    if info.object == 0 {
        return Ok(());
    }
    if thread.exceptions().is_object_owned(info.object) {
        log::trace!("object 0x{:X} still owned by another handler", info.object);
        return Ok(());
    }
    destroy_object(thread, record)
}

/// Runs the destructor of the thrown object of `record`, if its type has one.
pub(crate) fn destroy_object(thread: &mut Thread, record: &ExceptionRecord) -> Flow<()> {
    if !record.is_cxx() || record.object() == 0 || record.throw_info() == 0 {
        return Ok(());
    }

    let runtime = Arc::clone(thread.runtime());
    let arch = runtime.arch();
    let ctx = MetadataContext::new(runtime.space(), arch, record.throw_addressing(arch));
    let info = ThrowInfo::read(&ctx, record.throw_info())?;
    if let Some(destructor) = info.destructor {
        log::debug!(
            "destroying object 0x{:X} with 0x{:X}",
            record.object(),
            destructor
        );
        thread.call_destructor(destructor, record.object())?;
    }
    Ok(())
}

/// Hands the exception to the throw info's custom handler, if the record asks for one.
///
/// Only records tagged with a version newer than [`MAGIC_V3`] may carry a custom handler.
pub(crate) fn custom_handler(
    thread: &mut Thread,
    record: &mut ExceptionRecord,
    frame: u64,
    descriptor: u64,
) -> Flow<Option<ContinueSearch>> {
    if !record.is_cxx() || record.magic() <= MAGIC_V3 || record.throw_info() == 0 {
        return Ok(None);
    }

    let runtime = Arc::clone(thread.runtime());
    let arch = runtime.arch();
    let ctx = MetadataContext::new(runtime.space(), arch, record.throw_addressing(arch));
    let info = ThrowInfo::read(&ctx, record.throw_info())?;
    let Some(handler) = info.custom_handler else {
        return Ok(None);
    };

    log::debug!("delegating to custom handler 0x{:X}", handler);
    thread
        .call_custom_handler(handler, record, frame, descriptor)
        .map(Some)
}

/// Replaces a rethrow record with the record of the exception being handled.
pub(crate) fn patch_rethrow(thread: &Thread, record: &mut ExceptionRecord) {
    if !record.is_rethrow() {
        return;
    }
    if let Some(current) = thread.current_exception() {
        log::debug!("rethrow of object 0x{:X}", current.object());
        let mut patched = current.clone();
        patched.flags.remove(ExceptionFlags::UNWINDING);
        *record = patched;
    }
}
