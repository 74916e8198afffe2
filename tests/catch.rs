//! Catch clause selection, object copies and the terminate paths.
//!
//! Each scenario runs on every architecture; the frame-list and table dispatchers must
//! agree on which handler runs, which cleanups run and in what order.

mod common;

use common::{Fixture, ARCHES};
use cxxframe::{
    metadata::{
        CatchSpec, CatchableTypeSpec, DescriptorVersion, FunctionDescriptorBuilder,
        FunctionFlags, ImageWriter, ThrowInfoBuilder, TryBlockSpec, MAGIC_V3,
    },
    Arch, Error, Escape, ExceptionRecord, Result, TerminateReason,
};

const CONTINUATION: u64 = 0xC0DE;

/// `derived : base`, with the base sub-object 8 bytes into the derived object.
fn derived_throw_info(fixture: &Fixture) -> Result<(u64, u64, u64)> {
    let derived = fixture.module.type_descriptor(".?AVderived@@")?;
    let base = fixture.module.type_descriptor(".?AVbase@@")?;
    let throw_info = ThrowInfoBuilder::new()
        .destructor(fixture.destructor("derived")?)
        .catchable(CatchableTypeSpec::new(derived, 16))
        .catchable(CatchableTypeSpec::new(base, 8).this_offset(8))
        .build(&fixture.module)?;
    Ok((derived, base, throw_info))
}

fn nested_try_catches_base_reference(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, base, throw_info) = derived_throw_info(&fixture)?;
    let other = fixture.module.type_descriptor(".?AVother@@")?;
    let mut thread = fixture.thread()?;
    let object = thread.alloc(16)?;
    let slot = fixture.catch_slot();

    let trace = fixture.trace.clone();
    let handler = fixture.module.bind_catch(move |thread, entry| {
        let reference = thread.runtime().space().read_ptr(entry.local(slot), thread.arch())?;
        assert_eq!(reference, object + 8);
        assert_eq!(thread.current_exception().map(|r| r.object()), Some(object));
        assert!(!thread.uncaught_exception());
        trace.push("catch");
        Ok(CONTINUATION)
    })?;

    // 0: outer try body, 1: object in the outer try, 2: inner try body,
    // 3: object in the inner try, 4: inner handler, 5: outer handler
    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(0, Some(fixture.cleanup("outer-scope")?))
            .unwind(1, None)
            .unwind(2, Some(fixture.cleanup("inner-scope")?))
            .unwind(1, None)
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(2, 3)
                    .catch_level(4)
                    .catch(CatchSpec::typed(fixture.handler("other", 0x1)?, other).by_reference()),
            )
            .try_block(
                TryBlockSpec::new(0, 4)
                    .catch_level(5)
                    .catch(CatchSpec::typed(handler, base).by_reference().offset(slot)),
            ),
    )?;

    let trace = fixture.trace.clone();
    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            trace.push("resumed");
            return Ok(ip);
        }
        for level in 0..=3 {
            thread.set_try_level(level)?;
        }
        thread.throw(object, throw_info)
    });

    assert_eq!(result, Ok(CONTINUATION), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        ["inner-scope", "outer-scope", "catch", "~derived", "resumed"],
        "{arch}"
    );
    assert!(thread.current_exception().is_none());
    assert!(thread.exceptions().frame_infos().is_empty());
    assert!(thread.activations().is_empty());
    Ok(())
}

#[test]
fn test_nested_try_catches_base_reference() -> Result<()> {
    for arch in ARCHES {
        nested_try_catches_base_reference(arch)?;
    }
    Ok(())
}

fn first_matching_clause_wins(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, base, throw_info) = derived_throw_info(&fixture)?;
    let other = fixture.module.type_descriptor(".?AVother@@")?;
    let mut thread = fixture.thread()?;
    let object = thread.alloc(16)?;

    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V2)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(0, 0)
                    .catch_level(1)
                    .catch(CatchSpec::typed(fixture.handler("other", 1)?, other))
                    .catch(CatchSpec::typed(fixture.handler("base", 2)?, base).by_reference())
                    .catch(CatchSpec::catch_all(fixture.handler("all", 3)?)),
            ),
    )?;

    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.throw(object, throw_info)
    });

    assert_eq!(result, Ok(2), "{arch}");
    assert_eq!(fixture.trace.events(), ["base", "~derived"], "{arch}");
    Ok(())
}

#[test]
fn test_first_matching_clause_wins() -> Result<()> {
    for arch in ARCHES {
        first_matching_clause_wins(arch)?;
    }
    Ok(())
}

fn try_table_order_is_binding(arch: Arch, inner_first: bool) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let inner = TryBlockSpec::new(1, 1)
        .catch_level(2)
        .catch(CatchSpec::catch_all(fixture.handler("inner", 1)?));
    let outer = TryBlockSpec::new(0, 1)
        .catch_level(2)
        .catch(CatchSpec::catch_all(fixture.handler("outer", 2)?));

    let builder = FunctionDescriptorBuilder::new(DescriptorVersion::V1)
        .unwind(-1, None)
        .unwind(0, Some(fixture.cleanup("s1")?))
        .unwind(-1, None);
    let builder = if inner_first {
        builder.try_block(inner).try_block(outer)
    } else {
        builder.try_block(outer).try_block(inner)
    };
    let function = fixture.module.function("main", &builder)?;

    let mut thread = fixture.thread()?;
    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.set_try_level(1)?;
        thread.raise(0xC000_0005, &[])
    });

    if inner_first {
        assert_eq!(result, Ok(1), "{arch}");
        assert_eq!(fixture.trace.events(), ["inner"], "{arch}");
    } else {
        // Unwinding to the outer try block leaves scope 1
        assert_eq!(result, Ok(2), "{arch}");
        assert_eq!(fixture.trace.events(), ["s1", "outer"], "{arch}");
    }
    Ok(())
}

#[test]
fn test_try_table_order_is_binding() -> Result<()> {
    for arch in ARCHES {
        try_table_order_is_binding(arch, true)?;
        try_table_order_is_binding(arch, false)?;
    }
    Ok(())
}

fn foreign_exception_needs_catch_all(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, base, _) = derived_throw_info(&fixture)?;

    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(0, 0)
                    .catch_level(1)
                    .catch(CatchSpec::typed(fixture.handler("base", 1)?, base).by_reference())
                    .catch(CatchSpec::catch_all(fixture.handler("all", 2)?)),
            ),
    )?;

    let mut thread = fixture.thread()?;
    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.raise(0xC000_0005, &[0, 0x10])
    });

    assert_eq!(result, Ok(2), "{arch}");
    assert_eq!(fixture.trace.events(), ["all"], "{arch}");
    Ok(())
}

#[test]
fn test_foreign_exception_needs_catch_all() -> Result<()> {
    for arch in ARCHES {
        foreign_exception_needs_catch_all(arch)?;
    }
    Ok(())
}

fn copy_constructed_parameter(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let mut thread = fixture.thread()?;
    let object = thread.alloc(24)?;
    let slot = fixture.catch_slot();

    let trace = fixture.trace.clone();
    let constructor = fixture.module.bind_copy_constructor(move |thread, dest, src, virtual_bases| {
        assert_eq!(src, object);
        assert!(!virtual_bases);
        thread.runtime().space().write_u32(dest, 0xC09E)?;
        trace.push("copy");
        Ok(())
    })?;
    let td = fixture.module.type_descriptor(".?AVstring@@")?;
    let throw_info = ThrowInfoBuilder::new()
        .destructor(fixture.destructor("string")?)
        .catchable(CatchableTypeSpec::new(td, 24).copy_constructor(constructor))
        .build(&fixture.module)?;

    let trace = fixture.trace.clone();
    let handler = fixture.module.bind_catch(move |thread, entry| {
        let copy = thread.runtime().space().read_u32(entry.local(slot))?;
        assert_eq!(copy, 0xC09E);
        trace.push("catch");
        Ok(CONTINUATION)
    })?;
    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(0, 0)
                    .catch_level(1)
                    .catch(CatchSpec::typed(handler, td).offset(slot)),
            ),
    )?;

    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.throw(object, throw_info)
    });

    assert_eq!(result, Ok(CONTINUATION), "{arch}");
    assert_eq!(fixture.trace.events(), ["copy", "catch", "~string"], "{arch}");
    Ok(())
}

#[test]
fn test_copy_constructed_parameter() -> Result<()> {
    for arch in ARCHES {
        copy_constructed_parameter(arch)?;
    }
    Ok(())
}

fn cleanups_see_uncaught_exception(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let trace = fixture.trace.clone();
    let cleanup = fixture.module.bind_cleanup(move |thread, _| {
        trace.push(format!("cleanup uncaught={}", thread.uncaught_exception()));
        Ok(())
    })?;
    let trace = fixture.trace.clone();
    let handler = fixture.module.bind_catch(move |thread, _| {
        trace.push(format!("catch uncaught={}", thread.uncaught_exception()));
        Ok(CONTINUATION)
    })?;

    let callee = fixture.module.function(
        "callee",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1).unwind(-1, Some(cleanup)),
    )?;
    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(handler))),
    )?;

    let mut thread = fixture.thread()?;
    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.call(&callee, |thread, _| {
            thread.set_try_level(0)?;
            thread.raise(0xC000_0094, &[])
        })
    });

    assert_eq!(result, Ok(CONTINUATION), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        ["cleanup uncaught=true", "catch uncaught=false"],
        "{arch}"
    );
    assert!(!thread.uncaught_exception());
    Ok(())
}

#[test]
fn test_cleanups_see_uncaught_exception() -> Result<()> {
    for arch in ARCHES {
        cleanups_see_uncaught_exception(arch)?;
    }
    Ok(())
}

fn unhandled_exception_terminates(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let trace = fixture.trace.clone();
    fixture
        .runtime
        .set_terminate_hook(move |reason| trace.push(format!("terminate: {reason}")));

    let callee = fixture.module.function(
        "callee",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1).unwind(-1, Some(fixture.cleanup("g0")?)),
    )?;

    let mut thread = fixture.thread()?;
    let result = thread.call(&callee, |thread, _| {
        thread.set_try_level(0)?;
        thread.raise(0xC000_0005, &[])
    });

    let reason = TerminateReason::Unhandled { code: 0xC000_0005 };
    assert_eq!(result, Err(Escape::Fault(Error::Terminated(reason))), "{arch}");
    // No frame accepted the exception, so nothing was unwound
    assert_eq!(fixture.trace.events(), [format!("terminate: {reason}")], "{arch}");
    Ok(())
}

#[test]
fn test_unhandled_exception_terminates() -> Result<()> {
    for arch in ARCHES {
        unhandled_exception_terminates(arch)?;
    }
    Ok(())
}

fn noexcept_function_terminates(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, throw_info) = fixture.class(".?AVerror@@", "error", 8)?;

    let callee = fixture.module.plain_function("callee")?;
    let function = fixture.module.function(
        "noexcept_main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V3)
            .flags(FunctionFlags::NOEXCEPT)
            .unwind(-1, Some(fixture.cleanup("f0")?)),
    )?;

    let mut thread = fixture.thread()?;
    let object = thread.alloc(8)?;
    let result = thread.call(&function, |thread, _| {
        thread.set_try_level(0)?;
        thread.call(&callee, |thread, _| thread.throw(object, throw_info))
    });

    assert_eq!(
        result,
        Err(Escape::Fault(Error::Terminated(TerminateReason::NoexceptViolation))),
        "{arch}"
    );
    assert!(fixture.trace.events().is_empty(), "{arch}");
    Ok(())
}

#[test]
fn test_noexcept_function_terminates() -> Result<()> {
    for arch in ARCHES {
        noexcept_function_terminates(arch)?;
    }
    Ok(())
}

fn custom_handler_replaces_search(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let trace = fixture.trace.clone();
    let custom = fixture.module.bind_custom_handler(move |_, record, _, _| {
        trace.push(format!("custom 0x{:X}", record.magic()));
        Ok(cxxframe::runtime::ContinueSearch)
    })?;
    let td = fixture.module.type_descriptor(".?AVerror@@")?;
    let throw_info = ThrowInfoBuilder::new()
        .custom_handler(custom)
        .catchable(CatchableTypeSpec::new(td, 8))
        .build(&fixture.module)?;

    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V3)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(0, 0)
                    .catch_level(1)
                    .catch(CatchSpec::catch_all(fixture.handler("all", 1)?)),
            ),
    )?;

    let mut thread = fixture.thread()?;
    let object = thread.alloc(8)?;
    let image_base = fixture.module.image_base();
    let magic = u64::from(MAGIC_V3) + 1;
    let result = thread.call(&function, |thread, _| {
        thread.set_try_level(0)?;
        let mut record = ExceptionRecord::cxx(arch, object, throw_info, image_base);
        record.params[0] = magic;
        thread.raise_exception(record)
    });

    assert!(
        matches!(
            result,
            Err(Escape::Fault(Error::Terminated(TerminateReason::Unhandled { .. })))
        ),
        "{arch}"
    );
    assert_eq!(fixture.trace.events(), [format!("custom 0x{magic:X}")], "{arch}");
    Ok(())
}

#[test]
fn test_custom_handler_replaces_search() -> Result<()> {
    for arch in ARCHES {
        custom_handler_replaces_search(arch)?;
    }
    Ok(())
}
