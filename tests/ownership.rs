//! Caught-object lifetime across rethrows and exceptions raised inside catch handlers.
//!
//! A thrown object is destroyed exactly once: when the last handler that caught it
//! ends, whether that handler returns or is left by another exception.

mod common;

use common::{Fixture, ARCHES};
use cxxframe::{
    metadata::{CatchSpec, DescriptorVersion, FunctionDescriptorBuilder, TryBlockSpec},
    Arch, Result,
};

fn rethrow_keeps_object_alive(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, throw_info) = fixture.class(".?AVerror@@", "error", 8)?;
    let mut thread = fixture.thread()?;
    let object = thread.alloc(8)?;

    let trace = fixture.trace.clone();
    let inner_handler = fixture.module.bind_catch(move |thread, _| {
        trace.push("inner");
        thread.rethrow()
    })?;
    let inner = fixture.module.function(
        "inner",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, Some(fixture.cleanup("inner-catch-scope")?))
            .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(inner_handler))),
    )?;

    let trace = fixture.trace.clone();
    let outer_handler = fixture.module.bind_catch(move |thread, _| {
        assert_eq!(thread.current_exception().map(|r| r.object()), Some(object));
        trace.push("outer");
        Ok(0x0E)
    })?;
    let outer = fixture.module.function(
        "outer",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(outer_handler))),
    )?;

    let result = thread.call(&outer, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.call(&inner, |thread, _| {
            thread.set_try_level(0)?;
            thread.throw(object, throw_info)
        })
    });

    assert_eq!(result, Ok(0x0E), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        ["inner", "inner-catch-scope", "outer", "~error"],
        "{arch}"
    );
    assert!(thread.exceptions().frame_infos().is_empty());
    assert!(thread.current_exception().is_none());
    Ok(())
}

#[test]
fn test_rethrow_keeps_object_alive() -> Result<()> {
    for arch in ARCHES {
        rethrow_keeps_object_alive(arch)?;
    }
    Ok(())
}

fn repeated_rethrow_resolves_same_object(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, throw_info) = fixture.class(".?AVerror@@", "error", 8)?;
    let mut thread = fixture.thread()?;
    let object = thread.alloc(8)?;

    // catch (...) { <name> ; throw; } or, for the last frame, a plain return
    let frame = |name: &'static str, rethrow: bool| -> Result<cxxframe::FunctionSpec> {
        let trace = fixture.trace.clone();
        let handler = fixture.module.bind_catch(move |thread, _| {
            let current = thread.current_exception().map(|r| r.object());
            trace.push(format!("{name}:{:X}", current.unwrap_or(0)));
            if rethrow {
                thread.rethrow()
            } else {
                Ok(0x0E)
            }
        })?;
        fixture.module.function(
            name,
            &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
                .unwind(-1, None)
                .unwind(-1, None)
                .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(handler))),
        )
    };
    let inner = frame("inner", true)?;
    let middle = frame("middle", true)?;
    let outer = frame("outer", false)?;

    let result = thread.call(&outer, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.call(&middle, |thread, _| {
            thread.set_try_level(0)?;
            thread.call(&inner, |thread, _| {
                thread.set_try_level(0)?;
                thread.throw(object, throw_info)
            })
        })
    });

    assert_eq!(result, Ok(0x0E), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        [
            format!("inner:{object:X}"),
            format!("middle:{object:X}"),
            format!("outer:{object:X}"),
            "~error".to_string(),
        ],
        "{arch}"
    );
    assert_eq!(fixture.trace.count("~error"), 1);
    assert!(thread.exceptions().frame_infos().is_empty());
    assert!(thread.current_exception().is_none());
    Ok(())
}

#[test]
fn test_repeated_rethrow_resolves_same_object() -> Result<()> {
    for arch in ARCHES {
        repeated_rethrow_resolves_same_object(arch)?;
    }
    Ok(())
}

fn nested_exception_caught_inside_handler(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, first_info) = fixture.class(".?AVfirst@@", "first", 8)?;
    let (_, second_info) = fixture.class(".?AVsecond@@", "second", 8)?;
    let mut thread = fixture.thread()?;
    let first = thread.alloc(8)?;
    let second = thread.alloc(8)?;

    let trace = fixture.trace.clone();
    let nested_handler = fixture.module.bind_catch(move |thread, _| {
        assert_eq!(thread.current_exception().map(|r| r.object()), Some(second));
        trace.push("nested");
        Ok(0x2)
    })?;

    let trace = fixture.trace.clone();
    let handler = fixture.module.bind_catch(move |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            // Back in the first handler: its exception is current again
            assert_eq!(ip, 0x2);
            assert_eq!(thread.current_exception().map(|r| r.object()), Some(first));
            trace.push("handler resumed");
            return Ok(0x1);
        }
        trace.push("handler");
        thread.set_try_level(2)?;
        thread.throw(second, second_info)
    })?;

    // 0: try body, 1: handler, 2: try inside the handler, 3: its handler
    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, None)
            .unwind(1, Some(fixture.cleanup("s2")?))
            .unwind(1, None)
            .try_block(
                TryBlockSpec::new(2, 2)
                    .catch_level(3)
                    .catch(CatchSpec::catch_all(nested_handler)),
            )
            .try_block(TryBlockSpec::new(0, 0).catch_level(3).catch(CatchSpec::catch_all(handler))),
    )?;

    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.throw(first, first_info)
    });

    assert_eq!(result, Ok(0x1), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        ["handler", "nested", "~second", "handler resumed", "~first"],
        "{arch}"
    );
    assert!(thread.exceptions().frame_infos().is_empty());
    Ok(())
}

#[test]
fn test_nested_exception_caught_inside_handler() -> Result<()> {
    for arch in ARCHES {
        nested_exception_caught_inside_handler(arch)?;
    }
    Ok(())
}

fn exception_escaping_handler_to_enclosing_try(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, first_info) = fixture.class(".?AVfirst@@", "first", 8)?;
    let (_, second_info) = fixture.class(".?AVsecond@@", "second", 8)?;
    let mut thread = fixture.thread()?;
    let first = thread.alloc(8)?;
    let second = thread.alloc(8)?;

    let trace = fixture.trace.clone();
    let inner_handler = fixture.module.bind_catch(move |thread, _| {
        trace.push("inner");
        thread.throw(second, second_info)
    })?;

    // 0: outer try, 1: inner try, 2: inner handler, 3: outer handler
    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(0, None)
            .unwind(0, Some(fixture.cleanup("inner-catch-scope")?))
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(1, 1)
                    .catch_level(2)
                    .catch(CatchSpec::catch_all(inner_handler)),
            )
            .try_block(
                TryBlockSpec::new(0, 2)
                    .catch_level(3)
                    .catch(CatchSpec::catch_all(fixture.handler("outer", 0x3)?)),
            ),
    )?;

    let result = thread.call(&function, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.set_try_level(1)?;
        thread.throw(first, first_info)
    });

    // The outer handler resumes the function, not the inner handler
    assert_eq!(result, Ok(0x3), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        ["inner", "~first", "inner-catch-scope", "outer", "~second"],
        "{arch}"
    );
    assert_eq!(thread.exceptions().guard_depth(), 0);
    Ok(())
}

#[test]
fn test_exception_escaping_handler_to_enclosing_try() -> Result<()> {
    for arch in ARCHES {
        exception_escaping_handler_to_enclosing_try(arch)?;
    }
    Ok(())
}

fn exception_escaping_handler_to_caller(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, first_info) = fixture.class(".?AVfirst@@", "first", 8)?;
    let (_, second_info) = fixture.class(".?AVsecond@@", "second", 8)?;
    let mut thread = fixture.thread()?;
    let first = thread.alloc(8)?;
    let second = thread.alloc(8)?;

    let trace = fixture.trace.clone();
    let inner_handler = fixture.module.bind_catch(move |thread, _| {
        trace.push("inner");
        thread.throw(second, second_info)
    })?;
    let inner = fixture.module.function(
        "inner",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, Some(fixture.cleanup("inner-catch-scope")?))
            .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(inner_handler))),
    )?;
    let outer = fixture.module.function(
        "outer",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, None)
            .unwind(-1, None)
            .try_block(
                TryBlockSpec::new(0, 0)
                    .catch_level(1)
                    .catch(CatchSpec::catch_all(fixture.handler("outer", 0x9)?)),
            ),
    )?;

    let result = thread.call(&outer, |thread, entry| {
        if let Some(ip) = entry.resume_ip() {
            return Ok(ip);
        }
        thread.set_try_level(0)?;
        thread.call(&inner, |thread, _| {
            thread.set_try_level(0)?;
            thread.throw(first, first_info)
        })
    });

    assert_eq!(result, Ok(0x9), "{arch}");
    assert_eq!(
        fixture.trace.events(),
        ["inner", "~first", "inner-catch-scope", "outer", "~second"],
        "{arch}"
    );
    assert_eq!(fixture.trace.count("~first"), 1);
    assert_eq!(fixture.trace.count("~second"), 1);
    Ok(())
}

#[test]
fn test_exception_escaping_handler_to_caller() -> Result<()> {
    for arch in ARCHES {
        exception_escaping_handler_to_caller(arch)?;
    }
    Ok(())
}
