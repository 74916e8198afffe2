//! `setjmp`/`longjmp` interaction with C++ frames.

mod common;

use common::{Fixture, ARCHES};
use cxxframe::{
    metadata::{CatchSpec, DescriptorVersion, FunctionDescriptorBuilder, TryBlockSpec},
    Arch, Result,
};

const JUMP_BUFFER_SIZE: usize = 512;

fn longjmp_unwinds_three_scopes(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let mut thread = fixture.thread()?;
    let buffer = thread.alloc(JUMP_BUFFER_SIZE)?;

    let leaf = fixture.module.function(
        "leaf",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1).unwind(-1, Some(fixture.cleanup("h0")?)),
    )?;
    let middle = fixture.module.function(
        "middle",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1).unwind(-1, Some(fixture.cleanup("g0")?)),
    )?;
    let root = fixture.module.function(
        "root",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, Some(fixture.cleanup("f0")?))
            .unwind(0, Some(fixture.cleanup("f1")?)),
    )?;

    let result = thread.call(&root, |thread, entry| {
        if let Some(resume) = entry.resume {
            return Ok(resume.value);
        }
        thread.set_try_level(0)?;
        thread.set_jump(buffer)?;
        thread.set_try_level(1)?;
        thread.call(&middle, |thread, _| {
            thread.set_try_level(0)?;
            thread.call(&leaf, |thread, _| {
                thread.set_try_level(0)?;
                thread.long_jump(buffer, 0)
            })
        })
    });

    // A zero value is delivered as one
    assert_eq!(result, Ok(1), "{arch}");
    // Scope 0 of the root frame was live when setjmp ran, so it survives
    assert_eq!(fixture.trace.events(), ["h0", "g0", "f1"], "{arch}");
    assert!(thread.activations().is_empty());
    Ok(())
}

#[test]
fn test_longjmp_unwinds_three_scopes() -> Result<()> {
    for arch in ARCHES {
        longjmp_unwinds_three_scopes(arch)?;
    }
    Ok(())
}

fn longjmp_out_of_catch_handler(arch: Arch) -> Result<()> {
    let fixture = Fixture::new(arch)?;
    let (_, throw_info) = fixture.class(".?AVerror@@", "error", 8)?;
    let mut thread = fixture.thread()?;
    let buffer = thread.alloc(JUMP_BUFFER_SIZE)?;
    let object = thread.alloc(8)?;

    let trace = fixture.trace.clone();
    let handler = fixture.module.bind_catch(move |thread, _| {
        trace.push("catch");
        thread.long_jump(buffer, 42)
    })?;
    let function = fixture.module.function(
        "main",
        &FunctionDescriptorBuilder::new(DescriptorVersion::V1)
            .unwind(-1, Some(fixture.cleanup("try")?))
            .unwind(-1, Some(fixture.cleanup("in-catch")?))
            .try_block(TryBlockSpec::new(0, 0).catch_level(1).catch(CatchSpec::catch_all(handler))),
    )?;

    let result = thread.call(&function, |thread, entry| {
        if let Some(resume) = entry.resume {
            return Ok(resume.value);
        }
        thread.set_jump(buffer)?;
        thread.set_try_level(0)?;
        thread.throw(object, throw_info)
    });

    assert_eq!(result, Ok(42), "{arch}");
    // Leaving the handler releases the caught object before the frame's own scopes
    assert_eq!(fixture.trace.events(), ["catch", "~error", "in-catch"], "{arch}");
    assert!(thread.current_exception().is_none());
    assert!(thread.exceptions().frame_infos().is_empty());
    assert_eq!(thread.exceptions().guard_depth(), 0);
    Ok(())
}

#[test]
fn test_longjmp_out_of_catch_handler() -> Result<()> {
    for arch in ARCHES {
        longjmp_out_of_catch_handler(arch)?;
    }
    Ok(())
}

#[test]
fn test_longjmp_without_cxx_frame() -> Result<()> {
    for arch in ARCHES {
        let fixture = Fixture::new(arch)?;
        let mut thread = fixture.thread()?;
        let buffer = thread.alloc(JUMP_BUFFER_SIZE)?;

        let plain = fixture.module.plain_function("plain")?;
        let result = thread.call(&plain, |thread, entry| {
            if let Some(resume) = entry.resume {
                return Ok(resume.value);
            }
            thread.set_jump(buffer)?;
            thread.call(&plain, |thread, _| thread.long_jump(buffer, 5))
        });
        assert_eq!(result, Ok(5), "{arch}");
        assert!(fixture.trace.events().is_empty());
    }
    Ok(())
}
