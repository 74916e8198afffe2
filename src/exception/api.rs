//! Exception queries used by runtime library code outside the frame handlers.

use std::sync::Arc;

use crate::{
    exception::{
        find_caught_type,
        invoker::{copy_object, destroy_object},
        ExceptionRecord,
    },
    metadata::{Layout, MetadataContext, ThrowInfo, TypeDescriptor, TypeQualifiers},
    runtime::{Flow, Thread},
};

/// Outcome of [`exception_filter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum FilterAction {
    /// The filter accepts the exception; its handler runs.
    ExecuteHandler,
    /// The filter declines the exception.
    ContinueSearch,
}

/// Decides whether a C++ exception is accepted by a type, for code that catches C++
/// exceptions through an exception filter.
///
/// A null `type_descriptor` accepts every exception. Otherwise only C++ exceptions with
/// a known version tag are considered; a rethrow is resolved to the exception the thread
/// is handling. When a catchable type of the object matches, the object is optionally
/// stored at `copy` the same way a catch clause parameter is initialised.
///
/// # Errors
///
/// Returns a fault if the throw info cannot be read or the copy constructor fails.
pub fn exception_filter(
    thread: &mut Thread,
    record: &ExceptionRecord,
    type_descriptor: u64,
    qualifiers: TypeQualifiers,
    copy: Option<u64>,
) -> Flow<FilterAction> {
    if type_descriptor == 0 {
        return Ok(FilterAction::ExecuteHandler);
    }
    if !record.has_known_magic() {
        return Ok(FilterAction::ContinueSearch);
    }

    let record = if record.is_rethrow() {
        match thread.current_exception() {
            Some(current) => current.clone(),
            None => return Ok(FilterAction::ContinueSearch),
        }
    } else {
        record.clone()
    };

    let runtime = Arc::clone(thread.runtime());
    let arch = runtime.arch();
    let ctx = MetadataContext::new(runtime.space(), arch, record.throw_addressing(arch));
    let declared = TypeDescriptor::read(&ctx, type_descriptor)?;
    let info = ThrowInfo::read(&ctx, record.throw_info())?;

    let Some(caught) = find_caught_type(&ctx, &info, Some(&declared), qualifiers)? else {
        return Ok(FilterAction::ContinueSearch);
    };

    log::debug!(
        "filter accepts object 0x{:X} as '{}'",
        record.object(),
        declared.mangled
    );
    if let Some(dest) = copy {
        copy_object(thread, &ctx, record.object(), dest, qualifiers, &caught)?;
    }
    Ok(FilterAction::ExecuteHandler)
}

/// Checks whether `record` rethrows the exception the thread is handling.
///
/// A rethrow record (null object and throw info) is replaced by the record of the
/// exception being handled. A record carrying the same object as the one being handled
/// is also a rethrow.
pub fn detect_rethrow(thread: &Thread, record: &mut ExceptionRecord) -> bool {
    if !record.has_known_magic() {
        return false;
    }
    let Some(current) = thread.current_exception() else {
        return false;
    };

    if record.is_rethrow() {
        log::debug!("detected rethrow of object 0x{:X}", current.object());
        *record = current.clone();
        return true;
    }
    current.same_object(record)
}

/// Runs the destructor of the object thrown with `record`.
///
/// Records that are not C++ exceptions, or whose type has no destructor, are ignored.
///
/// # Errors
///
/// Returns the destructor's escape; a faulting destructor terminates.
pub fn destruct_exception_object(thread: &mut Thread, record: &ExceptionRecord) -> Flow<()> {
    if !record.has_known_magic() {
        return Ok(());
    }
    destroy_object(thread, record)
}

/// Size in bytes of a throw info, the same on every architecture.
#[must_use]
pub fn query_exception_size() -> usize {
    ThrowInfo::SIZE
}

/// Checks whether `object` may be destroyed: no running catch handler owns it.
#[must_use]
pub fn is_exception_object_to_be_destroyed(thread: &Thread, object: u64) -> bool {
    !thread.exceptions().is_object_owned(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exception::CXX_EXCEPTION,
        metadata::{CatchableTypeSpec, ImageWriter, ThrowInfoBuilder},
        Runtime, RuntimeConfig,
    };

    #[test]
    fn test_filter_without_type_accepts_everything() {
        let runtime = Runtime::new(RuntimeConfig::i386()).unwrap();
        let mut thread = runtime.spawn_thread().unwrap();
        let record = ExceptionRecord::new(0xC000_0005, Default::default());
        assert_eq!(
            exception_filter(&mut thread, &record, 0, TypeQualifiers::empty(), None),
            Ok(FilterAction::ExecuteHandler)
        );
    }

    #[test]
    fn test_filter_copies_matching_object() {
        let runtime = Runtime::new(RuntimeConfig::x86_64()).unwrap();
        let module = runtime.load_module("filter.dll").unwrap();
        let error = module.type_descriptor(".?AVerror@@").unwrap();
        let other = module.type_descriptor(".?AVother@@").unwrap();
        let throw_info = ThrowInfoBuilder::new()
            .catchable(CatchableTypeSpec::new(error, 8))
            .build(&module)
            .unwrap();

        let mut thread = runtime.spawn_thread().unwrap();
        let object = thread.alloc(8).unwrap();
        runtime.space().write_u64(object, 0x1122_3344_5566_7788).unwrap();
        let record = ExceptionRecord::cxx(runtime.arch(), object, throw_info, module.image_base());

        let dest = thread.alloc(8).unwrap();
        assert_eq!(
            exception_filter(&mut thread, &record, error, TypeQualifiers::empty(), Some(dest)),
            Ok(FilterAction::ExecuteHandler)
        );
        assert_eq!(runtime.space().read_u64(dest).unwrap(), 0x1122_3344_5566_7788);

        assert_eq!(
            exception_filter(&mut thread, &record, other, TypeQualifiers::empty(), None),
            Ok(FilterAction::ContinueSearch)
        );
    }

    #[test]
    fn test_filter_rejects_foreign_and_unresolved_rethrow() {
        let runtime = Runtime::new(RuntimeConfig::i386()).unwrap();
        let module = runtime.load_module("app.exe").unwrap();
        let error = module.type_descriptor(".?AVerror@@").unwrap();
        let mut thread = runtime.spawn_thread().unwrap();

        let foreign = ExceptionRecord::new(0xC000_0005, Default::default());
        assert_eq!(
            exception_filter(&mut thread, &foreign, error, TypeQualifiers::empty(), None),
            Ok(FilterAction::ContinueSearch)
        );

        let rethrow = ExceptionRecord::cxx(runtime.arch(), 0, 0, 0);
        assert_eq!(
            exception_filter(&mut thread, &rethrow, error, TypeQualifiers::empty(), None),
            Ok(FilterAction::ContinueSearch)
        );
    }

    #[test]
    fn test_detect_rethrow() {
        let runtime = Runtime::new(RuntimeConfig::i386()).unwrap();
        let mut thread = runtime.spawn_thread().unwrap();
        let current = ExceptionRecord::cxx(runtime.arch(), 0x1000, 0x2000, 0);

        let mut rethrow = ExceptionRecord::cxx(runtime.arch(), 0, 0, 0);
        assert!(!detect_rethrow(&thread, &mut rethrow));

        thread.exceptions_mut().replace_current(Some(current.clone()));
        assert!(detect_rethrow(&thread, &mut rethrow));
        assert_eq!(rethrow, current);

        let mut same = ExceptionRecord::cxx(runtime.arch(), 0x1000, 0x2000, 0);
        assert!(detect_rethrow(&thread, &mut same));

        let mut other = ExceptionRecord::cxx(runtime.arch(), 0x3000, 0x2000, 0);
        assert!(!detect_rethrow(&thread, &mut other));
        assert_eq!(other.code, CXX_EXCEPTION);
    }

    #[test]
    fn test_query_exception_size() {
        assert_eq!(query_exception_size(), 16);
    }
}
