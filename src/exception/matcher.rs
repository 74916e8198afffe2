//! Matching thrown types against catch clauses.

use crate::{
    metadata::{CatchableType, MetadataContext, ThrowInfo, TypeDescriptor, TypeQualifiers},
    Result,
};

/// Finds the catchable type of a thrown object that a catch clause accepts.
///
/// The catchable types are scanned most-derived first. A catch-all clause
/// (`catch_type == None`) accepts the first entry; a typed clause accepts the first
/// entry whose type descriptor is the same object or carries the same decorated name,
/// provided every `const`/`volatile` qualifier of the thrown type is also present on the
/// clause.
///
/// # Arguments
///
/// * `ctx` - Navigation context for the throw info (addressing of the throwing image)
/// * `throw_info` - Throw info of the thrown object
/// * `catch_type` - Declared type of the clause, `None` for `catch(...)`
/// * `catch_qualifiers` - Qualifiers of the clause
///
/// # Returns
///
/// The matching catchable type, or `None` if the clause does not catch the object. An
/// empty catchable type table matches nothing, not even `catch(...)`.
///
/// # Errors
///
/// Returns an error if the throw info's tables cannot be read.
pub fn find_caught_type(
    ctx: &MetadataContext<'_>,
    throw_info: &ThrowInfo,
    catch_type: Option<&TypeDescriptor>,
    catch_qualifiers: TypeQualifiers,
) -> Result<Option<CatchableType>> {
    for catchable in throw_info.catchable_types(ctx)? {
        let Some(catch_type) = catch_type else {
            return Ok(Some(catchable));
        };

        let thrown_type = catchable.type_descriptor(ctx)?;
        if !catch_type.same_type(&thrown_type) {
            continue;
        }

        if throw_info.qualifiers.contains(TypeQualifiers::CONST)
            && !catch_qualifiers.contains(TypeQualifiers::CONST)
        {
            continue;
        }
        if throw_info.qualifiers.contains(TypeQualifiers::VOLATILE)
            && !catch_qualifiers.contains(TypeQualifiers::VOLATILE)
        {
            continue;
        }

        return Ok(Some(catchable));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::Arch,
        metadata::{Addressing, Layout},
        test::TestImage,
    };

    fn descriptor(image: &TestImage, address: u64) -> TypeDescriptor {
        TypeDescriptor::read(&image.ctx(), address).unwrap()
    }

    #[test]
    fn test_most_derived_first() {
        let image = TestImage::new(Arch::I386);
        let (throw_info, types) = image.hierarchy(&[".?AVderived@@", ".?AVbase@@"], TypeQualifiers::empty());
        let info = ThrowInfo::read(&image.ctx(), throw_info).unwrap();

        let all = find_caught_type(&image.ctx(), &info, None, TypeQualifiers::empty())
            .unwrap()
            .unwrap();
        assert_eq!(all.type_descriptor.address(Addressing::Absolute), Some(types[0]));

        let base = descriptor(&image, types[1]);
        let found = find_caught_type(&image.ctx(), &info, Some(&base), TypeQualifiers::REFERENCE)
            .unwrap()
            .unwrap();
        assert_eq!(found.type_descriptor.address(Addressing::Absolute), Some(types[1]));
    }

    #[test]
    fn test_match_by_name_across_images() {
        let image = TestImage::new(Arch::X86_64);
        let (throw_info, _) = image.hierarchy(&[".?AVerror@@"], TypeQualifiers::empty());
        let info = ThrowInfo::read(&image.throw_ctx(), throw_info).unwrap();

        // An unrelated descriptor object with the same decorated name
        let duplicate = image.type_descriptor(".?AVerror@@");
        let other = image.type_descriptor(".?AVother@@");

        let ctx = image.throw_ctx();
        assert!(find_caught_type(&ctx, &info, Some(&image.read_type(duplicate)), TypeQualifiers::empty())
            .unwrap()
            .is_some());
        assert!(find_caught_type(&ctx, &info, Some(&image.read_type(other)), TypeQualifiers::empty())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_const_throw_needs_const_catch() {
        let image = TestImage::new(Arch::I386);
        let (throw_info, types) = image.hierarchy(&[".?AVerror@@"], TypeQualifiers::CONST);
        let info = ThrowInfo::read(&image.ctx(), throw_info).unwrap();
        let declared = descriptor(&image, types[0]);

        assert!(find_caught_type(&image.ctx(), &info, Some(&declared), TypeQualifiers::REFERENCE)
            .unwrap()
            .is_none());
        assert!(find_caught_type(
            &image.ctx(),
            &info,
            Some(&declared),
            TypeQualifiers::REFERENCE | TypeQualifiers::CONST
        )
        .unwrap()
        .is_some());
        // catch(...) ignores qualifiers
        assert!(find_caught_type(&image.ctx(), &info, None, TypeQualifiers::empty())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_empty_table_matches_nothing() {
        let image = TestImage::new(Arch::I386);
        let (throw_info, _) = image.hierarchy(&[], TypeQualifiers::empty());
        let info = ThrowInfo::read(&image.ctx(), throw_info).unwrap();
        assert!(find_caught_type(&image.ctx(), &info, None, TypeQualifiers::empty())
            .unwrap()
            .is_none());
    }
}
