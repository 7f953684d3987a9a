use super::{Entity, EntityType};
use crate::core::{RepoError, Result};

/// Copies every column-annotated property of `original` onto `tombstone`.
///
/// The tombstone type must declare a property with the same name for each
/// of them; the first one missing fails the copy.
pub fn copy_to_tombstone(
    entity_type: &EntityType,
    tombstone_type: &EntityType,
    original: &dyn Entity,
    tombstone: &mut dyn Entity,
) -> Result<()> {
    if !tombstone.entity_type().is(tombstone_type) {
        return Err(RepoError::EntityTypeMismatch {
            expected: tombstone_type.name.to_string(),
            original: original.type_name().to_string(),
            latest: tombstone.type_name().to_string(),
        });
    }

    for property in entity_type.column_properties() {
        let target = tombstone_type
            .property(property.name)
            .ok_or_else(|| RepoError::property_not_found(tombstone_type.name, property.name))?;
        let value = original.require_value(property.name)?;
        tombstone.set_value(target.name, value)?;
    }

    Ok(())
}
