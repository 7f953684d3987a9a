// ============================================================================
// Change Diff Engine
// ============================================================================
//
// `compute_diff` is pure: it walks the properties of the entity type in
// declaration order and reports one UPDATE record per differing property.
// `apply_diff` writes those records back onto the original instance.
// `diff` composes the two, which is what `save` relies on to update the
// tracked row before handing it to the session.
//
// ============================================================================

use super::{Entity, EntityType};
use crate::core::{RepoError, Result, Value};
use crate::result::{ChangeFunction, ChangeResult};

fn check_types(entity_type: &EntityType, original: &dyn Entity, latest: &dyn Entity) -> Result<()> {
    let original_type = original.entity_type();
    let latest_type = latest.entity_type();
    if original_type.is(entity_type) && latest_type.is(entity_type) {
        return Ok(());
    }

    Err(RepoError::EntityTypeMismatch {
        expected: entity_type.name.to_string(),
        original: original_type.name.to_string(),
        latest: latest_type.name.to_string(),
    })
}

/// Reports every non-key, non-foreign-key property whose value differs
/// between `original` and `latest`.
pub fn compute_diff(
    entity_type: &EntityType,
    original: &dyn Entity,
    latest: &dyn Entity,
    surrogate_key: &Value,
    entity_identifier: &str,
) -> Result<Vec<ChangeResult>> {
    check_types(entity_type, original, latest)?;

    let mut changes = Vec::new();
    for property in entity_type.properties.iter().filter(|p| p.is_diffable()) {
        let before = original.get_value(property.name).unwrap_or(Value::Null);
        let after = latest.get_value(property.name).unwrap_or(Value::Null);
        if before != after {
            changes.push(ChangeResult::update(
                entity_type.name,
                surrogate_key.clone(),
                property.name,
                before,
                after,
                entity_identifier,
            ));
        }
    }

    Ok(changes)
}

/// Writes the new value of every UPDATE record onto `original`.
pub fn apply_diff(original: &mut dyn Entity, changes: &[ChangeResult]) -> Result<()> {
    for change in changes
        .iter()
        .filter(|change| change.function == ChangeFunction::Update)
    {
        original.set_value(&change.field_changed, change.new_value.clone())?;
    }
    Ok(())
}

/// Detects and applies changes in one step, mutating `original`.
pub fn diff(
    entity_type: &EntityType,
    original: &mut dyn Entity,
    latest: &dyn Entity,
    surrogate_key: &Value,
    entity_identifier: &str,
) -> Result<Vec<ChangeResult>> {
    let changes = compute_diff(entity_type, original, latest, surrogate_key, entity_identifier)?;
    apply_diff(original, &changes)?;
    Ok(changes)
}
