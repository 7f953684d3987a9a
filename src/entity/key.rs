// ============================================================================
// Entity Key Resolver
// ============================================================================

use std::collections::HashMap;
use std::sync::RwLock;

use lazy_static::lazy_static;

use super::{EntityType, PropertyDescriptor};
use crate::core::{RepoError, Result};

lazy_static! {
    // Entity name -> index of the key property. Called on every CRUD operation.
    static ref KEY_CACHE: RwLock<HashMap<&'static str, usize>> = RwLock::new(HashMap::new());
}

/// Returns the single property designated as surrogate key.
///
/// Entities with no key, or with more than one, are rejected instead of
/// silently picking the first match.
pub fn surrogate_key(entity_type: &EntityType) -> Result<&'static PropertyDescriptor> {
    if let Some(index) = KEY_CACHE.read()?.get(entity_type.name).copied()
        && let Some(property) = entity_type.properties.get(index)
        && property.key
    {
        return Ok(property);
    }

    let keys: Vec<(usize, &'static PropertyDescriptor)> = entity_type
        .properties
        .iter()
        .enumerate()
        .filter(|(_, property)| property.key)
        .collect();

    match keys.as_slice() {
        [] => Err(RepoError::MissingSurrogateKey(entity_type.name.to_string())),
        [(index, property)] => {
            KEY_CACHE.write()?.insert(entity_type.name, *index);
            Ok(*property)
        }
        many => Err(RepoError::AmbiguousSurrogateKey {
            entity: entity_type.name.to_string(),
            keys: many
                .iter()
                .map(|(_, property)| property.name)
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

/// Whether the key value is generated by the database.
pub fn is_identity_column(property: &PropertyDescriptor) -> bool {
    property.key && property.identity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::entity::Entity;

    fn property(name: &'static str, key: bool, identity: bool) -> PropertyDescriptor {
        PropertyDescriptor {
            name,
            column: name,
            data_type: DataType::Integer,
            nullable: false,
            key,
            identity,
            foreign_key: false,
            column_annotated: key,
        }
    }

    fn unreachable_constructor() -> Box<dyn Entity> {
        panic!("not constructed in these tests")
    }

    #[test]
    fn test_single_key_is_resolved_and_cached() {
        static PROPS: std::sync::LazyLock<Vec<PropertyDescriptor>> = std::sync::LazyLock::new(|| {
            vec![property("name", false, false), property("id", true, true)]
        });
        let entity_type = EntityType {
            name: "KeyResolverSingle",
            table: "single",
            properties: PROPS.as_slice(),
            construct: unreachable_constructor,
        };

        let key = surrogate_key(&entity_type).unwrap();
        assert_eq!(key.name, "id");
        assert!(is_identity_column(key));

        let again = surrogate_key(&entity_type).unwrap();
        assert_eq!(again.name, "id");
    }

    #[test]
    fn test_missing_key_fails_fast() {
        static PROPS: std::sync::LazyLock<Vec<PropertyDescriptor>> =
            std::sync::LazyLock::new(|| vec![property("name", false, false)]);
        let entity_type = EntityType {
            name: "KeyResolverNone",
            table: "none",
            properties: PROPS.as_slice(),
            construct: unreachable_constructor,
        };

        assert!(matches!(
            surrogate_key(&entity_type),
            Err(RepoError::MissingSurrogateKey(name)) if name == "KeyResolverNone"
        ));
    }

    #[test]
    fn test_multiple_keys_fail_fast() {
        static PROPS: std::sync::LazyLock<Vec<PropertyDescriptor>> = std::sync::LazyLock::new(|| {
            vec![property("a", true, false), property("b", true, false)]
        });
        let entity_type = EntityType {
            name: "KeyResolverMany",
            table: "many",
            properties: PROPS.as_slice(),
            construct: unreachable_constructor,
        };

        let err = surrogate_key(&entity_type).unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }
}
