// ============================================================================
// Entity Metadata
// ============================================================================
//
// Static descriptors generated by `#[derive(Entity)]` stand in for runtime
// reflection: every entity type exposes its ordered property list, its key
// designation and a constructor, and every instance exposes property access
// through `Value`.
//
// ============================================================================

pub mod diff;
pub mod key;
pub mod registry;
pub mod tombstone;

use std::any::Any;
use std::fmt;

use crate::core::{DataType, RepoError, Result, Value};

pub use diff::{apply_diff, compute_diff, diff};
pub use key::{is_identity_column, surrogate_key};
pub use registry::EntityRegistry;
pub use tombstone::copy_to_tombstone;

/// Metadata for one entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptor {
    /// Rust field name, used as the property name in change records.
    pub name: &'static str,
    /// Storage column name.
    pub column: &'static str,
    pub data_type: DataType,
    pub nullable: bool,
    /// Designated surrogate key.
    pub key: bool,
    /// Key value generated by the backend.
    pub identity: bool,
    pub foreign_key: bool,
    /// Explicitly mapped column; these are the properties copied to tombstones.
    pub column_annotated: bool,
}

impl PropertyDescriptor {
    /// Key and foreign-key properties never take part in diffing.
    pub fn is_diffable(&self) -> bool {
        !self.key && !self.foreign_key
    }
}

/// Runtime type token for an entity.
pub struct EntityType {
    pub name: &'static str,
    pub table: &'static str,
    pub properties: &'static [PropertyDescriptor],
    pub construct: fn() -> Box<dyn Entity>,
}

impl EntityType {
    pub fn property(&self, name: &str) -> Option<&'static PropertyDescriptor> {
        self.properties.iter().find(|property| property.name == name)
    }

    pub fn require_property(&self, name: &str) -> Result<&'static PropertyDescriptor> {
        self.property(name)
            .ok_or_else(|| RepoError::property_not_found(self.name, name))
    }

    /// Properties carrying a column designation, in declaration order.
    pub fn column_properties(&self) -> impl Iterator<Item = &'static PropertyDescriptor> {
        self.properties.iter().filter(|property| property.column_annotated)
    }

    /// Creates a default instance of this entity type.
    pub fn new_instance(&self) -> Box<dyn Entity> {
        (self.construct)()
    }

    pub fn is(&self, other: &EntityType) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("properties", &self.properties.len())
            .finish()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.is(other)
    }
}

impl Eq for EntityType {}

/// Object-safe view of an entity instance.
pub trait Entity: Any + Send + Sync + fmt::Debug {
    fn entity_type(&self) -> &'static EntityType;

    /// Reads a property by name. `None` when the property does not exist.
    fn get_value(&self, property: &str) -> Option<Value>;

    /// Writes a property by name, converting `value` to the field's type.
    fn set_value(&mut self, property: &str, value: Value) -> Result<()>;

    fn clone_entity(&self) -> Box<dyn Entity>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Statically typed entity, implemented by `#[derive(Entity)]`.
pub trait EntityModel: Entity + Clone + Default + Sized {
    fn descriptor() -> &'static EntityType;
}

impl Clone for Box<dyn Entity> {
    fn clone(&self) -> Self {
        self.clone_entity()
    }
}

impl dyn Entity {
    pub fn type_name(&self) -> &'static str {
        self.entity_type().name
    }

    /// Reads a property that must exist.
    pub fn require_value(&self, property: &str) -> Result<Value> {
        self.get_value(property)
            .ok_or_else(|| RepoError::property_not_found(self.type_name(), property))
    }

    pub fn downcast_ref<E: EntityModel>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn downcast<E: EntityModel>(self: Box<Self>) -> Result<E> {
        let actual = self.type_name();
        self.into_any()
            .downcast::<E>()
            .map(|boxed| *boxed)
            .map_err(|_| {
                RepoError::TypeMismatch(format!(
                    "Expected entity {}, got {}",
                    E::descriptor().name,
                    actual
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;

    #[derive(Debug, Clone, Default, PartialEq, Entity)]
    #[entity(table = "gadgets")]
    struct Gadget {
        #[sql(key, identity)]
        id: i64,
        #[sql(column = "gadget_name")]
        name: String,
        #[sql(foreign_key)]
        owner_id: Option<i64>,
        weight: f64,
    }

    #[test]
    fn test_descriptor_reflects_attributes() {
        let descriptor = Gadget::descriptor();
        assert_eq!(descriptor.name, "Gadget");
        assert_eq!(descriptor.table, "gadgets");

        let names: Vec<_> = descriptor.properties.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["id", "name", "owner_id", "weight"]);

        let id = descriptor.property("id").unwrap();
        assert!(id.key && id.identity && id.column_annotated);

        let name = descriptor.property("name").unwrap();
        assert_eq!(name.column, "gadget_name");
        assert!(name.column_annotated);

        let owner = descriptor.property("owner_id").unwrap();
        assert!(owner.foreign_key && owner.nullable);
        assert!(!owner.is_diffable());

        let weight = descriptor.property("weight").unwrap();
        assert_eq!(weight.data_type, DataType::Float);
        assert!(!weight.column_annotated);
    }

    #[test]
    fn test_dynamic_property_access() {
        let mut gadget: Box<dyn Entity> = Box::new(Gadget::default());
        gadget.set_value("name", Value::from("lamp")).unwrap();
        gadget.set_value("weight", Value::Integer(2)).unwrap();
        assert_eq!(gadget.get_value("name"), Some(Value::from("lamp")));
        assert_eq!(gadget.get_value("weight"), Some(Value::Float(2.0)));
        assert!(gadget.get_value("missing").is_none());
        assert!(gadget.set_value("missing", Value::Null).is_err());

        let typed = gadget.downcast::<Gadget>().unwrap();
        assert_eq!(typed.name, "lamp");
    }

    #[test]
    fn test_new_instance_is_default() {
        let instance = Gadget::descriptor().new_instance();
        assert_eq!(instance.get_value("id"), Some(Value::Integer(0)));
        assert_eq!(instance.type_name(), "Gadget");
    }
}
