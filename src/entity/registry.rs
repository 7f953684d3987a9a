use std::collections::HashMap;

use super::{EntityModel, EntityType};
use crate::core::{RepoError, Result};

/// Name -> descriptor lookup for callers that dispatch on a runtime type name.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    types: HashMap<&'static str, &'static EntityType>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: EntityModel>(&mut self) -> &mut Self {
        self.register_type(E::descriptor())
    }

    pub fn register_type(&mut self, entity_type: &'static EntityType) -> &mut Self {
        self.types.insert(entity_type.name, entity_type);
        self
    }

    pub fn get(&self, name: &str) -> Option<&'static EntityType> {
        self.types.get(name).copied()
    }

    pub fn resolve(&self, name: &str) -> Result<&'static EntityType> {
        self.get(name)
            .ok_or_else(|| RepoError::InvalidArgument(format!("Entity type '{}' is not registered", name)))
    }

    /// Looks a type up by its storage table name.
    pub fn by_table(&self, table: &str) -> Option<&'static EntityType> {
        self.types.values().copied().find(|ty| ty.table == table)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn types(&self) -> impl Iterator<Item = &'static EntityType> + '_ {
        self.types.values().copied()
    }
}
