use std::collections::{BTreeMap, HashMap};

use crate::core::{RepoError, Result, Value};
use crate::entity::{Entity, EntityType, is_identity_column, surrogate_key};

/// In-memory rows of one entity type, in insertion order, indexed by key.
#[derive(Debug, Clone)]
pub struct Table {
    entity_type: &'static EntityType,
    rows: BTreeMap<usize, Box<dyn Entity>>,
    next_row_id: usize,
    key_index: HashMap<Value, usize>,
    next_identity: i64,
}

impl Table {
    pub fn new(entity_type: &'static EntityType) -> Self {
        Self {
            entity_type,
            rows: BTreeMap::new(),
            next_row_id: 0,
            key_index: HashMap::new(),
            next_identity: 1,
        }
    }

    pub fn entity_type(&self) -> &'static EntityType {
        self.entity_type
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn key_name(&self) -> Result<&'static str> {
        Ok(surrogate_key(self.entity_type)?.name)
    }

    /// Inserts a row, assigning an identity key when it is unset.
    /// Returns the row's key value.
    pub fn insert(&mut self, mut entity: Box<dyn Entity>) -> Result<Value> {
        let key_property = surrogate_key(self.entity_type)?;
        let mut key = entity.require_value(key_property.name)?;

        if is_identity_column(key_property) && key.is_unassigned_identity() {
            key = Value::Integer(self.next_identity);
            entity.set_value(key_property.name, key.clone())?;
        }
        if key.is_null() {
            return Err(RepoError::ConstraintViolation(format!(
                "{}.{} must not be NULL",
                self.entity_type.table, key_property.column
            )));
        }
        if self.key_index.contains_key(&key) {
            return Err(RepoError::ConstraintViolation(format!(
                "duplicate key {} = {} in {}",
                key_property.column, key, self.entity_type.table
            )));
        }
        if let Some(generated) = key.as_i64() {
            self.next_identity = self.next_identity.max(generated + 1);
        }

        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, entity);
        self.key_index.insert(key.clone(), id);
        Ok(key)
    }

    /// Replaces the row with the same key. Returns false when there is none.
    pub fn update(&mut self, entity: Box<dyn Entity>) -> Result<bool> {
        let key = entity.require_value(self.key_name()?)?;
        match self.key_index.get(&key) {
            Some(id) => {
                self.rows.insert(*id, entity);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete(&mut self, key: &Value) -> bool {
        match self.key_index.remove(key) {
            Some(id) => self.rows.remove(&id).is_some(),
            None => false,
        }
    }

    /// Removes every row, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let removed = self.rows.len();
        self.rows.clear();
        self.key_index.clear();
        removed
    }

    pub fn get(&self, key: &Value) -> Option<&dyn Entity> {
        self.key_index
            .get(key)
            .and_then(|id| self.rows.get(id))
            .map(|entity| -> &dyn Entity { &**entity })
    }

    pub fn scan(&self) -> impl Iterator<Item = &dyn Entity> {
        self.rows.values().map(|entity| -> &dyn Entity { &**entity })
    }
}
