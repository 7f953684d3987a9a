// ============================================================================
// Pending Changes
// ============================================================================
//
// A session's unit of work is an ordered list of pending changes. Nothing is
// visible to queries until `save_changes` applies the list; discarding the
// list is all it takes to forget a failed attempt.
//
// ============================================================================

use crate::core::Value;
use crate::entity::{Entity, EntityType};

/// One staged write, applied in order by `save_changes`.
#[derive(Debug, Clone)]
pub enum PendingChange {
    /// Add a new row
    Insert(Box<dyn Entity>),

    /// Overwrite the row with the same key
    Update(Box<dyn Entity>),

    /// Remove the row with the given key
    Delete {
        entity_type: &'static EntityType,
        key: Value,
    },

    /// Remove every row of a type
    DeleteAll { entity_type: &'static EntityType },
}

impl PendingChange {
    pub fn entity_type(&self) -> &'static EntityType {
        match self {
            PendingChange::Insert(entity) | PendingChange::Update(entity) => entity.entity_type(),
            PendingChange::Delete { entity_type, .. } => entity_type,
            PendingChange::DeleteAll { entity_type } => entity_type,
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.entity_type().table
    }

    pub fn is_write(&self) -> bool {
        matches!(self, PendingChange::Insert(_) | PendingChange::Update(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use crate::entity::EntityModel;

    #[derive(Debug, Clone, Default, Entity)]
    #[entity(table = "crates")]
    struct Crate {
        #[sql(key)]
        id: i64,
    }

    #[test]
    fn test_change_table_name() {
        let insert = PendingChange::Insert(Box::new(Crate { id: 1 }));
        assert_eq!(insert.table_name(), "crates");
        assert!(insert.is_write());

        let delete = PendingChange::Delete {
            entity_type: Crate::descriptor(),
            key: Value::Integer(1),
        };
        assert_eq!(delete.entity_type().name, "Crate");
        assert!(!delete.is_write());
    }
}
