use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Value;

/// Kind of mutation recorded in a [`ChangeResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeFunction {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "DELETE ALL")]
    DeleteAll,
}

impl ChangeFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::DeleteAll => "DELETE ALL",
        }
    }
}

impl fmt::Display for ChangeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field name recorded for a DELETE ALL change.
pub const ALL_FIELDS: &str = "*";

/// One audit record: an entity-level insert/delete, or a single field update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeResult {
    pub surrogate_key: Value,
    /// Caller-supplied correlation token.
    pub entity_identifier: String,
    pub function: ChangeFunction,
    pub timestamp: DateTime<Utc>,
    pub entity_type: String,
    pub field_changed: String,
    pub original_value: Value,
    pub new_value: Value,
}

impl ChangeResult {
    pub fn insert(
        entity_type: &str,
        key_field: &str,
        key_value: Value,
        entity_identifier: &str,
    ) -> Self {
        Self {
            surrogate_key: key_value.clone(),
            entity_identifier: entity_identifier.to_string(),
            function: ChangeFunction::Insert,
            timestamp: Utc::now(),
            entity_type: entity_type.to_string(),
            field_changed: key_field.to_string(),
            original_value: Value::Null,
            new_value: key_value,
        }
    }

    pub fn update(
        entity_type: &str,
        key_value: Value,
        field: &str,
        original_value: Value,
        new_value: Value,
        entity_identifier: &str,
    ) -> Self {
        Self {
            surrogate_key: key_value,
            entity_identifier: entity_identifier.to_string(),
            function: ChangeFunction::Update,
            timestamp: Utc::now(),
            entity_type: entity_type.to_string(),
            field_changed: field.to_string(),
            original_value,
            new_value,
        }
    }

    pub fn delete(
        entity_type: &str,
        key_field: &str,
        key_value: Value,
        entity_identifier: &str,
    ) -> Self {
        Self {
            surrogate_key: key_value.clone(),
            entity_identifier: entity_identifier.to_string(),
            function: ChangeFunction::Delete,
            timestamp: Utc::now(),
            entity_type: entity_type.to_string(),
            field_changed: key_field.to_string(),
            original_value: key_value,
            new_value: Value::Null,
        }
    }

    pub fn delete_all(entity_type: &str, entity_identifier: &str) -> Self {
        Self {
            surrogate_key: Value::Null,
            entity_identifier: entity_identifier.to_string(),
            function: ChangeFunction::DeleteAll,
            timestamp: Utc::now(),
            entity_type: entity_type.to_string(),
            field_changed: ALL_FIELDS.to_string(),
            original_value: Value::Null,
            new_value: Value::Null,
        }
    }
}

impl fmt::Display for ChangeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}[{}].{}: {} -> {}",
            self.function,
            self.entity_type,
            self.surrogate_key,
            self.field_changed,
            self.original_value,
            self.new_value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_record_points_at_key() {
        let change = ChangeResult::insert("Widget", "id", Value::Integer(1), "corr-1");
        assert_eq!(change.function, ChangeFunction::Insert);
        assert_eq!(change.field_changed, "id");
        assert_eq!(change.new_value, Value::Integer(1));
        assert!(change.original_value.is_null());
    }

    #[test]
    fn test_function_serializes_as_audit_label() {
        let json = serde_json::to_string(&ChangeFunction::DeleteAll).unwrap();
        assert_eq!(json, "\"DELETE ALL\"");

        let change = ChangeResult::delete("Widget", "id", Value::Integer(3), "corr");
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["function"], "DELETE");
        assert_eq!(value["original_value"]["Integer"], 3);
    }

    #[test]
    fn test_update_record_round_trips_through_json() {
        let change = ChangeResult::update(
            "Event",
            Value::Integer(1),
            "label",
            Value::Text("2024-01-01T00:00:00Z".into()),
            Value::Text("67e55044-10b1-426f-9247-bb680e5fe0c8".into()),
            "corr",
        );

        let json = serde_json::to_string(&change).unwrap();
        let back: ChangeResult = serde_json::from_str(&json).unwrap();

        assert_eq!(back.original_value.type_name(), "TEXT");
        assert_eq!(back.new_value.type_name(), "TEXT");
        assert_eq!(back, change);
    }
}
