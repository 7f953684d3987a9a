use std::cmp::Ordering;

use async_trait::async_trait;

use crate::core::{RepoError, Result, Value};
use crate::entity::{Entity, EntityType};
use crate::result::QueryResult;
use crate::transaction::{BackendKind, TransactionOptions};

/// Row predicate understood by every session.
///
/// Values are expected to be coerced to the property's declared type already.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq { property: String, value: Value },
    /// Strictly less than. NULL never matches.
    Lt { property: String, value: Value },
}

impl Filter {
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt {
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn property(&self) -> Option<&str> {
        match self {
            Filter::All => None,
            Filter::Eq { property, .. } | Filter::Lt { property, .. } => Some(property),
        }
    }

    /// Evaluates the filter against a materialized entity.
    pub fn matches(&self, entity: &dyn Entity) -> Result<bool> {
        match self {
            Filter::All => Ok(true),
            Filter::Eq { property, value } => Ok(entity.require_value(property)? == *value),
            Filter::Lt { property, value } => {
                let current = entity.require_value(property)?;
                if current.is_null() || value.is_null() {
                    return Ok(false);
                }
                Ok(current.compare(value)? == Ordering::Less)
            }
        }
    }
}

/// What a `save_changes` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    /// Rows touched, including every row removed by a delete-all.
    pub affected: u64,
    /// Key of each inserted row, in staging order. Holds the generated
    /// value for identity keys.
    pub inserted_keys: Vec<Value>,
}

impl SaveReport {
    pub fn merge(&mut self, other: SaveReport) {
        self.affected += other.affected;
        self.inserted_keys.extend(other.inserted_keys);
    }
}

/// SQL flavour used for catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    SqlServer,
    Sqlite,
}

impl SqlDialect {
    pub fn for_backend(backend: &BackendKind) -> Option<Self> {
        match backend {
            BackendKind::SqlServer => Some(SqlDialect::SqlServer),
            BackendKind::Sqlite => Some(SqlDialect::Sqlite),
            _ => None,
        }
    }

    /// Parameterized query returning one row per table named `?1`/`@p1`.
    pub fn table_exists_query(&self) -> &'static str {
        match self {
            SqlDialect::SqlServer => {
                "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = @p1"
            }
            SqlDialect::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        }
    }
}

/// Unit-of-work session over one storage backend.
///
/// Writes are staged with `add`/`update`/`remove`/`remove_all` and become
/// visible only after `save_changes`. Reads always see flushed state.
#[async_trait]
pub trait StorageSession: Send {
    fn backend(&self) -> BackendKind;

    fn add(&mut self, entity: Box<dyn Entity>) -> Result<()>;

    fn update(&mut self, entity: Box<dyn Entity>) -> Result<()>;

    fn remove(&mut self, entity_type: &'static EntityType, key: Value) -> Result<()>;

    fn remove_all(&mut self, entity_type: &'static EntityType) -> Result<()>;

    /// Drops every staged change that has not been saved.
    fn discard_changes(&mut self);

    fn has_pending_changes(&self) -> bool;

    /// Rows matching `filter`, in storage order.
    async fn find(
        &mut self,
        entity_type: &'static EntityType,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Box<dyn Entity>>>;

    async fn count(&mut self, entity_type: &'static EntityType, filter: &Filter) -> Result<u64>;

    /// Applies staged changes in order. Either all of them take effect or
    /// none do.
    async fn save_changes(&mut self) -> Result<SaveReport>;

    async fn begin_transaction(&mut self, options: &TransactionOptions) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn rollback_transaction(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    async fn query_raw(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Catalog lookup through the backend's SQL dialect.
    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        let dialect = SqlDialect::for_backend(&self.backend()).ok_or_else(|| {
            RepoError::Unsupported(format!(
                "no catalog query for {} backend",
                self.backend()
            ))
        })?;
        let result = self
            .query_raw(dialect.table_exists_query(), &[Value::from(table_name)])
            .await?;
        Ok(result
            .scalar()
            .and_then(Value::as_i64)
            .is_some_and(|count| count > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use chrono::{TimeZone, Utc};

    #[derive(Debug, Clone, Default, Entity)]
    struct Reading {
        #[sql(key)]
        id: i64,
        taken_at: Option<chrono::DateTime<Utc>>,
    }

    #[test]
    fn test_lt_skips_null() {
        let threshold = Value::from(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let filter = Filter::lt("taken_at", threshold);

        let old = Reading {
            id: 1,
            taken_at: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
        };
        let unset = Reading { id: 2, taken_at: None };

        assert!(filter.matches(&old).unwrap());
        assert!(!filter.matches(&unset).unwrap());
    }

    #[test]
    fn test_unknown_property_fails() {
        let filter = Filter::eq("missing", 1i64);
        assert!(filter.matches(&Reading::default()).is_err());
    }

    #[test]
    fn test_dialect_queries() {
        assert!(SqlDialect::SqlServer
            .table_exists_query()
            .contains("INFORMATION_SCHEMA.TABLES"));
        assert!(SqlDialect::Sqlite.table_exists_query().contains("sqlite_master"));
        assert_eq!(SqlDialect::for_backend(&BackendKind::InMemory), None);
    }
}
