// ============================================================================
// SQLite Session
// ============================================================================
//
// Staged changes are flushed inside `BEGIN IMMEDIATE ... COMMIT` when no
// explicit transaction is open, and inside a savepoint when one is, so that
// `save_changes` is all-or-nothing in both cases.
//
// Storage formats: booleans as INTEGER 0/1, UUIDs as TEXT, timestamps as
// fixed-width RFC 3339 TEXT (see `format_timestamp`) so that `<` on the
// column is chronological.
//
// ============================================================================

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql, TransactionBehavior, params_from_iter};
use tracing::{Level, event};

use super::session::{Filter, SaveReport, StorageSession};
use crate::connection::RepositoryConfig;
use crate::core::{DataType, RepoError, Result, Value, format_timestamp};
use crate::entity::{Entity, EntityType, PropertyDescriptor, is_identity_column, surrogate_key};
use crate::result::QueryResult;
use crate::transaction::{
    BackendKind, IsolationLevel, PendingChange, TransactionInfo, TransactionOptions,
};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Uuid(u) => ToSqlOutput::Owned(SqlValue::Text(u.to_string())),
            Value::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Text(format_timestamp(ts))),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn value_from_sql(value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => {
            return Err(RepoError::TypeMismatch(
                "BLOB columns are not supported".into(),
            ));
        }
    })
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Integer | DataType::Boolean => "INTEGER",
        DataType::Float => "REAL",
        DataType::Text | DataType::Uuid | DataType::Timestamp => "TEXT",
    }
}

fn column_definition(property: &PropertyDescriptor) -> String {
    let mut definition = format!("{} {}", quote(property.column), column_type(property.data_type));
    if property.key {
        definition.push_str(" PRIMARY KEY");
        if is_identity_column(property) && property.data_type == DataType::Integer {
            definition.push_str(" AUTOINCREMENT");
        }
    } else if !property.nullable {
        definition.push_str(" NOT NULL");
    }
    definition
}

/// `CREATE TABLE IF NOT EXISTS` statement for an entity type.
pub fn create_table_sql(entity_type: &EntityType) -> String {
    let columns: Vec<String> = entity_type
        .properties
        .iter()
        .map(column_definition)
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(entity_type.table),
        columns.join(", ")
    )
}

fn select_sql(entity_type: &EntityType, filter: &Filter, projection: &str) -> Result<String> {
    let mut sql = format!("SELECT {} FROM {}", projection, quote(entity_type.table));
    match filter {
        Filter::All => {}
        Filter::Eq { property, .. } => {
            let column = entity_type.require_property(property)?.column;
            sql.push_str(&format!(" WHERE {} = ?1", quote(column)));
        }
        Filter::Lt { property, .. } => {
            let column = entity_type.require_property(property)?.column;
            sql.push_str(&format!(" WHERE {} < ?1", quote(column)));
        }
    }
    Ok(sql)
}

fn filter_params(filter: &Filter) -> Vec<Value> {
    match filter {
        Filter::All => Vec::new(),
        Filter::Eq { value, .. } | Filter::Lt { value, .. } => vec![value.clone()],
    }
}

fn apply_change(conn: &Connection, change: &PendingChange, report: &mut SaveReport) -> Result<()> {
    match change {
        PendingChange::Insert(entity) => {
            let entity_type = entity.entity_type();
            let key_property = surrogate_key(entity_type)?;
            let key_value = entity.require_value(key_property.name)?;
            let generate_key = is_identity_column(key_property) && key_value.is_unassigned_identity();

            let mut columns = Vec::new();
            let mut values = Vec::new();
            for property in entity_type.properties {
                if property.key && generate_key {
                    continue;
                }
                columns.push(quote(property.column));
                values.push(entity.require_value(property.name)?);
            }
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(entity_type.table),
                columns.join(", "),
                placeholders.join(", ")
            );
            conn.execute(&sql, params_from_iter(values.iter()))?;

            let key = if generate_key {
                Value::Integer(conn.last_insert_rowid())
            } else {
                key_value
            };
            report.inserted_keys.push(key);
            report.affected += 1;
        }
        PendingChange::Update(entity) => {
            let entity_type = entity.entity_type();
            let key_property = surrogate_key(entity_type)?;

            let mut assignments = Vec::new();
            let mut values = Vec::new();
            for property in entity_type.properties.iter().filter(|p| !p.key) {
                values.push(entity.require_value(property.name)?);
                assignments.push(format!("{} = ?{}", quote(property.column), values.len()));
            }
            if assignments.is_empty() {
                return Ok(());
            }
            let key_value = entity.require_value(key_property.name)?;
            values.push(key_value.clone());
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quote(entity_type.table),
                assignments.join(", "),
                quote(key_property.column),
                values.len()
            );
            let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
            if changed == 0 {
                return Err(RepoError::not_found(
                    entity_type.name,
                    format!("{} = {}", key_property.name, key_value),
                ));
            }
            report.affected += changed as u64;
        }
        PendingChange::Delete { entity_type, key } => {
            let key_property = surrogate_key(entity_type)?;
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote(entity_type.table),
                quote(key_property.column)
            );
            report.affected += conn.execute(&sql, [key])? as u64;
        }
        PendingChange::DeleteAll { entity_type } => {
            let sql = format!("DELETE FROM {}", quote(entity_type.table));
            report.affected += conn.execute(&sql, [])? as u64;
        }
    }
    Ok(())
}

fn apply_all(conn: &Connection, changes: &[PendingChange]) -> Result<SaveReport> {
    let mut report = SaveReport::default();
    for change in changes {
        apply_change(conn, change, &mut report)?;
    }
    Ok(report)
}

/// `StorageSession` over a rusqlite connection.
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    pending: Vec<PendingChange>,
    transaction: Option<TransactionInfo>,
}

impl SqliteSession {
    pub fn open(config: &RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(config.sqlite_path())?;
        Self::configure(&conn, config)?;
        Ok(Self::from_connection(Arc::new(Mutex::new(conn))))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn, &RepositoryConfig::default())?;
        Ok(Self::from_connection(Arc::new(Mutex::new(conn))))
    }

    /// Wraps an existing connection, which may be shared with other sessions.
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            pending: Vec::new(),
            transaction: None,
        }
    }

    fn configure(conn: &Connection, config: &RepositoryConfig) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(config.command_timeout_duration())?;
        Ok(())
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepoError::LockError(e.to_string()))
    }

    /// Creates the tables of the given entity types if they do not exist.
    pub fn ensure_schema(&self, entity_types: &[&'static EntityType]) -> Result<()> {
        let conn = self.lock()?;
        for entity_type in entity_types {
            conn.execute(&create_table_sql(entity_type), [])?;
        }
        Ok(())
    }

    fn read_entities(
        conn: &Connection,
        entity_type: &'static EntityType,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Box<dyn Entity>>> {
        let projection: Vec<String> = entity_type
            .properties
            .iter()
            .map(|property| quote(property.column))
            .collect();
        let mut sql = select_sql(entity_type, filter, &projection.join(", "))?;
        sql.push_str(" ORDER BY rowid");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let params = filter_params(filter);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            let mut entity = entity_type.new_instance();
            for (index, property) in entity_type.properties.iter().enumerate() {
                let value = value_from_sql(row.get_ref(index)?)?;
                entity.set_value(property.name, value)?;
            }
            entities.push(entity);
        }
        Ok(entities)
    }
}

#[async_trait]
impl StorageSession for SqliteSession {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn add(&mut self, entity: Box<dyn Entity>) -> Result<()> {
        self.pending.push(PendingChange::Insert(entity));
        Ok(())
    }

    fn update(&mut self, entity: Box<dyn Entity>) -> Result<()> {
        self.pending.push(PendingChange::Update(entity));
        Ok(())
    }

    fn remove(&mut self, entity_type: &'static EntityType, key: Value) -> Result<()> {
        self.pending.push(PendingChange::Delete { entity_type, key });
        Ok(())
    }

    fn remove_all(&mut self, entity_type: &'static EntityType) -> Result<()> {
        self.pending.push(PendingChange::DeleteAll { entity_type });
        Ok(())
    }

    fn discard_changes(&mut self) {
        self.pending.clear();
    }

    fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn find(
        &mut self,
        entity_type: &'static EntityType,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Box<dyn Entity>>> {
        let conn = self.lock()?;
        Self::read_entities(&conn, entity_type, filter, limit)
    }

    async fn count(&mut self, entity_type: &'static EntityType, filter: &Filter) -> Result<u64> {
        let conn = self.lock()?;
        let sql = select_sql(entity_type, filter, "COUNT(*)")?;
        let params = filter_params(filter);
        let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    async fn save_changes(&mut self) -> Result<SaveReport> {
        if self.pending.is_empty() {
            return Ok(SaveReport::default());
        }

        let report = {
            let mut conn = self.lock()?;
            if self.transaction.is_some() {
                let savepoint = conn.savepoint()?;
                let report = apply_all(&savepoint, &self.pending)?;
                savepoint.commit()?;
                report
            } else {
                let tx = rusqlite::Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
                let report = apply_all(&tx, &self.pending)?;
                tx.commit()?;
                report
            }
        };

        event!(
            Level::DEBUG,
            changes = self.pending.len(),
            affected = report.affected,
            "sqlite changes saved"
        );
        self.pending.clear();
        Ok(report)
    }

    async fn begin_transaction(&mut self, options: &TransactionOptions) -> Result<()> {
        if self.transaction.is_some() {
            return Err(RepoError::Transaction(
                "a transaction is already active on this session".into(),
            ));
        }

        let statement = match options.isolation_level {
            IsolationLevel::Serializable | IsolationLevel::RepeatableRead => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };
        self.lock()?.execute_batch(statement)?;

        let info = TransactionInfo::begin(options.clone());
        event!(Level::DEBUG, txn = %info.id(), statement, "begin");
        self.transaction = Some(info);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        let Some(mut info) = self.transaction.take() else {
            return Err(RepoError::Transaction("no active transaction".into()));
        };

        let committed = self.lock()?.execute_batch("COMMIT");
        if let Err(err) = committed {
            // a failed COMMIT may leave the transaction open
            if let Ok(conn) = self.lock()
                && !conn.is_autocommit()
            {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    tracing::debug!(error = %rollback_err, "rollback after failed commit failed");
                }
            }
            info.abort();
            return Err(err.into());
        }

        info.commit();
        event!(Level::DEBUG, txn = %info.id(), elapsed = ?info.elapsed(), "commit");
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.pending.clear();
        let Some(mut info) = self.transaction.take() else {
            return Err(RepoError::Transaction("no active transaction".into()));
        };

        let conn = self.lock()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        info.abort();
        event!(Level::DEBUG, txn = %info.id(), "rollback");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    async fn query_raw(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result_rows = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(value_from_sql(row.get_ref(index)?)?);
            }
            result_rows.push(values);
        }
        Ok(QueryResult::new(columns, result_rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use crate::entity::EntityModel;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    #[derive(Debug, Clone, Default, PartialEq, Entity)]
    #[entity(table = "devices")]
    struct Device {
        #[sql(key, identity)]
        id: i64,
        serial: Uuid,
        active: bool,
        #[sql(column = "seen_at")]
        last_seen: DateTime<Utc>,
        label: Option<String>,
    }

    fn session() -> SqliteSession {
        let session = SqliteSession::open_in_memory().unwrap();
        session.ensure_schema(&[Device::descriptor()]).unwrap();
        session
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_open_transaction() {
        let mut session = session();
        let conn = session.connection();
        conn.lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE parents (id INTEGER PRIMARY KEY);
                 CREATE TABLE children (
                     id INTEGER PRIMARY KEY,
                     parent INTEGER REFERENCES parents(id) DEFERRABLE INITIALLY DEFERRED
                 );",
            )
            .unwrap();

        session
            .begin_transaction(&TransactionOptions::default())
            .await
            .unwrap();
        conn.lock()
            .unwrap()
            .execute_batch("INSERT INTO children (id, parent) VALUES (1, 42);")
            .unwrap();

        assert!(session.commit_transaction().await.is_err());
        assert!(!session.in_transaction());

        let guard = conn.lock().unwrap();
        assert!(guard.is_autocommit());
        let orphans: i64 = guard
            .query_row("SELECT COUNT(*) FROM children", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(Device::descriptor());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"devices\""));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"seen_at\" TEXT NOT NULL"));
        assert!(sql.contains("\"label\" TEXT"));
        assert!(!sql.contains("\"label\" TEXT NOT NULL"));
    }

    #[tokio::test]
    async fn test_insert_generates_identity_and_round_trips_types() {
        let mut session = session();
        let device = Device {
            id: 0,
            serial: Uuid::new_v4(),
            active: true,
            last_seen: Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap(),
            label: None,
        };

        session.add(Box::new(device.clone())).unwrap();
        let report = session.save_changes().await.unwrap();
        assert_eq!(report.inserted_keys, vec![Value::Integer(1)]);

        let rows = session
            .find(Device::descriptor(), &Filter::eq("id", 1i64), None)
            .await
            .unwrap();
        let loaded = rows.into_iter().next().unwrap().downcast::<Device>().unwrap();
        assert_eq!(loaded, Device { id: 1, ..device });
    }

    #[tokio::test]
    async fn test_failed_flush_is_atomic() {
        let mut session = session();
        let device = Device {
            id: 5,
            ..Device::default()
        };
        session.add(Box::new(device.clone())).unwrap();
        session.save_changes().await.unwrap();

        session.add(Box::new(Device { id: 6, ..Device::default() })).unwrap();
        session.add(Box::new(device)).unwrap();
        let err = session.save_changes().await.unwrap_err();
        assert!(matches!(err, RepoError::ConstraintViolation(_)));

        session.discard_changes();
        assert_eq!(session.count(Device::descriptor(), &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_saved_changes() {
        let mut session = session();
        session
            .begin_transaction(&TransactionOptions::new(IsolationLevel::Serializable))
            .await
            .unwrap();
        session.add(Box::new(Device::default())).unwrap();
        session.save_changes().await.unwrap();
        session.rollback_transaction().await.unwrap();

        assert_eq!(session.count(Device::descriptor(), &Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_table_exists_uses_sqlite_master() {
        let mut session = session();
        assert!(session.table_exists("devices").await.unwrap());
        assert!(!session.table_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_raw() {
        let mut session = session();
        let result = session
            .query_raw("SELECT ?1 + 1 AS answer", &[Value::Integer(41)])
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["answer".to_string()]);
        assert_eq!(result.scalar(), Some(&Value::Integer(42)));
    }
}
