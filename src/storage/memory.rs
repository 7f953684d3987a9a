// ============================================================================
// In-Memory Session
// ============================================================================
//
// Tables live in an `InMemoryStore` that several sessions may share. A store
// admits one writing transaction at a time: beginning a transaction, or
// saving outside one, while another session's transaction holds the store
// fails with a `MEMORY_WRITE_CONFLICT` backend error, which the default
// classifiers treat as transient.
//
// Beginning a transaction keeps a copy of the committed tables in the store.
// Other sessions read from that copy until the writer commits, so they never
// see uncommitted rows; rollback restores it.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{Level, event};

use super::session::{Filter, SaveReport, StorageSession};
use super::table::Table;
use crate::core::{RepoError, Result, Value};
use crate::entity::{Entity, EntityType};
use crate::result::QueryResult;
use crate::transaction::{
    BackendKind, MEMORY_WRITE_CONFLICT, PendingChange, TransactionId, TransactionInfo,
    TransactionOptions,
};

type Tables = HashMap<&'static str, Table>;

#[derive(Debug, Default)]
struct StoreState {
    tables: Tables,
    writer: Option<TransactionId>,
    // committed tables while `writer` is set
    committed: Option<Tables>,
}

impl StoreState {
    fn table_mut(&mut self, entity_type: &'static EntityType) -> &mut Table {
        table_mut(&mut self.tables, entity_type)
    }

    /// Tables as seen by `own`: the writer sees its uncommitted work,
    /// everyone else the last committed state.
    fn visible(&self, own: Option<TransactionId>) -> &Tables {
        match (&self.writer, &self.committed) {
            (Some(holder), Some(committed)) if Some(*holder) != own => committed,
            _ => &self.tables,
        }
    }

    /// Drops the writer's work and releases the store.
    fn restore(&mut self) {
        if let Some(committed) = self.committed.take() {
            self.tables = committed;
        }
        self.writer = None;
    }

    fn check_writer(&self, own: Option<TransactionId>) -> Result<()> {
        match self.writer {
            Some(holder) if Some(holder) != own => Err(RepoError::Backend {
                backend: BackendKind::InMemory,
                code: MEMORY_WRITE_CONFLICT,
                message: format!("store is locked by {holder}"),
            }),
            _ => Ok(()),
        }
    }
}

fn table_mut<'a>(tables: &'a mut Tables, entity_type: &'static EntityType) -> &'a mut Table {
    tables
        .entry(entity_type.name)
        .or_insert_with(|| Table::new(entity_type))
}

/// Shared table storage for `InMemorySession`s.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> InMemorySession {
        InMemorySession::with_store(self.clone())
    }

    /// Creates an empty table for `entity_type` if there is none.
    pub async fn register(&self, entity_type: &'static EntityType) {
        self.inner.write().await.table_mut(entity_type);
    }

    pub async fn row_count(&self, entity_type: &EntityType) -> usize {
        self.inner
            .read()
            .await
            .visible(None)
            .get(entity_type.name)
            .map_or(0, Table::len)
    }
}

pub struct InMemorySession {
    store: InMemoryStore,
    pending: Vec<PendingChange>,
    transaction: Option<TransactionInfo>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }

    pub fn with_store(store: InMemoryStore) -> Self {
        Self {
            store,
            pending: Vec::new(),
            transaction: None,
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub async fn register(&self, entity_type: &'static EntityType) {
        self.store.register(entity_type).await;
    }

    pub fn pending_changes(&self) -> &[PendingChange] {
        &self.pending
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(TransactionInfo::id)
    }

    fn apply(tables: &mut Tables, changes: &[PendingChange]) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        for change in changes {
            let table = table_mut(tables, change.entity_type());
            match change {
                PendingChange::Insert(entity) => {
                    let key = table.insert(entity.clone())?;
                    report.inserted_keys.push(key);
                    report.affected += 1;
                }
                PendingChange::Update(entity) => {
                    if !table.update(entity.clone())? {
                        let entity_type = entity.entity_type();
                        let key = crate::entity::surrogate_key(entity_type)?;
                        return Err(RepoError::not_found(
                            entity_type.name,
                            format!("{} = {}", key.name, entity.require_value(key.name)?),
                        ));
                    }
                    report.affected += 1;
                }
                PendingChange::Delete { key, .. } => {
                    if table.delete(key) {
                        report.affected += 1;
                    }
                }
                PendingChange::DeleteAll { .. } => {
                    report.affected += table.clear() as u64;
                }
            }
        }
        Ok(report)
    }
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        // release the store if the session goes away mid-transaction
        if let Some(info) = self.transaction.take()
            && let Ok(mut state) = self.store.inner.try_write()
            && state.writer == Some(info.id())
        {
            state.restore();
        }
    }
}

#[async_trait]
impl StorageSession for InMemorySession {
    fn backend(&self) -> BackendKind {
        BackendKind::InMemory
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
        let own = self.transaction_id();
        let state = self.store.inner.read().await;
        let Some(table) = state.visible(own).get(entity_type.name) else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        for row in table.scan() {
            if limit.is_some_and(|limit| found.len() >= limit) {
                break;
            }
            if filter.matches(row)? {
                found.push(row.clone_entity());
            }
        }
        Ok(found)
    }

    async fn count(&mut self, entity_type: &'static EntityType, filter: &Filter) -> Result<u64> {
        let own = self.transaction_id();
        let state = self.store.inner.read().await;
        let Some(table) = state.visible(own).get(entity_type.name) else {
            return Ok(0);
        };

        let mut count = 0u64;
        for row in table.scan() {
            if filter.matches(row)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn save_changes(&mut self) -> Result<SaveReport> {
        if self.pending.is_empty() {
            return Ok(SaveReport::default());
        }

        let own = self.transaction_id();
        let mut state = self.store.inner.write().await;
        state.check_writer(own)?;

        // apply to a copy so a failing change leaves the store untouched
        let mut working = state.tables.clone();
        let report = Self::apply(&mut working, &self.pending)?;
        state.tables = working;
        drop(state);

        event!(
            Level::DEBUG,
            changes = self.pending.len(),
            affected = report.affected,
            "in-memory changes saved"
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

        let mut state = self.store.inner.write().await;
        state.check_writer(None)?;

        let info = TransactionInfo::begin(options.clone());
        state.writer = Some(info.id());
        state.committed = Some(state.tables.clone());
        drop(state);

        event!(Level::DEBUG, txn = %info.id(), isolation = %options.isolation_level, "begin");
        self.transaction = Some(info);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        let Some(mut info) = self.transaction.take() else {
            return Err(RepoError::Transaction("no active transaction".into()));
        };

        let mut state = self.store.inner.write().await;
        if state.writer == Some(info.id()) {
            state.writer = None;
            state.committed = None;
        }
        drop(state);
        info.commit();
        event!(Level::DEBUG, txn = %info.id(), elapsed = ?info.elapsed(), "commit");
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.pending.clear();
        let Some(mut info) = self.transaction.take() else {
            return Err(RepoError::Transaction("no active transaction".into()));
        };

        let mut state = self.store.inner.write().await;
        if state.writer == Some(info.id()) {
            state.restore();
        }
        drop(state);
        info.abort();
        event!(Level::DEBUG, txn = %info.id(), "rollback");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    async fn query_raw(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        Err(RepoError::Unsupported(format!(
            "in-memory session cannot execute SQL: {sql}"
        )))
    }

    async fn table_exists(&mut self, table_name: &str) -> Result<bool> {
        let own = self.transaction_id();
        let state = self.store.inner.read().await;
        Ok(state
            .visible(own)
            .values()
            .any(|table| table.entity_type().table.eq_ignore_ascii_case(table_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entity;
    use crate::entity::EntityModel;
    use crate::transaction::ClassifierRegistry;

    #[derive(Debug, Clone, Default, Entity)]
    #[entity(table = "notes")]
    struct Note {
        #[sql(key, identity)]
        id: i64,
        body: String,
    }

    fn note(body: &str) -> Box<dyn Entity> {
        Box::new(Note {
            id: 0,
            body: body.into(),
        })
    }

    #[tokio::test]
    async fn test_changes_are_invisible_until_saved() {
        let mut session = InMemorySession::new();
        session.add(note("a")).unwrap();
        assert_eq!(session.count(Note::descriptor(), &Filter::All).await.unwrap(), 0);

        let report = session.save_changes().await.unwrap();
        assert_eq!(report.inserted_keys, vec![Value::Integer(1)]);
        assert_eq!(session.count(Note::descriptor(), &Filter::All).await.unwrap(), 1);
        assert!(!session.has_pending_changes());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_store_untouched() {
        let mut session = InMemorySession::new();
        session.add(Box::new(Note { id: 1, body: "a".into() })).unwrap();
        session.save_changes().await.unwrap();

        session.add(Box::new(Note { id: 2, body: "b".into() })).unwrap();
        session.add(Box::new(Note { id: 1, body: "dup".into() })).unwrap();
        assert!(session.save_changes().await.is_err());

        assert_eq!(session.count(Note::descriptor(), &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let mut session = InMemorySession::new();
        session
            .begin_transaction(&TransactionOptions::default())
            .await
            .unwrap();
        session.add(note("a")).unwrap();
        session.save_changes().await.unwrap();
        session.rollback_transaction().await.unwrap();

        assert!(!session.in_transaction());
        assert_eq!(session.count(Note::descriptor(), &Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_writer_gets_transient_conflict() {
        let store = InMemoryStore::new();
        let mut first = store.session();
        let mut second = store.session();

        first
            .begin_transaction(&TransactionOptions::default())
            .await
            .unwrap();

        let err = second
            .begin_transaction(&TransactionOptions::default())
            .await
            .unwrap_err();
        assert!(ClassifierRegistry::with_defaults().is_transient(&BackendKind::InMemory, &err));

        second.add(note("b")).unwrap();
        assert!(second.save_changes().await.is_err());

        first.commit_transaction().await.unwrap();
        second.save_changes().await.unwrap();
        assert_eq!(store.row_count(Note::descriptor()).await, 1);
    }

    #[tokio::test]
    async fn test_other_sessions_read_committed_rows_only() {
        let store = InMemoryStore::new();
        let mut writer = store.session();
        let mut reader = store.session();

        writer.add(note("kept")).unwrap();
        writer.save_changes().await.unwrap();

        writer
            .begin_transaction(&TransactionOptions::default())
            .await
            .unwrap();
        writer.add(note("pending")).unwrap();
        writer.save_changes().await.unwrap();

        assert_eq!(writer.count(Note::descriptor(), &Filter::All).await.unwrap(), 2);
        assert_eq!(reader.count(Note::descriptor(), &Filter::All).await.unwrap(), 1);
        let seen = reader
            .find(Note::descriptor(), &Filter::eq("body", "pending"), None)
            .await
            .unwrap();
        assert!(seen.is_empty());
        assert_eq!(store.row_count(Note::descriptor()).await, 1);

        writer.commit_transaction().await.unwrap();
        assert_eq!(reader.count(Note::descriptor(), &Filter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rollback_is_never_visible_to_readers() {
        let store = InMemoryStore::new();
        let mut writer = store.session();
        let mut reader = store.session();

        writer
            .begin_transaction(&TransactionOptions::default())
            .await
            .unwrap();
        writer.add(note("discarded")).unwrap();
        writer.save_changes().await.unwrap();
        assert_eq!(reader.count(Note::descriptor(), &Filter::All).await.unwrap(), 0);

        writer.rollback_transaction().await.unwrap();
        assert_eq!(reader.count(Note::descriptor(), &Filter::All).await.unwrap(), 0);
        assert_eq!(writer.count(Note::descriptor(), &Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_table_exists_is_native() {
        let mut session = InMemorySession::new();
        assert!(!session.table_exists("notes").await.unwrap());
        session.register(Note::descriptor()).await;
        assert!(session.table_exists("notes").await.unwrap());
        assert!(session.query_raw("SELECT 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_find_with_limit() {
        let mut session = InMemorySession::new();
        for body in ["a", "b", "c"] {
            session.add(note(body)).unwrap();
        }
        session.save_changes().await.unwrap();

        let first = session
            .find(Note::descriptor(), &Filter::All, Some(1))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].get_value("body"), Some(Value::from("a")));
    }
}
