#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entityrepo::entity::EntityType;
use entityrepo::prelude::*;
use entityrepo::result::QueryResult;
use entityrepo::storage::{Filter, SaveReport};
use entityrepo::transaction::TransactionOptions;

#[derive(Debug, Clone, Default, PartialEq, Entity)]
#[entity(table = "widgets")]
pub struct Widget {
    #[sql(key)]
    pub id: i64,
    #[sql(column)]
    pub name: String,
    #[sql(column)]
    pub price: i64,
}

impl Widget {
    pub fn new(id: i64, name: &str, price: i64) -> Self {
        Self {
            id,
            name: name.to_string(),
            price,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Entity)]
#[entity(table = "widget_archive")]
pub struct WidgetArchive {
    #[sql(key)]
    pub id: i64,
    pub name: String,
    pub price: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Entity)]
#[entity(table = "audit_entries")]
pub struct AuditEntry {
    #[sql(key, identity)]
    pub id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn aged(message: &str, age: chrono::Duration) -> Self {
        Self {
            id: 0,
            message: message.to_string(),
            created_at: Utc::now() - age,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Entity)]
pub struct Keyless {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Entity)]
pub struct TwoKeys {
    #[sql(key)]
    pub left: i64,
    #[sql(key)]
    pub right: i64,
}

/// Config with a short backoff so retry tests stay fast.
pub fn config(retries: i64) -> RepositoryConfig {
    RepositoryConfig::new(":memory:")
        .deadlock_retry_count(retries)
        .deadlock_retry_wait_ms(5)
}

pub fn memory_repo() -> Repository<InMemorySession> {
    Repository::new(InMemorySession::new(), config(3)).expect("valid config")
}

/// Session wrapper whose `save_changes` fails a fixed number of times with a
/// backend error before delegating.
pub struct FlakySession<S> {
    inner: S,
    backend: BackendKind,
    code: i32,
    successes_left: Arc<AtomicU32>,
    failures_left: Arc<AtomicU32>,
    save_calls: Arc<AtomicU32>,
}

impl<S: StorageSession> FlakySession<S> {
    pub fn new(inner: S, backend: BackendKind, code: i32, failures: u32) -> Self {
        Self::failing_after(inner, backend, code, 0, failures)
    }

    /// Lets `successes` saves through before injecting `failures` errors.
    pub fn failing_after(
        inner: S,
        backend: BackendKind,
        code: i32,
        successes: u32,
        failures: u32,
    ) -> Self {
        Self {
            inner,
            backend,
            code,
            successes_left: Arc::new(AtomicU32::new(successes)),
            failures_left: Arc::new(AtomicU32::new(failures)),
            save_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Counter shared with the session, readable after it moves into a
    /// repository.
    pub fn save_calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.save_calls)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: StorageSession> StorageSession for FlakySession<S> {
    fn backend(&self) -> BackendKind {
        self.backend.clone()
    }

    fn add(&mut self, entity: Box<dyn entityrepo::entity::Entity>) -> Result<()> {
        self.inner.add(entity)
    }

    fn update(&mut self, entity: Box<dyn entityrepo::entity::Entity>) -> Result<()> {
        self.inner.update(entity)
    }

    fn remove(&mut self, entity_type: &'static EntityType, key: Value) -> Result<()> {
        self.inner.remove(entity_type, key)
    }

    fn remove_all(&mut self, entity_type: &'static EntityType) -> Result<()> {
        self.inner.remove_all(entity_type)
    }

    fn discard_changes(&mut self) {
        self.inner.discard_changes();
    }

    fn has_pending_changes(&self) -> bool {
        self.inner.has_pending_changes()
    }

    async fn find(
        &mut self,
        entity_type: &'static EntityType,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Box<dyn entityrepo::entity::Entity>>> {
        self.inner.find(entity_type, filter, limit).await
    }

    async fn count(&mut self, entity_type: &'static EntityType, filter: &Filter) -> Result<u64> {
        self.inner.count(entity_type, filter).await
    }

    async fn save_changes(&mut self) -> Result<SaveReport> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let passing = self
            .successes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if passing {
            return self.inner.save_changes().await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepoError::Backend {
                backend: self.backend.clone(),
                code: self.code,
                message: "injected failure".into(),
            });
        }
        self.inner.save_changes().await
    }

    async fn begin_transaction(&mut self, options: &TransactionOptions) -> Result<()> {
        self.inner.begin_transaction(options).await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.inner.commit_transaction().await
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.inner.rollback_transaction().await
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    async fn query_raw(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.inner.query_raw(sql, params).await
    }
}

pub fn flaky_repo(
    backend: BackendKind,
    code: i32,
    failures: u32,
    retries: i64,
) -> (Repository<FlakySession<InMemorySession>>, Arc<AtomicU32>) {
    let session = FlakySession::new(InMemorySession::new(), backend, code, failures);
    let calls = session.save_calls();
    let repo = Repository::new(session, config(retries)).expect("valid config");
    (repo, calls)
}

pub async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
