// ============================================================================
// Transactional Retry Wrapper
// ============================================================================
//
// `execute` runs a unit of work inside a transaction and retries the whole
// unit on transient backend errors:
//
//   attempt ──ok──────────────────────────────> Success
//      │
//      ├──transient, attempts left──> sleep ──> attempt
//      ├──transient, budget spent─────────────> Failure (FatalError)
//      └──anything else───────────────────────> Fatal(error)
//
// A failed attempt is rolled back and its staged changes are discarded, so
// only the effects of the successful attempt persist. Batches re-run from
// the first element.
//
// ============================================================================

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::warn;

use super::Repository;
use crate::core::{RepoError, Result, Value};
use crate::entity::{EntityModel, EntityType};
use crate::result::{ChangeResult, OperationResult};
use crate::storage::StorageSession;
use crate::transaction::{CancellationSignal, TransactionScopeOption};

/// Work executed, and possibly re-executed, by `Repository::execute`.
#[async_trait]
pub trait UnitOfWork<S: StorageSession>: Send + Sync {
    type Output: Send;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output>;
}

/// Adapts a closure into a `UnitOfWork`.
pub struct FnWork<F>(pub F);

#[async_trait]
impl<S, F, T> UnitOfWork<S> for FnWork<F>
where
    S: StorageSession,
    F: for<'a> Fn(&'a mut Repository<S>) -> BoxFuture<'a, Result<T>> + Send + Sync,
    T: Send,
{
    type Output = T;

    async fn run(&self, repo: &mut Repository<S>) -> Result<T> {
        (self.0)(repo).await
    }
}

impl<S: StorageSession> Repository<S> {
    /// Runs `work` under the configured scope option, isolation level,
    /// timeout and retry policy.
    pub async fn execute<W>(&mut self, work: &W) -> OperationResult<W::Output>
    where
        W: UnitOfWork<S> + ?Sized,
    {
        let backend = self.session.backend();
        let policy = self.retry;
        let mut attempt: u32 = 1;

        loop {
            if self.is_cancelled() {
                return OperationResult::Fatal(RepoError::Cancelled);
            }

            let err = match self.run_attempt(work).await {
                Ok(value) => return OperationResult::Success(value),
                Err(err) => err,
            };

            if policy.is_disabled() || !self.classifiers.is_transient(&backend, &err) {
                return OperationResult::Fatal(err);
            }

            if !policy.should_retry(attempt) {
                warn!(
                    "Repository.transaction gave up after {} attempt(s): {}",
                    attempt, err
                );
                return OperationResult::exhausted(attempt, err.to_string());
            }

            warn!(
                "Repository.transaction retry on transient error (attempt {} of {}): {} (backoff={}ms)",
                attempt,
                policy.attempts(),
                err,
                policy.delay().as_millis()
            );
            if let Err(cancelled) = Self::pause(self.cancellation.as_ref(), policy.delay()).await {
                return OperationResult::Fatal(cancelled);
            }
            attempt += 1;
        }
    }

    /// Runs arbitrary caller work through the retry wrapper.
    ///
    /// The closure may run more than once, so it should capture owned data.
    pub async fn in_transaction<F, T>(&mut self, work: F) -> OperationResult<T>
    where
        F: for<'a> Fn(&'a mut Repository<S>) -> BoxFuture<'a, Result<T>> + Send + Sync,
        T: Send,
    {
        self.execute(&FnWork(work)).await
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|signal| signal.is_cancelled())
    }

    async fn pause(signal: Option<&CancellationSignal>, delay: Duration) -> Result<()> {
        match signal {
            Some(signal) => {
                tokio::select! {
                    _ = signal.cancelled() => Err(RepoError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    async fn run_attempt<W>(&mut self, work: &W) -> Result<W::Output>
    where
        W: UnitOfWork<S> + ?Sized,
    {
        let joined = self.session.in_transaction();
        match self.config.scope_option {
            TransactionScopeOption::Suppress => return self.run_bounded(work).await,
            TransactionScopeOption::Required if joined => return self.run_bounded(work).await,
            TransactionScopeOption::RequiresNew if joined => {
                return Err(RepoError::Transaction(
                    "RequiresNew scope cannot start while a transaction is active".into(),
                ));
            }
            _ => {}
        }

        let options = self.config.transaction_options();
        self.session.begin_transaction(&options).await?;

        match self.run_bounded(work).await {
            Ok(value) => match self.session.commit_transaction().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.session.discard_changes();
                    Err(err)
                }
            },
            Err(err) => {
                if let Err(rollback_err) = self.session.rollback_transaction().await {
                    tracing::debug!(error = %rollback_err, "rollback after failed attempt failed");
                }
                self.session.discard_changes();
                Err(err)
            }
        }
    }

    async fn run_bounded<W>(&mut self, work: &W) -> Result<W::Output>
    where
        W: UnitOfWork<S> + ?Sized,
    {
        let result = match self.config.transaction_timeout_duration() {
            Some(limit) => {
                let started = Instant::now();
                match tokio::time::timeout(limit, work.run(self)).await {
                    // blocking session calls never yield to the timer, so
                    // completed work is checked against the limit as well
                    Ok(_) if started.elapsed() > limit => {
                        Err(RepoError::TransactionTimeout(limit))
                    }
                    Ok(result) => result,
                    Err(_) => Err(RepoError::TransactionTimeout(limit)),
                }
            }
            None => work.run(self).await,
        };
        if result.is_err() {
            self.session.discard_changes();
        }
        result
    }

    // ------------------------------------------------------------------
    // Batched writes: one transaction for the whole list
    // ------------------------------------------------------------------

    pub async fn save_in_transaction<E: EntityModel>(
        &mut self,
        entities: &[E],
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&SaveBatch {
            entities,
            entity_identifier,
        })
        .await
    }

    pub async fn insert_in_transaction<E: EntityModel>(
        &mut self,
        entities: &[E],
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&InsertBatch {
            entities,
            entity_identifier,
        })
        .await
    }

    pub async fn delete_in_transaction<E: EntityModel>(
        &mut self,
        entities: &[E],
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&DeleteBatch {
            entities,
            entity_identifier,
            tombstone_type: None,
        })
        .await
    }

    pub async fn delete_with_tombstone_in_transaction<E: EntityModel, T: EntityModel>(
        &mut self,
        entities: &[E],
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&DeleteBatch {
            entities,
            entity_identifier,
            tombstone_type: Some(T::descriptor()),
        })
        .await
    }

    pub async fn delete_by_surrogate_key_in_transaction<E: EntityModel>(
        &mut self,
        keys: &[Value],
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&DeleteByKeyBatch {
            entity_type: E::descriptor(),
            keys,
            entity_identifier,
            tombstone_type: None,
        })
        .await
    }

    pub async fn delete_by_surrogate_key_with_tombstone_in_transaction<
        E: EntityModel,
        T: EntityModel,
    >(
        &mut self,
        keys: &[Value],
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&DeleteByKeyBatch {
            entity_type: E::descriptor(),
            keys,
            entity_identifier,
            tombstone_type: Some(T::descriptor()),
        })
        .await
    }

    pub async fn delete_all_in_transaction<E: EntityModel>(
        &mut self,
        entity_identifier: &str,
    ) -> OperationResult<ChangeResult> {
        self.execute(&DeleteAllWork {
            entity_type: E::descriptor(),
            entity_identifier,
        })
        .await
    }

    pub async fn delete_older_than_in_transaction<E: EntityModel>(
        &mut self,
        date_field: &str,
        age: chrono::Duration,
        entity_identifier: &str,
    ) -> OperationResult<Vec<ChangeResult>> {
        self.execute(&DeleteOlderThanWork {
            entity_type: E::descriptor(),
            date_field,
            age,
            entity_identifier,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_entity_by_surrogate_key_in_transaction<E: EntityModel>(
        &mut self,
        key: impl Into<Value>,
    ) -> OperationResult<Option<E>> {
        self.execute(&GetByKey::<E> {
            key: key.into(),
            _entity: PhantomData,
        })
        .await
    }

    pub async fn get_entities_by_field_in_transaction<E: EntityModel>(
        &mut self,
        field: &str,
        value: impl Into<Value>,
    ) -> OperationResult<Vec<E>> {
        self.execute(&GetByField::<E> {
            field,
            value: value.into(),
            _entity: PhantomData,
        })
        .await
    }

    pub async fn get_all_entities_in_transaction<E: EntityModel>(
        &mut self,
    ) -> OperationResult<Vec<E>> {
        self.execute(&GetAll::<E>(PhantomData)).await
    }

    pub async fn get_total_count_in_transaction<E: EntityModel>(
        &mut self,
    ) -> OperationResult<i32> {
        self.execute(&CountRows::<E>(PhantomData)).await
    }

    pub async fn get_total_count_long_in_transaction<E: EntityModel>(
        &mut self,
    ) -> OperationResult<i64> {
        self.execute(&CountRowsLong::<E>(PhantomData)).await
    }
}

struct SaveBatch<'a, E> {
    entities: &'a [E],
    entity_identifier: &'a str,
}

#[async_trait]
impl<'a, S: StorageSession, E: EntityModel> UnitOfWork<S> for SaveBatch<'a, E> {
    type Output = Vec<ChangeResult>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        let mut changes = Vec::new();
        for entity in self.entities {
            changes.extend(repo.save(entity, self.entity_identifier).await?);
        }
        Ok(changes)
    }
}

struct InsertBatch<'a, E> {
    entities: &'a [E],
    entity_identifier: &'a str,
}

#[async_trait]
impl<'a, S: StorageSession, E: EntityModel> UnitOfWork<S> for InsertBatch<'a, E> {
    type Output = Vec<ChangeResult>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        let mut changes = Vec::with_capacity(self.entities.len());
        for entity in self.entities {
            changes.push(repo.insert(entity, self.entity_identifier).await?);
        }
        Ok(changes)
    }
}

struct DeleteBatch<'a, E> {
    entities: &'a [E],
    entity_identifier: &'a str,
    tombstone_type: Option<&'static EntityType>,
}

#[async_trait]
impl<'a, S: StorageSession, E: EntityModel> UnitOfWork<S> for DeleteBatch<'a, E> {
    type Output = Vec<ChangeResult>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        let mut changes = Vec::with_capacity(self.entities.len());
        for entity in self.entities {
            changes.push(
                repo.delete_dyn(entity, self.entity_identifier, self.tombstone_type)
                    .await?,
            );
        }
        Ok(changes)
    }
}

struct DeleteByKeyBatch<'a> {
    entity_type: &'static EntityType,
    keys: &'a [Value],
    entity_identifier: &'a str,
    tombstone_type: Option<&'static EntityType>,
}

#[async_trait]
impl<'a, S: StorageSession> UnitOfWork<S> for DeleteByKeyBatch<'a> {
    type Output = Vec<ChangeResult>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        let mut changes = Vec::with_capacity(self.keys.len());
        for key in self.keys {
            changes.push(
                repo.delete_by_surrogate_key_dyn(
                    self.entity_type,
                    key.clone(),
                    self.entity_identifier,
                    self.tombstone_type,
                )
                .await?,
            );
        }
        Ok(changes)
    }
}

struct DeleteAllWork<'a> {
    entity_type: &'static EntityType,
    entity_identifier: &'a str,
}

#[async_trait]
impl<'a, S: StorageSession> UnitOfWork<S> for DeleteAllWork<'a> {
    type Output = ChangeResult;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        repo.delete_all_dyn(self.entity_type, self.entity_identifier)
            .await
    }
}

struct DeleteOlderThanWork<'a> {
    entity_type: &'static EntityType,
    date_field: &'a str,
    age: chrono::Duration,
    entity_identifier: &'a str,
}

#[async_trait]
impl<'a, S: StorageSession> UnitOfWork<S> for DeleteOlderThanWork<'a> {
    type Output = Vec<ChangeResult>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        let changes = repo
            .stage_delete_older_than(
                self.entity_type,
                self.date_field,
                self.age,
                self.entity_identifier,
            )
            .await?;
        repo.session.save_changes().await?;
        Ok(changes)
    }
}

struct GetByKey<E> {
    key: Value,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<S: StorageSession, E: EntityModel> UnitOfWork<S> for GetByKey<E> {
    type Output = Option<E>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        repo.get_entity_by_surrogate_key::<E>(self.key.clone()).await
    }
}

struct GetByField<'a, E> {
    field: &'a str,
    value: Value,
    _entity: PhantomData<fn() -> E>,
}

#[async_trait]
impl<'a, S: StorageSession, E: EntityModel> UnitOfWork<S> for GetByField<'a, E> {
    type Output = Vec<E>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        repo.get_entities_by_field::<E>(self.field, self.value.clone())
            .await
    }
}

struct GetAll<E>(PhantomData<fn() -> E>);

#[async_trait]
impl<S: StorageSession, E: EntityModel> UnitOfWork<S> for GetAll<E> {
    type Output = Vec<E>;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        repo.get_all_entities::<E>().await
    }
}

struct CountRows<E>(PhantomData<fn() -> E>);

#[async_trait]
impl<S: StorageSession, E: EntityModel> UnitOfWork<S> for CountRows<E> {
    type Output = i32;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        repo.get_total_count::<E>().await
    }
}

struct CountRowsLong<E>(PhantomData<fn() -> E>);

#[async_trait]
impl<S: StorageSession, E: EntityModel> UnitOfWork<S> for CountRowsLong<E> {
    type Output = i64;

    async fn run(&self, repo: &mut Repository<S>) -> Result<Self::Output> {
        repo.get_total_count_long::<E>().await
    }
}
