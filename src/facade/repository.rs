// ============================================================================
// Repository Facade: writes
// ============================================================================
//
// Every generic method is a thin wrapper over a `*_dyn` method taking an
// `&'static EntityType` or a `&dyn Entity`, so both forms run the same code.
// Each write stages its changes on the session and flushes them with one
// `save_changes` call before returning the change records.
//
// ============================================================================

use tracing::{Instrument, debug_span, info_span};

use crate::connection::RepositoryConfig;
use crate::core::{RepoError, Result, Value};
use crate::entity::{
    Entity, EntityModel, EntityType, PropertyDescriptor, copy_to_tombstone, diff, surrogate_key,
};
use crate::result::ChangeResult;
use crate::storage::{Filter, StorageSession};
use crate::transaction::{CancellationSignal, ClassifierRegistry, RetryPolicy, default_classifiers};

/// CRUD, change auditing and transactional retry over one storage session.
pub struct Repository<S: StorageSession> {
    pub(crate) session: S,
    pub(crate) config: RepositoryConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) classifiers: ClassifierRegistry,
    pub(crate) cancellation: Option<CancellationSignal>,
}

impl<S: StorageSession> Repository<S> {
    /// Fails with `InvalidConfig` when the retry settings are negative.
    pub fn new(session: S, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        let retry = config.retry_policy()?;
        Ok(Self {
            session,
            config,
            retry,
            classifiers: default_classifiers(),
            cancellation: None,
        })
    }

    /// Replaces the transient-error classifiers used by the retry wrapper.
    pub fn with_classifiers(mut self, classifiers: ClassifierRegistry) -> Self {
        self.classifiers = classifiers;
        self
    }

    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn classifiers(&self) -> &ClassifierRegistry {
        &self.classifiers
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    pub(crate) async fn find_by_key(
        &mut self,
        entity_type: &'static EntityType,
        key_property: &PropertyDescriptor,
        key: &Value,
    ) -> Result<Option<Box<dyn Entity>>> {
        let filter = Filter::eq(key_property.name, key.clone());
        let mut rows = self.session.find(entity_type, &filter, Some(1)).await?;
        Ok(rows.pop())
    }

    // ------------------------------------------------------------------
    // Save / Insert
    // ------------------------------------------------------------------

    /// Inserts `entity` when no row has its key, otherwise updates the
    /// stored row with every changed field.
    ///
    /// Returns one INSERT record, or one UPDATE record per changed field.
    pub async fn save<E: EntityModel>(
        &mut self,
        entity: &E,
        entity_identifier: &str,
    ) -> Result<Vec<ChangeResult>> {
        self.save_dyn(entity, entity_identifier).await
    }

    pub async fn save_dyn(
        &mut self,
        entity: &dyn Entity,
        entity_identifier: &str,
    ) -> Result<Vec<ChangeResult>> {
        let entity_type = entity.entity_type();
        let span = info_span!("repository.save", entity = entity_type.name);
        async move {
            let key_property = surrogate_key(entity_type)?;
            let key = entity.require_value(key_property.name)?;

            let existing = if key.is_null() {
                None
            } else {
                self.find_by_key(entity_type, key_property, &key).await?
            };

            let Some(mut tracked) = existing else {
                return self.insert_dyn(entity, entity_identifier).await.map(|change| vec![change]);
            };

            let changes = diff(entity_type, &mut *tracked, entity, &key, entity_identifier)?;
            if !changes.is_empty() {
                self.session.update(tracked)?;
            }
            self.session.save_changes().await?;
            tracing::debug!(changes = changes.len(), "entity saved");
            Ok(changes)
        }
        .instrument(span)
        .await
    }

    /// Adds `entity` without checking for an existing row.
    pub async fn insert<E: EntityModel>(
        &mut self,
        entity: &E,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        self.insert_dyn(entity, entity_identifier).await
    }

    pub async fn insert_dyn(
        &mut self,
        entity: &dyn Entity,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        let entity_type = entity.entity_type();
        let key_property = surrogate_key(entity_type)?;
        let supplied_key = entity.require_value(key_property.name)?;

        self.session.add(entity.clone_entity())?;
        let report = self.session.save_changes().await?;

        // the report holds the generated value for identity keys
        let key = report.inserted_keys.last().cloned().unwrap_or(supplied_key);
        tracing::debug!(entity = entity_type.name, key = %key, "entity inserted");
        Ok(ChangeResult::insert(
            entity_type.name,
            key_property.name,
            key,
            entity_identifier,
        ))
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub async fn delete<E: EntityModel>(
        &mut self,
        entity: &E,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        self.delete_dyn(entity, entity_identifier, None).await
    }

    /// Deletes `entity` after archiving it as a `T` tombstone.
    pub async fn delete_with_tombstone<E: EntityModel, T: EntityModel>(
        &mut self,
        entity: &E,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        self.delete_dyn(entity, entity_identifier, Some(T::descriptor()))
            .await
    }

    pub async fn delete_dyn(
        &mut self,
        entity: &dyn Entity,
        entity_identifier: &str,
        tombstone_type: Option<&'static EntityType>,
    ) -> Result<ChangeResult> {
        let entity_type = entity.entity_type();
        let key_property = surrogate_key(entity_type)?;
        let key = entity.require_value(key_property.name)?;
        self.delete_by_surrogate_key_dyn(entity_type, key, entity_identifier, tombstone_type)
            .await
    }

    pub async fn delete_by_surrogate_key<E: EntityModel>(
        &mut self,
        key: impl Into<Value>,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        self.delete_by_surrogate_key_dyn(E::descriptor(), key.into(), entity_identifier, None)
            .await
    }

    pub async fn delete_by_surrogate_key_with_tombstone<E: EntityModel, T: EntityModel>(
        &mut self,
        key: impl Into<Value>,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        self.delete_by_surrogate_key_dyn(
            E::descriptor(),
            key.into(),
            entity_identifier,
            Some(T::descriptor()),
        )
        .await
    }

    /// Looks the row up by key, optionally archives it, then removes it.
    ///
    /// Fails with `NotFound` naming the key property and value when no row
    /// has that key.
    pub async fn delete_by_surrogate_key_dyn(
        &mut self,
        entity_type: &'static EntityType,
        key: Value,
        entity_identifier: &str,
        tombstone_type: Option<&'static EntityType>,
    ) -> Result<ChangeResult> {
        let span = info_span!("repository.delete", entity = entity_type.name);
        async move {
            let key_property = surrogate_key(entity_type)?;
            let key = key_property.data_type.coerce(key)?;

            let existing = self
                .find_by_key(entity_type, key_property, &key)
                .await?
                .ok_or_else(|| {
                    RepoError::not_found(entity_type.name, format!("{} = {}", key_property.name, key))
                })?;

            if let Some(tombstone_type) = tombstone_type {
                self.stage_tombstone(entity_type, tombstone_type, &*existing)
                    .await?;
            }

            self.session.remove(entity_type, key.clone())?;
            self.session.save_changes().await?;
            tracing::debug!(key = %key, "entity deleted");

            Ok(ChangeResult::delete(
                entity_type.name,
                key_property.name,
                key,
                entity_identifier,
            ))
        }
        .instrument(span)
        .await
    }

    /// Stages a fresh tombstone for `original`, replacing any tombstone that
    /// already has the same key.
    async fn stage_tombstone(
        &mut self,
        entity_type: &'static EntityType,
        tombstone_type: &'static EntityType,
        original: &dyn Entity,
    ) -> Result<()> {
        let mut tombstone = tombstone_type.new_instance();
        copy_to_tombstone(entity_type, tombstone_type, original, &mut *tombstone)?;

        let tombstone_key = surrogate_key(tombstone_type)?;
        let key = tombstone.require_value(tombstone_key.name)?;
        if self
            .find_by_key(tombstone_type, tombstone_key, &key)
            .await?
            .is_some()
        {
            self.session.remove(tombstone_type, key)?;
        }

        self.session.add(tombstone)
    }

    /// Deletes every row whose `date_field` is strictly before now − `age`.
    ///
    /// Returns one DELETE record per removed row.
    pub async fn delete_older_than<E: EntityModel>(
        &mut self,
        date_field: &str,
        age: chrono::Duration,
        entity_identifier: &str,
    ) -> Result<Vec<ChangeResult>> {
        self.delete_older_than_dyn(E::descriptor(), date_field, age, entity_identifier)
            .await
    }

    pub async fn delete_older_than_dyn(
        &mut self,
        entity_type: &'static EntityType,
        date_field: &str,
        age: chrono::Duration,
        entity_identifier: &str,
    ) -> Result<Vec<ChangeResult>> {
        let changes = self
            .stage_delete_older_than(entity_type, date_field, age, entity_identifier)
            .await?;
        self.session.save_changes().await?;
        Ok(changes)
    }

    /// Stages the removals for `delete_older_than` without saving.
    pub(crate) async fn stage_delete_older_than(
        &mut self,
        entity_type: &'static EntityType,
        date_field: &str,
        age: chrono::Duration,
        entity_identifier: &str,
    ) -> Result<Vec<ChangeResult>> {
        let property = entity_type.property(date_field).ok_or_else(|| {
            RepoError::InvalidArgument(format!(
                "{} has no property '{}'",
                entity_type.name, date_field
            ))
        })?;
        if property.data_type != crate::core::DataType::Timestamp {
            return Err(RepoError::InvalidArgument(format!(
                "{}.{} is {}, not a timestamp",
                entity_type.name, date_field, property.data_type
            )));
        }

        let threshold = chrono::Utc::now() - age;
        let key_property = surrogate_key(entity_type)?;
        let expired = self
            .session
            .find(entity_type, &Filter::lt(property.name, threshold), None)
            .instrument(debug_span!("repository.find_expired", entity = entity_type.name))
            .await?;

        let mut changes = Vec::with_capacity(expired.len());
        for row in expired {
            let key = row.require_value(key_property.name)?;
            self.session.remove(entity_type, key.clone())?;
            changes.push(ChangeResult::delete(
                entity_type.name,
                key_property.name,
                key,
                entity_identifier,
            ));
        }
        Ok(changes)
    }

    /// Removes every row of `E`. Always yields exactly one DELETE ALL record.
    pub async fn delete_all<E: EntityModel>(&mut self, entity_identifier: &str) -> Result<ChangeResult> {
        self.delete_all_dyn(E::descriptor(), entity_identifier).await
    }

    pub async fn delete_all_dyn(
        &mut self,
        entity_type: &'static EntityType,
        entity_identifier: &str,
    ) -> Result<ChangeResult> {
        self.session.remove_all(entity_type)?;
        let report = self.session.save_changes().await?;
        tracing::debug!(entity = entity_type.name, removed = report.affected, "all rows deleted");
        Ok(ChangeResult::delete_all(entity_type.name, entity_identifier))
    }

    /// Whether `table_name` exists in the backing store.
    pub async fn sql_table_exists(&mut self, table_name: &str) -> Result<bool> {
        self.session.table_exists(table_name).await
    }
}
