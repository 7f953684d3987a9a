use super::Repository;
use crate::core::{RepoError, Result, Value};
use crate::entity::{Entity, EntityModel, EntityType, surrogate_key};
use crate::storage::{Filter, StorageSession};

const ANY_ROW: &str = "any row";

fn downcast_all<E: EntityModel>(rows: Vec<Box<dyn Entity>>) -> Result<Vec<E>> {
    rows.into_iter().map(|row| row.downcast::<E>()).collect()
}

impl<S: StorageSession> Repository<S> {
    pub async fn get_entity_by_surrogate_key<E: EntityModel>(
        &mut self,
        key: impl Into<Value>,
    ) -> Result<Option<E>> {
        self.get_entity_by_surrogate_key_dyn(E::descriptor(), key.into())
            .await?
            .map(|row| row.downcast::<E>())
            .transpose()
    }

    pub async fn require_entity_by_surrogate_key<E: EntityModel>(
        &mut self,
        key: impl Into<Value>,
    ) -> Result<E> {
        self.require_entity_by_surrogate_key_dyn(E::descriptor(), key.into())
            .await?
            .downcast::<E>()
    }

    /// The key is coerced to the key property's type before the lookup.
    pub async fn get_entity_by_surrogate_key_dyn(
        &mut self,
        entity_type: &'static EntityType,
        key: Value,
    ) -> Result<Option<Box<dyn Entity>>> {
        let key_property = surrogate_key(entity_type)?;
        let key = key_property.data_type.coerce(key)?;
        self.find_by_key(entity_type, key_property, &key).await
    }

    pub async fn require_entity_by_surrogate_key_dyn(
        &mut self,
        entity_type: &'static EntityType,
        key: Value,
    ) -> Result<Box<dyn Entity>> {
        let key_property = surrogate_key(entity_type)?;
        let key = key_property.data_type.coerce(key)?;
        self.find_by_key(entity_type, key_property, &key)
            .await?
            .ok_or_else(|| {
                RepoError::not_found(entity_type.name, format!("{} = {}", key_property.name, key))
            })
    }

    pub async fn get_entities_by_field<E: EntityModel>(
        &mut self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<E>> {
        let rows = self
            .get_entities_by_field_dyn(E::descriptor(), field, value.into())
            .await?;
        downcast_all(rows)
    }

    /// Like `get_entities_by_field`, but an empty result is `NotFound`.
    pub async fn require_entities_by_field<E: EntityModel>(
        &mut self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Vec<E>> {
        let rows = self
            .require_entities_by_field_dyn(E::descriptor(), field, value.into())
            .await?;
        downcast_all(rows)
    }

    pub async fn get_entities_by_field_dyn(
        &mut self,
        entity_type: &'static EntityType,
        field: &str,
        value: Value,
    ) -> Result<Vec<Box<dyn Entity>>> {
        let property = entity_type.require_property(field)?;
        let value = property.data_type.coerce(value)?;
        self.session
            .find(entity_type, &Filter::eq(property.name, value), None)
            .await
    }

    pub async fn require_entities_by_field_dyn(
        &mut self,
        entity_type: &'static EntityType,
        field: &str,
        value: Value,
    ) -> Result<Vec<Box<dyn Entity>>> {
        let property = entity_type.require_property(field)?;
        let value = property.data_type.coerce(value)?;
        let expression = format!("{} = {}", property.name, value);
        let rows = self
            .session
            .find(entity_type, &Filter::eq(property.name, value), None)
            .await?;
        if rows.is_empty() {
            return Err(RepoError::not_found(entity_type.name, expression));
        }
        Ok(rows)
    }

    /// First row in storage order.
    pub async fn get_first_entity<E: EntityModel>(&mut self) -> Result<Option<E>> {
        self.get_first_entity_dyn(E::descriptor())
            .await?
            .map(|row| row.downcast::<E>())
            .transpose()
    }

    pub async fn require_first_entity<E: EntityModel>(&mut self) -> Result<E> {
        self.get_first_entity_dyn(E::descriptor())
            .await?
            .ok_or_else(|| RepoError::not_found(E::descriptor().name, ANY_ROW))?
            .downcast::<E>()
    }

    pub async fn get_first_entity_dyn(
        &mut self,
        entity_type: &'static EntityType,
    ) -> Result<Option<Box<dyn Entity>>> {
        let mut rows = self.session.find(entity_type, &Filter::All, Some(1)).await?;
        Ok(rows.pop())
    }

    pub async fn get_all_entities<E: EntityModel>(&mut self) -> Result<Vec<E>> {
        let rows = self.get_all_entities_dyn(E::descriptor()).await?;
        downcast_all(rows)
    }

    pub async fn require_all_entities<E: EntityModel>(&mut self) -> Result<Vec<E>> {
        let rows = self.get_all_entities_dyn(E::descriptor()).await?;
        if rows.is_empty() {
            return Err(RepoError::not_found(E::descriptor().name, ANY_ROW));
        }
        downcast_all(rows)
    }

    pub async fn get_all_entities_dyn(
        &mut self,
        entity_type: &'static EntityType,
    ) -> Result<Vec<Box<dyn Entity>>> {
        self.session.find(entity_type, &Filter::All, None).await
    }

    /// Row count as `i32`; fails if the count does not fit.
    pub async fn get_total_count<E: EntityModel>(&mut self) -> Result<i32> {
        let count = self.get_total_count_dyn(E::descriptor()).await?;
        i32::try_from(count).map_err(|_| {
            RepoError::TypeMismatch(format!(
                "{} rows of {} do not fit in i32, use get_total_count_long",
                count,
                E::descriptor().name
            ))
        })
    }

    pub async fn get_total_count_long<E: EntityModel>(&mut self) -> Result<i64> {
        let count = self.get_total_count_dyn(E::descriptor()).await?;
        i64::try_from(count)
            .map_err(|_| RepoError::TypeMismatch(format!("{count} rows do not fit in i64")))
    }

    /// Like `get_total_count`, but zero rows is `NotFound`.
    pub async fn require_total_count<E: EntityModel>(&mut self) -> Result<i32> {
        match self.get_total_count::<E>().await? {
            0 => Err(RepoError::not_found(E::descriptor().name, ANY_ROW)),
            count => Ok(count),
        }
    }

    pub async fn require_total_count_long<E: EntityModel>(&mut self) -> Result<i64> {
        match self.get_total_count_long::<E>().await? {
            0 => Err(RepoError::not_found(E::descriptor().name, ANY_ROW)),
            count => Ok(count),
        }
    }

    pub async fn get_total_count_dyn(&mut self, entity_type: &'static EntityType) -> Result<u64> {
        self.session.count(entity_type, &Filter::All).await
    }
}
