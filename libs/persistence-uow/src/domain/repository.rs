//! Generic repository bound to one entity context and one entity type
//!
//! Mutations only change tracking state; nothing is written until the
//! context is flushed, except for the `*_and_get_id` operations which flush
//! immediately when the key is still temporary. Store failures from those
//! surface at the call site, not at the later commit.

use super::context::{EntityContext, EntityRef, IntoEntityRef};
use super::identity::IdentityStrategy;
use super::query::{Filter, Query, QuerySpec, Row};
use super::relation::{BelongsTo, HasMany, Relation};
use crate::contract::{Entity, PersistenceError, Result};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

fn entity_from_row<E: Entity>(row: Row) -> Result<E> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| PersistenceError::serialization(E::NAME, e))
}

fn key_filter<E: Entity>(id: &E::Key) -> Result<Filter> {
    let key = serde_json::to_value(id).map_err(|e| PersistenceError::serialization(E::NAME, e))?;
    Ok(Filter::Eq(E::KEY_COLUMN.to_string(), key))
}

/// CRUD facade for entity type `E`
pub struct Repository<'a, E: Entity> {
    ctx: &'a mut EntityContext,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> Repository<'a, E> {
    pub fn new(ctx: &'a mut EntityContext) -> Self {
        Self {
            ctx,
            _entity: PhantomData,
        }
    }

    /// The bound context
    pub fn context(&mut self) -> &mut EntityContext {
        &mut *self.ctx
    }

    pub fn get(&self, entity: &EntityRef<E>) -> Option<&E> {
        self.ctx.get(entity)
    }

    pub fn get_mut(&mut self, entity: &EntityRef<E>) -> Option<&mut E> {
        self.ctx.get_mut(entity)
    }

    fn key_of(&self, entity: &EntityRef<E>) -> Result<E::Key> {
        self.ctx
            .get(entity)
            .map(|e| e.id().clone())
            .ok_or(PersistenceError::ForeignReference)
    }

    // ===== Queries =====

    /// Lazy query over all entities of this type
    pub fn get_all(&self) -> Query<E> {
        Query::new()
    }

    /// Lazy query that also eager-loads `relations`
    pub fn get_all_including(
        &self,
        relations: impl IntoIterator<Item = Arc<dyn Relation<E>>>,
    ) -> Query<E> {
        relations
            .into_iter()
            .fold(Query::new(), |query, relation| query.include_shared(relation))
    }

    /// Execute a query. Results are not tracked.
    pub async fn fetch(&mut self, query: &Query<E>) -> Result<Vec<E>> {
        let rows = self.ctx.fetch_rows(E::NAME, query.spec()).await?;
        let mut entities = rows
            .into_iter()
            .map(entity_from_row::<E>)
            .collect::<Result<Vec<_>>>()?;
        for relation in query.includes() {
            self.load_into(&mut entities, relation.as_ref()).await?;
        }
        Ok(entities)
    }

    /// Number of rows a query's filter matches
    pub async fn fetch_count(&mut self, query: &Query<E>) -> Result<u64> {
        self.ctx
            .count_rows(E::NAME, query.spec().filter.as_ref())
            .await
    }

    pub async fn get_all_list(&mut self) -> Result<Vec<E>> {
        let query = self.get_all();
        self.fetch(&query).await
    }

    pub async fn get_all_list_where(&mut self, filter: Filter) -> Result<Vec<E>> {
        let query = self.get_all().filter(filter);
        self.fetch(&query).await
    }

    /// The only entity matching `filter`; zero or several matches are an error
    pub async fn single(&mut self, filter: Filter) -> Result<E> {
        let mut matches = self.get_all_list_where(filter).await?;
        if matches.len() != 1 {
            return Err(PersistenceError::NotSingle {
                entity: E::NAME,
                found: matches.len(),
            });
        }
        matches.pop().ok_or(PersistenceError::NotSingle {
            entity: E::NAME,
            found: 0,
        })
    }

    pub async fn first_or_default(&mut self, id: &E::Key) -> Result<Option<E>> {
        self.first_or_default_where(key_filter::<E>(id)?).await
    }

    pub async fn first_or_default_where(&mut self, filter: Filter) -> Result<Option<E>> {
        let query = self.get_all().filter(filter).limit(1);
        Ok(self.fetch(&query).await?.into_iter().next())
    }

    pub async fn count(&mut self) -> Result<usize> {
        let count = self.long_count().await?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    pub async fn count_where(&mut self, filter: Filter) -> Result<usize> {
        let count = self.long_count_where(filter).await?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    pub async fn long_count(&mut self) -> Result<u64> {
        let query = self.get_all();
        self.fetch_count(&query).await
    }

    pub async fn long_count_where(&mut self, filter: Filter) -> Result<u64> {
        let query = self.get_all().filter(filter);
        self.fetch_count(&query).await
    }

    // ===== Mutations =====

    /// Track as a pending insert
    pub fn insert(&mut self, entity: impl IntoEntityRef<E>) -> Result<EntityRef<E>> {
        self.ctx.add(entity)
    }

    /// Insert and return the key, flushing first if the key is still temporary
    pub async fn insert_and_get_id(&mut self, entity: impl IntoEntityRef<E>) -> Result<E::Key> {
        let entity = self.insert(entity)?;
        self.read_key(&entity).await
    }

    /// Insert when the key is temporary, update otherwise
    pub fn insert_or_update(&mut self, entity: impl IntoEntityRef<E>) -> Result<EntityRef<E>> {
        let entity = entity.into_entity_ref(self.ctx)?;
        if IdentityStrategy::is_temporary_key(&self.key_of(&entity)?) {
            self.insert(entity)
        } else {
            self.update(entity)
        }
    }

    /// [`insert_or_update`](Self::insert_or_update), then read the key like
    /// [`insert_and_get_id`](Self::insert_and_get_id)
    pub async fn insert_or_update_and_get_id(
        &mut self,
        entity: impl IntoEntityRef<E>,
    ) -> Result<E::Key> {
        let entity = self.insert_or_update(entity)?;
        self.read_key(&entity).await
    }

    async fn read_key(&mut self, entity: &EntityRef<E>) -> Result<E::Key> {
        if IdentityStrategy::requires_flush(&self.key_of(entity)?) {
            tracing::debug!(entity = E::NAME, "Flushing to obtain generated key");
            self.ctx.flush().await?;
        }
        self.key_of(entity)
    }

    /// Attach this reference if needed and mark it modified.
    ///
    /// Matching is by reference: a second owned value with the same key is a
    /// separate entry.
    pub fn update(&mut self, entity: impl IntoEntityRef<E>) -> Result<EntityRef<E>> {
        self.ctx.mark_modified(entity)
    }

    /// Attach this reference if needed and mark it deleted
    pub fn delete(&mut self, entity: impl IntoEntityRef<E>) -> Result<()> {
        let entity = self.ctx.attach(entity)?;
        self.ctx.remove(&entity)
    }

    /// Delete by key: a tracked entity first, then one loaded from the store.
    /// A key that matches nothing is a no-op.
    pub async fn delete_by_id(&mut self, id: &E::Key) -> Result<()> {
        if let Some(tracked) = self.ctx.find_tracked::<E>(id) {
            return self.delete(tracked);
        }
        if let Some(stored) = self.first_or_default(id).await? {
            return self.delete(stored);
        }
        tracing::debug!(entity = E::NAME, key = ?id, "Nothing to delete");
        Ok(())
    }

    // ===== Related data =====

    /// Load a one-to-many relationship of a tracked entity, once
    pub async fn ensure_collection_loaded<R: Entity>(
        &mut self,
        entity: &EntityRef<E>,
        relation: &HasMany<E, R>,
    ) -> Result<()> {
        self.ensure_loaded(entity, relation).await
    }

    /// Load a many-to-one relationship of a tracked entity, once
    pub async fn ensure_reference_loaded<R: Entity>(
        &mut self,
        entity: &EntityRef<E>,
        relation: &BelongsTo<E, R>,
    ) -> Result<()> {
        self.ensure_loaded(entity, relation).await
    }

    async fn ensure_loaded(
        &mut self,
        entity: &EntityRef<E>,
        relation: &dyn Relation<E>,
    ) -> Result<()> {
        if self.ctx.is_loaded(entity, relation.name()) {
            return Ok(());
        }
        let filter = {
            let parent = self.ctx.get(entity).ok_or(PersistenceError::ForeignReference)?;
            relation.related_filter(&[parent])?
        };
        let rows = match filter {
            Some(filter) => {
                self.ctx
                    .fetch_rows(relation.related_entity(), &QuerySpec::filtered(filter))
                    .await?
            }
            None => Vec::new(),
        };
        let parent = self
            .ctx
            .get_mut_unobserved(entity)
            .ok_or(PersistenceError::ForeignReference)?;
        relation.assign(&mut [parent], &rows)?;
        self.ctx.mark_loaded(entity, relation.name());
        Ok(())
    }

    async fn load_into(&mut self, entities: &mut [E], relation: &dyn Relation<E>) -> Result<()> {
        let filter = {
            let parents: Vec<&E> = entities.iter().collect();
            relation.related_filter(&parents)?
        };
        let rows = match filter {
            Some(filter) => {
                self.ctx
                    .fetch_rows(relation.related_entity(), &QuerySpec::filtered(filter))
                    .await?
            }
            None => Vec::new(),
        };
        let mut parents: Vec<&mut E> = entities.iter_mut().collect();
        relation.assign(&mut parents, &rows)
    }
}
