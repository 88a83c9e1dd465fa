//! Entity context: one persistence session plus its tracked entities
//!
//! Entities are tracked by reference. A reference is an [`EntityRef`] issued
//! the first time the context receives an owned value; handing the context
//! another owned value with the same key creates a second, independent
//! reference. Entries of any entity type share one collection.
//!
//! After a successful flush every entry is demoted to `Detached`. The values
//! stay readable through their references until the context is dropped or
//! [`EntityContext::clear`] is called.

use super::identity::IdentityStrategy;
use super::model::{Model, TableTarget};
use super::query::{Filter, QuerySpec, Row};
use super::remap::SchemaRemapper;
use super::store::{Session, WriteKind, WriteOp};
use crate::contract::{Entity, EntityState, PersistenceError, Result};
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque reference to an entity held by an [`EntityContext`]
pub struct EntityRef<E> {
    context: u64,
    slot: usize,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EntityRef<E> {}

impl<E> PartialEq for EntityRef<E> {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.slot == other.slot
    }
}

impl<E> Eq for EntityRef<E> {}

impl<E> Hash for EntityRef<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.hash(state);
        self.slot.hash(state);
    }
}

impl<E> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({}#{})", self.context, self.slot)
    }
}

/// Anything that can name an entity reference in a context.
///
/// An owned entity becomes a new, detached reference; an existing
/// [`EntityRef`] is validated and reused.
pub trait IntoEntityRef<E: Entity> {
    fn into_entity_ref(self, ctx: &mut EntityContext) -> Result<EntityRef<E>>;
}

impl<E: Entity> IntoEntityRef<E> for E {
    fn into_entity_ref(self, ctx: &mut EntityContext) -> Result<EntityRef<E>> {
        Ok(ctx.track(self))
    }
}

impl<E: Entity> IntoEntityRef<E> for EntityRef<E> {
    fn into_entity_ref(self, ctx: &mut EntityContext) -> Result<EntityRef<E>> {
        ctx.slot_of(&self)?;
        Ok(self)
    }
}

/// Type-erased view of a tracked entity used by flush
trait TrackedObject: Send + Sync {
    fn entity_name(&self) -> &'static str;
    fn key_column(&self) -> &'static str;
    fn key_json(&self) -> Result<Value>;
    fn key_is_temporary(&self) -> bool;
    fn to_row(&self) -> Result<Row>;
    fn assign_key(&mut self, key: Value) -> serde_json::Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<E: Entity> TrackedObject for E {
    fn entity_name(&self) -> &'static str {
        E::NAME
    }

    fn key_column(&self) -> &'static str {
        E::KEY_COLUMN
    }

    fn key_json(&self) -> Result<Value> {
        serde_json::to_value(self.id()).map_err(|e| PersistenceError::serialization(E::NAME, e))
    }

    fn key_is_temporary(&self) -> bool {
        IdentityStrategy::requires_flush(self.id())
    }

    fn to_row(&self) -> Result<Row> {
        match serde_json::to_value(self) {
            Ok(Value::Object(row)) => Ok(row),
            Ok(other) => Err(PersistenceError::serialization(
                E::NAME,
                <serde_json::Error as serde::ser::Error>::custom(format!(
                    "entity must serialize to an object, got {other}"
                )),
            )),
            Err(e) => Err(PersistenceError::serialization(E::NAME, e)),
        }
    }

    fn assign_key(&mut self, key: Value) -> serde_json::Result<()> {
        self.set_id(serde_json::from_value(key)?);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Slot {
    object: Box<dyn TrackedObject>,
    state: EntityState,
}

/// Options applied to new contexts
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    /// Promote `Unchanged` entries to `Modified` on mutable access
    pub auto_detect_changes: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
        }
    }
}

/// Wraps one persistence session and the entities it tracks.
///
/// Every owned value handed to the context keeps its entry, detached or not,
/// so that its reference stays readable. A long-lived context reused for
/// unrelated work should call [`clear`](Self::clear) between batches.
pub struct EntityContext {
    id: u64,
    name: String,
    model: Arc<Model>,
    session: Box<dyn Session>,
    slots: Vec<Slot>,
    loaded: HashSet<(usize, &'static str)>,
    auto_detect_changes: bool,
}

impl EntityContext {
    pub fn new(
        name: impl Into<String>,
        model: Arc<Model>,
        session: Box<dyn Session>,
        options: ContextOptions,
    ) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            model,
            session,
            slots: Vec::new(),
            loaded: HashSet::new(),
            auto_detect_changes: options.auto_detect_changes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn remapper(&self) -> SchemaRemapper<'_> {
        SchemaRemapper::new(&self.model)
    }

    pub fn auto_detect_changes(&self) -> bool {
        self.auto_detect_changes
    }

    pub fn set_auto_detect_changes(&mut self, enabled: bool) {
        self.auto_detect_changes = enabled;
    }

    // ===== Tracking =====

    fn track<E: Entity>(&mut self, entity: E) -> EntityRef<E> {
        self.slots.push(Slot {
            object: Box::new(entity),
            state: EntityState::Detached,
        });
        EntityRef {
            context: self.id,
            slot: self.slots.len() - 1,
            _entity: PhantomData,
        }
    }

    fn slot_of<E: Entity>(&self, entity: &EntityRef<E>) -> Result<usize> {
        if entity.context != self.id {
            return Err(PersistenceError::ForeignReference);
        }
        match self.slots.get(entity.slot) {
            Some(slot) if slot.object.as_any().is::<E>() => Ok(entity.slot),
            _ => Err(PersistenceError::ForeignReference),
        }
    }

    /// Lifecycle state of a reference
    pub fn state_of<E: Entity>(&self, entity: &EntityRef<E>) -> Option<EntityState> {
        let slot = self.slot_of(entity).ok()?;
        Some(self.slots[slot].state)
    }

    /// Whether this exact reference is currently tracked
    pub fn is_tracked<E: Entity>(&self, entity: &EntityRef<E>) -> bool {
        self.state_of(entity)
            .is_some_and(|state| state != EntityState::Detached)
    }

    pub fn get<E: Entity>(&self, entity: &EntityRef<E>) -> Option<&E> {
        let slot = self.slot_of(entity).ok()?;
        self.slots[slot].object.as_any().downcast_ref::<E>()
    }

    /// Mutable access. With change detection on, an `Unchanged` entry becomes `Modified`.
    pub fn get_mut<E: Entity>(&mut self, entity: &EntityRef<E>) -> Option<&mut E> {
        let slot = self.slot_of(entity).ok()?;
        let detect = self.auto_detect_changes;
        let slot = &mut self.slots[slot];
        if detect && slot.state == EntityState::Unchanged {
            slot.state = EntityState::Modified;
        }
        slot.object.as_any_mut().downcast_mut::<E>()
    }

    /// Mutable access that never changes the entry state
    pub(crate) fn get_mut_unobserved<E: Entity>(
        &mut self,
        entity: &EntityRef<E>,
    ) -> Option<&mut E> {
        let slot = self.slot_of(entity).ok()?;
        self.slots[slot].object.as_any_mut().downcast_mut::<E>()
    }

    /// Begin tracking as `Unchanged`; no-op for a reference already tracked
    pub fn attach<E: Entity>(&mut self, entity: impl IntoEntityRef<E>) -> Result<EntityRef<E>> {
        let entity = entity.into_entity_ref(self)?;
        let slot = self.slot_of(&entity)?;
        if self.slots[slot].state == EntityState::Detached {
            self.slots[slot].state = EntityState::Unchanged;
            tracing::debug!(context = %self.name, entity = E::NAME, "Attached entity");
        }
        Ok(entity)
    }

    /// Attach if needed, then mark `Modified` whether or not anything changed
    pub fn mark_modified<E: Entity>(
        &mut self,
        entity: impl IntoEntityRef<E>,
    ) -> Result<EntityRef<E>> {
        let entity = self.attach(entity)?;
        let slot = self.slot_of(&entity)?;
        self.slots[slot].state = EntityState::Modified;
        Ok(entity)
    }

    /// Track as `Added`
    pub fn add<E: Entity>(&mut self, entity: impl IntoEntityRef<E>) -> Result<EntityRef<E>> {
        let entity = entity.into_entity_ref(self)?;
        let slot = self.slot_of(&entity)?;
        self.slots[slot].state = EntityState::Added;
        tracing::debug!(context = %self.name, entity = E::NAME, "Added entity");
        Ok(entity)
    }

    /// Mark an attached entity `Deleted`. An `Added` entry is simply dropped
    /// from tracking since the store has never seen it.
    pub fn remove<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        let slot = self.slot_of(entity)?;
        let slot = &mut self.slots[slot];
        slot.state = match slot.state {
            EntityState::Detached => {
                return Err(PersistenceError::InvalidOperation(format!(
                    "cannot remove a detached `{}`; attach it first",
                    E::NAME
                )))
            }
            EntityState::Added => EntityState::Detached,
            _ => EntityState::Deleted,
        };
        Ok(())
    }

    /// Tracked entity of type `E` with key `id`, by scanning tracked entries
    pub fn find_tracked<E: Entity>(&self, id: &E::Key) -> Option<EntityRef<E>> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            if slot.state == EntityState::Detached {
                return None;
            }
            let entity = slot.object.as_any().downcast_ref::<E>()?;
            (entity.id() == id).then_some(EntityRef {
                context: self.id,
                slot: index,
                _entity: PhantomData,
            })
        })
    }

    /// Number of tracked (non-detached) entries of all types
    pub fn tracked_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != EntityState::Detached)
            .count()
    }

    /// Whether a flush would write anything
    pub fn has_pending_changes(&self) -> bool {
        self.slots.iter().any(|slot| slot.state.is_pending())
    }

    /// Demote every entry to `Detached`
    pub fn detach_all(&mut self) {
        for slot in &mut self.slots {
            slot.state = EntityState::Detached;
        }
        self.loaded.clear();
    }

    /// Drop every entry, pending or not, and start over under a new identity.
    ///
    /// References issued before the call are rejected as foreign afterwards.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.loaded.clear();
        self.id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = %self.name, "Cleared tracked entries");
    }

    pub(crate) fn is_loaded<E: Entity>(
        &self,
        entity: &EntityRef<E>,
        relation: &'static str,
    ) -> bool {
        self.loaded.contains(&(entity.slot, relation))
    }

    pub(crate) fn mark_loaded<E: Entity>(&mut self, entity: &EntityRef<E>, relation: &'static str) {
        if self.is_tracked(entity) {
            self.loaded.insert((entity.slot, relation));
        }
    }

    // ===== Store I/O =====

    fn target(&self, entity: &'static str) -> Result<TableTarget> {
        self.model
            .target_of(entity)
            .ok_or(PersistenceError::UnmappedEntity(entity))
    }

    /// Open the connection if needed and verify it
    pub async fn ensure_connected(&mut self) -> Result<()> {
        self.session.ping().await?;
        Ok(())
    }

    /// Read rows of an entity type
    pub async fn fetch_rows(&mut self, entity: &'static str, spec: &QuerySpec) -> Result<Vec<Row>> {
        self.model.try_finalize();
        let target = self.target(entity)?;
        let rows = self.session.fetch(&target, spec).await?;
        tracing::debug!(context = %self.name, %target, rows = rows.len(), "Fetched rows");
        Ok(rows)
    }

    /// Count rows of an entity type
    pub async fn count_rows(
        &mut self,
        entity: &'static str,
        filter: Option<&Filter>,
    ) -> Result<u64> {
        self.model.try_finalize();
        let target = self.target(entity)?;
        Ok(self.session.count(&target, filter).await?)
    }

    /// Persist all pending changes, then detach every entry.
    ///
    /// Change detection is suspended while writing. When the store rejects the
    /// batch the entries keep their states. Once the batch is committed the
    /// entries are detached even if a generated key cannot be read back.
    /// Returns the number of affected rows.
    pub async fn flush(&mut self) -> Result<u64> {
        let detect = std::mem::replace(&mut self.auto_detect_changes, false);
        let result = self.write_pending().await;
        self.auto_detect_changes = detect;

        let affected = result?;
        self.detach_all();
        Ok(affected)
    }

    /// [`flush`](Self::flush) that gives up when `cancel` fires.
    ///
    /// A flush interrupted mid-way is dropped before its transaction commits.
    pub async fn flush_with_cancel(&mut self, cancel: &CancellationToken) -> Result<u64> {
        let detect = self.auto_detect_changes;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PersistenceError::Cancelled),
            result = self.flush() => result,
        };
        self.auto_detect_changes = detect;
        result
    }

    async fn write_pending(&mut self) -> Result<u64> {
        self.model.try_finalize();

        let mut batch = Vec::new();
        let mut owners = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let kind = match slot.state {
                EntityState::Added => WriteKind::Insert,
                EntityState::Modified => WriteKind::Update,
                EntityState::Deleted => WriteKind::Delete,
                EntityState::Detached | EntityState::Unchanged => continue,
            };
            let object = &slot.object;
            let generate_key = kind == WriteKind::Insert && object.key_is_temporary();
            let row = match kind {
                WriteKind::Delete => Row::new(),
                _ => {
                    let mut row = object.to_row()?;
                    if generate_key {
                        row.remove(object.key_column());
                    }
                    row
                }
            };
            batch.push(WriteOp {
                kind,
                target: self.target(object.entity_name())?,
                key_column: object.key_column(),
                key: object.key_json()?,
                row,
                generate_key,
                generated_key: None,
            });
            owners.push(index);
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let backend = self.session.backend();
        let affected = match self.session.apply(&mut batch).await {
            Ok(affected) => affected,
            Err(e) => {
                tracing::warn!(context = %self.name, backend, error = %e, "Flush failed");
                return Err(e.into());
            }
        };

        let mut unreadable = None;
        for (op, index) in batch.into_iter().zip(owners) {
            let Some(key) = op.generated_key else {
                continue;
            };
            let object = &mut self.slots[index].object;
            if let Err(source) = object.assign_key(key) {
                if unreadable.is_none() {
                    unreadable = Some((object.entity_name(), source));
                }
            }
        }

        if let Some((entity, source)) = unreadable {
            // the batch is committed; keep it from being written again
            self.detach_all();
            tracing::error!(
                context = %self.name,
                backend,
                entity,
                affected,
                error = %source,
                "Flushed, but a generated key could not be read back"
            );
            return Err(PersistenceError::UnreadableGeneratedKey {
                entity,
                affected,
                source,
            });
        }

        tracing::debug!(context = %self.name, backend, affected, "Flushed pending changes");
        Ok(affected)
    }

    // ===== Retargeting =====

    /// Point the session at `database` and move every entity type to `schema`
    pub fn change_database(&mut self, database: &str, schema: &str) -> Result<()> {
        if database.trim().is_empty() {
            return Err(PersistenceError::InvalidArgument {
                name: "database",
                reason: "database name must not be empty".to_string(),
            });
        }
        self.session.change_database(database)?;
        self.remapper().remap_all(schema);
        tracing::info!(context = %self.name, database, schema, "Changed database");
        Ok(())
    }

    /// Replace the connection string and move every entity type to `schema`
    pub fn change_connection(&mut self, connection: &str, schema: &str) -> Result<()> {
        if connection.trim().is_empty() {
            return Err(PersistenceError::InvalidArgument {
                name: "connection",
                reason: "connection string must not be empty".to_string(),
            });
        }
        self.session.change_connection(connection)?;
        self.remapper().remap_all(schema);
        tracing::info!(context = %self.name, schema, "Changed connection");
        Ok(())
    }
}

impl fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityContext")
            .field("name", &self.name)
            .field("backend", &self.session.backend())
            .field("entries", &self.slots.len())
            .field("tracked", &self.tracked_count())
            .finish()
    }
}
