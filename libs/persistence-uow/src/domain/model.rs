//! Model metadata: entity type to storage location mapping
//!
//! A model is shared by every context opened on the same data source. It is
//! mutable until finalized; contexts finalize it on their first store I/O.

use crate::contract::Entity;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Physical location of an entity type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableTarget {
    pub schema: Option<String>,
    pub table: String,
}

impl TableTarget {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema,
            table: table.into(),
        }
    }
}

impl fmt::Display for TableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

#[derive(Debug)]
struct ModelState {
    finalized: bool,
    mappings: BTreeMap<&'static str, TableTarget>,
}

/// Entity mapping registry
#[derive(Debug)]
pub struct Model {
    state: RwLock<ModelState>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// Registered entity type names, sorted
    pub fn entity_types(&self) -> Vec<&'static str> {
        self.state.read().mappings.keys().copied().collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.state.read().finalized
    }

    /// Freeze the mapping; later schema or table changes are ignored
    pub fn finalize(&self) {
        self.state.write().finalized = true;
    }

    /// Finalize unless already finalized. Returns whether this call did it.
    pub fn try_finalize(&self) -> bool {
        let mut state = self.state.write();
        if state.finalized {
            return false;
        }
        state.finalized = true;
        tracing::debug!(entities = state.mappings.len(), "Model finalized");
        true
    }

    /// Current location of an entity type
    pub fn target_of(&self, entity: &str) -> Option<TableTarget> {
        self.state.read().mappings.get(entity).cloned()
    }

    /// Current location of `E`
    pub fn target_for<E: Entity>(&self) -> Option<TableTarget> {
        self.target_of(E::NAME)
    }

    /// Set the schema of every entity type. Returns `false` once finalized.
    pub fn set_schema_all(&self, schema: &str) -> bool {
        let mut state = self.state.write();
        if state.finalized {
            return false;
        }
        for target in state.mappings.values_mut() {
            target.schema = Some(schema.to_string());
        }
        true
    }

    /// Set the schema of one entity type. Returns `false` when finalized or unmapped.
    pub fn set_schema(&self, entity: &str, schema: &str) -> bool {
        let mut state = self.state.write();
        if state.finalized {
            return false;
        }
        match state.mappings.get_mut(entity) {
            Some(target) => {
                target.schema = Some(schema.to_string());
                true
            }
            None => false,
        }
    }

    /// Set the table of one entity type. Returns `false` when finalized or unmapped.
    pub fn set_table(&self, entity: &str, table: &str) -> bool {
        let mut state = self.state.write();
        if state.finalized {
            return false;
        }
        match state.mappings.get_mut(entity) {
            Some(target) => {
                target.table = table.to_string();
                true
            }
            None => false,
        }
    }
}

/// Builder for [`Model`]
#[derive(Debug, Default)]
pub struct ModelBuilder {
    default_schema: Option<String>,
    mappings: BTreeMap<&'static str, TableTarget>,
}

impl ModelBuilder {
    /// Schema applied to entities registered after this call
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Register `E` under its own name as table name
    pub fn entity<E: Entity>(self) -> Self {
        self.entity_with_table::<E>(E::NAME)
    }

    /// Register `E` with an explicit table name
    pub fn entity_with_table<E: Entity>(mut self, table: &str) -> Self {
        self.mappings
            .insert(E::NAME, TableTarget::new(self.default_schema.clone(), table));
        self
    }

    pub fn build(self) -> Arc<Model> {
        Arc::new(Model {
            state: RwLock::new(ModelState {
                finalized: false,
                mappings: self.mappings,
            }),
        })
    }
}
