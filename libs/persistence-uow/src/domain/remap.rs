//! Post-hoc schema and table remapping
//!
//! Every operation is silently ignored once the model is finalized, so they
//! are safe to call speculatively. Callers cannot tell from the return value
//! whether a remap took effect.

use super::model::Model;
use crate::contract::Entity;

/// Rewrites storage locations on a [`Model`]
#[derive(Debug, Clone, Copy)]
pub struct SchemaRemapper<'a> {
    model: &'a Model,
}

impl<'a> SchemaRemapper<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    /// Move every entity type to `schema`
    pub fn remap_all(&self, schema: &str) {
        if self.model.is_finalized() {
            return;
        }
        self.model.set_schema_all(schema);
    }

    /// Move `E` to `schema`
    pub fn remap<E: Entity>(&self, schema: &str) {
        if self.model.is_finalized() {
            return;
        }
        self.model.set_schema(E::NAME, schema);
    }

    /// Rename the table of `E`
    pub fn remap_table<E: Entity>(&self, table: &str) {
        if self.model.is_finalized() {
            return;
        }
        self.model.set_table(E::NAME, table);
    }
}
