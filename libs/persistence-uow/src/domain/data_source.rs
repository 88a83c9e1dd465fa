//! Named data sources: a model plus a way to open sessions against it

use super::context::{ContextOptions, EntityContext};
use super::model::Model;
use super::store::SessionFactory;
use crate::contract::{PersistenceError, Result};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
struct DataSource {
    name: String,
    model: Arc<Model>,
    sessions: Arc<dyn SessionFactory>,
}

/// Registry of data sources, keyed case-insensitively
#[derive(Clone, Default)]
pub struct DataSources {
    sources: HashMap<String, DataSource>,
    options: ContextOptions,
}

impl DataSources {
    pub fn new(options: ContextOptions) -> Self {
        Self {
            sources: HashMap::new(),
            options,
        }
    }

    /// Register (or replace) a data source
    pub fn register(
        &mut self,
        name: impl Into<String>,
        model: Arc<Model>,
        sessions: Arc<dyn SessionFactory>,
    ) -> &mut Self {
        let name = name.into();
        self.sources.insert(
            name.to_lowercase(),
            DataSource {
                name,
                model,
                sessions,
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(&name.to_lowercase())
    }

    /// Registered names as given at registration
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.values().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn model(&self, name: &str) -> Result<Arc<Model>> {
        self.sources
            .get(&name.to_lowercase())
            .map(|s| s.model.clone())
            .ok_or_else(|| PersistenceError::UnknownDataSource(name.to_string()))
    }

    /// Open a fresh context with its own session
    pub fn open_context(&self, name: &str) -> Result<EntityContext> {
        let source = self
            .sources
            .get(&name.to_lowercase())
            .ok_or_else(|| PersistenceError::UnknownDataSource(name.to_string()))?;
        tracing::debug!(data_source = %source.name, "Opening entity context");
        Ok(EntityContext::new(
            source.name.clone(),
            source.model.clone(),
            source.sessions.open_session(),
            self.options,
        ))
    }
}

impl std::fmt::Debug for DataSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSources")
            .field("names", &self.names())
            .field("options", &self.options)
            .finish()
    }
}
