//! Persistence Unit of Work
//!
//! Generic repository and unit-of-work layer over pluggable persistence
//! sessions. Entities are plain serde types; a [`Model`] maps them to
//! tables, an [`EntityContext`] tracks their changes and a [`UnitOfWork`]
//! flushes several contexts as one logical commit.

// Public exports
pub mod contract;
pub use contract::{Entity, EntityState, KeyKind, PersistenceError, PrimaryKey, Result, StoreError};

pub mod domain;
pub use domain::{
    BelongsTo, ContextOptions, DataSources, EntityContext, EntityRef, Filter, HasMany,
    IdentityStrategy, Model, Order, Query, Repository, SchemaRemapper, UnitOfWork,
    UnitOfWorkState,
};

pub mod config;
pub use config::{DataSourceConfig, PersistenceConfig};

pub mod infra;
pub use infra::storage::{MemoryStore, SeaOrmStore};
