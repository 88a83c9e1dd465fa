//! Domain layer - change tracking, repositories and the unit of work

pub mod context;
pub mod data_source;
pub mod identity;
pub mod model;
pub mod query;
pub mod relation;
pub mod remap;
pub mod repository;
pub mod store;
pub mod unit_of_work;

pub use context::{ContextOptions, EntityContext, EntityRef, IntoEntityRef};
pub use data_source::DataSources;
pub use identity::IdentityStrategy;
pub use model::{Model, ModelBuilder, TableTarget};
pub use query::{Filter, Order, Query, QuerySpec, Row};
pub use relation::{BelongsTo, HasMany, Relation};
pub use remap::SchemaRemapper;
pub use repository::Repository;
pub use store::{Session, SessionFactory, WriteKind, WriteOp};
pub use unit_of_work::{UnitOfWork, UnitOfWorkState};
