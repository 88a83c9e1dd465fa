//! Contract layer - public entity model and error types
//!
//! These types are backend-agnostic: nothing here knows which store a
//! session talks to.

pub mod entity;
pub mod error;

pub use entity::{Entity, EntityState, KeyKind, PrimaryKey};
pub use error::{PersistenceError, Result, StoreError};
