//! Storage layer - session implementations

pub mod memory;
pub mod sea;

pub use memory::{MemorySession, MemoryStore};
pub use sea::{connect_data_sources, SeaOrmSession, SeaOrmStore};
