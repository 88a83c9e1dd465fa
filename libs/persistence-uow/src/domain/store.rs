//! Session traits for the underlying store
//!
//! These traits define what the orchestration layer needs from a store.
//! Implementations are in infra/storage.

use super::model::TableTarget;
use super::query::{Filter, QuerySpec, Row};
use crate::contract::StoreError;
use async_trait::async_trait;
use serde_json::Value;

/// Kind of a pending write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// One write produced by a flush
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub target: TableTarget,
    pub key_column: &'static str,
    /// Current key value; meaningless for inserts with `generate_key`
    pub key: Value,
    /// Full row for inserts and updates, empty for deletes
    pub row: Row,
    /// Insert must omit the key column and let the store assign it
    pub generate_key: bool,
    /// Filled by the session with the store-assigned key
    pub generated_key: Option<Value>,
}

/// One persistence session against a store
#[async_trait]
pub trait Session: Send {
    /// Backend name for logs and errors
    fn backend(&self) -> &'static str;

    /// Open the connection if needed and verify it is usable
    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Read matching rows
    async fn fetch(
        &mut self,
        target: &TableTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, StoreError>;

    /// Count matching rows
    async fn count(
        &mut self,
        target: &TableTarget,
        filter: Option<&Filter>,
    ) -> Result<u64, StoreError>;

    /// Apply all writes in one transaction, in order.
    ///
    /// Either every write is durable on return or none is. Returns the number
    /// of affected rows.
    async fn apply(&mut self, batch: &mut [WriteOp]) -> Result<u64, StoreError>;

    /// Point the session at another database on the same server
    fn change_database(&mut self, database: &str) -> Result<(), StoreError>;

    /// Replace the connection string
    fn change_connection(&mut self, connection: &str) -> Result<(), StoreError>;
}

/// Opens sessions for new contexts
pub trait SessionFactory: Send + Sync {
    fn open_session(&self) -> Box<dyn Session>;
}
