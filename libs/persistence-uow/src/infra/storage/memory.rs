//! In-memory store
//!
//! Keeps rows in process memory, one namespace per database name. Used by
//! tests and by callers that want the tracking semantics without a server.
//! Writes are atomic per batch: the batch runs against a copy of the
//! database which replaces the original only if every write succeeds.

use crate::contract::StoreError;
use crate::domain::model::TableTarget;
use crate::domain::query::{Filter, Order, QuerySpec, Row};
use crate::domain::store::{Session, SessionFactory, WriteKind, WriteOp};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

const BACKEND: &str = "memory";
const CONNECTION_PREFIX: &str = "memory://";

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<Row>,
    next_id: i64,
}

type Database = HashMap<TableTarget, Table>;

#[derive(Debug, Default)]
struct Inner {
    databases: RwLock<HashMap<String, Database>>,
    offline: AtomicBool,
    applied: AtomicU64,
}

/// Shared in-memory store; clones share the same data
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    database: String,
}

impl MemoryStore {
    /// Store whose sessions start on `database`
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            database: database.into(),
        }
    }

    /// Simulate an unreachable store
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Number of successfully applied write batches
    pub fn apply_count(&self) -> u64 {
        self.inner.applied.load(AtomicOrdering::SeqCst)
    }

    /// Rows of `target` in the default database
    pub fn rows(&self, target: &TableTarget) -> Vec<Row> {
        self.rows_in(&self.database, target)
    }

    /// Rows of `target` in `database`
    pub fn rows_in(&self, database: &str, target: &TableTarget) -> Vec<Row> {
        self.inner
            .databases
            .read()
            .get(database)
            .and_then(|db| db.get(target))
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("default")
    }
}

impl SessionFactory for MemoryStore {
    fn open_session(&self) -> Box<dyn Session> {
        Box::new(MemorySession {
            store: self.inner.clone(),
            database: self.database.clone(),
        })
    }
}

/// Session over a [`MemoryStore`]
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<Inner>,
    database: String,
}

impl MemorySession {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.store.offline.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "memory database `{}` is offline",
                self.database
            )));
        }
        Ok(())
    }

    fn select(&self, target: &TableTarget, filter: Option<&Filter>) -> Vec<Row> {
        let databases = self.store.databases.read();
        let Some(table) = databases.get(&self.database).and_then(|db| db.get(target)) else {
            return Vec::new();
        };
        table
            .rows
            .iter()
            .filter(|row| filter.is_none_or(|f| row_matches(f, row)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Session for MemorySession {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn fetch(
        &mut self,
        target: &TableTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, StoreError> {
        self.check_online()?;
        let mut rows = self.select(target, spec.filter.as_ref());
        if !spec.order.is_empty() {
            rows.sort_by(|a, b| {
                spec.order
                    .iter()
                    .map(|(column, order)| {
                        let ordering = compare(
                            a.get(column).unwrap_or(&Value::Null),
                            b.get(column).unwrap_or(&Value::Null),
                        )
                        .unwrap_or(Ordering::Equal);
                        match order {
                            Order::Asc => ordering,
                            Order::Desc => ordering.reverse(),
                        }
                    })
                    .find(|ordering| *ordering != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }
        let offset = spec.offset.map_or(0, to_usize);
        let limit = spec.limit.map_or(usize::MAX, to_usize);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(
        &mut self,
        target: &TableTarget,
        filter: Option<&Filter>,
    ) -> Result<u64, StoreError> {
        self.check_online()?;
        Ok(self.select(target, filter).len() as u64)
    }

    async fn apply(&mut self, batch: &mut [WriteOp]) -> Result<u64, StoreError> {
        self.check_online()?;
        let mut databases = self.store.databases.write();
        let mut working = databases.get(&self.database).cloned().unwrap_or_default();

        let mut affected = 0;
        for op in batch.iter_mut() {
            apply_one(&mut working, op)?;
            affected += 1;
        }

        databases.insert(self.database.clone(), working);
        self.store.applied.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(affected)
    }

    fn change_database(&mut self, database: &str) -> Result<(), StoreError> {
        self.database = database.to_string();
        Ok(())
    }

    fn change_connection(&mut self, connection: &str) -> Result<(), StoreError> {
        let database = connection.strip_prefix(CONNECTION_PREFIX).unwrap_or(connection);
        if database.is_empty() {
            return Err(StoreError::Unavailable(format!(
                "connection `{connection}` names no database"
            )));
        }
        self.database = database.to_string();
        Ok(())
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn key_matches(row: &Row, column: &str, key: &Value) -> bool {
    row.get(column).is_some_and(|value| values_equal(value, key))
}

fn apply_one(db: &mut Database, op: &mut WriteOp) -> Result<(), StoreError> {
    let table = db.entry(op.target.clone()).or_default();
    match op.kind {
        WriteKind::Insert => {
            let mut row = op.row.clone();
            let key = if op.generate_key {
                table.next_id = table.next_id.max(0) + 1;
                let key = Value::from(table.next_id);
                row.insert(op.key_column.to_string(), key.clone());
                op.generated_key = Some(key.clone());
                key
            } else {
                op.key.clone()
            };
            if table.rows.iter().any(|r| key_matches(r, op.key_column, &key)) {
                return Err(StoreError::Constraint {
                    target: op.target.to_string(),
                    message: format!("duplicate key {key}"),
                });
            }
            if let Some(explicit) = key.as_i64() {
                table.next_id = table.next_id.max(explicit);
            }
            table.rows.push(row);
        }
        WriteKind::Update => {
            let existing = table
                .rows
                .iter_mut()
                .find(|r| key_matches(r, op.key_column, &op.key))
                .ok_or_else(|| stale(op))?;
            *existing = op.row.clone();
        }
        WriteKind::Delete => {
            let index = table
                .rows
                .iter()
                .position(|r| key_matches(r, op.key_column, &op.key))
                .ok_or_else(|| stale(op))?;
            table.rows.remove(index);
        }
    }
    Ok(())
}

fn stale(op: &WriteOp) -> StoreError {
    StoreError::StaleWrite {
        target: op.target.to_string(),
        key: op.key.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b).map_or(a == b, |ordering| ordering == Ordering::Equal)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn column<'r>(row: &'r Row, name: &str) -> Option<&'r Value> {
    row.get(name).filter(|value| !value.is_null())
}

fn ordered(row: &Row, name: &str, value: &Value, accept: fn(Ordering) -> bool) -> bool {
    column(row, name)
        .and_then(|actual| compare(actual, value))
        .is_some_and(accept)
}

fn row_matches(filter: &Filter, row: &Row) -> bool {
    match filter {
        Filter::Eq(name, value) => {
            column(row, name).is_some_and(|actual| values_equal(actual, value))
        }
        Filter::Ne(name, value) => {
            column(row, name).is_some_and(|actual| !values_equal(actual, value))
        }
        Filter::Gt(name, value) => ordered(row, name, value, Ordering::is_gt),
        Filter::Ge(name, value) => ordered(row, name, value, Ordering::is_ge),
        Filter::Lt(name, value) => ordered(row, name, value, Ordering::is_lt),
        Filter::Le(name, value) => ordered(row, name, value, Ordering::is_le),
        Filter::In(name, values) => column(row, name)
            .is_some_and(|actual| values.iter().any(|v| values_equal(actual, v))),
        Filter::IsNull(name) => column(row, name).is_none(),
        Filter::IsNotNull(name) => column(row, name).is_some(),
        Filter::And(all) => all.iter().all(|f| row_matches(f, row)),
        Filter::Or(any) => any.iter().any(|f| row_matches(f, row)),
        Filter::Not(inner) => !row_matches(inner, row),
    }
}
