//! Shared entities, models and test doubles

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use persistence_uow::contract::{Entity, StoreError};
use persistence_uow::domain::store::{Session, SessionFactory, WriteOp};
use persistence_uow::domain::{
    BelongsTo, ContextOptions, DataSources, Filter, HasMany, Model, QuerySpec, Row, TableTarget,
};
use persistence_uow::MemoryStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ===== Entities =====

/// Store-generated `i64` key
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub orders: Vec<Order>,
}

fn customer_orders(customer: &mut Customer) -> &mut Vec<Order> {
    &mut customer.orders
}

impl Customer {
    pub const ORDERS: HasMany<Customer, Order> =
        HasMany::new("orders", "customer_id", customer_orders);

    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            orders: Vec::new(),
        }
    }

    pub fn with_id(id: i64, name: &str) -> Self {
        Self {
            id,
            ..Self::new(name)
        }
    }
}

impl Entity for Customer {
    type Key = i64;
    const NAME: &'static str = "customer";

    fn id(&self) -> &i64 {
        &self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

/// Store-generated `i32` key, belongs to a customer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Order {
    pub id: i32,
    pub customer_id: i64,
    pub amount: i64,
    #[serde(skip)]
    pub customer: Option<Customer>,
}

fn order_customer_id(order: &Order) -> Option<i64> {
    Some(order.customer_id)
}

fn order_customer(order: &mut Order) -> &mut Option<Customer> {
    &mut order.customer
}

impl Order {
    pub const CUSTOMER: BelongsTo<Order, Customer> =
        BelongsTo::new("customer", order_customer_id, order_customer);

    pub fn new(customer_id: i64, amount: i64) -> Self {
        Self {
            id: 0,
            customer_id,
            amount,
            customer: None,
        }
    }
}

impl Entity for Order {
    type Key = i32;
    const NAME: &'static str = "order";

    fn id(&self) -> &i32 {
        &self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }
}

/// Single-byte key, always assigned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u8,
    pub label: String,
}

impl Entity for Tag {
    type Key = u8;
    const NAME: &'static str = "tag";

    fn id(&self) -> &u8 {
        &self.id
    }

    fn set_id(&mut self, id: u8) {
        self.id = id;
    }
}

/// Natural string key, never temporary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

impl Country {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
        }
    }
}

impl Entity for Country {
    type Key = String;
    const NAME: &'static str = "country";
    const KEY_COLUMN: &'static str = "code";

    fn id(&self) -> &String {
        &self.code
    }

    fn set_id(&mut self, id: String) {
        self.code = id;
    }
}

// ===== Models and data sources =====

pub fn model() -> Arc<Model> {
    Model::builder()
        .entity::<Customer>()
        .entity_with_table::<Order>("orders")
        .entity::<Tag>()
        .entity::<Country>()
        .build()
}

pub fn target(table: &str) -> TableTarget {
    TableTarget::new(None, table)
}

/// Data sources over in-memory stores, each with its own model
pub fn memory_sources(stores: &[(&str, &MemoryStore)]) -> Arc<DataSources> {
    let mut sources = DataSources::new(ContextOptions::default());
    for (name, store) in stores {
        sources.register(*name, model(), Arc::new((*store).clone()));
    }
    Arc::new(sources)
}

// ===== Test doubles =====

/// Wraps a memory store, records every applied batch and can be told to fail
#[derive(Clone)]
pub struct RecordingStore {
    pub label: String,
    pub inner: MemoryStore,
    pub log: Arc<Mutex<Vec<String>>>,
    pub fail_apply: Arc<AtomicBool>,
    pub cancel_after_apply: Arc<Mutex<Option<CancellationToken>>>,
}

impl RecordingStore {
    pub fn new(label: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.to_string(),
            inner: MemoryStore::default(),
            log,
            fail_apply: Arc::new(AtomicBool::new(false)),
            cancel_after_apply: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_next_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// Fire `token` once the next batch has been written
    pub fn cancel_after_next_apply(&self, token: CancellationToken) {
        *self.cancel_after_apply.lock() = Some(token);
    }
}

impl SessionFactory for RecordingStore {
    fn open_session(&self) -> Box<dyn Session> {
        Box::new(RecordingSession {
            store: self.clone(),
            inner: self.inner.open_session(),
        })
    }
}

struct RecordingSession {
    store: RecordingStore,
    inner: Box<dyn Session>,
}

#[async_trait]
impl Session for RecordingSession {
    fn backend(&self) -> &'static str {
        "recording"
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn fetch(
        &mut self,
        target: &TableTarget,
        spec: &QuerySpec,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner.fetch(target, spec).await
    }

    async fn count(
        &mut self,
        target: &TableTarget,
        filter: Option<&Filter>,
    ) -> Result<u64, StoreError> {
        self.inner.count(target, filter).await
    }

    async fn apply(&mut self, batch: &mut [WriteOp]) -> Result<u64, StoreError> {
        self.store.log.lock().push(format!(
            "{}:{}",
            self.store.label,
            batch
                .iter()
                .map(|op| format!("{:?} {}", op.kind, op.target))
                .collect::<Vec<_>>()
                .join(",")
        ));
        if self.store.fail_apply.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{} refused the write",
                self.store.label
            )));
        }
        let affected = self.inner.apply(batch).await?;
        if let Some(token) = self.store.cancel_after_apply.lock().take() {
            token.cancel();
        }
        Ok(affected)
    }

    fn change_database(&mut self, database: &str) -> Result<(), StoreError> {
        self.inner.change_database(database)
    }

    fn change_connection(&mut self, connection: &str) -> Result<(), StoreError> {
        self.inner.change_connection(connection)
    }
}
