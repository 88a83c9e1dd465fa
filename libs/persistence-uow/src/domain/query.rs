//! Lazy, composable query handles
//!
//! A [`Query`] describes what to read; nothing touches the store until a
//! repository executes it. Backends receive the untyped [`QuerySpec`].

use super::relation::Relation;
use crate::contract::Entity;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Row form of an entity: column name to value
pub type Row = serde_json::Map<String, Value>;

/// Predicate over row columns, translated by each backend
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(column.into(), value.into())
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(column.into(), value.into())
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(column.into(), value.into())
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le(column.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::IsNotNull(column.into())
    }

    /// Conjunction, flattening nested `And`s
    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction, flattening nested `Or`s
    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Or(mut any) => {
                any.push(other);
                Self::Or(any)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Backend-facing description of a read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub filter: Option<Filter>,
    pub order: Vec<(String, Order)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QuerySpec {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }
}

/// Typed query handle for entity type `E`
pub struct Query<E: Entity> {
    spec: QuerySpec,
    includes: Vec<Arc<dyn Relation<E>>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Query<E> {
    pub fn new() -> Self {
        Self {
            spec: QuerySpec::default(),
            includes: Vec::new(),
            _entity: PhantomData,
        }
    }

    /// Add a predicate; repeated calls are combined with AND
    pub fn filter(mut self, filter: Filter) -> Self {
        self.spec.filter = Some(match self.spec.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: Order) -> Self {
        self.spec.order.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    /// Eager-load a relationship of every returned entity
    pub fn include<R>(mut self, relation: R) -> Self
    where
        R: Relation<E> + 'static,
    {
        self.includes.push(Arc::new(relation));
        self
    }

    /// Eager-load an already shared relationship descriptor
    pub fn include_shared(mut self, relation: Arc<dyn Relation<E>>) -> Self {
        self.includes.push(relation);
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn includes(&self) -> &[Arc<dyn Relation<E>>] {
        &self.includes
    }
}

impl<E: Entity> Default for Query<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            includes: self.includes.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity", &E::NAME)
            .field("spec", &self.spec)
            .field(
                "includes",
                &self.includes.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
