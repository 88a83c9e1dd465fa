//! Relationship descriptors for eager and lazy loading
//!
//! A descriptor knows how to build the filter that selects related rows for
//! a set of parents, and how to hand the loaded rows back to each parent.
//! Relationship fields themselves are plain `#[serde(skip)]` fields.

use super::query::{Filter, Row};
use crate::contract::{Entity, PersistenceError, Result};
use serde_json::Value;

/// A navigable relationship from `E` to another entity type
pub trait Relation<E: Entity>: Send + Sync {
    /// Relationship name, unique per entity type
    fn name(&self) -> &'static str;

    /// Entity type name of the related side
    fn related_entity(&self) -> &'static str;

    /// Filter selecting related rows of `parents`, or `None` when nothing can match
    fn related_filter(&self, parents: &[&E]) -> Result<Option<Filter>>;

    /// Distribute loaded rows over `parents`, replacing previous contents
    fn assign(&self, parents: &mut [&mut E], rows: &[Row]) -> Result<()>;
}

fn to_json<T: serde::Serialize>(entity: &'static str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| PersistenceError::serialization(entity, e))
}

fn from_row<R: Entity>(row: &Row) -> Result<R> {
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|e| PersistenceError::serialization(R::NAME, e))
}

/// One-to-many: rows of `R` whose `foreign_key` column equals the parent's key
pub struct HasMany<E: Entity, R: Entity> {
    pub name: &'static str,
    pub foreign_key: &'static str,
    pub collection: fn(&mut E) -> &mut Vec<R>,
}

impl<E: Entity, R: Entity> HasMany<E, R> {
    pub const fn new(
        name: &'static str,
        foreign_key: &'static str,
        collection: fn(&mut E) -> &mut Vec<R>,
    ) -> Self {
        Self {
            name,
            foreign_key,
            collection,
        }
    }
}

impl<E: Entity, R: Entity> Clone for HasMany<E, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Entity, R: Entity> Copy for HasMany<E, R> {}

impl<E: Entity, R: Entity> Relation<E> for HasMany<E, R> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn related_entity(&self) -> &'static str {
        R::NAME
    }

    fn related_filter(&self, parents: &[&E]) -> Result<Option<Filter>> {
        if parents.is_empty() {
            return Ok(None);
        }
        let keys = parents
            .iter()
            .map(|p| to_json(E::NAME, p.id()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Filter::In(self.foreign_key.to_string(), keys)))
    }

    fn assign(&self, parents: &mut [&mut E], rows: &[Row]) -> Result<()> {
        for parent in parents.iter_mut() {
            let key = to_json(E::NAME, parent.id())?;
            let children = rows
                .iter()
                .filter(|row| row.get(self.foreign_key) == Some(&key))
                .map(from_row::<R>)
                .collect::<Result<Vec<_>>>()?;
            *(self.collection)(parent) = children;
        }
        Ok(())
    }
}

/// Many-to-one: the row of `R` whose key equals the parent's foreign key
pub struct BelongsTo<E: Entity, R: Entity> {
    pub name: &'static str,
    pub foreign_key: fn(&E) -> Option<R::Key>,
    pub reference: fn(&mut E) -> &mut Option<R>,
}

impl<E: Entity, R: Entity> BelongsTo<E, R> {
    pub const fn new(
        name: &'static str,
        foreign_key: fn(&E) -> Option<R::Key>,
        reference: fn(&mut E) -> &mut Option<R>,
    ) -> Self {
        Self {
            name,
            foreign_key,
            reference,
        }
    }
}

impl<E: Entity, R: Entity> Clone for BelongsTo<E, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Entity, R: Entity> Copy for BelongsTo<E, R> {}

impl<E: Entity, R: Entity> Relation<E> for BelongsTo<E, R> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn related_entity(&self) -> &'static str {
        R::NAME
    }

    fn related_filter(&self, parents: &[&E]) -> Result<Option<Filter>> {
        let mut keys = Vec::new();
        for parent in parents {
            if let Some(fk) = (self.foreign_key)(parent) {
                let fk = to_json(R::NAME, &fk)?;
                if !keys.contains(&fk) {
                    keys.push(fk);
                }
            }
        }
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(Filter::In(R::KEY_COLUMN.to_string(), keys)))
    }

    fn assign(&self, parents: &mut [&mut E], rows: &[Row]) -> Result<()> {
        for parent in parents.iter_mut() {
            let related = match (self.foreign_key)(parent) {
                Some(fk) => {
                    let fk = to_json(R::NAME, &fk)?;
                    rows.iter()
                        .find(|row| row.get(R::KEY_COLUMN) == Some(&fk))
                        .map(from_row::<R>)
                        .transpose()?
                }
                None => None,
            };
            *(self.reference)(parent) = related;
        }
        Ok(())
    }
}
