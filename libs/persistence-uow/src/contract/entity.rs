//! Entity and primary key contracts
//!
//! An entity is an owned Rust value whose serde object form is its row:
//! field names are column names, relationship fields are `#[serde(skip)]`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use uuid::Uuid;

/// Runtime classification of a primary key type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Single-byte unsigned integer, reserved for store-generated keys
    UnsignedByte,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// Strings, UUIDs, composite keys and everything else
    Other,
}

/// A primary key type
///
/// The key type of an entity is fixed by its `Entity::Key` associated type.
pub trait PrimaryKey:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Classification used by [`IdentityStrategy`](crate::domain::IdentityStrategy)
    const KIND: KeyKind;

    /// Signed integer view of the key, for the integer kinds only
    fn as_signed(&self) -> Option<i64> {
        None
    }
}

impl PrimaryKey for u8 {
    const KIND: KeyKind = KeyKind::UnsignedByte;
}

impl PrimaryKey for i32 {
    const KIND: KeyKind = KeyKind::Int32;

    fn as_signed(&self) -> Option<i64> {
        Some(i64::from(*self))
    }
}

impl PrimaryKey for i64 {
    const KIND: KeyKind = KeyKind::Int64;

    fn as_signed(&self) -> Option<i64> {
        Some(*self)
    }
}

impl PrimaryKey for String {
    const KIND: KeyKind = KeyKind::Other;
}

impl PrimaryKey for Uuid {
    const KIND: KeyKind = KeyKind::Other;
}

impl<A, B> PrimaryKey for (A, B)
where
    A: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    B: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    const KIND: KeyKind = KeyKind::Other;
}

/// A persistent domain object
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Primary key type
    type Key: PrimaryKey;

    /// Logical entity type name, also the default table name
    const NAME: &'static str;

    /// Column holding the primary key
    const KEY_COLUMN: &'static str = "id";

    /// Current primary key value
    fn id(&self) -> &Self::Key;

    /// Overwrite the primary key, used to write back store-generated keys
    fn set_id(&mut self, id: Self::Key);
}

/// Lifecycle state of a tracked entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked; ignored by flush
    Detached,
    /// Tracked, no pending write
    Unchanged,
    /// Pending insert
    Added,
    /// Pending update
    Modified,
    /// Pending delete
    Deleted,
}

impl EntityState {
    /// Whether a flush will write this entry
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }
}

