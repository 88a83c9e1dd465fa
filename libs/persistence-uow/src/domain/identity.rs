//! Temporary-key classification
//!
//! Decides from a key's type and value whether the store still has to
//! assign it. Repositories use this to decide whether an insert must be
//! flushed before the key can be read back.

use crate::contract::{KeyKind, PrimaryKey};

/// Stateless temporary-key classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityStrategy;

impl IdentityStrategy {
    /// Classify a key value given its kind.
    ///
    /// `UnsignedByte` is always temporary; `Int32`/`Int64` are temporary iff
    /// the value is `<= 0`; everything else is never temporary.
    pub fn is_temporary(kind: KeyKind, signed_value: Option<i64>) -> bool {
        match kind {
            KeyKind::UnsignedByte => true,
            KeyKind::Int32 | KeyKind::Int64 => signed_value.is_some_and(|v| v <= 0),
            KeyKind::Other => false,
        }
    }

    /// Whether `key` has not been assigned by the store yet
    pub fn is_temporary_key<K: PrimaryKey>(key: &K) -> bool {
        Self::is_temporary(K::KIND, key.as_signed())
    }

    /// Whether values of `K` can be temporary at all, whatever their value
    pub fn may_have_temporary_key<K: PrimaryKey>() -> bool {
        K::KIND == KeyKind::UnsignedByte
    }

    /// Whether reading a freshly inserted `key` requires a flush first
    pub fn requires_flush<K: PrimaryKey>(key: &K) -> bool {
        Self::may_have_temporary_key::<K>() || Self::is_temporary_key(key)
    }
}
