//! Error types for the persistence layer
//!
//! Store-level failures are carried unchanged inside [`PersistenceError::Store`];
//! nothing in this crate retries or swallows them.

/// Failure reported by a session backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Error raised by the SQL driver
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Unique or key constraint violated
    #[error("constraint violation on {target}: {message}")]
    Constraint {
        /// Table the write was aimed at
        target: String,
        /// Violation details
        message: String,
    },

    /// Update or delete matched no row
    #[error("stale write on {target}: no row with key {key}")]
    StaleWrite {
        /// Table the write was aimed at
        target: String,
        /// Key of the missing row
        key: String,
    },

    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation not supported by this backend
    #[error("unsupported by {backend}: {operation}")]
    Unsupported {
        /// Backend name
        backend: &'static str,
        /// Operation that was attempted
        operation: String,
    },

    /// Row returned by the store does not have the expected shape
    #[error("malformed row from {target}: {message}")]
    MalformedRow {
        /// Table the row came from
        target: String,
        /// What was wrong with it
        message: String,
    },

    /// Any other backend failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by repositories, contexts and units of work
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Rejected argument, raised before any I/O
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Argument name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Failure from the underlying store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Entity type was never registered with the model
    #[error("entity type `{0}` is not mapped by the model")]
    UnmappedEntity(&'static str),

    /// Entity reference issued by a different context
    #[error("entity reference was not issued by this context")]
    ForeignReference,

    /// Operation not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A single-result query matched zero or several rows
    #[error("expected exactly one `{entity}`, found {found}")]
    NotSingle {
        /// Entity type name
        entity: &'static str,
        /// Number of matching rows
        found: usize,
    },

    /// Entity could not be converted to or from its row form
    #[error("failed to map `{entity}` to or from a row: {source}")]
    Serialization {
        /// Entity type name
        entity: &'static str,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// The flush was committed but a store-assigned key could not be read back.
    ///
    /// The written entries are detached anyway, so flushing again does not
    /// repeat the writes.
    #[error("flushed {affected} row(s) but the new `{entity}` key is unreadable: {source}")]
    UnreadableGeneratedKey {
        /// Entity type whose key failed to convert
        entity: &'static str,
        /// Rows written by the committed flush
        affected: u64,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Cancellation signal fired
    #[error("operation cancelled")]
    Cancelled,

    /// A unit-of-work commit stopped at `context`.
    ///
    /// Contexts listed in `flushed` were already durably written and are not
    /// compensated.
    #[error("commit failed in context `{context}` (already flushed: {flushed:?}): {source}")]
    CommitFailed {
        /// Context whose flush failed
        context: String,
        /// Contexts flushed successfully before or alongside the failure
        flushed: Vec<String>,
        /// Failure of `context`
        #[source]
        source: Box<PersistenceError>,
    },

    /// No data source registered under that name
    #[error("unknown data source `{0}`")]
    UnknownDataSource(String),
}

impl PersistenceError {
    pub(crate) fn serialization(entity: &'static str, source: serde_json::Error) -> Self {
        Self::Serialization { entity, source }
    }

    /// Whether the failing flush had already committed its writes
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::UnreadableGeneratedKey { .. })
    }

    /// The store failure at the root of this error, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            Self::CommitFailed { source, .. } => source.store_error(),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = PersistenceError> = std::result::Result<T, E>;
