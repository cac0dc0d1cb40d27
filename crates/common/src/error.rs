use std::sync::Arc;
use thiserror::Error;

/// Error taxonomy shared by every backend and wrapper.
///
/// Tests distinguish failures by variant, so each kind of failure maps to
/// exactly one variant. Transient backend errors are retried inside the
/// backends and only show up here (as [`StoreError::Backend`]) once the
/// retry budget is exhausted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate value for attribute {attribute} in collection {collection}")]
    Duplicate {
        collection: String,
        attribute: String,
    },
    #[error("attribute {0} is not indexed")]
    NotIndexed(String),
    #[error("cannot update id of existing record")]
    IdImmutable,
    #[error("upsert only supports filtering by id")]
    UpsertRequiresId,
    #[error("failed to upsert record")]
    UpsertConflict,
    #[error("connection closed")]
    ClosedHandle,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cannot {operation} by wrapped attribute {attribute}")]
    WrappedQuery {
        operation: String,
        attribute: String,
    },
    #[error("must provide ID for encryption")]
    MissingEncryptionId,
    #[error("no encryption key found for record")]
    MissingEncryptionKey,
    #[error("record is missing an id")]
    MissingId,
    #[error("record id must be a string or an integer")]
    InvalidId,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("backend error {kind}: {message}")]
    Backend {
        status: Option<u16>,
        kind: String,
        message: String,
    },
    /// Sticky initialisation failure, re-raised to every caller that hits
    /// the ready gate after the init task failed.
    #[error(transparent)]
    Init(Arc<StoreError>),
    #[error("{0}")]
    Custom(String),
}

impl StoreError {
    pub fn duplicate(collection: impl Into<String>, attribute: impl Into<String>) -> Self {
        StoreError::Duplicate {
            collection: collection.into(),
            attribute: attribute.into(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }

    /// The backend error kind, seen through the [`StoreError::Init`] layer.
    pub fn backend_kind(&self) -> Option<&str> {
        match self {
            StoreError::Backend { kind, .. } => Some(kind),
            StoreError::Init(inner) => inner.backend_kind(),
            _ => None,
        }
    }
}
