//! # Collection Storage API
//!
//! The uniform contract every backend implements. Rather than pushing
//! business logic into each backend, the traits here pin the shared
//! semantics (duplicate rejection, projection, upsert routing) and leave
//! the storage strategy to the implementation:
//!
//! - [`Collection`]: record-level operations against one named collection
//! - [`DbEngine`]: opens collections and tears the backend down
//!
//! All operations are asynchronous requests; the only ordering the
//! contract guarantees is the caller's own suspension on each call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use colstore_common::{KeySchema, Record, StoreError, Value};

/// Options for [`Collection::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Insert a new record when nothing matches. Only valid when the
    /// filter attribute is `id`.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        UpdateOptions { upsert: true }
    }
}

/// A named set of records sharing a key schema.
///
/// Every operation rejects with [`StoreError::ClosedHandle`] once the
/// owning database handle has been closed, and suspends behind the
/// collection's initialisation until it first completes.
#[async_trait]
pub trait Collection: Send + Sync {
    /// The indexed attributes this collection was opened with.
    fn indices(&self) -> &KeySchema;

    /// Stores a new record. Fails with [`StoreError::Duplicate`] if the
    /// id or any unique indexed attribute is already taken, leaving
    /// storage (including auxiliary indexes) unchanged.
    async fn add(&self, record: Record) -> Result<(), StoreError>;

    /// Returns one record where `attribute == value`, or `None`.
    /// `attribute` must be `id` or an indexed attribute. When `fields`
    /// is supplied only those fields (and only if present) are returned.
    async fn get(
        &self,
        attribute: &str,
        value: &Value,
        fields: Option<&[&str]>,
    ) -> Result<Option<Record>, StoreError>;

    /// Returns all matching records, or every record in the collection
    /// when no filter is given. Order is unspecified.
    async fn get_all(
        &self,
        filter: Option<(&str, &Value)>,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Record>, StoreError>;

    /// Merges `delta` into every matching record: fields present in
    /// `delta` overwrite, absent fields are untouched. A `delta.id` must
    /// equal the existing id. With [`UpdateOptions::upsert`] and no
    /// match, inserts `delta` as a new record (filter must be by `id`).
    async fn update(
        &self,
        attribute: &str,
        value: &Value,
        delta: Record,
        options: UpdateOptions,
    ) -> Result<(), StoreError>;

    /// Deletes all matches and returns the count.
    async fn remove(&self, attribute: &str, value: &Value) -> Result<usize, StoreError>;
}

/// Backend seam: opens collections and closes the underlying store.
#[async_trait]
pub trait DbEngine: Send + Sync {
    /// Opens (or creates) a collection. Backend-specific initialisation
    /// may continue asynchronously; the returned collection queues its
    /// public operations behind that completion.
    fn open_collection(
        &self,
        name: &str,
        keys: KeySchema,
        lifecycle: Lifecycle,
    ) -> Result<Arc<dyn Collection>, StoreError>;

    /// Tears the backend down, letting in-flight operations settle.
    async fn close(&self) -> Result<(), StoreError>;
}

/// The shared closed flag, referenced by a database handle and every
/// collection it has created.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    closed: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The pre-act check: fails once the owning handle has been closed.
    pub fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::ClosedHandle)
        } else {
            Ok(())
        }
    }
}
