use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use colstore_common::{KeySchema, StoreError};
use tracing::debug;

use crate::api::{Collection, DbEngine, Lifecycle};

/// A database handle: owns the collection cache and the shared lifecycle
/// state, and funnels collection construction through the engine.
///
/// Collections are created lazily on first request and cached by raw
/// name, so a repeated request returns the same instance. Closing the
/// handle is one-way; afterwards every operation on the handle and on
/// its collections fails with [`StoreError::ClosedHandle`], while
/// operations already in flight are allowed to finish.
pub struct Database {
    engine: Arc<dyn DbEngine>,
    lifecycle: Lifecycle,
    collections: Mutex<HashMap<String, Arc<dyn Collection>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    pub fn new(engine: Arc<dyn DbEngine>) -> Self {
        Database {
            engine,
            lifecycle: Lifecycle::new(),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a collection with no secondary indexes.
    pub fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, StoreError> {
        self.collection_with_keys(name, KeySchema::new())
    }

    /// Opens a collection with the given key schema. The schema only
    /// takes effect the first time a name is seen by this handle; later
    /// requests return the cached instance.
    pub fn collection_with_keys(
        &self,
        name: &str,
        keys: KeySchema,
    ) -> Result<Arc<dyn Collection>, StoreError> {
        keys.validate()?;
        let mut cache = self
            .collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match cache.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                debug!(collection = name, "opening collection");
                let collection =
                    self.engine
                        .open_collection(name, keys, self.lifecycle.clone())?;
                Ok(slot.insert(collection).clone())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Closes the handle: new operations fail fast, in-flight ones are
    /// awaited by the engine before it reports closed.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.lifecycle.check_open()?;
        self.lifecycle.close();
        self.engine.close().await
    }
}
