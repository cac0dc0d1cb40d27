//! Reference backend: maps plus inverted indexes, fully in process.
//!
//! Collections are serialised behind one async mutex each, so duplicate
//! checks always complete before any mutation and failed writes leave no
//! partial state. Named instances are shared process-wide, which lets
//! independent handles observe the same data, and an optional simulated
//! latency makes timing-sensitive tests honest.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use colstore_common::{ID_FIELD, KeySchema, Record, StoreError, Value, value};
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::api::{Collection, DbEngine, Lifecycle, UpdateOptions};

static SHARED_INSTANCES: Lazy<StdMutex<HashMap<String, Arc<MemoryShared>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

#[derive(Default)]
struct MemoryShared {
    collections: StdMutex<HashMap<String, Arc<Mutex<MemInner>>>>,
}

/// The in-memory engine. `shared` instances with the same id alias the
/// same underlying data for the lifetime of the process.
pub struct MemoryEngine {
    shared: Arc<MemoryShared>,
    latency: Option<Duration>,
}

impl MemoryEngine {
    /// A private instance, dropped with the engine.
    pub fn new() -> Self {
        MemoryEngine {
            shared: Arc::new(MemoryShared::default()),
            latency: None,
        }
    }

    /// A named instance shared across every handle in this process.
    pub fn shared(instance: &str) -> Self {
        let mut registry = SHARED_INSTANCES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let shared = registry
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(MemoryShared::default()))
            .clone();
        MemoryEngine {
            shared,
            latency: None,
        }
    }

    /// Sleeps this long at the start of every operation.
    pub fn with_simulated_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        MemoryEngine::new()
    }
}

#[async_trait]
impl DbEngine for MemoryEngine {
    fn open_collection(
        &self,
        name: &str,
        keys: KeySchema,
        lifecycle: Lifecycle,
    ) -> Result<Arc<dyn Collection>, StoreError> {
        let inner = {
            let mut collections = self
                .shared
                .collections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(MemInner::default())))
                .clone()
        };
        Ok(Arc::new(MemoryCollection {
            name: name.to_string(),
            keys,
            inner,
            lifecycle,
            latency: self.latency,
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemInner {
    /// Codec bytes of the id, so ids hash and compare uniformly.
    records: HashMap<Vec<u8>, Record>,
    indexes: HashMap<String, AttrIndex>,
}

/// Inverted index for one attribute: codec bytes of the value -> holder
/// ids. Uniqueness is enforced from the key schema, not stored here.
#[derive(Default)]
struct AttrIndex {
    entries: HashMap<Vec<u8>, HashSet<Vec<u8>>>,
}

struct MemoryCollection {
    name: String,
    keys: KeySchema,
    inner: Arc<Mutex<MemInner>>,
    lifecycle: Lifecycle,
    latency: Option<Duration>,
}

impl MemoryCollection {
    async fn begin(&self) -> Result<MutexGuard<'_, MemInner>, StoreError> {
        self.lifecycle.check_open()?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut inner = self.inner.lock().await;
        ensure_indexes(&self.keys, &mut inner)?;
        Ok(inner)
    }

    fn matching_ids(
        &self,
        inner: &MemInner,
        attribute: &str,
        filter: &Value,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let key = value::to_bytes(filter)?;
        if attribute == ID_FIELD {
            return Ok(if inner.records.contains_key(&key) {
                vec![key]
            } else {
                Vec::new()
            });
        }
        let index = inner
            .indexes
            .get(attribute)
            .ok_or_else(|| StoreError::NotIndexed(attribute.to_string()))?;
        Ok(index
            .entries
            .get(&key)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Insert with full duplicate checking; shared by `add` and the
    /// upsert-miss path. Checks run to completion before any mutation.
    fn insert_locked(&self, inner: &mut MemInner, record: Record) -> Result<(), StoreError> {
        let id_key = value::to_bytes(record.id()?)?;
        if inner.records.contains_key(&id_key) {
            return Err(StoreError::duplicate(&self.name, ID_FIELD));
        }
        for attribute in self.keys.unique_attributes() {
            let Some(taken) = record.get(attribute) else {
                continue;
            };
            let taken_key = value::to_bytes(taken)?;
            if let Some(index) = inner.indexes.get(attribute) {
                if index
                    .entries
                    .get(&taken_key)
                    .is_some_and(|holders| !holders.is_empty())
                {
                    return Err(StoreError::duplicate(&self.name, attribute));
                }
            }
        }
        add_to_indexes(&mut inner.indexes, &id_key, &record)?;
        inner.records.insert(id_key, record);
        Ok(())
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn indices(&self) -> &KeySchema {
        &self.keys
    }

    async fn add(&self, record: Record) -> Result<(), StoreError> {
        let mut inner = self.begin().await?;
        trace!(collection = %self.name, "add");
        self.insert_locked(&mut inner, record)
    }

    async fn get(
        &self,
        attribute: &str,
        filter: &Value,
        fields: Option<&[&str]>,
    ) -> Result<Option<Record>, StoreError> {
        let inner = self.begin().await?;
        let ids = self.matching_ids(&inner, attribute, filter)?;
        Ok(ids
            .first()
            .and_then(|id| inner.records.get(id))
            .map(|record| record.clone().project_opt(fields)))
    }

    async fn get_all(
        &self,
        filter: Option<(&str, &Value)>,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Record>, StoreError> {
        let inner = self.begin().await?;
        let records = match filter {
            None => inner.records.values().cloned().collect::<Vec<_>>(),
            Some((attribute, filter)) => self
                .matching_ids(&inner, attribute, filter)?
                .iter()
                .filter_map(|id| inner.records.get(id).cloned())
                .collect(),
        };
        Ok(records
            .into_iter()
            .map(|record| record.project_opt(fields))
            .collect())
    }

    async fn update(
        &self,
        attribute: &str,
        filter: &Value,
        delta: Record,
        options: UpdateOptions,
    ) -> Result<(), StoreError> {
        if attribute == ID_FIELD {
            if let Some(delta_id) = delta.get(ID_FIELD) {
                if !delta_id.is_valid_id() {
                    return Err(StoreError::InvalidId);
                }
                if delta_id != filter {
                    return Err(StoreError::IdImmutable);
                }
            }
        }
        let mut inner = self.begin().await?;
        let ids = self.matching_ids(&inner, attribute, filter)?;

        if ids.is_empty() {
            if options.upsert {
                if attribute != ID_FIELD {
                    return Err(StoreError::UpsertRequiresId);
                }
                let mut record = delta;
                record.insert(ID_FIELD, filter.clone());
                return self.insert_locked(&mut inner, record);
            }
            return Ok(());
        }

        if let Some(delta_id) = delta.get(ID_FIELD) {
            if !delta_id.is_valid_id() {
                return Err(StoreError::InvalidId);
            }
            let delta_key = value::to_bytes(delta_id)?;
            if ids.len() > 1 || ids[0] != delta_key {
                return Err(StoreError::IdImmutable);
            }
        }

        // Duplicate checks before any mutation (atomicity of rejection).
        let touched: Vec<&str> = self
            .keys
            .unique_attributes()
            .filter(|u| delta.contains(u))
            .collect();
        if let Some(first) = touched.first() {
            if ids.len() > 1 {
                // Every match would receive the same unique value.
                return Err(StoreError::duplicate(&self.name, *first));
            }
            for unique_attr in &touched {
                let Some(new_value) = delta.get(unique_attr) else {
                    continue;
                };
                let new_key = value::to_bytes(new_value)?;
                if let Some(index) = inner.indexes.get(*unique_attr) {
                    if let Some(holders) = index.entries.get(&new_key) {
                        if holders.iter().any(|holder| holder != &ids[0]) {
                            return Err(StoreError::duplicate(&self.name, *unique_attr));
                        }
                    }
                }
            }
        }

        for id in &ids {
            let Some(old) = inner.records.get(id).cloned() else {
                continue;
            };
            remove_from_indexes(&mut inner.indexes, id, &old)?;
            let merged = old.merged_with(&delta);
            add_to_indexes(&mut inner.indexes, id, &merged)?;
            inner.records.insert(id.clone(), merged);
        }
        Ok(())
    }

    async fn remove(&self, attribute: &str, filter: &Value) -> Result<usize, StoreError> {
        let mut inner = self.begin().await?;
        let ids = self.matching_ids(&inner, attribute, filter)?;
        let mut removed = 0;
        for id in &ids {
            if let Some(old) = inner.records.remove(id) {
                remove_from_indexes(&mut inner.indexes, id, &old)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Makes sure every configured attribute has an inverted index, building
/// missing ones from the stored records. Lets a shared instance be
/// reopened with a wider key schema.
fn ensure_indexes(keys: &KeySchema, inner: &mut MemInner) -> Result<(), StoreError> {
    for entry in keys.entries() {
        if inner.indexes.contains_key(&entry.attribute) {
            continue;
        }
        let mut index = AttrIndex::default();
        for (id, record) in &inner.records {
            if let Some(indexed) = record.get(&entry.attribute) {
                index
                    .entries
                    .entry(value::to_bytes(indexed)?)
                    .or_default()
                    .insert(id.clone());
            }
        }
        inner.indexes.insert(entry.attribute.clone(), index);
    }
    Ok(())
}

fn add_to_indexes(
    indexes: &mut HashMap<String, AttrIndex>,
    id: &[u8],
    record: &Record,
) -> Result<(), StoreError> {
    for (attribute, index) in indexes.iter_mut() {
        if let Some(indexed) = record.get(attribute) {
            index
                .entries
                .entry(value::to_bytes(indexed)?)
                .or_default()
                .insert(id.to_vec());
        }
    }
    Ok(())
}

fn remove_from_indexes(
    indexes: &mut HashMap<String, AttrIndex>,
    id: &[u8],
    record: &Record,
) -> Result<(), StoreError> {
    for (attribute, index) in indexes.iter_mut() {
        if let Some(indexed) = record.get(attribute) {
            let key = value::to_bytes(indexed)?;
            if let Some(holders) = index.entries.get_mut(&key) {
                holders.remove(id);
                if holders.is_empty() {
                    index.entries.remove(&key);
                }
            }
        }
    }
    Ok(())
}
