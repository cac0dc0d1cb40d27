//! Envelope encryption transforms.
//!
//! Stored form is `algorithm-id || nonce || ciphertext` over AES-256-GCM
//! with a fresh nonce per write. Three flavours: one fixed key for every
//! record, a lazily-generated key per record persisted in a caller-
//! supplied key collection, and the per-record variant with the key
//! collection itself encrypted at rest under a master key.

use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use async_trait::async_trait;
use colstore_common::{ID_FIELD, Record, StoreError, Value, value};
use colstore_storage::api::Collection;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cache::KeyCache;
use crate::wrapped::{FieldTransform, Wrapped};

pub const KEY_LEN: usize = 32;
/// Field of the key collection that holds the per-record key material.
pub const KEY_FIELD: &str = "key";

const ALG_AES256_GCM: u8 = 0x01;
const NONCE_LEN: usize = 12;

/// Key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        SecretKey(bytes)
    }

    pub fn generate() -> Self {
        SecretKey(Aes256Gcm::generate_key(OsRng).into())
    }
}

fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| StoreError::Codec("encryption failed".to_string()))?;
    let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    envelope.push(ALG_AES256_GCM);
    envelope.extend_from_slice(nonce.as_slice());
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

fn open(key: &SecretKey, envelope: &[u8]) -> Result<Vec<u8>, StoreError> {
    if envelope.len() < 1 + NONCE_LEN {
        return Err(StoreError::Codec("encrypted payload too short".to_string()));
    }
    if envelope[0] != ALG_AES256_GCM {
        return Err(StoreError::Codec(format!(
            "unknown encryption algorithm 0x{:02x}",
            envelope[0]
        )));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Nonce::from_slice(&envelope[1..1 + NONCE_LEN]);
    cipher
        .decrypt(nonce, &envelope[1 + NONCE_LEN..])
        .map_err(|_| StoreError::Codec("decryption failed".to_string()))
}

fn encrypt_value(key: &SecretKey, plain: &Value) -> Result<Value, StoreError> {
    Ok(Value::Binary(seal(key, &value::to_bytes(plain)?)?.into()))
}

fn decrypt_value(key: &SecretKey, envelope: &[u8]) -> Result<Value, StoreError> {
    value::from_bytes(&open(key, envelope)?)
}

/// One externally supplied key for every record.
pub struct FixedKey {
    key: SecretKey,
    allow_raw: bool,
}

impl FixedKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        FixedKey {
            key: SecretKey::new(key),
            allow_raw: false,
        }
    }

    /// Pass non-binary stored values through unchanged (data written
    /// before encryption was enabled). Binary payloads are always
    /// treated as encrypted.
    pub fn with_allow_raw(mut self, allow_raw: bool) -> Self {
        self.allow_raw = allow_raw;
        self
    }
}

#[async_trait]
impl FieldTransform for FixedKey {
    type Context = ();

    async fn wrap_context(&self, _record: &Record) -> Result<(), StoreError> {
        Ok(())
    }

    async fn unwrap_context(&self, _record: &Record) -> Result<(), StoreError> {
        Ok(())
    }

    fn wrap(&self, _context: &(), plain: &Value) -> Result<Value, StoreError> {
        encrypt_value(&self.key, plain)
    }

    fn unwrap(&self, _context: &(), stored: &Value) -> Result<Value, StoreError> {
        match stored {
            Value::Binary(envelope) => decrypt_value(&self.key, envelope),
            other if self.allow_raw => Ok(other.clone()),
            _ => Err(StoreError::Codec(
                "stored value is not encrypted".to_string(),
            )),
        }
    }
}

/// A fresh key per record, generated lazily on first write, persisted in
/// the key collection under the record's id, and cached in an LRU.
pub struct RecordKey {
    keys: Arc<dyn Collection>,
    cache: Mutex<KeyCache<Vec<u8>, SecretKey>>,
    allow_raw: bool,
}

impl RecordKey {
    pub fn new(keys: Arc<dyn Collection>, cache_capacity: usize) -> Self {
        RecordKey {
            keys,
            cache: Mutex::new(KeyCache::new(cache_capacity)),
            allow_raw: false,
        }
    }

    pub fn with_allow_raw(mut self, allow_raw: bool) -> Self {
        self.allow_raw = allow_raw;
        self
    }

    fn record_id(record: &Record) -> Result<&Value, StoreError> {
        match record.get(ID_FIELD) {
            Some(id) if id.is_valid_id() => Ok(id),
            _ => Err(StoreError::MissingEncryptionId),
        }
    }

    fn secret_of(row: &Record) -> Result<SecretKey, StoreError> {
        let material = row
            .get(KEY_FIELD)
            .and_then(Value::as_bytes)
            .ok_or_else(|| StoreError::Codec("malformed key record".to_string()))?;
        let bytes: [u8; KEY_LEN] = material
            .try_into()
            .map_err(|_| StoreError::Codec("malformed key record".to_string()))?;
        Ok(SecretKey::new(bytes))
    }

    /// Cache, then the key collection. `None` when no key exists.
    async fn load_key(&self, id: &Value) -> Result<Option<SecretKey>, StoreError> {
        let cache_key = value::to_bytes(id)?;
        {
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(key) = cache.get(&cache_key) {
                return Ok(Some(key.clone()));
            }
        }
        let Some(row) = self.keys.get(ID_FIELD, id, Some(&[KEY_FIELD])).await? else {
            return Ok(None);
        };
        let key = Self::secret_of(&row)?;
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(cache_key, key.clone());
        Ok(Some(key))
    }

    async fn obtain_or_create(&self, id: &Value) -> Result<SecretKey, StoreError> {
        if let Some(key) = self.load_key(id).await? {
            return Ok(key);
        }
        let fresh = SecretKey::generate();
        let mut row = Record::new();
        row.insert(ID_FIELD, id.clone());
        row.insert(KEY_FIELD, Value::Binary(fresh.0.to_vec().into()));
        match self.keys.add(row).await {
            Ok(()) => {
                debug!("generated encryption key for record");
                self.cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(value::to_bytes(id)?, fresh.clone());
                Ok(fresh)
            }
            // Lost a creation race; the winner's key is authoritative.
            Err(err) if err.is_duplicate() => self
                .load_key(id)
                .await?
                .ok_or(StoreError::MissingEncryptionKey),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl FieldTransform for RecordKey {
    type Context = Option<SecretKey>;

    async fn wrap_context(&self, record: &Record) -> Result<Option<SecretKey>, StoreError> {
        let id = Self::record_id(record)?;
        Ok(Some(self.obtain_or_create(id).await?))
    }

    async fn unwrap_context(&self, record: &Record) -> Result<Option<SecretKey>, StoreError> {
        let id = Self::record_id(record)?;
        self.load_key(id).await
    }

    fn wrap(&self, context: &Option<SecretKey>, plain: &Value) -> Result<Value, StoreError> {
        let key = context.as_ref().ok_or(StoreError::MissingEncryptionKey)?;
        encrypt_value(key, plain)
    }

    fn unwrap(&self, context: &Option<SecretKey>, stored: &Value) -> Result<Value, StoreError> {
        match stored {
            Value::Binary(envelope) => {
                // Binary payloads are always treated as encrypted.
                let key = context.as_ref().ok_or(StoreError::MissingEncryptionKey)?;
                decrypt_value(key, envelope)
            }
            other if self.allow_raw => Ok(other.clone()),
            _ => Err(StoreError::Codec(
                "stored value is not encrypted".to_string(),
            )),
        }
    }

    fn removes_individually(&self) -> bool {
        true
    }

    /// Deleting a record deletes its key and evicts the cache entry.
    async fn pre_remove(&self, id: &Value) -> Result<(), StoreError> {
        self.keys.remove(ID_FIELD, id).await?;
        let cache_key = value::to_bytes(id)?;
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&cache_key);
        Ok(())
    }
}

/// Encrypts `fields` with one externally supplied key.
pub fn encrypted_with_key(
    inner: Arc<dyn Collection>,
    fields: &[&str],
    key: [u8; KEY_LEN],
) -> Result<Arc<dyn Collection>, StoreError> {
    Ok(Arc::new(Wrapped::new(inner, fields, FixedKey::new(key))?))
}

/// Encrypts `fields` with a per-record key held in `key_collection`.
pub fn encrypted_by_record(
    inner: Arc<dyn Collection>,
    fields: &[&str],
    key_collection: Arc<dyn Collection>,
    cache_capacity: usize,
) -> Result<Arc<dyn Collection>, StoreError> {
    Ok(Arc::new(Wrapped::new(
        inner,
        fields,
        RecordKey::new(key_collection, cache_capacity),
    )?))
}

/// Per-record keys, themselves encrypted at rest under `master_key`.
pub fn encrypted_by_record_with_master(
    inner: Arc<dyn Collection>,
    fields: &[&str],
    key_collection: Arc<dyn Collection>,
    master_key: [u8; KEY_LEN],
    cache_capacity: usize,
) -> Result<Arc<dyn Collection>, StoreError> {
    let keys_at_rest = encrypted_with_key(key_collection, &[KEY_FIELD], master_key)?;
    encrypted_by_record(inner, fields, keys_at_rest, cache_capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip_with_fresh_nonces() {
        let key = SecretKey::generate();
        let sealed_a = seal(&key, b"payload").unwrap();
        let sealed_b = seal(&key, b"payload").unwrap();
        assert_ne!(sealed_a, sealed_b);
        assert_eq!(open(&key, &sealed_a).unwrap(), b"payload");
        assert_eq!(open(&key, &sealed_b).unwrap(), b"payload");
    }

    #[test]
    fn rejects_unknown_algorithm_and_tampering() {
        let key = SecretKey::generate();
        let mut sealed = seal(&key, b"payload").unwrap();
        sealed[0] = 0x7f;
        assert!(open(&key, &sealed).is_err());

        let mut tampered = seal(&key, b"payload").unwrap();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(open(&key, &tampered).is_err());

        assert!(open(&key, &[ALG_AES256_GCM, 0, 0]).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&SecretKey::generate(), b"payload").unwrap();
        assert!(open(&SecretKey::generate(), &sealed).is_err());
    }

    #[test]
    fn fixed_key_value_round_trip() {
        let transform = FixedKey::new([7u8; KEY_LEN]);
        let plain = Value::String("secret".to_string());
        let stored = transform.wrap(&(), &plain).unwrap();
        assert!(matches!(stored, Value::Binary(_)));
        assert_eq!(transform.unwrap(&(), &stored).unwrap(), plain);
    }

    #[test]
    fn allow_raw_passes_plain_values_only() {
        let strict = FixedKey::new([7u8; KEY_LEN]);
        let tolerant = FixedKey::new([7u8; KEY_LEN]).with_allow_raw(true);
        let legacy = Value::String("legacy".to_string());
        assert!(strict.unwrap(&(), &legacy).is_err());
        assert_eq!(tolerant.unwrap(&(), &legacy).unwrap(), legacy);
        // Binary always decrypts, even in allow-raw mode.
        let garbage = Value::Binary(vec![0x02, 1, 2, 3].into());
        assert!(tolerant.unwrap(&(), &garbage).is_err());
    }
}
