//! Transparent field wrappers: decorators over any collection that
//! transform a declared set of fields on write and read.
//!
//! Wrappers stack. When combining compression with encryption, make
//! compression the outer wrapper so it sees plaintext; ciphertext does
//! not deflate.

pub mod cache;
pub mod compress;
pub mod encrypt;
pub mod wrapped;

pub use cache::KeyCache;
pub use compress::{DEFAULT_COMPRESSION_THRESHOLD, Deflate};
pub use encrypt::{
    FixedKey, KEY_FIELD, KEY_LEN, RecordKey, SecretKey, encrypted_by_record,
    encrypted_by_record_with_master, encrypted_with_key,
};
pub use wrapped::{FieldTransform, Wrapped};

use std::sync::Arc;

use colstore_common::StoreError;
use colstore_storage::api::Collection;

/// Compresses `fields` with the default threshold.
pub fn compressed(
    inner: Arc<dyn Collection>,
    fields: &[&str],
) -> Result<Arc<dyn Collection>, StoreError> {
    Ok(Arc::new(Wrapped::new(inner, fields, Deflate::new())?))
}
