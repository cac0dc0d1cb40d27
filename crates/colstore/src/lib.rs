//! Uniform record/index storage over swappable backends.
//!
//! Connect with a URL, get a [`Database`] handle, open [`Collection`]s
//! by name, and optionally layer field wrappers (compression, envelope
//! encryption) in front of any collection.
//!
//! ```no_run
//! # async fn demo() -> Result<(), colstore::StoreError> {
//! use colstore::{Collection as _, KeySchema, Record, Value, connect};
//!
//! let db = connect("memory://")?;
//! let users = db.collection_with_keys("users", KeySchema::new().unique("email"))?;
//! users
//!     .add(Record::new().set("id", 1).set("email", "a@example.com"))
//!     .await?;
//! let found = users
//!     .get("email", &Value::String("a@example.com".into()), None)
//!     .await?;
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```

mod connect;

pub use colstore_common::{ID_FIELD, IndexEntry, KeySchema, Record, StoreError, Value};
pub use colstore_dynamo::{Credentials, DynamoClient, DynamoEngine, ProvisionResolver};
pub use colstore_storage::{Collection, Database, DbEngine, MemoryEngine, UpdateOptions};
pub use colstore_wrappers::{
    Deflate, FieldTransform, FixedKey, RecordKey, SecretKey, Wrapped, compressed,
    encrypted_by_record, encrypted_by_record_with_master, encrypted_with_key,
};
pub use connect::connect;
