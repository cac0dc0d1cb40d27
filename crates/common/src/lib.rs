//! Shared data model for the collection storage backends: field values
//! and their codec, records, key schemas, and the error taxonomy.

pub mod error;
pub mod keys;
pub mod record;
pub mod value;

pub use error::StoreError;
pub use keys::{IndexEntry, KeySchema};
pub use record::{ID_FIELD, Record};
pub use value::Value;
