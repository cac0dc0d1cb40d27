//! Storage contract and base skeleton shared by every backend, plus the
//! in-memory reference backend.

pub mod api;
pub mod memory;
pub mod ready;
pub mod store;

pub use api::{Collection, DbEngine, Lifecycle, UpdateOptions};
pub use memory::MemoryEngine;
pub use ready::ReadyGate;
pub use store::Database;
