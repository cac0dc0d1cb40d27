//! Wide-column backend over DynamoDB's HTTP API.
//!
//! A collection maps to a primary table hash-keyed on `id` (one GSI per
//! non-unique indexed attribute) plus, when the schema has unique
//! attributes, an auxiliary uniqueness table that emulates unique
//! secondary indexes with conditional writes. Requests are signed
//! (Signature v4), retried on transient failures, and tracked so close
//! can drain them.

pub mod batch;
pub mod client;
pub mod collection;
pub mod engine;
pub mod escape;
pub mod migrate;
pub mod provision;
pub mod sign;
pub mod types;

pub use client::DynamoClient;
pub use engine::DynamoEngine;
pub use provision::{OnDemand, ProvisionResolver, QueryProvision};
pub use sign::Credentials;
