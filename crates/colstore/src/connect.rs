//! Connection-URL dispatch.
//!
//! The scheme selects a backend; everything after it is backend
//! configuration. Unknown schemes and malformed options are rejected
//! before any backend work happens.

use std::sync::Arc;
use std::time::Duration;

use colstore_common::StoreError;
use colstore_dynamo::DynamoEngine;
use colstore_storage::{Database, MemoryEngine};
use tracing::debug;
use url::Url;

/// Backends with companion crates outside this workspace; recognised so
/// the error distinguishes "not wired in" from a typo.
const DELEGATED_SCHEMES: [&str; 5] = ["mongodb", "postgresql", "postgres", "redis", "rediss"];

/// Opens a database handle for a connection URL.
///
/// - `memory://<instance>?simulatedLatency=<ms>` — in-process store;
///   a non-empty instance id is shared process-wide.
/// - `dynamodb://[key:secret@]dynamodb.<region>.amazonaws.com/<prefix>` —
///   wide-column backend, with `tls=false`, `consistentRead=true`, and
///   provisioning hints as query options.
pub fn connect(raw: &str) -> Result<Database, StoreError> {
    let url = Url::parse(raw)
        .map_err(|e| StoreError::Config(format!("invalid connection URL: {e}")))?;
    debug!(scheme = url.scheme(), "connecting");
    match url.scheme() {
        "memory" => Ok(Database::new(Arc::new(memory_engine(&url)?))),
        "dynamodb" => Ok(Database::new(Arc::new(DynamoEngine::from_url(&url)?))),
        scheme if DELEGATED_SCHEMES.contains(&scheme) => Err(StoreError::Config(format!(
            "backend for {scheme:?} is not available in this build"
        ))),
        scheme => Err(StoreError::Config(format!(
            "unsupported connection scheme {scheme:?}"
        ))),
    }
}

fn memory_engine(url: &Url) -> Result<MemoryEngine, StoreError> {
    // The shared-instance id: host plus any path, so `memory://cache`
    // and `memory:///cache` both name an instance.
    let mut instance = url.host_str().unwrap_or_default().to_string();
    instance.push_str(url.path().trim_end_matches('/'));
    let mut engine = if instance.is_empty() {
        MemoryEngine::new()
    } else {
        MemoryEngine::shared(&instance)
    };
    for (key, value) in url.query_pairs() {
        if key == "simulatedLatency" {
            let millis: u64 = value.parse().map_err(|_| {
                StoreError::Config(format!("invalid simulatedLatency {value:?}"))
            })?;
            engine = engine.with_simulated_latency(Duration::from_millis(millis));
        }
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_memory() {
        // Anonymous (private) and named (shared) instances.
        assert!(connect("memory:").is_ok());
        assert!(connect("memory://some-instance?simulatedLatency=5").is_ok());
    }

    #[test]
    fn rejects_bad_latency() {
        assert!(matches!(
            connect("memory://x?simulatedLatency=soon"),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn recognises_delegated_schemes() {
        for scheme in DELEGATED_SCHEMES {
            let err = connect(&format!("{scheme}://host/db")).unwrap_err();
            match err {
                StoreError::Config(message) => assert!(message.contains("not available")),
                other => panic!("expected config rejection, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unknown_schemes_and_garbage() {
        assert!(matches!(
            connect("carrier-pigeon://coop"),
            Err(StoreError::Config(_))
        ));
        assert!(matches!(connect("not a url"), Err(StoreError::Config(_))));
    }

    #[test]
    fn dynamodb_requires_wellformed_host() {
        assert!(matches!(
            connect("dynamodb://k:s@wrong.example.com/prefix"),
            Err(StoreError::Config(_))
        ));
    }
}
