//! Signed DynamoDB HTTP client.
//!
//! Every operation is a `POST /` with `X-Amz-Target:
//! DynamoDB_20120810.<Op>`. Transient failures (5xx, throttling, and
//! transport errors) are retried with jittered exponential backoff under
//! a single deadline; everything else surfaces verbatim as a typed
//! backend error. Consumed capacity from every response is summed into a
//! per-client counter that tests can read.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use colstore_common::StoreError;
use rand::Rng;
use reqwest::Url;
use serde_json::{Value as Json, json};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::sign::{CONTENT_TYPE, Credentials, SigningKeyCache, sign_dynamo_request};

pub const TARGET_PREFIX: &str = "DynamoDB_20120810.";

pub const MIN_RETRY_DELAY_MS: u64 = 100;
pub const MAX_RETRY_DELAY_MS: u64 = 5_000;
pub const BACKOFF_FACTOR: u64 = 2;
pub const CALL_DEADLINE: Duration = Duration::from_secs(60);

/// Error-type suffixes the service uses for load shedding; all safe to
/// retry.
const TRANSIENT_SUFFIXES: [&str; 4] = [
    "LimitExceededException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
];

/// Synthetic kind for request-level (network) failures.
pub const TRANSPORT_ERROR: &str = "TransportError";

pub struct DynamoClient {
    http: reqwest::Client,
    endpoint: Url,
    host: String,
    region: String,
    credentials: Credentials,
    consistent_read: bool,
    signing_keys: SigningKeyCache,
    /// f64 bits; summed `ConsumedCapacity` units.
    capacity_units: AtomicU64,
    inflight: InflightTracker,
    closed: AtomicBool,
    min_retry_delay: u64,
    max_retry_delay: u64,
    backoff_factor: u64,
    call_deadline: Duration,
}

impl DynamoClient {
    pub fn new(
        endpoint: Url,
        region: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self, StoreError> {
        let mut host = endpoint
            .host_str()
            .ok_or_else(|| StoreError::Config("endpoint is missing a host".to_string()))?
            .to_string();
        if let Some(port) = endpoint.port() {
            host = format!("{host}:{port}");
        }
        Ok(DynamoClient {
            http: reqwest::Client::new(),
            endpoint,
            host,
            region: region.into(),
            credentials,
            consistent_read: false,
            signing_keys: SigningKeyCache::new(),
            capacity_units: AtomicU64::new(0f64.to_bits()),
            inflight: InflightTracker::new(),
            closed: AtomicBool::new(false),
            min_retry_delay: MIN_RETRY_DELAY_MS,
            max_retry_delay: MAX_RETRY_DELAY_MS,
            backoff_factor: BACKOFF_FACTOR,
            call_deadline: CALL_DEADLINE,
        })
    }

    pub fn with_consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }

    /// Whether table reads (GetItem/Scan) should be strongly consistent.
    /// Secondary-index queries are always eventually consistent.
    pub fn consistent_read(&self) -> bool {
        self.consistent_read
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Calls one operation, retrying transient failures until the
    /// deadline would be exceeded.
    pub async fn call(&self, op: &str, body: Json) -> Result<Json, StoreError> {
        if self.is_closed() {
            return Err(StoreError::ClosedHandle);
        }
        let _guard = self.inflight.enter();
        let payload =
            serde_json::to_vec(&body).map_err(|e| StoreError::Codec(e.to_string()))?;
        let deadline = Instant::now() + self.call_deadline;
        let mut delay = self.min_retry_delay;
        loop {
            match self.send(op, &payload).await {
                Ok(response) => {
                    self.record_capacity(&response);
                    return Ok(response);
                }
                Err(err) if is_transient(&err) => {
                    let wait = jittered(delay);
                    if Instant::now() + wait >= deadline {
                        return Err(err);
                    }
                    debug!(op, error = %err, wait_ms = wait.as_millis() as u64, "retrying transient error");
                    tokio::time::sleep(wait).await;
                    delay = (delay * self.backoff_factor).min(self.max_retry_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send(&self, op: &str, payload: &[u8]) -> Result<Json, StoreError> {
        let target = format!("{TARGET_PREFIX}{op}");
        let signed = sign_dynamo_request(
            &self.credentials,
            &self.signing_keys,
            &self.region,
            &self.host,
            &target,
            Utc::now(),
            payload,
        );
        trace!(op, bytes = payload.len(), "sending request");
        let response = self
            .http
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-target", &target)
            .header("authorization", &signed.authorization)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status().as_u16();
        let raw = response.bytes().await.map_err(transport_error)?;
        if status >= 300 {
            let parsed: Json = serde_json::from_slice(&raw).unwrap_or(Json::Null);
            let kind = parsed
                .get("__type")
                .and_then(Json::as_str)
                .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
                .unwrap_or_else(|| "UnknownError".to_string());
            let message = parsed
                .get("message")
                .or_else(|| parsed.get("Message"))
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(StoreError::Backend {
                status: Some(status),
                kind,
                message,
            });
        }
        if raw.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_slice(&raw).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn record_capacity(&self, response: &Json) {
        let mut units = 0.0;
        match response.get("ConsumedCapacity") {
            Some(Json::Array(entries)) => {
                for entry in entries {
                    units += entry
                        .get("CapacityUnits")
                        .and_then(Json::as_f64)
                        .unwrap_or(0.0);
                }
            }
            Some(entry) => {
                units += entry
                    .get("CapacityUnits")
                    .and_then(Json::as_f64)
                    .unwrap_or(0.0);
            }
            None => {}
        }
        if units > 0.0 {
            let mut current = self.capacity_units.load(Ordering::Relaxed);
            loop {
                let next = (f64::from_bits(current) + units).to_bits();
                match self.capacity_units.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    /// Total consumed capacity units observed on this client.
    pub fn consumed_capacity(&self) -> f64 {
        f64::from_bits(self.capacity_units.load(Ordering::Relaxed))
    }

    /// Fails new calls fast and waits for in-flight ones to settle.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inflight.settle().await;
    }

    /// One page of a `Scan`/`Query`, resuming from `start`.
    pub async fn page(
        &self,
        op: &str,
        mut body: Json,
        start: Option<Json>,
    ) -> Result<(Vec<Json>, Option<Json>), StoreError> {
        if let Some(key) = start {
            body["ExclusiveStartKey"] = key;
        }
        let response = self.call(op, body).await?;
        let items = response
            .get("Items")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        let next = response
            .get("LastEvaluatedKey")
            .filter(|key| !key.is_null())
            .cloned();
        Ok((items, next))
    }

    /// Materialises every page.
    pub async fn collect_pages(&self, op: &str, body: Json) -> Result<Vec<Json>, StoreError> {
        let mut items = Vec::new();
        let mut start = None;
        loop {
            let (page, next) = self.page(op, body.clone(), start).await?;
            items.extend(page);
            match next {
                Some(key) => start = Some(key),
                None => return Ok(items),
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    StoreError::Backend {
        status: None,
        kind: TRANSPORT_ERROR.to_string(),
        message: err.to_string(),
    }
}

/// Retry classification: server errors, throttling families, and
/// transport failures.
pub fn is_transient(error: &StoreError) -> bool {
    match error {
        StoreError::Backend { status, kind, .. } => {
            status.is_some_and(|s| s >= 500)
                || kind == TRANSPORT_ERROR
                || TRANSIENT_SUFFIXES.iter().any(|suffix| kind.ends_with(suffix))
        }
        _ => false,
    }
}

pub fn is_conditional_failure(error: &StoreError) -> bool {
    matches!(error, StoreError::Backend { kind, .. } if kind == "ConditionalCheckFailedException")
}

pub fn is_resource_in_use(error: &StoreError) -> bool {
    matches!(error, StoreError::Backend { kind, .. } if kind == "ResourceInUseException")
}

pub fn is_resource_not_found(error: &StoreError) -> bool {
    matches!(error, StoreError::Backend { kind, .. } if kind == "ResourceNotFoundException")
}

fn jittered(delay_ms: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=delay_ms / 2);
    Duration::from_millis(delay_ms + jitter)
}

/// Tracks outstanding requests so `close` can wait for them without
/// blocking new-request rejection.
pub struct InflightTracker {
    count: AtomicUsize,
    drained: Notify,
}

impl InflightTracker {
    pub fn new() -> Self {
        InflightTracker {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn enter(&self) -> InflightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard { tracker: self }
    }

    /// Waits until every guard has been dropped. Settling is best-effort
    /// by construction: guards are dropped on success, failure, and
    /// cancellation alike.
    pub async fn settle(&self) {
        loop {
            let drained = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl Default for InflightTracker {
    fn default() -> Self {
        InflightTracker::new()
    }
}

pub struct InflightGuard<'a> {
    tracker: &'a InflightTracker,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(status: Option<u16>, kind: &str) -> StoreError {
        StoreError::Backend {
            status,
            kind: kind.to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&backend(Some(500), "InternalServerError")));
        assert!(is_transient(&backend(Some(503), "ServiceUnavailable")));
        assert!(is_transient(&backend(
            Some(400),
            "ProvisionedThroughputExceededException"
        )));
        assert!(is_transient(&backend(Some(400), "ThrottlingException")));
        assert!(is_transient(&backend(Some(400), "RequestLimitExceeded")));
        assert!(is_transient(&backend(Some(400), "LimitExceededException")));
        // Suffix match covers namespaced kinds.
        assert!(is_transient(&backend(
            Some(400),
            "com.amazonaws.dynamodb.v20120810.LimitExceededException"
        )));
        assert!(is_transient(&backend(None, TRANSPORT_ERROR)));

        assert!(!is_transient(&backend(
            Some(400),
            "ConditionalCheckFailedException"
        )));
        assert!(!is_transient(&backend(Some(400), "ValidationException")));
        assert!(!is_transient(&StoreError::ClosedHandle));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..32 {
            let wait = jittered(100).as_millis() as u64;
            assert!((100..=150).contains(&wait));
        }
    }

    #[tokio::test]
    async fn inflight_settles_when_guards_drop() {
        let tracker = InflightTracker::new();
        {
            let _a = tracker.enter();
            let _b = tracker.enter();
        }
        tracker.settle().await;

        let guard = tracker.enter();
        let settled = {
            let count = tracker.count.load(Ordering::SeqCst);
            assert_eq!(count, 1);
            drop(guard);
            tracker.settle()
        };
        settled.await;
    }
}
