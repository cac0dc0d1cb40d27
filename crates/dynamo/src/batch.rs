//! Batched reads and writes.
//!
//! The service caps BatchGetItem at 100 keys and BatchWriteItem at 25
//! requests, and may return any subset as unprocessed under load. The
//! unprocessed loop here is deliberately separate from the transient
//! retry policy in the client: no backoff of its own, bounded by
//! progress instead of time.

use std::collections::HashSet;

use colstore_common::StoreError;
use serde_json::{Value as Json, json};
use tracing::warn;

use crate::client::DynamoClient;
use crate::types::Expr;

pub const BATCH_GET_LIMIT: usize = 100;
pub const BATCH_WRITE_LIMIT: usize = 25;

/// Consecutive rounds allowed to make no progress before giving up.
const MAX_STALLED_ROUNDS: u32 = 5;

/// Deduplicates keys by their flattened JSON encoding, keeping first
/// occurrences in order.
pub fn dedup_keys(keys: Vec<Json>) -> Vec<Json> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|key| seen.insert(key.to_string()))
        .collect()
}

fn projection_body(projection: Option<&[&str]>) -> (Option<String>, Option<Json>) {
    match projection {
        None => (None, None),
        Some(fields) => {
            let mut expr = Expr::new();
            let placeholders: Vec<String> =
                fields.iter().map(|field| expr.name(field)).collect();
            let mut carrier = json!({});
            expr.apply(&mut carrier);
            (
                Some(placeholders.join(", ")),
                carrier.get("ExpressionAttributeNames").cloned(),
            )
        }
    }
}

fn unprocessed_of(response: &Json, section: &str, table: &str, inner: Option<&str>) -> Vec<Json> {
    let per_table = &response[section][table];
    let list = match inner {
        Some(field) => &per_table[field],
        None => per_table,
    };
    list.as_array().cloned().unwrap_or_default()
}

/// Reads many items by key, retrying unprocessed keys until none remain.
pub async fn batch_get(
    client: &DynamoClient,
    table: &str,
    keys: Vec<Json>,
    projection: Option<&[&str]>,
) -> Result<Vec<Json>, StoreError> {
    let keys = dedup_keys(keys);
    let (projection_expr, names) = projection_body(projection);
    let mut items = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(BATCH_GET_LIMIT) {
        let mut pending = chunk.to_vec();
        let mut stalled = 0u32;
        while !pending.is_empty() {
            let mut request = json!({
                "Keys": pending,
                "ConsistentRead": client.consistent_read(),
            });
            if let Some(expr) = &projection_expr {
                request["ProjectionExpression"] = Json::String(expr.clone());
                if let Some(names) = &names {
                    request["ExpressionAttributeNames"] = names.clone();
                }
            }
            let body = json!({
                "RequestItems": { table: request },
                "ReturnConsumedCapacity": "TOTAL",
            });
            let response = client.call("BatchGetItem", body).await?;
            if let Some(found) = response["Responses"][table].as_array() {
                items.extend(found.iter().cloned());
            }
            let unprocessed = unprocessed_of(&response, "UnprocessedKeys", table, Some("Keys"));
            if unprocessed.len() == pending.len() {
                stalled += 1;
                if stalled >= MAX_STALLED_ROUNDS {
                    return Err(StoreError::Backend {
                        status: None,
                        kind: "UnprocessedKeys".to_string(),
                        message: format!(
                            "batch get made no progress on {} keys",
                            unprocessed.len()
                        ),
                    });
                }
                warn!(table, pending = unprocessed.len(), "batch get stalled, retrying");
            } else {
                stalled = 0;
            }
            pending = unprocessed;
        }
    }
    Ok(items)
}

/// A single BatchWriteItem request entry.
pub fn put_request(item: Json) -> Json {
    json!({ "PutRequest": { "Item": item } })
}

pub fn delete_request(key: Json) -> Json {
    json!({ "DeleteRequest": { "Key": key } })
}

/// Writes (puts and/or deletes) many items, retrying unprocessed
/// entries until none remain.
pub async fn batch_write(
    client: &DynamoClient,
    table: &str,
    requests: Vec<Json>,
) -> Result<(), StoreError> {
    for chunk in requests.chunks(BATCH_WRITE_LIMIT) {
        let mut pending = chunk.to_vec();
        let mut stalled = 0u32;
        while !pending.is_empty() {
            let body = json!({
                "RequestItems": { table: pending },
                "ReturnConsumedCapacity": "TOTAL",
            });
            let response = client.call("BatchWriteItem", body).await?;
            let unprocessed = unprocessed_of(&response, "UnprocessedItems", table, None);
            if unprocessed.len() == pending.len() {
                stalled += 1;
                if stalled >= MAX_STALLED_ROUNDS {
                    return Err(StoreError::Backend {
                        status: None,
                        kind: "UnprocessedItems".to_string(),
                        message: format!(
                            "batch write made no progress on {} requests",
                            unprocessed.len()
                        ),
                    });
                }
                warn!(table, pending = unprocessed.len(), "batch write stalled, retrying");
            } else {
                stalled = 0;
            }
            pending = unprocessed;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_flattens_key_json() {
        let keys = vec![
            json!({"id": {"B": "AQ=="}}),
            json!({"id": {"B": "Ag=="}}),
            json!({"id": {"B": "AQ=="}}),
        ];
        let deduped = dedup_keys(keys);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0]["id"]["B"], "AQ==");
        assert_eq!(deduped[1]["id"]["B"], "Ag==");
    }

    #[test]
    fn projection_carries_attribute_names() {
        let (expr, names) = projection_body(Some(&["id", "state"]));
        let expr = expr.unwrap();
        let names = names.unwrap();
        assert_eq!(expr, "#n0, #n1");
        assert_eq!(names["#n0"], "id");
        assert_eq!(names["#n1"], "state");
        assert_eq!(projection_body(None), (None, None));
    }

    #[test]
    fn unprocessed_extraction() {
        let get_response = json!({
            "Responses": {"t": []},
            "UnprocessedKeys": {"t": {"Keys": [{"id": {"B": "AQ=="}}]}},
        });
        assert_eq!(
            unprocessed_of(&get_response, "UnprocessedKeys", "t", Some("Keys")).len(),
            1
        );
        let write_response = json!({
            "UnprocessedItems": {"t": [{"PutRequest": {"Item": {}}}]},
        });
        assert_eq!(
            unprocessed_of(&write_response, "UnprocessedItems", "t", None).len(),
            1
        );
        assert!(unprocessed_of(&json!({}), "UnprocessedKeys", "t", Some("Keys")).is_empty());
    }
}
