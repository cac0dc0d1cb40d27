//! Table creation and online reconfiguration.
//!
//! Collection initialisation is idempotent: it creates the primary table
//! with its full GSI set or reconciles an existing table towards it
//! (surplus indexes dropped, missing ones added, one at a time with the
//! table back to ACTIVE between steps), ensures or removes the
//! uniqueness table, backfills uniqueness rows for newly-unique
//! attributes, and finally polls until the table and every index report
//! ACTIVE.

use std::sync::Arc;
use std::time::Duration;

use colstore_common::{ID_FIELD, KeySchema, StoreError, value};
use serde_json::{Value as Json, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{batch_write, put_request};
use crate::client::{DynamoClient, is_resource_in_use, is_resource_not_found};
use crate::escape::escape_name;
use crate::provision::{ProvisionResolver, combined_throughput};
use crate::types::{
    SENTINEL_CONTENT, UNIQUE_FIELD, attr_bytes, attr_string_set, decode_item, ix_content, ix_key,
    string_set_of,
};

/// Polling deadline for table readiness.
pub const TABLE_WAIT_DEADLINE: Duration = Duration::from_secs(60);
const WAIT_MIN_DELAY_MS: u64 = 200;
const WAIT_MAX_DELAY_MS: u64 = 5_000;

/// Everything the init task needs to know about one collection.
pub struct CollectionSpec {
    /// Raw collection name, used for provisioning lookups.
    pub collection: String,
    pub table: String,
    pub unique_table: String,
    pub keys: KeySchema,
}

/// The idempotent initialisation task scheduled at collection
/// construction. The primary and uniqueness tables are ensured in
/// parallel.
pub async fn initialise(
    client: Arc<DynamoClient>,
    spec: CollectionSpec,
    provision: Arc<dyn ProvisionResolver>,
) -> Result<(), StoreError> {
    let (primary, unique) = tokio::join!(
        ensure_primary_table(&client, &spec, provision.as_ref()),
        ensure_unique_table(&client, &spec, provision.as_ref()),
    );
    primary?;
    unique?;
    if spec.keys.has_unique() {
        // Backfill scans the primary table, so both must be readable.
        wait_for_table(&client, &spec.table, true).await?;
        wait_for_table(&client, &spec.unique_table, false).await?;
        migrate_unique_rows(&client, &spec).await?;
    }
    wait_for_table(&client, &spec.table, true).await
}

fn throughput_json((read, write): (u64, u64)) -> Json {
    json!({ "ReadCapacityUnits": read, "WriteCapacityUnits": write })
}

fn apply_billing(body: &mut Json, throughput: Option<(u64, u64)>) {
    match throughput {
        Some(units) => body["ProvisionedThroughput"] = throughput_json(units),
        None => body["BillingMode"] = Json::String("PAY_PER_REQUEST".to_string()),
    }
}

fn gsi_create_json(
    spec: &CollectionSpec,
    provision: &dyn ProvisionResolver,
    attribute: &str,
    table_throughput: Option<(u64, u64)>,
) -> Json {
    let mut gsi = json!({
        "IndexName": escape_name(attribute),
        "KeySchema": [{ "AttributeName": attribute, "KeyType": "HASH" }],
        "Projection": { "ProjectionType": "KEYS_ONLY" },
    });
    // GSIs need explicit throughput only on provisioned tables.
    if table_throughput.is_some() {
        let units = provision
            .resolve(&spec.collection, Some(attribute))
            .or(table_throughput)
            .unwrap_or((1, 1));
        gsi["ProvisionedThroughput"] = throughput_json(units);
    }
    gsi
}

async fn ensure_primary_table(
    client: &DynamoClient,
    spec: &CollectionSpec,
    provision: &dyn ProvisionResolver,
) -> Result<(), StoreError> {
    let table_throughput = provision.resolve(&spec.collection, None);
    let mut definitions = vec![json!({ "AttributeName": ID_FIELD, "AttributeType": "B" })];
    let mut gsis = Vec::new();
    for attribute in spec.keys.non_unique_attributes() {
        definitions.push(json!({ "AttributeName": attribute, "AttributeType": "B" }));
        gsis.push(gsi_create_json(spec, provision, attribute, table_throughput));
    }
    let mut body = json!({
        "TableName": spec.table,
        "AttributeDefinitions": definitions,
        "KeySchema": [{ "AttributeName": ID_FIELD, "KeyType": "HASH" }],
    });
    apply_billing(&mut body, table_throughput);
    if !gsis.is_empty() {
        body["GlobalSecondaryIndexes"] = Json::Array(gsis);
    }
    match client.call("CreateTable", body).await {
        Ok(_) => {
            info!(table = %spec.table, "created table");
            Ok(())
        }
        Err(err) if is_resource_in_use(&err) => {
            reconcile_indexes(client, spec, provision, table_throughput).await
        }
        Err(err) => Err(err),
    }
}

/// `(index name, hash attribute)` pairs of a table description.
fn described_indexes(description: &Json) -> Vec<(String, String)> {
    description["Table"]["GlobalSecondaryIndexes"]
        .as_array()
        .map(|gsis| {
            gsis.iter()
                .filter_map(|gsi| {
                    let name = gsi["IndexName"].as_str()?;
                    let attribute = gsi["KeySchema"]
                        .as_array()?
                        .iter()
                        .find(|entry| entry["KeyType"] == "HASH")?["AttributeName"]
                        .as_str()?;
                    Some((name.to_string(), attribute.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Splits current vs desired indexes into deletions and additions.
/// An existing index whose name matches but whose hash key differs is an
/// incompatible reconfiguration and fails the whole init.
fn diff_indexes(
    current: &[(String, String)],
    desired: &[(String, String)],
) -> Result<(Vec<String>, Vec<(String, String)>), StoreError> {
    for (name, attribute) in current {
        if let Some((_, wanted)) = desired.iter().find(|(n, _)| n == name) {
            if wanted != attribute {
                return Err(StoreError::Config(format!(
                    "index {name} exists with an incompatible key schema \
                     (hashed on {attribute}, wanted {wanted})"
                )));
            }
        }
    }
    let surplus = current
        .iter()
        .filter(|(name, _)| !desired.iter().any(|(n, _)| n == name))
        .map(|(name, _)| name.clone())
        .collect();
    let missing = desired
        .iter()
        .filter(|(name, _)| !current.iter().any(|(n, _)| n == name))
        .cloned()
        .collect();
    Ok((surplus, missing))
}

async fn reconcile_indexes(
    client: &DynamoClient,
    spec: &CollectionSpec,
    provision: &dyn ProvisionResolver,
    table_throughput: Option<(u64, u64)>,
) -> Result<(), StoreError> {
    let description = client
        .call("DescribeTable", json!({ "TableName": spec.table }))
        .await?;
    let current = described_indexes(&description);
    let desired: Vec<(String, String)> = spec
        .keys
        .non_unique_attributes()
        .map(|attribute| (escape_name(attribute), attribute.to_string()))
        .collect();
    let (surplus, missing) = diff_indexes(&current, &desired)?;
    if surplus.is_empty() && missing.is_empty() {
        debug!(table = %spec.table, "indexes already match");
        return Ok(());
    }

    // One index change at a time, with the table ACTIVE between steps.
    for name in surplus {
        info!(table = %spec.table, index = %name, "deleting surplus index");
        wait_for_table(client, &spec.table, true).await?;
        client
            .call(
                "UpdateTable",
                json!({
                    "TableName": spec.table,
                    "GlobalSecondaryIndexUpdates": [{ "Delete": { "IndexName": name } }],
                }),
            )
            .await?;
    }
    for (_, attribute) in missing {
        info!(table = %spec.table, attribute = %attribute, "adding missing index");
        wait_for_table(client, &spec.table, true).await?;
        client
            .call(
                "UpdateTable",
                json!({
                    "TableName": spec.table,
                    "AttributeDefinitions": [
                        { "AttributeName": attribute, "AttributeType": "B" },
                    ],
                    "GlobalSecondaryIndexUpdates": [{
                        "Create": gsi_create_json(spec, provision, &attribute, table_throughput),
                    }],
                }),
            )
            .await?;
    }
    Ok(())
}

async fn ensure_unique_table(
    client: &DynamoClient,
    spec: &CollectionSpec,
    provision: &dyn ProvisionResolver,
) -> Result<(), StoreError> {
    if !spec.keys.has_unique() {
        // Best-effort removal of a uniqueness table left over from an
        // earlier key schema.
        match client
            .call("DeleteTable", json!({ "TableName": spec.unique_table }))
            .await
        {
            Ok(_) => info!(table = %spec.unique_table, "deleted stale uniqueness table"),
            Err(err) if is_resource_not_found(&err) => {}
            Err(err) => {
                warn!(table = %spec.unique_table, error = %err, "could not delete uniqueness table");
            }
        }
        return Ok(());
    }

    let throughput = combined_throughput(
        provision,
        &spec.collection,
        spec.keys.unique_attributes(),
    );
    let mut body = json!({
        "TableName": spec.unique_table,
        "AttributeDefinitions": [{ "AttributeName": "ix", "AttributeType": "B" }],
        "KeySchema": [{ "AttributeName": "ix", "KeyType": "HASH" }],
    });
    apply_billing(&mut body, throughput);
    match client.call("CreateTable", body).await {
        Ok(_) => {
            info!(table = %spec.unique_table, "created uniqueness table");
            Ok(())
        }
        Err(err) if is_resource_in_use(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Brings the uniqueness table in line with the configured unique set:
/// rows are backfilled for newly-unique attributes by scanning the
/// primary table; rows of attributes that stopped being unique stay in
/// place (storage is cheap, a deleting scan would not be). The sentinel
/// row records the new set.
async fn migrate_unique_rows(
    client: &DynamoClient,
    spec: &CollectionSpec,
) -> Result<(), StoreError> {
    let desired: Vec<&str> = spec.keys.unique_attributes().collect();
    let response = client
        .call(
            "GetItem",
            json!({
                "TableName": spec.unique_table,
                "Key": ix_key(SENTINEL_CONTENT),
                "ConsistentRead": true,
                "ReturnConsumedCapacity": "TOTAL",
            }),
        )
        .await?;
    let previous: Vec<String> = response
        .get("Item")
        .and_then(|item| item.get(UNIQUE_FIELD))
        .and_then(string_set_of)
        .unwrap_or_default();
    let added: Vec<&str> = desired
        .iter()
        .filter(|attribute| !previous.iter().any(|p| p == *attribute))
        .copied()
        .collect();

    if !added.is_empty() {
        info!(
            table = %spec.table,
            attributes = ?added,
            "backfilling uniqueness rows for newly-unique attributes"
        );
        let mut start = None;
        loop {
            let body = json!({
                "TableName": spec.table,
                "ConsistentRead": client.consistent_read(),
                "ReturnConsumedCapacity": "TOTAL",
            });
            let (items, next) = client.page("Scan", body, start).await?;
            let mut requests = Vec::new();
            for item in &items {
                let record = decode_item(item)?;
                for attribute in &added {
                    if let Some(unique_value) = record.get(attribute) {
                        let content = ix_content(attribute, &value::to_bytes(unique_value)?);
                        requests.push(put_request(json!({
                            "ix": attr_bytes(&content),
                            "id": item[ID_FIELD].clone(),
                        })));
                    }
                }
            }
            batch_write(client, &spec.unique_table, requests).await?;
            match next {
                Some(key) => start = Some(key),
                None => break,
            }
        }
    }

    let desired_set: std::collections::BTreeSet<&str> = desired.iter().copied().collect();
    let previous_set: std::collections::BTreeSet<&str> =
        previous.iter().map(String::as_str).collect();
    if desired_set != previous_set {
        client
            .call(
                "PutItem",
                json!({
                    "TableName": spec.unique_table,
                    "Item": {
                        "ix": attr_bytes(SENTINEL_CONTENT),
                        "unique": attr_string_set(desired.iter().copied()),
                    },
                    "ReturnConsumedCapacity": "TOTAL",
                }),
            )
            .await?;
    }
    Ok(())
}

fn table_active(description: &Json, include_indexes: bool) -> bool {
    let table = &description["Table"];
    if table["TableStatus"] != "ACTIVE" {
        return false;
    }
    if include_indexes {
        if let Some(gsis) = table["GlobalSecondaryIndexes"].as_array() {
            return gsis.iter().all(|gsi| gsi["IndexStatus"] == "ACTIVE");
        }
    }
    true
}

/// Polls `DescribeTable` until the table (and, if asked, every index)
/// reports ACTIVE, with exponential backoff up to the 60 s deadline.
/// `ResourceNotFoundException` counts as still-pending: creation may not
/// have propagated yet.
pub async fn wait_for_table(
    client: &DynamoClient,
    table: &str,
    include_indexes: bool,
) -> Result<(), StoreError> {
    let deadline = Instant::now() + TABLE_WAIT_DEADLINE;
    let mut delay = WAIT_MIN_DELAY_MS;
    loop {
        let pending = match client
            .call("DescribeTable", json!({ "TableName": table }))
            .await
        {
            Ok(description) => !table_active(&description, include_indexes),
            Err(err) if is_resource_not_found(&err) => true,
            Err(err) => return Err(err),
        };
        if !pending {
            return Ok(());
        }
        let wait = Duration::from_millis(delay);
        if Instant::now() + wait >= deadline {
            return Err(StoreError::Backend {
                status: None,
                kind: "TableNotReady".to_string(),
                message: format!("table {table} did not become active within the deadline"),
            });
        }
        debug!(table, delay_ms = delay, "waiting for table to become active");
        tokio::time::sleep(wait).await;
        delay = (delay * 2).min(WAIT_MAX_DELAY_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn diff_plans_deletions_and_additions() {
        let current = pairs(&[("foo", "foo"), ("old", "old")]);
        let desired = pairs(&[("foo", "foo"), ("fresh", "fresh")]);
        let (surplus, missing) = diff_indexes(&current, &desired).unwrap();
        assert_eq!(surplus, vec!["old".to_string()]);
        assert_eq!(missing, pairs(&[("fresh", "fresh")]));
    }

    #[test]
    fn diff_rejects_incompatible_key_schema() {
        let current = pairs(&[("foo", "bar")]);
        let desired = pairs(&[("foo", "foo")]);
        assert!(matches!(
            diff_indexes(&current, &desired),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn described_indexes_reads_hash_keys() {
        let description = json!({
            "Table": {
                "GlobalSecondaryIndexes": [
                    {
                        "IndexName": "foo",
                        "KeySchema": [
                            { "AttributeName": "foo", "KeyType": "HASH" },
                        ],
                        "IndexStatus": "ACTIVE",
                    },
                ],
            },
        });
        assert_eq!(
            described_indexes(&description),
            pairs(&[("foo", "foo")])
        );
        assert!(described_indexes(&json!({"Table": {}})).is_empty());
    }

    #[test]
    fn table_activity_includes_index_status() {
        let creating = json!({ "Table": { "TableStatus": "CREATING" } });
        assert!(!table_active(&creating, true));

        let active_no_indexes = json!({ "Table": { "TableStatus": "ACTIVE" } });
        assert!(table_active(&active_no_indexes, true));

        let backfilling = json!({
            "Table": {
                "TableStatus": "ACTIVE",
                "GlobalSecondaryIndexes": [
                    { "IndexName": "a", "IndexStatus": "ACTIVE" },
                    { "IndexName": "b", "IndexStatus": "CREATING" },
                ],
            },
        });
        assert!(!table_active(&backfilling, true));
        assert!(table_active(&backfilling, false));
    }

    #[test]
    fn billing_defaults_to_on_demand() {
        let mut body = json!({});
        apply_billing(&mut body, None);
        assert_eq!(body["BillingMode"], "PAY_PER_REQUEST");

        let mut provisioned = json!({});
        apply_billing(&mut provisioned, Some((3, 4)));
        assert_eq!(provisioned["ProvisionedThroughput"]["ReadCapacityUnits"], 3);
        assert_eq!(provisioned["ProvisionedThroughput"]["WriteCapacityUnits"], 4);
        assert!(provisioned.get("BillingMode").is_none());
    }
}
