//! The wide-column collection.
//!
//! The service has no native unique secondary indexes and no cross-table
//! transactions, so uniqueness is emulated with an auxiliary table: one
//! row per (attribute, value) pair, conditionally claimed before the
//! primary write and released again when a compound operation fails.
//! Non-unique indexed attributes are served by one GSI each, projected
//! keys-only; the primary table is always authoritative.

use std::sync::Arc;

use async_trait::async_trait;
use colstore_common::{ID_FIELD, KeySchema, Record, StoreError, Value, value};
use colstore_storage::api::{Collection, Lifecycle, UpdateOptions};
use colstore_storage::ready::ReadyGate;
use serde_json::{Value as Json, json};
use tracing::warn;

use crate::batch::{batch_get, batch_write, delete_request};
use crate::client::{DynamoClient, is_conditional_failure};
use crate::escape::escape_name;
use crate::types::{
    Expr, IX_FIELD, attr_bytes, attr_value, decode_item, encode_record, item_id, ix_content,
    ix_key, key_of_id,
};

enum UpdateOutcome {
    Applied,
    NotFound,
}

pub struct DynamoCollection {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) unique_table: String,
    pub(crate) keys: KeySchema,
    pub(crate) client: Arc<DynamoClient>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) gate: ReadyGate,
}

impl DynamoCollection {
    /// Closed check, then the ready gate: calls fail fast after close and
    /// suspend while initialisation is still running.
    async fn ready(&self) -> Result<(), StoreError> {
        self.lifecycle.check_open()?;
        self.gate.wait().await
    }

    // --- uniqueness table -------------------------------------------------

    /// Conditionally claims one uniqueness row per `(attribute, value)`.
    /// On any clash the rows claimed so far are released best-effort and
    /// the clash surfaces as a duplicate on that attribute.
    async fn claim_unique_rows(
        &self,
        id: &Value,
        entries: &[(&str, &Value)],
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut claimed: Vec<Vec<u8>> = Vec::new();
        for (attribute, claim_value) in entries {
            let content = ix_content(attribute, &value::to_bytes(claim_value)?);
            let mut expr = Expr::new();
            let ix_name = expr.name(IX_FIELD);
            let mut body = json!({
                "TableName": self.unique_table,
                "Item": { "ix": attr_bytes(&content), "id": attr_value(id)? },
                "ConditionExpression": format!("attribute_not_exists({ix_name})"),
                "ReturnConsumedCapacity": "TOTAL",
            });
            expr.apply(&mut body);
            match self.client.call("PutItem", body).await {
                Ok(_) => claimed.push(content),
                Err(err) => {
                    let err = if is_conditional_failure(&err) {
                        StoreError::duplicate(&self.name, *attribute)
                    } else {
                        err
                    };
                    self.release_unique_rows(&claimed).await;
                    return Err(err);
                }
            }
        }
        Ok(claimed)
    }

    /// Best-effort rollback of claimed rows; the original failure is what
    /// the caller re-raises.
    async fn release_unique_rows(&self, contents: &[Vec<u8>]) {
        if contents.is_empty() {
            return;
        }
        let requests = contents
            .iter()
            .map(|content| delete_request(ix_key(content)))
            .collect();
        if let Err(err) = batch_write(&self.client, &self.unique_table, requests).await {
            warn!(table = %self.unique_table, error = %err, "failed to release uniqueness rows");
        }
    }

    /// Deletes the uniqueness rows for the given old attribute values.
    async fn delete_unique_rows(
        &self,
        record: &Record,
        attributes: impl IntoIterator<Item = &str>,
    ) -> Result<(), StoreError> {
        let mut requests = Vec::new();
        for attribute in attributes {
            if let Some(old_value) = record.get(attribute) {
                let content = ix_content(attribute, &value::to_bytes(old_value)?);
                requests.push(delete_request(ix_key(&content)));
            }
        }
        if requests.is_empty() {
            return Ok(());
        }
        batch_write(&self.client, &self.unique_table, requests).await
    }

    async fn lookup_unique_id(
        &self,
        attribute: &str,
        filter: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let content = ix_content(attribute, &value::to_bytes(filter)?);
        let body = json!({
            "TableName": self.unique_table,
            "Key": ix_key(&content),
            "ConsistentRead": self.client.consistent_read(),
            "ReturnConsumedCapacity": "TOTAL",
        });
        let response = self.client.call("GetItem", body).await?;
        match response.get("Item") {
            Some(item) if !item.is_null() => Ok(Some(item_id(item)?)),
            _ => Ok(None),
        }
    }

    // --- primary table ----------------------------------------------------

    async fn get_item(
        &self,
        id: &Value,
        fields: Option<&[&str]>,
    ) -> Result<Option<Record>, StoreError> {
        let mut body = json!({
            "TableName": self.table,
            "Key": key_of_id(id)?,
            "ConsistentRead": self.client.consistent_read(),
            "ReturnConsumedCapacity": "TOTAL",
        });
        if let Some(fields) = fields {
            let mut expr = Expr::new();
            let names: Vec<String> = fields.iter().map(|field| expr.name(field)).collect();
            body["ProjectionExpression"] = Json::String(names.join(", "));
            expr.apply(&mut body);
        }
        let response = self.client.call("GetItem", body).await?;
        match response.get("Item") {
            Some(item) if !item.is_null() => Ok(Some(decode_item(item)?)),
            _ => Ok(None),
        }
    }

    /// Conditional insert: uniqueness rows first, then the primary item
    /// guarded on the id not existing. Any failure unwinds the claims.
    async fn put_new(&self, record: &Record) -> Result<(), StoreError> {
        let id = record.id()?;
        let unique_entries: Vec<(&str, &Value)> = self
            .keys
            .unique_attributes()
            .filter_map(|attribute| record.get(attribute).map(|v| (attribute, v)))
            .collect();
        let claimed = self.claim_unique_rows(id, &unique_entries).await?;

        let mut expr = Expr::new();
        let id_name = expr.name(ID_FIELD);
        let mut body = json!({
            "TableName": self.table,
            "Item": encode_record(record)?,
            "ConditionExpression": format!("attribute_not_exists({id_name})"),
            "ReturnConsumedCapacity": "TOTAL",
        });
        expr.apply(&mut body);
        match self.client.call("PutItem", body).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.release_unique_rows(&claimed).await;
                if is_conditional_failure(&err) {
                    Err(StoreError::duplicate(&self.name, ID_FIELD))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// One conditional update. `guard` re-checks that the filter
    /// attribute still holds its original value, which keeps index
    /// lookups truthful under concurrent writers. Unique attributes in
    /// the delta get the claim/condition/cleanup treatment.
    async fn update_one(
        &self,
        id: &Value,
        delta: &Record,
        guard: Option<(&str, &Value)>,
    ) -> Result<UpdateOutcome, StoreError> {
        if delta.iter().all(|(field, _)| field.as_str() == ID_FIELD) {
            // Nothing to write; report whether the record exists.
            return Ok(match self.get_item(id, Some(&[ID_FIELD])).await? {
                Some(_) => UpdateOutcome::Applied,
                None => UpdateOutcome::NotFound,
            });
        }

        let touched: Vec<&str> = self
            .keys
            .unique_attributes()
            .filter(|attribute| delta.contains(attribute))
            .collect();
        if touched.is_empty() {
            return self.conditional_update(id, delta, guard, None).await;
        }

        let old = match self.get_item(id, Some(&touched)).await? {
            Some(old) => old,
            None => return Ok(UpdateOutcome::NotFound),
        };
        let changed: Vec<&str> = touched
            .iter()
            .filter(|attribute| old.get(attribute) != delta.get(attribute))
            .copied()
            .collect();
        if changed.is_empty() {
            return self.conditional_update(id, delta, guard, None).await;
        }

        let claims: Vec<(&str, &Value)> = changed
            .iter()
            .filter_map(|attribute| delta.get(attribute).map(|v| (*attribute, v)))
            .collect();
        let claimed = self.claim_unique_rows(id, &claims).await?;

        match self
            .conditional_update(id, delta, guard, Some((&old, &changed)))
            .await
        {
            Ok(UpdateOutcome::Applied) => {
                // The old values are no longer held by this record.
                if let Err(err) = self.delete_unique_rows(&old, changed.iter().copied()).await {
                    warn!(table = %self.unique_table, error = %err, "failed to delete stale uniqueness rows");
                }
                Ok(UpdateOutcome::Applied)
            }
            Ok(UpdateOutcome::NotFound) => {
                // A concurrent writer moved the record from under us.
                self.release_unique_rows(&claimed).await;
                Ok(UpdateOutcome::NotFound)
            }
            Err(err) => {
                self.release_unique_rows(&claimed).await;
                Err(err)
            }
        }
    }

    async fn conditional_update(
        &self,
        id: &Value,
        delta: &Record,
        guard: Option<(&str, &Value)>,
        unique_guard: Option<(&Record, &[&str])>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut expr = Expr::new();
        let mut sets = Vec::new();
        for (field, new_value) in delta.iter().filter(|(field, _)| field.as_str() != ID_FIELD) {
            let name = expr.name(field);
            let placeholder = expr.value(attr_value(new_value)?);
            sets.push(format!("{name} = {placeholder}"));
        }
        let id_name = expr.name(ID_FIELD);
        let mut conditions = vec![format!("attribute_exists({id_name})")];
        if let Some((attribute, original)) = guard {
            let name = expr.name(attribute);
            let placeholder = expr.value(attr_value(original)?);
            conditions.push(format!("{name} = {placeholder}"));
        }
        if let Some((old, changed)) = unique_guard {
            for attribute in changed {
                let name = expr.name(attribute);
                match old.get(attribute) {
                    Some(old_value) => {
                        let placeholder = expr.value(attr_value(old_value)?);
                        conditions.push(format!("{name} = {placeholder}"));
                    }
                    None => conditions.push(format!("attribute_not_exists({name})")),
                }
            }
        }
        let mut body = json!({
            "TableName": self.table,
            "Key": key_of_id(id)?,
            "UpdateExpression": format!("SET {}", sets.join(", ")),
            "ConditionExpression": conditions.join(" AND "),
            "ReturnConsumedCapacity": "TOTAL",
        });
        expr.apply(&mut body);
        match self.client.call("UpdateItem", body).await {
            Ok(_) => Ok(UpdateOutcome::Applied),
            Err(err) if is_conditional_failure(&err) => Ok(UpdateOutcome::NotFound),
            Err(err) => Err(err),
        }
    }

    /// The upsert ladder: update-if-present, insert on miss, and one
    /// more update if the insert lost a race on the id.
    async fn upsert_by_id(&self, id: &Value, delta: &Record) -> Result<(), StoreError> {
        if let UpdateOutcome::Applied = self.update_one(id, delta, None).await? {
            return Ok(());
        }
        let mut record = delta.clone();
        record.insert(ID_FIELD, id.clone());
        match self.put_new(&record).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_duplicate() => match self.update_one(id, delta, None).await? {
                UpdateOutcome::Applied => Ok(()),
                UpdateOutcome::NotFound => Err(StoreError::UpsertConflict),
            },
            Err(err) => Err(err),
        }
    }

    // --- index resolution -------------------------------------------------

    async fn query_index_page(
        &self,
        attribute: &str,
        filter: &Value,
        limit: Option<u64>,
        start: Option<Json>,
    ) -> Result<(Vec<Json>, Option<Json>), StoreError> {
        let mut expr = Expr::new();
        let name = expr.name(attribute);
        let placeholder = expr.value(attr_value(filter)?);
        let mut body = json!({
            "TableName": self.table,
            "IndexName": escape_name(attribute),
            "KeyConditionExpression": format!("{name} = {placeholder}"),
            "ReturnConsumedCapacity": "TOTAL",
        });
        if let Some(limit) = limit {
            body["Limit"] = Json::from(limit);
        }
        expr.apply(&mut body);
        self.client.page("Query", body, start).await
    }

    async fn query_index_all(
        &self,
        attribute: &str,
        filter: &Value,
    ) -> Result<Vec<Json>, StoreError> {
        let mut items = Vec::new();
        let mut start = None;
        loop {
            let (page, next) = self
                .query_index_page(attribute, filter, None, start)
                .await?;
            items.extend(page);
            match next {
                Some(key) => start = Some(key),
                None => return Ok(items),
            }
        }
    }

    /// Resolves a filter to the matching ids: trivially for `id`, via the
    /// uniqueness table for unique attributes, via the GSI otherwise.
    async fn resolve_ids(&self, attribute: &str, filter: &Value) -> Result<Vec<Value>, StoreError> {
        if attribute == ID_FIELD {
            if !filter.is_valid_id() {
                return Err(StoreError::InvalidId);
            }
            return Ok(vec![filter.clone()]);
        }
        if !self.keys.is_indexed(attribute) {
            return Err(StoreError::NotIndexed(attribute.to_string()));
        }
        if self.keys.is_unique(attribute) {
            return Ok(self
                .lookup_unique_id(attribute, filter)
                .await?
                .into_iter()
                .collect());
        }
        let items = self.query_index_all(attribute, filter).await?;
        items.iter().map(item_id).collect()
    }

    /// Whether a projection is fully covered by the keys-only GSI item.
    fn covered_by_index(attribute: &str, fields: Option<&[&str]>) -> bool {
        fields.is_some_and(|fields| {
            fields
                .iter()
                .all(|field| *field == ID_FIELD || *field == attribute)
        })
    }
}

#[async_trait]
impl Collection for DynamoCollection {
    fn indices(&self) -> &KeySchema {
        &self.keys
    }

    async fn add(&self, record: Record) -> Result<(), StoreError> {
        self.ready().await?;
        record.id()?;
        self.put_new(&record).await
    }

    async fn get(
        &self,
        attribute: &str,
        filter: &Value,
        fields: Option<&[&str]>,
    ) -> Result<Option<Record>, StoreError> {
        self.ready().await?;
        if attribute == ID_FIELD {
            return self.get_item(filter, fields).await;
        }
        if !self.keys.is_indexed(attribute) {
            return Err(StoreError::NotIndexed(attribute.to_string()));
        }
        if self.keys.is_unique(attribute) {
            let Some(id) = self.lookup_unique_id(attribute, filter).await? else {
                return Ok(None);
            };
            if Self::covered_by_index(attribute, fields) {
                // No second lookup needed: the row already pins id and value.
                let mut record = Record::new();
                record.insert(ID_FIELD, id);
                record.insert(attribute, filter.clone());
                return Ok(Some(record.project_opt(fields)));
            }
            // The primary table is authoritative: a dangling uniqueness
            // row reads as absent.
            return self.get_item(&id, fields).await;
        }
        let (items, _) = self.query_index_page(attribute, filter, Some(1), None).await?;
        let Some(item) = items.first() else {
            return Ok(None);
        };
        if Self::covered_by_index(attribute, fields) {
            return Ok(Some(decode_item(item)?.project_opt(fields)));
        }
        self.get_item(&item_id(item)?, fields).await
    }

    async fn get_all(
        &self,
        filter: Option<(&str, &Value)>,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Record>, StoreError> {
        self.ready().await?;
        let Some((attribute, filter_value)) = filter else {
            let mut body = json!({
                "TableName": self.table,
                "ConsistentRead": self.client.consistent_read(),
                "ReturnConsumedCapacity": "TOTAL",
            });
            if let Some(fields) = fields {
                let mut expr = Expr::new();
                let names: Vec<String> = fields.iter().map(|field| expr.name(field)).collect();
                body["ProjectionExpression"] = Json::String(names.join(", "));
                expr.apply(&mut body);
            }
            let items = self.client.collect_pages("Scan", body).await?;
            return items.iter().map(decode_item).collect();
        };

        if attribute == ID_FIELD || self.keys.is_unique(attribute) {
            return Ok(self
                .get(attribute, filter_value, fields)
                .await?
                .into_iter()
                .collect());
        }
        if !self.keys.is_indexed(attribute) {
            return Err(StoreError::NotIndexed(attribute.to_string()));
        }

        let index_items = self.query_index_all(attribute, filter_value).await?;
        if Self::covered_by_index(attribute, fields) {
            return index_items
                .iter()
                .map(|item| Ok(decode_item(item)?.project_opt(fields)))
                .collect();
        }
        // Fetch the remaining attributes from the primary table.
        let keys: Vec<Json> = index_items
            .iter()
            .map(|item| json!({ "id": item["id"].clone() }))
            .collect();
        let full = batch_get(&self.client, &self.table, keys, fields).await?;
        full.iter().map(decode_item).collect()
    }

    async fn update(
        &self,
        attribute: &str,
        filter: &Value,
        delta: Record,
        options: UpdateOptions,
    ) -> Result<(), StoreError> {
        self.ready().await?;
        if attribute == ID_FIELD {
            if !filter.is_valid_id() {
                return Err(StoreError::InvalidId);
            }
            if let Some(delta_id) = delta.get(ID_FIELD) {
                if !delta_id.is_valid_id() {
                    return Err(StoreError::InvalidId);
                }
                if delta_id != filter {
                    return Err(StoreError::IdImmutable);
                }
            }
            if options.upsert {
                return self.upsert_by_id(filter, &delta).await;
            }
            // Not-found conditional failures are swallowed.
            self.update_one(filter, &delta, None).await?;
            return Ok(());
        }

        let ids = self.resolve_ids(attribute, filter).await?;
        if ids.is_empty() {
            if options.upsert {
                return Err(StoreError::UpsertRequiresId);
            }
            return Ok(());
        }
        if let Some(delta_id) = delta.get(ID_FIELD) {
            if !delta_id.is_valid_id() {
                return Err(StoreError::InvalidId);
            }
            if ids.len() > 1 || &ids[0] != delta_id {
                return Err(StoreError::IdImmutable);
            }
        }
        for id in &ids {
            // Guarded on the filter still matching, so a record reindexed
            // by a concurrent writer is skipped rather than clobbered.
            self.update_one(id, &delta, Some((attribute, filter))).await?;
        }
        Ok(())
    }

    async fn remove(&self, attribute: &str, filter: &Value) -> Result<usize, StoreError> {
        self.ready().await?;
        let ids = self.resolve_ids(attribute, filter).await?;
        let has_unique = self.keys.has_unique();
        let mut removed = 0;
        for id in &ids {
            let mut expr = Expr::new();
            let id_name = expr.name(ID_FIELD);
            let mut body = json!({
                "TableName": self.table,
                "Key": key_of_id(id)?,
                "ConditionExpression": format!("attribute_exists({id_name})"),
                "ReturnConsumedCapacity": "TOTAL",
            });
            if has_unique {
                body["ReturnValues"] = Json::String("ALL_OLD".to_string());
            }
            expr.apply(&mut body);
            match self.client.call("DeleteItem", body).await {
                Ok(response) => {
                    removed += 1;
                    if has_unique {
                        if let Some(old_item) =
                            response.get("Attributes").filter(|a| !a.is_null())
                        {
                            let old = decode_item(old_item)?;
                            self.delete_unique_rows(&old, self.keys.unique_attributes())
                                .await?;
                        }
                    }
                }
                // Already gone; not counted.
                Err(err) if is_conditional_failure(&err) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }
}
