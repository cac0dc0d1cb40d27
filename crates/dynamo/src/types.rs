//! DynamoDB attribute-value helpers.
//!
//! Every record field is stored as a binary (`B`) attribute holding the
//! value codec's bytes, so a field can later become indexed without an
//! attribute-type migration. Request bodies are plain `serde_json`
//! documents; these helpers keep the base64/codec plumbing in one place.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use colstore_common::{ID_FIELD, Record, StoreError, Value, value};
use serde_json::{Map, Value as Json, json};

/// Hash-key attribute of the uniqueness table.
pub const IX_FIELD: &str = "ix";
/// String-set attribute of the uniqueness-table sentinel row.
pub const UNIQUE_FIELD: &str = "unique";
/// Content of the sentinel row's `ix` key.
pub const SENTINEL_CONTENT: &[u8] = b":";

pub fn attr_bytes(raw: &[u8]) -> Json {
    json!({ "B": BASE64.encode(raw) })
}

pub fn attr_value(value: &Value) -> Result<Json, StoreError> {
    Ok(attr_bytes(&value::to_bytes(value)?))
}

pub fn attr_string_set<'a>(items: impl IntoIterator<Item = &'a str>) -> Json {
    json!({ "SS": items.into_iter().collect::<Vec<_>>() })
}

/// The raw bytes of a `B` attribute.
pub fn bytes_of(attr: &Json) -> Result<Vec<u8>, StoreError> {
    let b64 = attr
        .get("B")
        .and_then(Json::as_str)
        .ok_or_else(|| StoreError::Codec("expected a binary attribute".to_string()))?;
    BASE64
        .decode(b64)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub fn value_of(attr: &Json) -> Result<Value, StoreError> {
    value::from_bytes(&bytes_of(attr)?)
}

pub fn string_set_of(attr: &Json) -> Option<Vec<String>> {
    attr.get("SS")?.as_array().map(|items| {
        items
            .iter()
            .filter_map(Json::as_str)
            .map(str::to_string)
            .collect()
    })
}

/// Encodes a record as a DynamoDB item.
pub fn encode_record(record: &Record) -> Result<Json, StoreError> {
    let mut item = Map::with_capacity(record.len());
    for (field, val) in record.iter() {
        item.insert(field.clone(), attr_value(val)?);
    }
    Ok(Json::Object(item))
}

/// Decodes a DynamoDB item back into a record, skipping non-binary
/// attributes (the sentinel's string set, for one).
pub fn decode_item(item: &Json) -> Result<Record, StoreError> {
    let object = item
        .as_object()
        .ok_or_else(|| StoreError::Codec("expected an item object".to_string()))?;
    let mut record = Record::new();
    for (field, attr) in object {
        if attr.get("B").is_some() {
            record.insert(field.clone(), value_of(attr)?);
        }
    }
    Ok(record)
}

pub fn key_of_id(id: &Value) -> Result<Json, StoreError> {
    Ok(json!({ ID_FIELD: attr_value(id)? }))
}

pub fn item_id(item: &Json) -> Result<Value, StoreError> {
    value_of(
        item.get(ID_FIELD)
            .ok_or_else(|| StoreError::Codec("item is missing its id attribute".to_string()))?,
    )
}

/// Content of a uniqueness-table key: `<attr>:<base64(value bytes)>`.
pub fn ix_content(attribute: &str, value_bytes: &[u8]) -> Vec<u8> {
    format!("{attribute}:{}", BASE64.encode(value_bytes)).into_bytes()
}

pub fn ix_key(content: &[u8]) -> Json {
    json!({ IX_FIELD: attr_bytes(content) })
}

/// Accumulates expression attribute names and values with distinct
/// placeholders, applied to a request body at the end.
#[derive(Default)]
pub struct Expr {
    names: Map<String, Json>,
    values: Map<String, Json>,
}

impl Expr {
    pub fn new() -> Self {
        Expr::default()
    }

    pub fn name(&mut self, attribute: &str) -> String {
        let placeholder = format!("#n{}", self.names.len());
        self.names
            .insert(placeholder.clone(), Json::String(attribute.to_string()));
        placeholder
    }

    pub fn value(&mut self, attr: Json) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), attr);
        placeholder
    }

    pub fn apply(self, body: &mut Json) {
        if !self.names.is_empty() {
            body["ExpressionAttributeNames"] = Json::Object(self.names);
        }
        if !self.values.is_empty() {
            body["ExpressionAttributeValues"] = Json::Object(self.values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colstore_common::Record;

    #[test]
    fn record_item_round_trip() {
        let record = Record::new()
            .set("id", 7)
            .set("name", "x")
            .set("blob", vec![0u8, 1, 255]);
        let item = encode_record(&record).unwrap();
        assert!(item["id"]["B"].is_string());
        assert_eq!(decode_item(&item).unwrap(), record);
    }

    #[test]
    fn decode_skips_non_binary_attributes() {
        let item = json!({
            "id": attr_value(&Value::Int(1)).unwrap(),
            "unique": { "SS": ["a", "b"] },
        });
        let record = decode_item(&item).unwrap();
        assert_eq!(record, Record::new().set("id", 1));
    }

    #[test]
    fn ix_content_is_prefixed_and_base64() {
        let bytes = value::to_bytes(&Value::String("def".into())).unwrap();
        let content = ix_content("bar", &bytes);
        assert_eq!(content, format!("bar:{}", BASE64.encode(&bytes)).into_bytes());
        // Different attributes with equal values stay distinct.
        assert_ne!(ix_content("bar", &bytes), ix_content("baz", &bytes));
    }

    #[test]
    fn expr_builds_distinct_placeholders() {
        let mut expr = Expr::new();
        let a = expr.name("alpha");
        let b = expr.name("beta");
        let v = expr.value(json!({"B": "AA=="}));
        assert_ne!(a, b);
        let mut body = json!({});
        expr.apply(&mut body);
        assert_eq!(body["ExpressionAttributeNames"][&a], "alpha");
        assert_eq!(body["ExpressionAttributeNames"][&b], "beta");
        assert_eq!(body["ExpressionAttributeValues"][&v]["B"], "AA==");
    }
}
