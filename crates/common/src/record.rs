use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::value::Value;

/// The mandatory primary-key field.
pub const ID_FIELD: &str = "id";

/// A record: an ordered mapping from field names to values with a
/// mandatory `id` field. Everything else is free-form per record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    /// Builder-style insert, for constructing records inline.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn take(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// The record id, validated to be a string or an integer.
    pub fn id(&self) -> Result<&Value, StoreError> {
        let id = self.get(ID_FIELD).ok_or(StoreError::MissingId)?;
        if id.is_valid_id() {
            Ok(id)
        } else {
            Err(StoreError::InvalidId)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Keeps only the requested fields, and only those actually present.
    pub fn project(&self, fields: &[&str]) -> Record {
        Record {
            fields: fields
                .iter()
                .filter_map(|f| self.fields.get(*f).map(|v| (f.to_string(), v.clone())))
                .collect(),
        }
    }

    /// Projects when a field list was supplied, otherwise returns the
    /// record unchanged.
    pub fn project_opt(self, fields: Option<&[&str]>) -> Record {
        match fields {
            Some(list) => self.project(list),
            None => self,
        }
    }

    /// Merges `delta` in: present fields overwrite, absent fields stay.
    pub fn apply(&mut self, delta: &Record) {
        for (field, value) in delta.iter() {
            self.fields.insert(field.clone(), value.clone());
        }
    }

    pub fn merged_with(&self, delta: &Record) -> Record {
        let mut merged = self.clone();
        merged.apply(delta);
        merged
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_validated() {
        assert!(matches!(Record::new().id(), Err(StoreError::MissingId)));
        assert!(matches!(
            Record::new().set("id", true).id(),
            Err(StoreError::InvalidId)
        ));
        assert_eq!(
            Record::new().set("id", 7).id().unwrap(),
            &Value::Int(7)
        );
        assert_eq!(
            Record::new().set("id", "a").id().unwrap(),
            &Value::String("a".to_string())
        );
    }

    #[test]
    fn projection_keeps_only_present_fields() {
        let record = Record::new().set("id", 1).set("foo", "x");
        let projected = record.project(&["foo", "missing"]);
        assert_eq!(projected, Record::new().set("foo", "x"));
    }

    #[test]
    fn apply_overwrites_and_preserves() {
        let mut record = Record::new().set("id", 1).set("a", "old").set("b", 2);
        record.apply(&Record::new().set("a", "new").set("c", true));
        assert_eq!(
            record,
            Record::new().set("id", 1).set("a", "new").set("b", 2).set("c", true)
        );
    }
}
