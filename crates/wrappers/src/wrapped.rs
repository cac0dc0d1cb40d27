//! The field-wrapper decorator.
//!
//! A [`Wrapped`] collection sits in front of any other collection and
//! transforms a declared set of non-`id` fields on the way down and back
//! up. Stored values for those fields are opaque to the backend, so
//! filtering by a wrapped field is refused outright. Wrappers compose by
//! stacking; the outermost wrapper sees application values first on
//! writes and last on reads.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use colstore_common::{ID_FIELD, KeySchema, Record, StoreError, Value};
use colstore_storage::api::{Collection, UpdateOptions};

/// A per-field transform with an optional per-record context.
///
/// `wrap_context` runs once per write that touches a wrapped field and
/// `unwrap_context` once per read that returns one; both see the partial
/// record (including `id` when the operation can supply it) and their
/// result is handed to every `wrap`/`unwrap` call for that record.
#[async_trait]
pub trait FieldTransform: Send + Sync {
    type Context: Send + Sync;

    async fn wrap_context(&self, record: &Record) -> Result<Self::Context, StoreError>;

    async fn unwrap_context(&self, record: &Record) -> Result<Self::Context, StoreError>;

    fn wrap(&self, context: &Self::Context, value: &Value) -> Result<Value, StoreError>;

    fn unwrap(&self, context: &Self::Context, value: &Value) -> Result<Value, StoreError>;

    /// When true, remove resolves matching ids first and deletes them one
    /// by one, invoking [`FieldTransform::pre_remove`] for each.
    fn removes_individually(&self) -> bool {
        false
    }

    async fn pre_remove(&self, _id: &Value) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct Wrapped<T: FieldTransform> {
    inner: Arc<dyn Collection>,
    fields: BTreeSet<String>,
    transform: T,
}

impl<T: FieldTransform> Wrapped<T> {
    pub fn new(
        inner: Arc<dyn Collection>,
        fields: &[&str],
        transform: T,
    ) -> Result<Self, StoreError> {
        if fields.iter().any(|field| *field == ID_FIELD) {
            return Err(StoreError::Config(
                "the id field cannot be wrapped".to_string(),
            ));
        }
        Ok(Wrapped {
            inner,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            transform,
        })
    }

    fn refuse_wrapped_filter(&self, operation: &str, attribute: &str) -> Result<(), StoreError> {
        if self.fields.contains(attribute) {
            Err(StoreError::WrappedQuery {
                operation: operation.to_string(),
                attribute: attribute.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn touches_wrapped(&self, record: &Record) -> bool {
        self.fields.iter().any(|field| record.contains(field))
    }

    fn apply_wrap(&self, context: &T::Context, mut record: Record) -> Result<Record, StoreError> {
        for field in &self.fields {
            if let Some(plain) = record.take(field) {
                record.insert(field.clone(), self.transform.wrap(context, &plain)?);
            }
        }
        Ok(record)
    }

    async fn unwrap_record(&self, mut record: Record) -> Result<Record, StoreError> {
        if !self.touches_wrapped(&record) {
            return Ok(record);
        }
        let context = self.transform.unwrap_context(&record).await?;
        for field in &self.fields {
            if let Some(stored) = record.take(field) {
                record.insert(field.clone(), self.transform.unwrap(&context, &stored)?);
            }
        }
        Ok(record)
    }
}

#[async_trait]
impl<T: FieldTransform + 'static> Collection for Wrapped<T> {
    fn indices(&self) -> &KeySchema {
        self.inner.indices()
    }

    async fn add(&self, mut record: Record) -> Result<(), StoreError> {
        if self.touches_wrapped(&record) {
            let context = self.transform.wrap_context(&record).await?;
            record = self.apply_wrap(&context, record)?;
        }
        self.inner.add(record).await
    }

    async fn get(
        &self,
        attribute: &str,
        filter: &Value,
        fields: Option<&[&str]>,
    ) -> Result<Option<Record>, StoreError> {
        self.refuse_wrapped_filter("get", attribute)?;
        match self.inner.get(attribute, filter, fields).await? {
            Some(record) => Ok(Some(self.unwrap_record(record).await?)),
            None => Ok(None),
        }
    }

    async fn get_all(
        &self,
        filter: Option<(&str, &Value)>,
        fields: Option<&[&str]>,
    ) -> Result<Vec<Record>, StoreError> {
        if let Some((attribute, _)) = filter {
            self.refuse_wrapped_filter("getAll", attribute)?;
        }
        let records = self.inner.get_all(filter, fields).await?;
        let mut unwrapped = Vec::with_capacity(records.len());
        for record in records {
            unwrapped.push(self.unwrap_record(record).await?);
        }
        Ok(unwrapped)
    }

    async fn update(
        &self,
        attribute: &str,
        filter: &Value,
        mut delta: Record,
        options: UpdateOptions,
    ) -> Result<(), StoreError> {
        self.refuse_wrapped_filter("update", attribute)?;
        if self.touches_wrapped(&delta) {
            // The filter binding is part of the partial record the
            // context hook sees; with an id filter that is what lets
            // per-record transforms find their key.
            let mut context_record = delta.clone();
            context_record.insert(attribute, filter.clone());
            let context = self.transform.wrap_context(&context_record).await?;
            delta = self.apply_wrap(&context, delta)?;
        }
        self.inner.update(attribute, filter, delta, options).await
    }

    async fn remove(&self, attribute: &str, filter: &Value) -> Result<usize, StoreError> {
        self.refuse_wrapped_filter("remove", attribute)?;
        if !self.transform.removes_individually() {
            return self.inner.remove(attribute, filter).await;
        }
        // Resolve ids first so the transform sees every removed record.
        let matches = self
            .inner
            .get_all(Some((attribute, filter)), Some(&[ID_FIELD]))
            .await?;
        let mut removed = 0;
        for record in &matches {
            let id = record.id()?;
            self.transform.pre_remove(id).await?;
            removed += self.inner.remove(ID_FIELD, id).await?;
        }
        Ok(removed)
    }
}
