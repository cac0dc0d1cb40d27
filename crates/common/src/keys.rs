use crate::error::StoreError;
use crate::record::ID_FIELD;

/// One configured index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub attribute: String,
    pub unique: bool,
}

/// The indexed attributes of a collection and which of them are unique.
///
/// `id` is always indexed-unique and must not be listed here; membership
/// queries treat it as implicitly present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySchema {
    entries: Vec<IndexEntry>,
}

impl KeySchema {
    pub fn new() -> Self {
        KeySchema::default()
    }

    pub fn index(mut self, attribute: &str) -> Self {
        self.entries.push(IndexEntry {
            attribute: attribute.to_string(),
            unique: false,
        });
        self
    }

    pub fn unique(mut self, attribute: &str) -> Self {
        self.entries.push(IndexEntry {
            attribute: attribute.to_string(),
            unique: true,
        });
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.attribute == ID_FIELD {
                return Err(StoreError::Config(
                    "id is always indexed and must not appear in the key schema".to_string(),
                ));
            }
            if self.entries[..i].iter().any(|e| e.attribute == entry.attribute) {
                return Err(StoreError::Config(format!(
                    "attribute {} is listed twice in the key schema",
                    entry.attribute
                )));
            }
        }
        Ok(())
    }

    pub fn is_indexed(&self, attribute: &str) -> bool {
        attribute == ID_FIELD || self.entries.iter().any(|e| e.attribute == attribute)
    }

    pub fn is_unique(&self, attribute: &str) -> bool {
        attribute == ID_FIELD
            || self
                .entries
                .iter()
                .any(|e| e.attribute == attribute && e.unique)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Configured attributes, excluding the implicit `id`.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.attribute.as_str())
    }

    pub fn unique_attributes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.unique)
            .map(|e| e.attribute.as_str())
    }

    pub fn non_unique_attributes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| !e.unique)
            .map(|e| e.attribute.as_str())
    }

    pub fn has_unique(&self) -> bool {
        self.entries.iter().any(|e| e.unique)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_includes_implicit_id() {
        let keys = KeySchema::new().index("foo").unique("bar");
        assert!(keys.is_indexed("id"));
        assert!(keys.is_unique("id"));
        assert!(keys.is_indexed("foo"));
        assert!(!keys.is_unique("foo"));
        assert!(keys.is_unique("bar"));
        assert!(!keys.is_indexed("baz"));
        assert_eq!(keys.unique_attributes().collect::<Vec<_>>(), vec!["bar"]);
        assert_eq!(keys.non_unique_attributes().collect::<Vec<_>>(), vec!["foo"]);
    }

    #[test]
    fn validation_rejects_id_and_duplicates() {
        assert!(KeySchema::new().unique("id").validate().is_err());
        assert!(KeySchema::new().index("a").unique("a").validate().is_err());
        assert!(KeySchema::new().index("a").unique("b").validate().is_ok());
    }
}
