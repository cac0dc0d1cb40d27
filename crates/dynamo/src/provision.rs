//! Provisioned-capacity hints.
//!
//! The connection layer resolves a desired `{read, write}` throughput per
//! (table, index-or-none) pair; `None` means pay-per-request. Hints only
//! apply when a table is created, never retroactively.

use std::collections::HashMap;

use colstore_common::StoreError;

/// Resolves the desired throughput for a table or one of its indexes.
pub trait ProvisionResolver: Send + Sync {
    fn resolve(&self, table: &str, index: Option<&str>) -> Option<(u64, u64)>;
}

/// Everything pay-per-request.
#[derive(Debug, Default)]
pub struct OnDemand;

impl ProvisionResolver for OnDemand {
    fn resolve(&self, _table: &str, _index: Option<&str>) -> Option<(u64, u64)> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Level {
    Global,
    Table(String),
    AnyIndex(String),
    Index(String, String),
}

/// Hints parsed from connection-URL query parameters of the form
/// `provision[_<table>[_index[_<idx>]]]=<read>.<write>`.
///
/// A `-` value declines to pin a throughput at that level, so resolution
/// falls through to the more general one; with nothing resolved anywhere
/// the table is created pay-per-request.
#[derive(Debug, Default)]
pub struct QueryProvision {
    entries: HashMap<Level, (u64, u64)>,
}

impl QueryProvision {
    pub fn from_query<'a, I>(pairs: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut entries = HashMap::new();
        for (key, raw) in pairs {
            let Some(rest) = key.strip_prefix("provision") else {
                continue;
            };
            let Some(level) = parse_level(rest) else {
                continue;
            };
            if raw == "-" {
                continue;
            }
            entries.insert(level, parse_throughput(raw)?);
        }
        Ok(QueryProvision { entries })
    }
}

fn parse_level(rest: &str) -> Option<Level> {
    if rest.is_empty() {
        return Some(Level::Global);
    }
    let rest = rest.strip_prefix('_')?;
    if let Some(at) = rest.find("_index") {
        let tail = &rest[at + "_index".len()..];
        if tail.is_empty() {
            return Some(Level::AnyIndex(rest[..at].to_string()));
        }
        if let Some(index) = tail.strip_prefix('_') {
            return Some(Level::Index(rest[..at].to_string(), index.to_string()));
        }
        // "_index" embedded in a longer table name.
    }
    Some(Level::Table(rest.to_string()))
}

fn parse_throughput(raw: &str) -> Result<(u64, u64), StoreError> {
    let invalid = || {
        StoreError::Config(format!(
            "invalid provisioning value {raw:?}, expected <read>.<write> or -"
        ))
    };
    let (read, write) = raw.split_once('.').ok_or_else(invalid)?;
    Ok((
        read.parse().map_err(|_| invalid())?,
        write.parse().map_err(|_| invalid())?,
    ))
}

impl ProvisionResolver for QueryProvision {
    fn resolve(&self, table: &str, index: Option<&str>) -> Option<(u64, u64)> {
        if let Some(index) = index {
            if let Some(hit) = self
                .entries
                .get(&Level::Index(table.to_string(), index.to_string()))
            {
                return Some(*hit);
            }
            if let Some(hit) = self.entries.get(&Level::AnyIndex(table.to_string())) {
                return Some(*hit);
            }
        }
        self.entries
            .get(&Level::Table(table.to_string()))
            .or_else(|| self.entries.get(&Level::Global))
            .copied()
    }
}

/// Throughput for a uniqueness table: the sum of its constituent
/// unique-attribute throughputs, floored at 1/1. `None` if nothing
/// resolves, meaning pay-per-request.
pub fn combined_throughput<'a>(
    resolver: &dyn ProvisionResolver,
    table: &str,
    attributes: impl IntoIterator<Item = &'a str>,
) -> Option<(u64, u64)> {
    let mut total: Option<(u64, u64)> = None;
    for attribute in attributes {
        if let Some((read, write)) = resolver.resolve(table, Some(attribute)) {
            let (r, w) = total.unwrap_or((0, 0));
            total = Some((r + read, w + write));
        }
    }
    total.map(|(r, w)| (r.max(1), w.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(pairs: &[(&str, &str)]) -> QueryProvision {
        QueryProvision::from_query(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn resolves_most_specific_level_first() {
        let hints = parsed(&[
            ("provision", "1.2"),
            ("provision_users", "3.4"),
            ("provision_users_index", "5.6"),
            ("provision_users_index_email", "7.8"),
        ]);
        assert_eq!(hints.resolve("users", Some("email")), Some((7, 8)));
        assert_eq!(hints.resolve("users", Some("other")), Some((5, 6)));
        assert_eq!(hints.resolve("users", None), Some((3, 4)));
        assert_eq!(hints.resolve("posts", Some("email")), Some((1, 2)));
        assert_eq!(hints.resolve("posts", None), Some((1, 2)));
    }

    #[test]
    fn dash_and_absent_fall_through() {
        let hints = parsed(&[("provision_users", "-"), ("provision", "2.2")]);
        assert_eq!(hints.resolve("users", None), Some((2, 2)));
        let bare = parsed(&[("provision_users_index_email", "-")]);
        assert_eq!(bare.resolve("users", Some("email")), None);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(QueryProvision::from_query([("provision", "5")]).is_err());
        assert!(QueryProvision::from_query([("provision", "a.b")]).is_err());
        assert!(QueryProvision::from_query([("provision", "1.2.3")]).is_err());
    }

    #[test]
    fn ignores_unrelated_keys() {
        let hints = parsed(&[("consistentRead", "true"), ("provisioning", "9.9")]);
        assert_eq!(hints.resolve("users", None), None);
    }

    #[test]
    fn combined_uniqueness_throughput_sums_and_floors() {
        let hints = parsed(&[
            ("provision_users_index_email", "2.3"),
            ("provision_users_index_handle", "4.5"),
        ]);
        assert_eq!(
            combined_throughput(&hints, "users", ["email", "handle"]),
            Some((6, 8))
        );
        assert_eq!(combined_throughput(&hints, "users", ["none"]), None);
        let zero = parsed(&[("provision_users_index_email", "0.0")]);
        assert_eq!(
            combined_throughput(&zero, "users", ["email"]),
            Some((1, 1))
        );
    }
}
