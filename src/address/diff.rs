//! Path-level change detection between two snapshots of a document
//!
//! A [`Diff`] is built once per write and then queried for as many
//! addresses as needed. Whole-document comparison ignores bookkeeping
//! fields; address comparison resolves the address on both sides and
//! compares what it finds, so a null and an absent member look the same.

use serde_json::{Map, Value};

use super::{fetch, AddressError, FetchOptions};

/// Bookkeeping fields ignored by whole-document comparison
pub const VOLATILE_FIELDS: &[&str] = &["id", "_id", "version", "created_at", "updated_at"];

/// A record of what differs between a live document and a stored one.
#[derive(Clone, Debug)]
pub struct Diff {
    live: Value,
    stored: Value,
    changed: bool,
    persisted: bool,
}

impl Diff {
    /// Diff `live` against an explicit baseline.
    pub fn between(live: Value, stored: Value) -> Self {
        let changed = strip_volatile(&live) != strip_volatile(&stored);
        Self {
            live,
            stored,
            changed,
            persisted: true,
        }
    }

    /// Diff a document that has never been written. Every address that
    /// resolves to something appears changed.
    pub fn unpersisted(live: Value) -> Self {
        Self {
            live,
            stored: Value::Object(Map::new()),
            changed: true,
            persisted: false,
        }
    }

    pub fn live(&self) -> &Value {
        &self.live
    }

    pub fn stored(&self) -> &Value {
        &self.stored
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Whether anything outside the bookkeeping fields differs.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Whether the value at `addr` differs.
    pub fn path_changed(&self, addr: &str) -> Result<bool, AddressError> {
        Ok(resolve(addr, &self.live)? != resolve(addr, &self.stored)?)
    }

    /// Whether any of `addrs` differs.
    pub fn any_changed<I, S>(&self, addrs: I) -> Result<bool, AddressError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for addr in addrs {
            if self.path_changed(addr.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whole-document diff when `addr` is `None`, path diff otherwise.
    pub fn changed_at(&self, addr: Option<&str>) -> Result<bool, AddressError> {
        match addr {
            None => Ok(self.changed),
            Some(addr) => self.path_changed(addr),
        }
    }
}

// Single-match first; addresses that legitimately fan out compare as lists.
fn resolve(addr: &str, doc: &Value) -> Result<Vec<Value>, AddressError> {
    match fetch(addr, doc, FetchOptions::single()) {
        Err(AddressError::AmbiguousMatch(_)) => fetch(addr, doc, FetchOptions::plural()),
        other => other,
    }
}

fn strip_volatile(doc: &Value) -> Value {
    match doc {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
