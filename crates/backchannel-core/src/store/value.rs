//! Graph value model
//!
//! Every graph path holds exactly one [`Value`] shape for its lifetime (leaf
//! text/number, link, or record with a known field set). The store does not
//! police this; the schema layer does. Records written at a path merge
//! field-by-field; everything else overwrites last-write-wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One graph value: a leaf, a link to another node, or a record of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Tombstone; also what `put(null)` leaves behind
    Null,
    Bool(bool),
    /// Integer leaf (timestamps in ms, the rendezvous sentinel's `0`)
    Num(i64),
    Text(String),
    /// Reference to a member of a sibling collection by generated id; which
    /// collection is fixed by the field's shape, not stored here
    Link(String),
    /// Nested record; materialized deeply on reads
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Build a record from field pairs
    pub fn record<'a, I>(fields: I) -> Value
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<i64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&str> {
        match self {
            Value::Link(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Field lookup on a record; `None` for any other shape
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_record().and_then(|map| map.get(name))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
