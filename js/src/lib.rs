//! jobstore - persistent record storage over SQLite
//!
//! Records are JSON documents keyed by id within a named collection. Each
//! record declares a set of indexed fields that are mirrored into a side
//! table so status/name/cycle queries never scan document bodies. Writes are
//! transactional; status transitions go through a compare-and-set primitive
//! so concurrent writers resolve conflicts instead of clobbering each other.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

mod store;

pub use store::{CasOutcome, Store};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A value that can be stored in the index side table
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// Textual form used for storage and equality comparison
    pub fn as_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    /// Numeric form for range comparisons (None for non-numeric values)
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Comparison operator for filtered queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    /// Numeric greater-or-equal; only meaningful for `IndexValue::Int` fields
    Gte,
    /// Numeric less-or-equal; only meaningful for `IndexValue::Int` fields
    Lte,
}

/// A single predicate over an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    pub fn gte(field: impl Into<String>, value: i64) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gte,
            value: IndexValue::Int(value),
        }
    }

    pub fn lte(field: impl Into<String>, value: i64) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Lte,
            value: IndexValue::Int(value),
        }
    }
}

/// A persistable record
///
/// Implementors serialize to a JSON document and expose the fields that
/// should be queryable without deserializing the document.
pub trait Record: Serialize + DeserializeOwned {
    /// Unique record id within the collection
    fn id(&self) -> &str;

    /// Last modification time (Unix ms); used for recency ordering
    fn updated_at(&self) -> i64;

    /// Name of the collection this record type lives in
    fn collection_name() -> &'static str;

    /// Fields mirrored into the index side table
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
