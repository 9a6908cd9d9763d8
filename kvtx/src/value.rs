//! Attribute values and items: the generic row representation every
//! user table, T_TX, and T_IMG row is built from.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Names of the four reserved metadata attributes this crate owns on every
/// user row participating in a transaction. Any caller attribute starting
/// with [`RESERVED_PREFIX`] is rejected at request-validation time.
pub const RESERVED_PREFIX: char = '_';
pub const ATTR_TXID: &str = "_txid";
pub const ATTR_DATE: &str = "_date";
pub const ATTR_TRANSIENT: &str = "_transient";
pub const ATTR_APPLIED: &str = "_applied";

/// A single attribute value. Scalars, a byte buffer, and two flavors of set.
///
/// Sets are `BTreeSet`, not `Vec` or `HashSet`: the backing store does not
/// preserve insertion order for set-typed attributes, so two items carrying
/// the same logical set must still compare and serialize identically. Using
/// a canonically-ordered collection makes that true by construction instead
/// of by a bespoke comparator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// A UTF-8 string.
    S(String),
    /// A number, carried as its canonical decimal string so that encoding
    /// is exact and doesn't depend on floating point representation.
    N(String),
    /// An opaque byte buffer.
    B(#[serde(with = "serde_bytes")] Vec<u8>),
    Bool(bool),
    Null,
    /// A set of strings.
    Ss(BTreeSet<String>),
    /// A set of byte buffers.
    Bs(BTreeSet<Vec<u8>>),
}

impl AttributeValue {
    pub fn is_set(&self) -> bool {
        matches!(self, AttributeValue::Ss(_) | AttributeValue::Bs(_))
    }

    /// Parses an `N` value as an `i64`, for `Add` actions.
    pub fn as_number(&self) -> CResult<i64> {
        match self {
            AttributeValue::N(s) => s
                .parse::<i64>()
                .map_err(|e| Error::InvalidRequest(format!("attribute is not an integer: {e}"))),
            other => Err(Error::InvalidRequest(format!(
                "expected a numeric attribute, found {other:?}"
            ))),
        }
    }

    pub fn number(n: i64) -> Self {
        AttributeValue::N(n.to_string())
    }
}

/// A row: an order-insensitive map of attribute name to value. `BTreeMap` so
/// that two structurally-equal items encode to identical bytes, which the
/// canonical-serialization and pre-image-restoration requirements rely on.
pub type Item = BTreeMap<String, AttributeValue>;

pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Returns a copy of `item` with the four reserved attributes removed. Used
/// whenever a row is about to be handed back to a caller: reserved metadata
/// must never leak into a caller-visible read.
pub fn strip_reserved(item: &Item) -> Item {
    item.iter()
        .filter(|(name, _)| !is_reserved_name(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub fn lock_owner(item: &Item) -> Option<&str> {
    match item.get(ATTR_TXID) {
        Some(AttributeValue::S(txid)) => Some(txid.as_str()),
        _ => None,
    }
}

pub fn is_transient(item: &Item) -> bool {
    matches!(item.get(ATTR_TRANSIENT), Some(AttributeValue::Bool(true)))
}

pub fn is_applied(item: &Item) -> bool {
    matches!(item.get(ATTR_APPLIED), Some(AttributeValue::Bool(true)))
}

/// Removes `_txid`, `_date`, `_transient`, and `_applied` from `item` in
/// place. Used when restoring a pre-image back over a user row and when
/// committing a read-only lock.
pub fn clear_lock_attrs(item: &mut Item) {
    item.remove(ATTR_TXID);
    item.remove(ATTR_DATE);
    item.remove(ATTR_TRANSIENT);
    item.remove(ATTR_APPLIED);
}
