//! The closed set of requests a transaction can carry, their validation,
//! and their canonical (de)serialization for persistence inside a
//! transaction record.

mod codec;

pub use codec::{decode_recorded, encode_recorded};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::key::ItemKey;
use crate::value::{is_reserved_name, AttributeValue, Item};

/// What the caller wants back from a mutating request. `ReadLock` ignores
/// this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnMode {
    None,
    AllOld,
    AllNew,
}

/// An update action against a single attribute of an existing row, used by
/// `UpdateRow`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeUpdate {
    /// Sets (or replaces) the attribute.
    Put(String, AttributeValue),
    /// Adds to a numeric attribute, or unions into a set attribute.
    Add(String, AttributeValue),
    /// Removes the attribute entirely.
    Delete(String),
}

impl AttributeUpdate {
    pub fn attribute_name(&self) -> &str {
        match self {
            AttributeUpdate::Put(name, _) => name,
            AttributeUpdate::Add(name, _) => name,
            AttributeUpdate::Delete(name) => name,
        }
    }
}

/// The closed set of request variants a transaction may carry. No range or
/// predicate locks, no conditional expressions embedded in the write itself
/// — those are explicit non-goals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    PutRow {
        table: String,
        item: Item,
        return_mode: ReturnMode,
    },
    UpdateRow {
        table: String,
        key: Item,
        updates: Vec<AttributeUpdate>,
        return_mode: ReturnMode,
    },
    DeleteRow {
        table: String,
        key: Item,
        return_mode: ReturnMode,
    },
    ReadLock {
        table: String,
        key: Item,
    },
}

impl Request {
    pub fn table(&self) -> &str {
        match self {
            Request::PutRow { table, .. }
            | Request::UpdateRow { table, .. }
            | Request::DeleteRow { table, .. }
            | Request::ReadLock { table, .. } => table,
        }
    }

    /// True for requests whose apply step writes or removes a row, as
    /// opposed to `ReadLock` which only takes the lock.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Request::ReadLock { .. })
    }

    pub fn return_mode(&self) -> ReturnMode {
        match self {
            Request::PutRow { return_mode, .. }
            | Request::UpdateRow { return_mode, .. }
            | Request::DeleteRow { return_mode, .. } => *return_mode,
            Request::ReadLock { .. } => ReturnMode::None,
        }
    }

    /// The raw item this request was constructed with — the full row for
    /// `PutRow`, the key item for everything else. Used only where a key
    /// schema isn't at hand (e.g. size-limit error messages); callers
    /// needing the actual primary key should use [`Request::key`].
    pub fn raw_key_item(&self) -> &Item {
        match self {
            Request::PutRow { item, .. } => item,
            Request::UpdateRow { key, .. } | Request::DeleteRow { key, .. } | Request::ReadLock { key, .. } => key,
        }
    }

    /// The key attributes this request addresses. For `PutRow`, the key is
    /// extracted from the item using the table's known primary-key
    /// attribute names, since the request itself carries the whole row.
    pub fn key(&self, pk_attrs: &[String]) -> CResult<ItemKey> {
        match self {
            Request::PutRow { item, .. } => ItemKey::from_item(item, pk_attrs),
            Request::UpdateRow { key, .. }
            | Request::DeleteRow { key, .. }
            | Request::ReadLock { key, .. } => ItemKey::new(key.clone()),
        }
    }

    /// Validates the request in isolation (not against any existing
    /// transaction record). Duplicate-request detection against sibling
    /// requests in the same transaction happens one level up, in the
    /// transaction record, since it needs visibility into the other
    /// requests already added.
    pub fn validate(&self) -> CResult<()> {
        if self.table().is_empty() {
            return Err(Error::InvalidRequest("table name must not be empty".into()));
        }
        match self {
            Request::PutRow { item, .. } => {
                if item.is_empty() {
                    return Err(Error::InvalidRequest("item must not be empty".into()));
                }
                for name in item.keys() {
                    if is_reserved_name(name) {
                        return Err(Error::InvalidRequest(format!(
                            "item attribute '{name}' uses the reserved prefix"
                        )));
                    }
                }
            }
            Request::UpdateRow { key, updates, .. } => {
                validate_key_attrs(key)?;
                if updates.is_empty() {
                    return Err(Error::InvalidRequest("update must have at least one action".into()));
                }
                for update in updates {
                    if is_reserved_name(update.attribute_name()) {
                        return Err(Error::InvalidRequest(format!(
                            "update targets reserved attribute '{}'",
                            update.attribute_name()
                        )));
                    }
                }
            }
            Request::DeleteRow { key, .. } | Request::ReadLock { key, .. } => {
                validate_key_attrs(key)?;
            }
        }
        Ok(())
    }
}

fn validate_key_attrs(key: &Item) -> CResult<()> {
    if key.is_empty() {
        return Err(Error::InvalidRequest("key must not be empty".into()));
    }
    for name in key.keys() {
        if is_reserved_name(name) {
            return Err(Error::InvalidRequest(format!(
                "key attribute '{name}' uses the reserved prefix"
            )));
        }
    }
    Ok(())
}

/// A request together with the `rid` it was assigned when added to a
/// transaction record. This is the unit actually persisted — the `rid` is
/// embedded in the encoded bytes so that a coordinator reconstructing a
/// record's request order from the backing store's unordered byte-blob set
/// can recover it without a side channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub rid: u64,
    pub request: Request,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn item(pairs: &[(&str, &str)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttributeValue::S(v.to_string())))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn put_row_rejects_reserved_attribute() {
        let req = Request::PutRow {
            table: "widgets".into(),
            item: item(&[("_txid", "x")]),
            return_mode: ReturnMode::None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn put_row_rejects_empty_item() {
        let req = Request::PutRow {
            table: "widgets".into(),
            item: Item::new(),
            return_mode: ReturnMode::None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn update_row_rejects_empty_updates() {
        let req = Request::UpdateRow {
            table: "widgets".into(),
            key: item(&[("id", "1")]),
            updates: vec![],
            return_mode: ReturnMode::None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn update_row_rejects_reserved_update_target() {
        let req = Request::UpdateRow {
            table: "widgets".into(),
            key: item(&[("id", "1")]),
            updates: vec![AttributeUpdate::Put("_applied".into(), AttributeValue::Bool(true))],
            return_mode: ReturnMode::None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn delete_row_rejects_empty_key() {
        let req = Request::DeleteRow {
            table: "widgets".into(),
            key: Item::new(),
            return_mode: ReturnMode::None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn key_extraction_uses_table_pk_attrs_for_put_row() {
        let req = Request::PutRow {
            table: "widgets".into(),
            item: item(&[("id", "1"), ("color", "red")]),
            return_mode: ReturnMode::None,
        };
        let key = req.key(&["id".to_string()]).unwrap();
        assert_eq!(key.get("id"), Some(&AttributeValue::S("1".into())));
        assert_eq!(key.get("color"), None);
    }
}
