//! The KV Adapter: a typed wrapper over the external store's single-item
//! conditional put/update/delete, consistent get, and scan.
//!
//! This module only defines the contract ([`KvStore`]) and the predicate /
//! action vocabulary a conforming backend must support; the backing store
//! itself is an external collaborator. [`memory::MemoryStore`] is a
//! reference implementation used by this crate's own tests.

pub mod memory;

use crate::error::CResult;
use crate::key::ItemKey;
use crate::value::{AttributeValue, Item};

/// One predicate term of a conditional write. A [`Condition`] is the
/// conjunction (AND) of zero or more of these — exactly the
/// `{name: exists=false} ∪ {name: value=v}` shape the backing store
/// contract specifies.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Exists(String),
    NotExists(String),
    Eq(String, AttributeValue),
}

impl Predicate {
    fn holds(&self, item: Option<&Item>) -> bool {
        match self {
            Predicate::Exists(name) => item.is_some_and(|item| item.contains_key(name)),
            Predicate::NotExists(name) => !item.is_some_and(|item| item.contains_key(name)),
            Predicate::Eq(name, value) => {
                item.and_then(|item| item.get(name)) == Some(value)
            }
        }
    }
}

/// A conjunction of predicates evaluated against the current state of a
/// single item. An empty condition is unconditional (always holds).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Condition(Vec<Predicate>);

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(mut self, name: impl Into<String>) -> Self {
        self.0.push(Predicate::Exists(name.into()));
        self
    }

    pub fn not_exists(mut self, name: impl Into<String>) -> Self {
        self.0.push(Predicate::NotExists(name.into()));
        self
    }

    pub fn eq(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.0.push(Predicate::Eq(name.into(), value));
        self
    }

    pub fn holds(&self, item: Option<&Item>) -> bool {
        self.0.iter().all(|p| p.holds(item))
    }

    pub fn is_unconditional(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single-attribute update action, matching the backing store contract's
/// {put, add, delete} action set.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeAction {
    /// Sets (or replaces) the attribute.
    Put(String, AttributeValue),
    /// Increments a numeric attribute, or unions a set attribute.
    Add(String, AttributeValue),
    /// Removes the attribute.
    Delete(String),
}

/// An opaque scan continuation token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanToken(pub Vec<u8>);

#[derive(Clone, Debug, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub next: Option<ScanToken>,
}

/// A key/value storage adapter: single-item conditional writes, a
/// consistent get, and a paginated scan. Only single-item operations are
/// assumed — no range locks, no multi-item atomicity, no expressions beyond
/// the predicate vocabulary above.
///
/// Mirrors the shape of a single-threaded, blocking `Engine` trait: every
/// call may block on network I/O, but no cooperative-suspension primitive
/// is imposed on implementers. An async backend can implement this trait
/// by blocking on its own runtime internally.
pub trait KvStore: Send + Sync {
    /// A strongly consistent point read.
    fn get_item(&self, table: &str, key: &ItemKey) -> CResult<Option<Item>>;

    /// Writes a full item at `key`, subject to `condition`. `key` is
    /// supplied explicitly (rather than inferred from `item`) because the
    /// adapter itself carries no table schema — that lives one layer up, in
    /// the transaction manager's per-table key-attribute cache.
    fn put_item(&self, table: &str, key: &ItemKey, item: Item, condition: Condition) -> CResult<()>;

    /// Applies a sequence of attribute actions to the row at `key`, subject
    /// to `condition`, returning the item's state after the update.
    fn update_item(
        &self,
        table: &str,
        key: &ItemKey,
        actions: &[AttributeAction],
        condition: Condition,
    ) -> CResult<Item>;

    /// Deletes the row at `key`, subject to `condition`.
    fn delete_item(&self, table: &str, key: &ItemKey, condition: Condition) -> CResult<()>;

    /// Scans a page of items, starting after `start` (or from the
    /// beginning if `None`), returning at most `limit` items and a
    /// continuation token if more remain.
    fn scan(&self, table: &str, start: Option<ScanToken>, limit: usize) -> CResult<ScanPage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconditional_condition_always_holds() {
        assert!(Condition::new().holds(None));
        let mut item = Item::new();
        item.insert("a".into(), AttributeValue::Bool(true));
        assert!(Condition::new().holds(Some(&item)));
    }

    #[test]
    fn not_exists_holds_when_item_or_attribute_absent() {
        assert!(Condition::new().not_exists("_txid").holds(None));
        let item = Item::new();
        assert!(Condition::new().not_exists("_txid").holds(Some(&item)));
        let mut locked = Item::new();
        locked.insert("_txid".into(), AttributeValue::S("t1".into()));
        assert!(!Condition::new().not_exists("_txid").holds(Some(&locked)));
    }

    #[test]
    fn eq_requires_matching_attribute_value() {
        let mut item = Item::new();
        item.insert("_txid".into(), AttributeValue::S("t1".into()));
        assert!(Condition::new()
            .eq("_txid", AttributeValue::S("t1".into()))
            .holds(Some(&item)));
        assert!(!Condition::new()
            .eq("_txid", AttributeValue::S("t2".into()))
            .holds(Some(&item)));
    }

    #[test]
    fn conjunction_requires_every_predicate_to_hold() {
        let mut item = Item::new();
        item.insert("_txid".into(), AttributeValue::S("t1".into()));
        let cond = Condition::new()
            .exists("_txid")
            .eq("_txid", AttributeValue::S("t1".into()));
        assert!(cond.holds(Some(&item)));
        let cond_fails = Condition::new()
            .exists("_txid")
            .eq("_txid", AttributeValue::S("t2".into()));
        assert!(!cond_fails.holds(Some(&item)));
    }
}
