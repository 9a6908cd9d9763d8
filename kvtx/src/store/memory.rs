//! A purely in-memory [`KvStore`] backed by a `BTreeMap` per table, keyed
//! by [`ItemKey`]'s canonical byte ordering. Not a production backend: no
//! persistence, no network, no concurrent-writer isolation beyond a single
//! process mutex. This is the reference backend this crate's own tests run
//! against — an in-process `BTreeMap`-backed reference implementation of the
//! storage contract, nothing more.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{CResult, Error};
use crate::key::ItemKey;
use crate::store::{AttributeAction, Condition, KvStore, ScanPage, ScanToken};
use crate::value::{AttributeValue, Item};

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, BTreeMap<ItemKey, Item>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_action(item: &mut Item, action: &AttributeAction) -> CResult<()> {
    match action {
        AttributeAction::Put(name, value) => {
            item.insert(name.clone(), value.clone());
        }
        AttributeAction::Add(name, delta) => match delta {
            AttributeValue::N(_) => {
                let existing = item.get(name).map(AttributeValue::as_number).transpose()?.unwrap_or(0);
                let added = delta.as_number()?;
                item.insert(name.clone(), AttributeValue::number(existing + added));
            }
            AttributeValue::Ss(new_members) => match item.get(name) {
                Some(AttributeValue::Ss(existing)) => {
                    let mut merged = existing.clone();
                    merged.extend(new_members.iter().cloned());
                    item.insert(name.clone(), AttributeValue::Ss(merged));
                }
                None => {
                    item.insert(name.clone(), AttributeValue::Ss(new_members.clone()));
                }
                Some(_) => {
                    return Err(Error::BackingStore(format!(
                        "attribute '{name}' is not a string set"
                    )))
                }
            },
            AttributeValue::Bs(new_members) => match item.get(name) {
                Some(AttributeValue::Bs(existing)) => {
                    let mut merged = existing.clone();
                    merged.extend(new_members.iter().cloned());
                    item.insert(name.clone(), AttributeValue::Bs(merged));
                }
                None => {
                    item.insert(name.clone(), AttributeValue::Bs(new_members.clone()));
                }
                Some(_) => {
                    return Err(Error::BackingStore(format!(
                        "attribute '{name}' is not a binary set"
                    )))
                }
            },
            other => {
                return Err(Error::BackingStore(format!(
                    "cannot add a {other:?} value to attribute '{name}'"
                )))
            }
        },
        AttributeAction::Delete(name) => {
            item.remove(name);
        }
    }
    Ok(())
}

impl KvStore for MemoryStore {
    fn get_item(&self, table: &str, key: &ItemKey) -> CResult<Option<Item>> {
        let tables = self.tables.lock().expect("memory store mutex poisoned");
        Ok(tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    fn put_item(&self, table: &str, key: &ItemKey, item: Item, condition: Condition) -> CResult<()> {
        let mut tables = self.tables.lock().expect("memory store mutex poisoned");
        let rows = tables.entry(table.to_string()).or_default();
        let current = rows.get(key);
        if !condition.holds(current) {
            return Err(Error::ConditionalCheckFailed(format!(
                "put_item condition failed for {table}/{key}"
            )));
        }
        rows.insert(key.clone(), item);
        Ok(())
    }

    fn update_item(
        &self,
        table: &str,
        key: &ItemKey,
        actions: &[AttributeAction],
        condition: Condition,
    ) -> CResult<Item> {
        let mut tables = self.tables.lock().expect("memory store mutex poisoned");
        let rows = tables.entry(table.to_string()).or_default();
        let current = rows.get(key).cloned();
        if !condition.holds(current.as_ref()) {
            return Err(Error::ConditionalCheckFailed(format!(
                "update_item condition failed for {table}/{key}"
            )));
        }
        let mut next = current.unwrap_or_else(|| key.to_item());
        for action in actions {
            apply_action(&mut next, action)?;
        }
        rows.insert(key.clone(), next.clone());
        Ok(next)
    }

    fn delete_item(&self, table: &str, key: &ItemKey, condition: Condition) -> CResult<()> {
        let mut tables = self.tables.lock().expect("memory store mutex poisoned");
        let rows = tables.entry(table.to_string()).or_default();
        let current = rows.get(key);
        if !condition.holds(current) {
            return Err(Error::ConditionalCheckFailed(format!(
                "delete_item condition failed for {table}/{key}"
            )));
        }
        rows.remove(key);
        Ok(())
    }

    fn scan(&self, table: &str, start: Option<ScanToken>, limit: usize) -> CResult<ScanPage> {
        let tables = self.tables.lock().expect("memory store mutex poisoned");
        let Some(rows) = tables.get(table) else {
            return Ok(ScanPage::default());
        };
        let start_bytes = start.map(|t| t.0);
        let mut items = Vec::new();
        let mut next = None;
        for (key, item) in rows.iter() {
            let key_bytes = key.canonical_scan_bytes();
            if let Some(s) = &start_bytes {
                if &key_bytes <= s {
                    continue;
                }
            }
            if items.len() == limit {
                next = Some(ScanToken(key_bytes));
                break;
            }
            items.push(item.clone());
        }
        Ok(ScanPage { items, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ItemKey {
        ItemKey::single("id", AttributeValue::S(id.into())).unwrap()
    }

    fn item(id: &str, color: &str) -> Item {
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S(id.into()));
        item.insert("color".into(), AttributeValue::S(color.into()));
        item
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryStore::new();
        store
            .put_item("widgets", &key("1"), item("1", "red"), Condition::new())
            .unwrap();
        let got = store.get_item("widgets", &key("1")).unwrap();
        assert_eq!(got, Some(item("1", "red")));
    }

    #[test]
    fn put_condition_not_exists_rejects_existing_row() {
        let store = MemoryStore::new();
        store
            .put_item("widgets", &key("1"), item("1", "red"), Condition::new())
            .unwrap();
        let err = store
            .put_item(
                "widgets",
                &key("1"),
                item("1", "blue"),
                Condition::new().not_exists("id"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConditionalCheckFailed(_)));
    }

    #[test]
    fn update_item_applies_add_to_numeric_attribute() {
        let store = MemoryStore::new();
        let mut seed = item("1", "red");
        seed.insert("count".into(), AttributeValue::number(5));
        store
            .put_item("widgets", &key("1"), seed, Condition::new())
            .unwrap();
        let result = store
            .update_item(
                "widgets",
                &key("1"),
                &[AttributeAction::Add("count".into(), AttributeValue::number(3))],
                Condition::new(),
            )
            .unwrap();
        assert_eq!(result.get("count"), Some(&AttributeValue::number(8)));
    }

    #[test]
    fn delete_item_is_conditioned_on_ownership() {
        let store = MemoryStore::new();
        let mut seed = item("1", "red");
        seed.insert("_txid".into(), AttributeValue::S("t1".into()));
        store
            .put_item("widgets", &key("1"), seed, Condition::new())
            .unwrap();
        let err = store
            .delete_item(
                "widgets",
                &key("1"),
                Condition::new().eq("_txid", AttributeValue::S("t2".into())),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConditionalCheckFailed(_)));
        store
            .delete_item(
                "widgets",
                &key("1"),
                Condition::new().eq("_txid", AttributeValue::S("t1".into())),
            )
            .unwrap();
        assert_eq!(store.get_item("widgets", &key("1")).unwrap(), None);
    }

    #[test]
    fn scan_paginates_in_canonical_key_order() {
        let store = MemoryStore::new();
        for id in ["3", "1", "2"] {
            store
                .put_item("widgets", &key(id), item(id, "red"), Condition::new())
                .unwrap();
        }
        let page1 = store.scan("widgets", None, 2).unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(page1.next.is_some());
        let page2 = store.scan("widgets", page1.next, 2).unwrap();
        assert_eq!(page2.items.len(), 1);
        assert!(page2.next.is_none());
    }
}
