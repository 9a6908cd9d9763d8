//! Lock-free read paths that filter a raw row through the current
//! transaction metadata. `ReadLock`, the strongest level, is not a handler
//! here at all — it's a real transaction (see [`crate::txn::Transaction::read_lock`]).

use crate::error::{CResult, Error};
use crate::key::ItemKey;
use crate::record::{rid_for, RecordStore, TxState};
use crate::store::KvStore;
use crate::value::{is_applied, is_transient, lock_owner, Item};

const COMMITTED_READ_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Isolation {
    Uncommitted,
    Committed,
}

/// Returns the row as read, except that a transient, not-yet-applied row
/// (a phantom insert mid-lock) is reported absent.
pub fn read_uncommitted(store: &dyn KvStore, table: &str, key: &ItemKey) -> CResult<Option<Item>> {
    let item = store.get_item(table, key)?;
    Ok(match item {
        Some(item) if is_transient(&item) && !is_applied(&item) => None,
        other => other,
    })
}

/// Returns the last committed state of a row, resolving an in-flight
/// applied write back to its pre-image when the owning transaction hasn't
/// committed (or is still finalizing a commit, in which case the applied
/// bytes already are the committed ones).
pub fn read_committed(store: &dyn KvStore, table: &str, key: &ItemKey, pk_attrs: &[String]) -> CResult<Option<Item>> {
    let records = RecordStore::new(store);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let Some(item) = store.get_item(table, key)? else {
            return Ok(None);
        };
        if is_transient(&item) {
            return Ok(None);
        }
        if !is_applied(&item) {
            return Ok(Some(item));
        }
        let Some(owner) = lock_owner(&item) else {
            return Ok(Some(item));
        };
        match records.load(owner) {
            Ok(record) => {
                if record.state == TxState::Committed {
                    return Ok(Some(item));
                }
                match rid_for(&record, table, key, pk_attrs)? {
                    Some(rid) => match records.load_item_image(owner, rid)? {
                        Some(image) => return Ok(Some(image)),
                        None if attempts < COMMITTED_READ_ATTEMPTS => continue,
                        None => {
                            return Err(Error::Assertion(format!(
                                "no pre-image for {table}/{key} under transaction {owner}"
                            )))
                        }
                    },
                    None => return Ok(Some(item)),
                }
            }
            Err(Error::TxNotFound(_)) if attempts < COMMITTED_READ_ATTEMPTS => continue,
            Err(Error::TxNotFound(_)) => {
                return Err(Error::Assertion(format!(
                    "transaction {owner} vanished while resolving a committed read of {table}/{key}"
                )))
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::Condition;
    use crate::value::{AttributeValue, ATTR_APPLIED, ATTR_TRANSIENT, ATTR_TXID};

    fn key(id: &str) -> ItemKey {
        ItemKey::single("id", AttributeValue::S(id.into())).unwrap()
    }

    #[test]
    fn uncommitted_read_hides_unapplied_transient_rows() {
        let store = MemoryStore::new();
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S("1".into()));
        item.insert(ATTR_TXID.into(), AttributeValue::S("t1".into()));
        item.insert(ATTR_TRANSIENT.into(), AttributeValue::Bool(true));
        store.put_item("widgets", &key("1"), item, Condition::new()).unwrap();
        assert_eq!(read_uncommitted(&store, "widgets", &key("1")).unwrap(), None);
    }

    #[test]
    fn uncommitted_read_returns_applied_bytes_regardless_of_commit_status() {
        let store = MemoryStore::new();
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S("1".into()));
        item.insert("color".into(), AttributeValue::S("purple".into()));
        item.insert(ATTR_TXID.into(), AttributeValue::S("t1".into()));
        item.insert(ATTR_APPLIED.into(), AttributeValue::Bool(true));
        store.put_item("widgets", &key("1"), item, Condition::new()).unwrap();
        let read = read_uncommitted(&store, "widgets", &key("1")).unwrap().unwrap();
        assert_eq!(read.get("color"), Some(&AttributeValue::S("purple".into())));
    }

    #[test]
    fn committed_read_falls_back_to_pre_image_while_owner_is_pending() {
        let store = MemoryStore::new();
        let mut original = Item::new();
        original.insert("id".into(), AttributeValue::S("1".into()));
        original.insert("color".into(), AttributeValue::S("red".into()));
        store.put_item("widgets", &key("1"), original, Condition::new()).unwrap();

        let records = RecordStore::new(&store);
        let record = records.insert("t1", 100).unwrap();
        let mut update_key = Item::new();
        update_key.insert("id".into(), AttributeValue::S("1".into()));
        let request = crate::request::Request::UpdateRow {
            table: "widgets".into(),
            key: update_key,
            updates: vec![crate::request::AttributeUpdate::Put(
                "color".into(),
                AttributeValue::S("purple".into()),
            )],
            return_mode: crate::request::ReturnMode::None,
        };
        let (_record, rid) = records.add_request_raw(&record, request, 101).unwrap();

        let mut pre_image = Item::new();
        pre_image.insert("id".into(), AttributeValue::S("1".into()));
        pre_image.insert("color".into(), AttributeValue::S("red".into()));
        records.save_item_image("t1", rid, &pre_image).unwrap();

        let mut applied = Item::new();
        applied.insert("id".into(), AttributeValue::S("1".into()));
        applied.insert("color".into(), AttributeValue::S("purple".into()));
        applied.insert(ATTR_TXID.into(), AttributeValue::S("t1".into()));
        applied.insert(ATTR_APPLIED.into(), AttributeValue::Bool(true));
        store
            .put_item("widgets", &key("1"), applied, Condition::new())
            .unwrap();

        let pk_attrs = vec!["id".to_string()];
        let seen = read_committed(&store, "widgets", &key("1"), &pk_attrs).unwrap().unwrap();
        assert_eq!(seen.get("color"), Some(&AttributeValue::S("red".into())));
    }
}
