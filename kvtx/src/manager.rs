//! Factory and session holder: caches per-table key schemas, owns the KV
//! adapter, and creates/resumes transactions. Also the entry point for the
//! non-transactional read API and the sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::error::{CResult, Error};
use crate::isolation::{self, Isolation};
use crate::key::ItemKey;
use crate::record::{RecordStore, TransactionRecord};
use crate::store::{AttributeAction, Condition, KvStore, ScanPage, ScanToken};
use crate::sweeper::{self, SweepAction};
use crate::txn::Transaction;
use crate::value::{strip_reserved, AttributeValue, Item, ATTR_APPLIED, ATTR_DATE, ATTR_TRANSIENT, ATTR_TXID};

pub struct TransactionManager<S: KvStore> {
    store: S,
    clock: Arc<dyn Clock>,
    key_schemas: Mutex<HashMap<String, Vec<String>>>,
}

impl<S: KvStore> TransactionManager<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            key_schemas: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &dyn KvStore {
        &self.store
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_secs()
    }

    /// Registers the primary-key attribute names for `table`. A table used
    /// before being registered here defaults to a single `"id"` attribute.
    pub fn register_key_schema(&self, table: impl Into<String>, pk_attrs: Vec<String>) {
        self.key_schemas
            .lock()
            .expect("key schema cache mutex poisoned")
            .insert(table.into(), pk_attrs);
    }

    pub(crate) fn key_attrs(&self, table: &str) -> CResult<Vec<String>> {
        let mut schemas = self.key_schemas.lock().expect("key schema cache mutex poisoned");
        if let Some(attrs) = schemas.get(table) {
            return Ok(attrs.clone());
        }
        let attrs = vec!["id".to_string()];
        schemas.insert(table.to_string(), attrs.clone());
        Ok(attrs)
    }

    pub fn new_tx(&self) -> CResult<Transaction<'_, S>> {
        let txid = format!("{:032x}", rand::random::<u128>());
        let record = RecordStore::new(self.store()).insert(&txid, self.now())?;
        Ok(Transaction::new(self, record))
    }

    pub fn resume_tx(&self, txid: &str) -> CResult<Transaction<'_, S>> {
        let record = RecordStore::new(self.store()).load(txid)?;
        Ok(Transaction::new(self, record))
    }

    pub fn resume_tx_from_record(&self, record: TransactionRecord) -> Transaction<'_, S> {
        Transaction::new(self, record)
    }

    pub fn get_row(&self, table: &str, key: &Item, isolation: Isolation) -> CResult<Option<Item>> {
        let pk_attrs = self.key_attrs(table)?;
        let item_key = ItemKey::from_item(key, &pk_attrs)?;
        let row = self.read_at_isolation(table, &item_key, &pk_attrs, isolation)?;
        Ok(row.map(|item| strip_reserved(&item)))
    }

    fn read_at_isolation(&self, table: &str, key: &ItemKey, pk_attrs: &[String], isolation: Isolation) -> CResult<Option<Item>> {
        match isolation {
            Isolation::Uncommitted => isolation::read_uncommitted(self.store(), table, key),
            Isolation::Committed => isolation::read_committed(self.store(), table, key, pk_attrs),
        }
    }

    pub fn scan(&self, table: &str, start: Option<ScanToken>, limit: usize, isolation: Isolation) -> CResult<ScanPage> {
        let pk_attrs = self.key_attrs(table)?;
        let page = self.store().scan(table, start, limit)?;
        let mut items = Vec::with_capacity(page.items.len());
        for item in &page.items {
            let item_key = ItemKey::from_item(item, &pk_attrs)?;
            if let Some(visible) = self.read_at_isolation(table, &item_key, &pk_attrs, isolation)? {
                items.push(strip_reserved(&visible));
            }
        }
        Ok(ScanPage { items, next: page.next })
    }

    /// Scans every page of `table`, filtered through `isolation`.
    pub fn query(&self, table: &str, isolation: Isolation) -> CResult<Vec<Item>> {
        let mut out = Vec::new();
        let mut start = None;
        loop {
            let page = self.scan(table, start, 100, isolation)?;
            let done = page.next.is_none();
            out.extend(page.items);
            if done {
                break;
            }
            start = page.next;
        }
        Ok(out)
    }

    pub fn batch_get(&self, table: &str, keys: &[Item], isolation: Isolation) -> CResult<Vec<Option<Item>>> {
        keys.iter().map(|key| self.get_row(table, key, isolation)).collect()
    }

    /// Forcibly strips the reserved lock attributes from a row. Only
    /// succeeds when the named transaction's record is confirmed gone — a
    /// last-resort operator tool, never called by the protocol itself.
    pub fn break_lock(&self, table: &str, key: &Item, txid: &str) -> CResult<()> {
        if RecordStore::new(self.store()).load(txid).is_ok() {
            return Err(Error::InvalidRequest(format!(
                "transaction {txid} still has a record; drive it to completion instead of breaking its lock"
            )));
        }
        let pk_attrs = self.key_attrs(table)?;
        let item_key = ItemKey::from_item(key, &pk_attrs)?;
        self.store().update_item(
            table,
            &item_key,
            &[
                AttributeAction::Delete(ATTR_TXID.into()),
                AttributeAction::Delete(ATTR_DATE.into()),
                AttributeAction::Delete(ATTR_TRANSIENT.into()),
                AttributeAction::Delete(ATTR_APPLIED.into()),
            ],
            Condition::new().eq(ATTR_TXID, AttributeValue::S(txid.to_string())),
        )?;
        log::warn!("break_lock removed a stale lock on {table}/{item_key} held by {txid}");
        Ok(())
    }

    /// Applies one sweep decision to `record`: delete if finalized and
    /// stale, roll back if stuck Pending, or drive to finalized if terminal
    /// but not yet finalized.
    pub fn sweep_once(&self, record: TransactionRecord, rollback_threshold: i64, delete_threshold: i64) -> CResult<SweepAction> {
        let now = self.now();
        sweeper::sweep_record(self, record, now, rollback_threshold, delete_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReturnMode;
    use crate::store::memory::MemoryStore;

    fn item(pairs: &[(&str, &str)]) -> Item {
        pairs.iter().map(|(k, v)| (k.to_string(), AttributeValue::S(v.to_string()))).collect()
    }

    #[test]
    fn new_tx_assigns_distinct_txids() {
        let manager = TransactionManager::new(MemoryStore::new());
        let a = manager.new_tx().unwrap();
        let b = manager.new_tx().unwrap();
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn get_row_returns_none_for_missing_item() {
        let manager = TransactionManager::new(MemoryStore::new());
        let key = item(&[("id", "absent")]);
        assert_eq!(manager.get_row("widgets", &key, Isolation::Committed).unwrap(), None);
    }

    #[test]
    fn get_row_reflects_a_committed_write() {
        let manager = TransactionManager::new(MemoryStore::new());
        let tx = manager.new_tx().unwrap();
        tx.put("widgets", item(&[("id", "1"), ("color", "red")]), ReturnMode::None).unwrap();
        tx.commit().unwrap();
        let row = manager.get_row("widgets", &item(&[("id", "1")]), Isolation::Committed).unwrap();
        assert_eq!(row, Some(item(&[("id", "1"), ("color", "red")])));
    }

    #[test]
    fn break_lock_refuses_while_the_record_still_exists() {
        let manager = TransactionManager::new(MemoryStore::new());
        let tx = manager.new_tx().unwrap();
        tx.put("widgets", item(&[("id", "1")]), ReturnMode::None).unwrap();
        let err = manager.break_lock("widgets", &item(&[("id", "1")]), &tx.txid()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
