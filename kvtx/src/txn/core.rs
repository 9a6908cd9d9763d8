//! One coordinator driving one transaction. Safe for concurrent use by
//! multiple threads holding the same `Transaction` value (every entry
//! point takes the coordinator's mutex first), via an `Arc<Mutex<_>>`-style
//! guarded handle.
//!
//! Retry budgets are independent per loop (lock acquisition, contention
//! resolution, request addition, commit-decision, commit/rollback
//! cleanup), rather than one count reused across phases.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::{CResult, Error, TerminalState};
use crate::manager::TransactionManager;
use crate::record::{RecordStore, TransactionRecord, TxState};
use crate::request::{AttributeUpdate, Request, ReturnMode};
use crate::store::{AttributeAction, Condition, KvStore};
use crate::value::{
    clear_lock_attrs, is_applied, is_transient, lock_owner, strip_reserved, AttributeValue, Item,
    ATTR_APPLIED, ATTR_DATE, ATTR_TRANSIENT, ATTR_TXID,
};

const LOCK_ATTEMPTS: u32 = 5;
const CONTENTION_RESOLUTION_ATTEMPTS: u32 = 3;
const ADD_REQUEST_ATTEMPTS: u32 = 5;
const COMMIT_ATTEMPTS: u32 = 5;
const COMMIT_FINISH_ATTEMPTS: u32 = 5;

struct CoordinatorState {
    record: TransactionRecord,
    /// Rids this coordinator has itself carried through lock/save/apply.
    /// Lets a second call to `verify_locks` skip work it already observed
    /// complete, without needing to re-read the user row.
    applied: BTreeSet<u64>,
}

/// One coordinator's view of a transaction. Cheap to construct (holds a
/// borrow of the manager plus one in-memory copy of the record); many may
/// exist for the same `txid` across threads or processes at once, which is
/// exactly the coordinator hand-off the protocol is built to tolerate.
pub struct Transaction<'m, S: KvStore> {
    manager: &'m TransactionManager<S>,
    state: Mutex<CoordinatorState>,
}

impl<'m, S: KvStore> Transaction<'m, S> {
    pub(crate) fn new(manager: &'m TransactionManager<S>, record: TransactionRecord) -> Self {
        Self {
            manager,
            state: Mutex::new(CoordinatorState {
                record,
                applied: BTreeSet::new(),
            }),
        }
    }

    pub fn txid(&self) -> String {
        self.state.lock().expect("transaction mutex poisoned").record.txid.clone()
    }

    fn records(&self) -> RecordStore<'_> {
        RecordStore::new(self.manager.store())
    }

    pub fn put(&self, table: impl Into<String>, item: Item, return_mode: ReturnMode) -> CResult<Option<Item>> {
        self.drive_request(Request::PutRow {
            table: table.into(),
            item,
            return_mode,
        })
    }

    pub fn update(
        &self,
        table: impl Into<String>,
        key: Item,
        updates: Vec<AttributeUpdate>,
        return_mode: ReturnMode,
    ) -> CResult<Option<Item>> {
        self.drive_request(Request::UpdateRow {
            table: table.into(),
            key,
            updates,
            return_mode,
        })
    }

    pub fn delete(&self, table: impl Into<String>, key: Item, return_mode: ReturnMode) -> CResult<Option<Item>> {
        self.drive_request(Request::DeleteRow {
            table: table.into(),
            key,
            return_mode,
        })
    }

    pub fn read_lock(&self, table: impl Into<String>, key: Item) -> CResult<Option<Item>> {
        self.drive_request(Request::ReadLock { table: table.into(), key })
    }

    /// Step A: VerifyLocks, then AddRequest, then drive the new request
    /// through lock/save/verify/apply (steps B-E).
    fn drive_request(&self, request: Request) -> CResult<Option<Item>> {
        request.validate()?;
        let table = request.table().to_string();
        let pk_attrs = self.manager.key_attrs(&table)?;
        let key = request.key(&pk_attrs)?;

        let mut guard = self.state.lock().expect("transaction mutex poisoned");
        self.verify_locks_locked(&mut guard)?;
        let rid = self.add_request_locked(&mut guard, &table, &key, &pk_attrs, request.clone())?;
        self.drive_rid_locked(&mut guard, rid, &table, &key)?;

        let result = if matches!(request, Request::ReadLock { .. }) {
            self.read_lock_result(&guard, rid, &table, &key)?
        } else {
            match request.return_mode() {
                ReturnMode::None => None,
                ReturnMode::AllNew => self
                    .manager
                    .store()
                    .get_item(&table, &key)?
                    .map(|item| strip_reserved(&item)),
                ReturnMode::AllOld => self
                    .records()
                    .load_item_image(&guard.record.txid, rid)?
                    .map(|item| strip_reserved(&item)),
            }
        };
        Ok(result)
    }

    /// The value a `ReadLock` observes: the locked row's current bytes,
    /// with reserved attributes stripped. A `ReadLock` that merged into an
    /// existing `DeleteRow` on the same key reports absent (the row is
    /// being deleted by this transaction, so there is nothing to read);
    /// a `ReadLock` over a row that doesn't exist (a phantom lock) also
    /// reports absent rather than the bare lock-attribute placeholder.
    fn read_lock_result(&self, guard: &CoordinatorState, rid: u64, table: &str, key: &crate::key::ItemKey) -> CResult<Option<Item>> {
        if matches!(guard.record.requests.get(&rid), Some(Request::DeleteRow { .. })) {
            return Ok(None);
        }
        let current = self.manager.store().get_item(table, key)?;
        Ok(match current {
            Some(item) if is_transient(&item) && !is_applied(&item) => None,
            Some(item) => Some(strip_reserved(&item)),
            None => None,
        })
    }

    /// Resolves duplicate-request / read-lock-merge against the record as
    /// currently observed, then appends (with bounded retry on a lost
    /// optimistic-concurrency race).
    fn add_request_locked(
        &self,
        guard: &mut CoordinatorState,
        table: &str,
        key: &crate::key::ItemKey,
        pk_attrs: &[String],
        request: Request,
    ) -> CResult<u64> {
        for (existing_rid, existing) in &guard.record.requests {
            if existing.table() != table {
                continue;
            }
            if &existing.key(pk_attrs)? != key {
                continue;
            }
            match (existing.is_mutating(), request.is_mutating()) {
                (true, false) => return Ok(*existing_rid),
                (false, false) => return Ok(*existing_rid),
                (true, true) => {
                    return Err(Error::DuplicateRequest {
                        table: table.to_string(),
                        key: key.to_string(),
                    })
                }
                // A mutating request supersedes a bare read-lock on the same
                // row: fall through and append it as a new request.
                (false, true) => break,
            }
        }

        let records = self.records();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match records.add_request_raw(&guard.record, request.clone(), self.manager.now()) {
                Ok((updated, rid)) => {
                    guard.record = updated;
                    return Ok(rid);
                }
                Err(Error::ConditionalCheckFailed(_)) if attempts < ADD_REQUEST_ATTEMPTS => {
                    guard.record = records.load(&guard.record.txid)?;
                    if let Some(terminal) = guard.record.terminal() {
                        return Err(terminal_error(&guard.record.txid, terminal));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Step F: catches this coordinator up on every request already in the
    /// record that it hasn't itself driven through apply yet.
    fn verify_locks_locked(&self, guard: &mut CoordinatorState) -> CResult<()> {
        let pending: Vec<u64> = guard
            .record
            .requests
            .keys()
            .copied()
            .filter(|rid| !guard.applied.contains(rid))
            .collect();
        for rid in pending {
            let Some(request) = guard.record.requests.get(&rid).cloned() else {
                continue;
            };
            let table = request.table().to_string();
            let pk_attrs = self.manager.key_attrs(&table)?;
            let key = request.key(&pk_attrs)?;
            self.drive_rid_locked(guard, rid, &table, &key)?;
        }
        Ok(())
    }

    /// Steps B-E for a single already-recorded request.
    fn drive_rid_locked(
        &self,
        guard: &mut CoordinatorState,
        rid: u64,
        table: &str,
        key: &crate::key::ItemKey,
    ) -> CResult<()> {
        if guard.applied.contains(&rid) {
            return Ok(());
        }
        let txid = guard.record.txid.clone();
        let request = guard
            .record
            .requests
            .get(&rid)
            .cloned()
            .ok_or_else(|| Error::Assertion(format!("rid {rid} missing from transaction {txid}")))?;

        let locked_item = self.lock_item(&txid, table, key)?;

        if request.is_mutating() {
            self.save_pre_image(&txid, rid, &locked_item)?;
        }

        self.reverify_record_state(guard, table, key)?;

        self.apply(&txid, rid, table, key, &request, &locked_item)?;

        guard.applied.insert(rid);
        Ok(())
    }

    /// Step B.
    fn lock_item(&self, txid: &str, table: &str, key: &crate::key::ItemKey) -> CResult<Item> {
        let store = self.manager.store();
        let marker = key
            .attribute_names()
            .next()
            .ok_or_else(|| Error::Assertion("key has no attributes".into()))?
            .to_string();
        let mut expect_exists = store.get_item(table, key)?.is_some();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut actions = vec![
                AttributeAction::Put(ATTR_TXID.into(), AttributeValue::S(txid.to_string())),
                AttributeAction::Put(ATTR_DATE.into(), AttributeValue::number(self.manager.now())),
            ];
            let mut condition = Condition::new().not_exists(ATTR_TXID);
            if expect_exists {
                condition = condition.exists(marker.clone());
            } else {
                condition = condition.not_exists(marker.clone());
                actions.push(AttributeAction::Put(ATTR_TRANSIENT.into(), AttributeValue::Bool(true)));
            }
            match store.update_item(table, key, &actions, condition) {
                Ok(item) => {
                    log::debug!("transaction {txid} acquired lock on {table}/{key}");
                    return Ok(item);
                }
                Err(Error::ConditionalCheckFailed(_)) => {
                    let current = store.get_item(table, key)?;
                    match current.as_ref().and_then(|i| lock_owner(i)) {
                        Some(owner) if owner == txid => {
                            return store
                                .get_item(table, key)?
                                .ok_or_else(|| Error::Assertion(format!("item {table}/{key} disappeared after we locked it")));
                        }
                        Some(owner) => {
                            let owner = owner.to_string();
                            if attempts >= LOCK_ATTEMPTS {
                                return Err(Error::ItemNotLocked {
                                    table: table.to_string(),
                                    key: key.to_string(),
                                    owner,
                                });
                            }
                            self.resolve_contention(&owner)?;
                        }
                        None => {
                            if attempts >= LOCK_ATTEMPTS {
                                return Err(Error::Assertion(format!(
                                    "could not acquire lock on {table}/{key} after {attempts} attempts"
                                )));
                            }
                            expect_exists = current.is_some();
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Step K: force-completes the transaction blocking us, so that a
    /// deadlock resolves instead of both coordinators waiting forever.
    fn resolve_contention(&self, owner_txid: &str) -> CResult<()> {
        log::info!("resolving contention: rolling back transaction {owner_txid}");
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.manager.resume_tx(owner_txid) {
                Ok(other) => match other.rollback() {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_completed() => return Ok(()),
                    Err(_) if attempts < CONTENTION_RESOLUTION_ATTEMPTS => continue,
                    Err(e) => return Err(e),
                },
                Err(Error::TxNotFound(_)) => return Ok(()),
                Err(_) if attempts < CONTENTION_RESOLUTION_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Step C.
    fn save_pre_image(&self, txid: &str, rid: u64, locked_item: &Item) -> CResult<()> {
        if is_transient(locked_item) || is_applied(locked_item) {
            return Ok(());
        }
        self.records().save_item_image(txid, rid, locked_item)
    }

    /// Step D.
    fn reverify_record_state(&self, guard: &mut CoordinatorState, table: &str, key: &crate::key::ItemKey) -> CResult<()> {
        let txid = guard.record.txid.clone();
        match self.records().load(&txid) {
            Ok(record) => {
                guard.record = record;
                if let Some(terminal) = guard.record.terminal() {
                    match terminal {
                        TerminalState::Committed => {
                            self.do_commit(guard)?;
                        }
                        TerminalState::RolledBack => {
                            self.do_rollback(guard)?;
                        }
                    }
                    return Err(terminal_error(&txid, terminal));
                }
                Ok(())
            }
            Err(Error::TxNotFound(_)) => {
                let _ = self.release_read_lock(&txid, table, key);
                Err(Error::TxNotFound(txid))
            }
            Err(e) => Err(e),
        }
    }

    /// Step E.
    fn apply(
        &self,
        txid: &str,
        rid: u64,
        table: &str,
        key: &crate::key::ItemKey,
        request: &Request,
        locked_item: &Item,
    ) -> CResult<()> {
        if is_applied(locked_item) {
            return Ok(());
        }
        let store = self.manager.store();
        match request {
            Request::PutRow { item, .. } => {
                let mut full = item.clone();
                full.insert(ATTR_TXID.into(), AttributeValue::S(txid.to_string()));
                if let Some(date) = locked_item.get(ATTR_DATE) {
                    full.insert(ATTR_DATE.into(), date.clone());
                }
                if is_transient(locked_item) {
                    full.insert(ATTR_TRANSIENT.into(), AttributeValue::Bool(true));
                }
                full.insert(ATTR_APPLIED.into(), AttributeValue::Bool(true));
                store.put_item(
                    table,
                    key,
                    full,
                    Condition::new()
                        .eq(ATTR_TXID, AttributeValue::S(txid.to_string()))
                        .not_exists(ATTR_APPLIED),
                )?;
            }
            Request::UpdateRow { updates, .. } => {
                let mut actions: Vec<AttributeAction> = updates
                    .iter()
                    .map(|update| match update {
                        AttributeUpdate::Put(name, value) => AttributeAction::Put(name.clone(), value.clone()),
                        AttributeUpdate::Add(name, value) => AttributeAction::Add(name.clone(), value.clone()),
                        AttributeUpdate::Delete(name) => AttributeAction::Delete(name.clone()),
                    })
                    .collect();
                actions.push(AttributeAction::Put(ATTR_APPLIED.into(), AttributeValue::Bool(true)));
                store.update_item(
                    table,
                    key,
                    &actions,
                    Condition::new()
                        .eq(ATTR_TXID, AttributeValue::S(txid.to_string()))
                        .not_exists(ATTR_APPLIED),
                )?;
            }
            // The delete is realized at unlock-after-commit; nothing to
            // write here, and ReadLock never mutates the row.
            Request::DeleteRow { .. } | Request::ReadLock { .. } => {}
        }
        log::debug!("transaction {txid} applied request {rid} on {table}/{key}");
        Ok(())
    }

    pub fn commit(&self) -> CResult<()> {
        let mut guard = self.state.lock().expect("transaction mutex poisoned");
        if let Some(terminal) = guard.record.terminal() {
            return self.honor_terminal(&mut guard, terminal);
        }
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.verify_locks_locked(&mut guard)?;
            match self.records().finish(&guard.record, TxState::Committed, self.manager.now()) {
                Ok(updated) => {
                    guard.record = updated;
                    break;
                }
                Err(Error::ConditionalCheckFailed(_)) if attempts < COMMIT_ATTEMPTS => {
                    guard.record = self.records().load(&guard.record.txid)?;
                    if let Some(terminal) = guard.record.terminal() {
                        return self.honor_terminal(&mut guard, terminal);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.do_commit(&mut guard)
    }

    pub fn rollback(&self) -> CResult<()> {
        let mut guard = self.state.lock().expect("transaction mutex poisoned");
        if let Some(terminal) = guard.record.terminal() {
            return self.honor_terminal(&mut guard, terminal);
        }
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.records().finish(&guard.record, TxState::RolledBack, self.manager.now()) {
                Ok(updated) => {
                    guard.record = updated;
                    break;
                }
                Err(Error::ConditionalCheckFailed(_)) if attempts < COMMIT_ATTEMPTS => {
                    guard.record = self.records().load(&guard.record.txid)?;
                    if let Some(terminal) = guard.record.terminal() {
                        return self.honor_terminal(&mut guard, terminal);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.do_rollback(&mut guard)
    }

    fn honor_terminal(&self, guard: &mut CoordinatorState, terminal: TerminalState) -> CResult<()> {
        let txid = guard.record.txid.clone();
        match terminal {
            TerminalState::Committed => {
                self.do_commit(guard)?;
                Err(Error::TxCommitted(txid))
            }
            TerminalState::RolledBack => {
                self.do_rollback(guard)?;
                Err(Error::TxRolledBack(txid))
            }
        }
    }

    /// Step G.2-G.3, retried as a whole: unlock every row, drop every
    /// pre-image, then finalize.
    fn do_commit(&self, guard: &mut CoordinatorState) -> CResult<()> {
        let txid = guard.record.txid.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.finish_commit_cleanup(guard) {
                Ok(()) => return Ok(()),
                Err(e) if attempts < COMMIT_FINISH_ATTEMPTS => {
                    log::warn!("commit cleanup for {txid} failed on attempt {attempts}, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_commit_cleanup(&self, guard: &mut CoordinatorState) -> CResult<()> {
        let txid = guard.record.txid.clone();
        let requests: Vec<(u64, Request)> = guard
            .record
            .requests
            .iter()
            .map(|(rid, request)| (*rid, request.clone()))
            .collect();
        for (rid, request) in &requests {
            let table = request.table().to_string();
            let pk_attrs = self.manager.key_attrs(&table)?;
            let key = request.key(&pk_attrs)?;
            self.unlock_after_commit(&txid, &table, &key, request)?;
            self.records().delete_item_image(&txid, *rid)?;
        }
        guard.record = self.records().finalize(&guard.record, TxState::Committed)?;
        Ok(())
    }

    fn unlock_after_commit(&self, txid: &str, table: &str, key: &crate::key::ItemKey, request: &Request) -> CResult<()> {
        let store = self.manager.store();
        let owned = Condition::new().eq(ATTR_TXID, AttributeValue::S(txid.to_string()));
        match request {
            Request::DeleteRow { .. } => match store.delete_item(table, key, owned) {
                Ok(()) | Err(Error::ConditionalCheckFailed(_)) => Ok(()),
                Err(e) => Err(e),
            },
            Request::ReadLock { .. } => self.release_read_lock(txid, table, key),
            Request::PutRow { .. } | Request::UpdateRow { .. } => {
                match store.update_item(
                    table,
                    key,
                    &[
                        AttributeAction::Delete(ATTR_TXID.into()),
                        AttributeAction::Delete(ATTR_DATE.into()),
                        AttributeAction::Delete(ATTR_TRANSIENT.into()),
                        AttributeAction::Delete(ATTR_APPLIED.into()),
                    ],
                    owned,
                ) {
                    Ok(_) | Err(Error::ConditionalCheckFailed(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Step H: drives `doRollback` to completion, retried as a whole.
    fn do_rollback(&self, guard: &mut CoordinatorState) -> CResult<()> {
        let txid = guard.record.txid.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.finish_rollback_cleanup(guard) {
                Ok(()) => return Ok(()),
                Err(e) if attempts < COMMIT_FINISH_ATTEMPTS => {
                    log::warn!("rollback cleanup for {txid} failed on attempt {attempts}, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_rollback_cleanup(&self, guard: &mut CoordinatorState) -> CResult<()> {
        let txid = guard.record.txid.clone();
        let requests: Vec<(u64, Request)> = guard
            .record
            .requests
            .iter()
            .map(|(rid, request)| (*rid, request.clone()))
            .collect();
        for (rid, request) in &requests {
            let table = request.table().to_string();
            let pk_attrs = self.manager.key_attrs(&table)?;
            let key = request.key(&pk_attrs)?;
            self.rollback_item_and_release_lock(&txid, *rid, &table, &key, request)?;
            self.records().delete_item_image(&txid, *rid)?;
        }
        guard.record = self.records().finalize(&guard.record, TxState::RolledBack)?;
        Ok(())
    }

    /// Step I.
    fn rollback_item_and_release_lock(
        &self,
        txid: &str,
        rid: u64,
        table: &str,
        key: &crate::key::ItemKey,
        request: &Request,
    ) -> CResult<()> {
        if matches!(request, Request::ReadLock { .. }) {
            return self.release_read_lock(txid, table, key);
        }
        let store = self.manager.store();
        let owned = Condition::new().eq(ATTR_TXID, AttributeValue::S(txid.to_string()));
        match self.records().load_item_image(txid, rid)? {
            Some(mut image) => {
                clear_lock_attrs(&mut image);
                match store.put_item(table, key, image, owned) {
                    Ok(()) | Err(Error::ConditionalCheckFailed(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            None => {
                let transient_owned = Condition::new()
                    .eq(ATTR_TXID, AttributeValue::S(txid.to_string()))
                    .eq(ATTR_TRANSIENT, AttributeValue::Bool(true));
                match store.delete_item(table, key, transient_owned) {
                    Ok(()) => Ok(()),
                    Err(Error::ConditionalCheckFailed(_)) => {
                        match store.get_item(table, key)? {
                            None => Ok(()),
                            Some(item) => {
                                if lock_owner(&item) == Some(txid) && is_applied(&item) {
                                    return Err(Error::Assertion(format!(
                                        "item {table}/{key} is applied with no pre-image and is not transient"
                                    )));
                                }
                                self.release_read_lock(txid, table, key)
                            }
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Step J.
    fn release_read_lock(&self, txid: &str, table: &str, key: &crate::key::ItemKey) -> CResult<()> {
        let store = self.manager.store();
        match store.update_item(
            table,
            key,
            &[AttributeAction::Delete(ATTR_TXID.into()), AttributeAction::Delete(ATTR_DATE.into())],
            Condition::new()
                .eq(ATTR_TXID, AttributeValue::S(txid.to_string()))
                .not_exists(ATTR_TRANSIENT)
                .not_exists(ATTR_APPLIED),
        ) {
            Ok(_) => Ok(()),
            Err(Error::ConditionalCheckFailed(_)) => match store.delete_item(
                table,
                key,
                Condition::new()
                    .eq(ATTR_TXID, AttributeValue::S(txid.to_string()))
                    .eq(ATTR_TRANSIENT, AttributeValue::Bool(true)),
            ) {
                Ok(()) | Err(Error::ConditionalCheckFailed(_)) => Ok(()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}

fn terminal_error(txid: &str, terminal: TerminalState) -> Error {
    match terminal {
        TerminalState::Committed => Error::TxCommitted(txid.to_string()),
        TerminalState::RolledBack => Error::TxRolledBack(txid.to_string()),
    }
}
