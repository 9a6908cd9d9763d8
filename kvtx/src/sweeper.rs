//! Background reclamation: rolls back transactions stuck `Pending` past a
//! rollback threshold, drives a completed-but-not-finalized record the rest
//! of the way to `finalized`, and deletes finalized records past a delete
//! threshold. Intended to be driven by a caller's own polling loop over
//! [`crate::manager::TransactionManager::sweep_once`] — this crate doesn't
//! run a background thread of its own.

use crate::error::CResult;
use crate::record::{RecordStore, TransactionRecord, TxState};
use crate::store::KvStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepAction {
    /// The record was already finalized and past its delete threshold; gone.
    Deleted,
    /// The record was stuck `Pending` past its rollback threshold and has
    /// now been rolled back.
    RolledBack,
    /// The record had already reached a terminal state but hadn't finished
    /// its cleanup pass; it has now been finalized.
    Finalized,
    /// Neither threshold had elapsed; nothing changed.
    None,
}

pub(crate) fn sweep_record<S: KvStore>(
    manager: &crate::manager::TransactionManager<S>,
    record: TransactionRecord,
    now: i64,
    rollback_threshold: i64,
    delete_threshold: i64,
) -> CResult<SweepAction> {
    if record.finalized {
        if record.last_updated + delete_threshold < now {
            RecordStore::new(manager.store()).delete(&record.txid)?;
            return Ok(SweepAction::Deleted);
        }
        return Ok(SweepAction::None);
    }

    if record.state == TxState::Pending {
        if record.last_updated + rollback_threshold < now {
            let tx = manager.resume_tx_from_record(record);
            return match tx.rollback() {
                Ok(()) => Ok(SweepAction::RolledBack),
                Err(e) if e.is_completed() => Ok(SweepAction::RolledBack),
                Err(e) => Err(e),
            };
        }
        return Ok(SweepAction::None);
    }

    // Committed or RolledBack but not yet finalized: calling rollback() here
    // is safe and converges for both, since honor_terminal runs the cleanup
    // matching the record's actual terminal state rather than re-deciding it.
    let tx = manager.resume_tx_from_record(record);
    match tx.rollback() {
        Ok(()) => Ok(SweepAction::Finalized),
        Err(e) if e.is_completed() => Ok(SweepAction::Finalized),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::manager::TransactionManager;
    use crate::request::ReturnMode;
    use crate::store::memory::MemoryStore;
    use crate::value::{AttributeValue, Item};
    use std::sync::Arc;

    fn item(id: &str) -> Item {
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S(id.into()));
        item
    }

    #[test]
    fn stuck_pending_record_is_rolled_back_past_the_threshold() {
        let clock = Arc::new(FakeClock::at(0));
        let manager = TransactionManager::with_clock(MemoryStore::new(), clock.clone());
        let tx = manager.new_tx().unwrap();
        tx.put("widgets", item("1"), ReturnMode::None).unwrap();

        clock.advance(1000);
        let record = RecordStore::new(manager.store()).load(&tx.txid()).unwrap();
        let action = manager.sweep_once(record, 500, 10_000).unwrap();
        assert_eq!(action, SweepAction::RolledBack);

        let row = manager
            .get_row("widgets", &item("1"), crate::isolation::Isolation::Committed)
            .unwrap();
        assert_eq!(row, None);
    }

    #[test]
    fn fresh_pending_record_is_left_alone() {
        let clock = Arc::new(FakeClock::at(0));
        let manager = TransactionManager::with_clock(MemoryStore::new(), clock);
        let tx = manager.new_tx().unwrap();
        let record = RecordStore::new(manager.store()).load(&tx.txid()).unwrap();
        let action = manager.sweep_once(record, 500, 10_000).unwrap();
        assert_eq!(action, SweepAction::None);
    }

    #[test]
    fn finalized_record_is_deleted_past_its_delete_threshold() {
        let clock = Arc::new(FakeClock::at(0));
        let manager = TransactionManager::with_clock(MemoryStore::new(), clock.clone());
        let tx = manager.new_tx().unwrap();
        tx.put("widgets", item("1"), ReturnMode::None).unwrap();
        tx.commit().unwrap();

        clock.advance(100_000);
        let record = RecordStore::new(manager.store()).load(&tx.txid()).unwrap();
        assert!(record.finalized);
        let action = manager.sweep_once(record, 500, 10_000).unwrap();
        assert_eq!(action, SweepAction::Deleted);
        assert!(RecordStore::new(manager.store()).load(&tx.txid()).is_err());
    }
}
