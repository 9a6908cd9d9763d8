//! The durable transaction record (T_TX) and its sibling item-image table
//! (T_IMG). [`RecordStore`] is the only thing in this crate that issues
//! conditional writes against those two tables; [`crate::txn`] drives it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error, TerminalState};
use crate::key::ItemKey;
use crate::request::{decode_recorded, encode_recorded, RecordedRequest, Request};
use crate::store::{Condition, KvStore};
use crate::value::{AttributeValue, Item};

pub const TX_TABLE: &str = "_kvtx_transactions";
pub const IMAGE_TABLE: &str = "_kvtx_item_images";

/// The backing store's assumed maximum single-item size, matching the
/// limit the DynamoDB Transactions library itself builds against. A
/// transaction record carrying more request bytes than this cannot be
/// written as one conditional put, so `AddRequest` rejects it up front
/// rather than discovering the failure as an opaque backing-store error.
pub const MAX_RECORD_SIZE_BYTES: usize = 400 * 1024;

/// The state a transaction record occupies before it is finalized. See
/// [`TransactionRecord::terminal`] for the finalized-or-not distinction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Committed,
    RolledBack,
}

impl TxState {
    fn tag(self) -> &'static str {
        match self {
            TxState::Pending => "pending",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
        }
    }

    fn from_tag(tag: &str) -> CResult<Self> {
        match tag {
            "pending" => Ok(TxState::Pending),
            "committed" => Ok(TxState::Committed),
            "rolled_back" => Ok(TxState::RolledBack),
            other => Err(Error::Serialization(format!(
                "unknown transaction state tag '{other}'"
            ))),
        }
    }

    /// The error a caller gets for trying to add to or roll back a record
    /// already in this state. Only meaningful for `Committed`/`RolledBack`.
    pub fn completion_error(self, txid: &str) -> Error {
        match self {
            TxState::Pending => Error::Assertion(format!("transaction {txid} is still pending")),
            TxState::Committed => Error::TxCommitted(txid.to_string()),
            TxState::RolledBack => Error::TxRolledBack(txid.to_string()),
        }
    }
}

/// The coordinator's durable state for one transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionRecord {
    pub txid: String,
    pub state: TxState,
    pub version: u64,
    pub last_updated: i64,
    pub finalized: bool,
    pub requests: BTreeMap<u64, Request>,
}

impl TransactionRecord {
    pub fn terminal(&self) -> Option<TerminalState> {
        match self.state {
            TxState::Committed => Some(TerminalState::Committed),
            TxState::RolledBack => Some(TerminalState::RolledBack),
            TxState::Pending => None,
        }
    }

    pub fn to_item(&self) -> CResult<Item> {
        let mut item = Item::new();
        item.insert("txid".into(), AttributeValue::S(self.txid.clone()));
        item.insert("state".into(), AttributeValue::S(self.state.tag().into()));
        item.insert("version".into(), AttributeValue::number(self.version as i64));
        item.insert(
            "last_updated".into(),
            AttributeValue::number(self.last_updated),
        );
        if self.finalized {
            item.insert("finalized".into(), AttributeValue::Bool(true));
        }
        if !self.requests.is_empty() {
            let mut blobs = BTreeSet::new();
            for (rid, request) in &self.requests {
                blobs.insert(encode_recorded(&RecordedRequest {
                    rid: *rid,
                    request: request.clone(),
                })?);
            }
            item.insert("requests".into(), AttributeValue::Bs(blobs));
        }
        Ok(item)
    }

    pub fn from_item(item: &Item) -> CResult<Self> {
        let txid = match item.get("txid") {
            Some(AttributeValue::S(s)) => s.clone(),
            _ => return Err(Error::Serialization("transaction record missing txid".into())),
        };
        let state = match item.get("state") {
            Some(AttributeValue::S(tag)) => TxState::from_tag(tag)?,
            _ => return Err(Error::Serialization("transaction record missing state".into())),
        };
        let version = match item.get("version") {
            Some(v) => v.as_number()? as u64,
            None => return Err(Error::Serialization("transaction record missing version".into())),
        };
        let last_updated = match item.get("last_updated") {
            Some(v) => v.as_number()?,
            None => 0,
        };
        let finalized = matches!(item.get("finalized"), Some(AttributeValue::Bool(true)));
        let requests = match item.get("requests") {
            Some(AttributeValue::Bs(blobs)) => {
                let mut map = BTreeMap::new();
                for blob in blobs {
                    let recorded = decode_recorded(blob)?;
                    map.insert(recorded.rid, recorded.request);
                }
                map
            }
            _ => BTreeMap::new(),
        };
        Ok(Self {
            txid,
            state,
            version,
            last_updated,
            finalized,
            requests,
        })
    }
}

fn tx_key(txid: &str) -> CResult<ItemKey> {
    ItemKey::single("txid", AttributeValue::S(txid.to_string()))
}

fn image_key(txid: &str, rid: u64) -> CResult<ItemKey> {
    ItemKey::single("image_id", AttributeValue::S(format!("{txid}#{rid}")))
}

/// Thin conditional-write wrapper over T_TX/T_IMG. Holds no state of its
/// own beyond a borrow of the backing store; every method takes the
/// caller's last-observed [`TransactionRecord`] and returns the new one, so
/// the caller (in `crate::txn`) is the one driving retry loops.
pub struct RecordStore<'s> {
    store: &'s dyn KvStore,
}

impl<'s> RecordStore<'s> {
    pub fn new(store: &'s dyn KvStore) -> Self {
        Self { store }
    }

    /// Creates a fresh Pending record. Fails if `txid` is already in use.
    pub fn insert(&self, txid: &str, now: i64) -> CResult<TransactionRecord> {
        let record = TransactionRecord {
            txid: txid.to_string(),
            state: TxState::Pending,
            version: 1,
            last_updated: now,
            finalized: false,
            requests: BTreeMap::new(),
        };
        self.store.put_item(
            TX_TABLE,
            &tx_key(txid)?,
            record.to_item()?,
            Condition::new().not_exists("txid"),
        )?;
        Ok(record)
    }

    pub fn load(&self, txid: &str) -> CResult<TransactionRecord> {
        match self.store.get_item(TX_TABLE, &tx_key(txid)?)? {
            Some(item) => TransactionRecord::from_item(&item),
            None => Err(Error::TxNotFound(txid.to_string())),
        }
    }

    /// Appends `request` to `record`, assigning it `rid = record.version`,
    /// and bumps `version`. Conditioned on `state = Pending` and the
    /// observed `version`; a lost race surfaces as
    /// `Error::ConditionalCheckFailed` for the caller to reload and retry.
    /// Does not perform duplicate-request or read-lock-merge detection —
    /// that needs the per-table key schema and lives in `crate::txn`.
    pub fn add_request_raw(
        &self,
        record: &TransactionRecord,
        request: Request,
        now: i64,
    ) -> CResult<(TransactionRecord, u64)> {
        if record.state != TxState::Pending {
            return Err(record.state.completion_error(&record.txid));
        }
        let rid = record.version;
        let table = request.table().to_string();
        let key_repr = format!("{:?}", request.raw_key_item());
        let mut requests = record.requests.clone();
        requests.insert(rid, request);
        let updated = TransactionRecord {
            version: record.version + 1,
            last_updated: now,
            requests,
            ..record.clone()
        };
        let encoded_size: usize = updated
            .requests
            .iter()
            .map(|(rid, request)| -> CResult<usize> {
                Ok(encode_recorded(&RecordedRequest {
                    rid: *rid,
                    request: request.clone(),
                })?
                .len())
            })
            .sum::<CResult<usize>>()?;
        if encoded_size > MAX_RECORD_SIZE_BYTES {
            return Err(Error::ItemSizeExceeded {
                table,
                key: key_repr,
                size: encoded_size,
                max: MAX_RECORD_SIZE_BYTES,
            });
        }
        self.store.put_item(
            TX_TABLE,
            &tx_key(&record.txid)?,
            updated.to_item()?,
            Condition::new()
                .eq("state", AttributeValue::S(TxState::Pending.tag().into()))
                .eq("version", AttributeValue::number(record.version as i64)),
        )?;
        Ok((updated, rid))
    }

    /// `Finish`: the Pending → {Committed, RolledBack} transition.
    pub fn finish(&self, record: &TransactionRecord, target: TxState, now: i64) -> CResult<TransactionRecord> {
        debug_assert!(matches!(target, TxState::Committed | TxState::RolledBack));
        let updated = TransactionRecord {
            state: target,
            version: record.version + 1,
            last_updated: now,
            ..record.clone()
        };
        self.store.put_item(
            TX_TABLE,
            &tx_key(&record.txid)?,
            updated.to_item()?,
            Condition::new()
                .eq("state", AttributeValue::S(TxState::Pending.tag().into()))
                .not_exists("finalized")
                .eq("version", AttributeValue::number(record.version as i64)),
        )?;
        log::info!("transaction {} finished as {}", record.txid, target.tag());
        Ok(updated)
    }

    /// Sets `finalized = true`, conditioned on the record still being in
    /// `expected` state.
    pub fn finalize(&self, record: &TransactionRecord, expected: TxState) -> CResult<TransactionRecord> {
        let updated = TransactionRecord {
            finalized: true,
            ..record.clone()
        };
        self.store.put_item(
            TX_TABLE,
            &tx_key(&record.txid)?,
            updated.to_item()?,
            Condition::new().eq("state", AttributeValue::S(expected.tag().into())),
        )?;
        log::info!("transaction {} finalized", record.txid);
        Ok(updated)
    }

    /// Conditioned on `finalized = true`. A record that is already gone is
    /// treated as a successful delete.
    pub fn delete(&self, txid: &str) -> CResult<()> {
        let key = tx_key(txid)?;
        if self.store.get_item(TX_TABLE, &key)?.is_none() {
            return Ok(());
        }
        self.store.delete_item(
            TX_TABLE,
            &key,
            Condition::new().eq("finalized", AttributeValue::Bool(true)),
        )
    }

    /// Saves the pre-image of `item` under `txid#rid`. A pre-existing image
    /// at that key is left untouched (the true pre-image is whichever one
    /// was written first).
    pub fn save_item_image(&self, txid: &str, rid: u64, item: &Item) -> CResult<()> {
        let mut image = item.clone();
        image.insert("image_id".into(), AttributeValue::S(format!("{txid}#{rid}")));
        match self.store.put_item(
            IMAGE_TABLE,
            &image_key(txid, rid)?,
            image,
            Condition::new().not_exists("image_id"),
        ) {
            Ok(()) => Ok(()),
            Err(Error::ConditionalCheckFailed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn load_item_image(&self, txid: &str, rid: u64) -> CResult<Option<Item>> {
        Ok(self
            .store
            .get_item(IMAGE_TABLE, &image_key(txid, rid)?)?
            .map(|mut image| {
                image.remove("image_id");
                image
            }))
    }

    pub fn delete_item_image(&self, txid: &str, rid: u64) -> CResult<()> {
        self.store
            .delete_item(IMAGE_TABLE, &image_key(txid, rid)?, Condition::new())
    }
}

/// Finds the `rid` of the request in `record` addressing `(table, key)`,
/// using `pk_attrs` (the primary-key attribute names of `table`) to compute
/// each candidate request's key. Used by the Committed isolation handler to
/// locate the pre-image covering a locked row.
pub fn rid_for(record: &TransactionRecord, table: &str, key: &ItemKey, pk_attrs: &[String]) -> CResult<Option<u64>> {
    for (rid, request) in &record.requests {
        if request.table() != table {
            continue;
        }
        if &request.key(pk_attrs)? == key {
            return Ok(Some(*rid));
        }
    }
    Ok(None)
}
