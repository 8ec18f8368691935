use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::index::btree::BTreeIndex;
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase-locking transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was forcibly aborted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while in the shrinking phase")]
    LockOnShrinking,
    #[error("shared lock requested under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,
    #[error("requested lock is not an upgrade of the held lock")]
    IncompatibleUpgrade,
    #[error("unlock attempted on a lock that is not held")]
    AttemptedUnlockButNoLockHeld,
    #[error("intention lock attempted on a row")]
    AttemptedIntentionLockOnRow,
    #[error("row lock requested without the required table lock")]
    TableLockNotPresent,
    #[error("table unlocked before its row locks were released")]
    TableUnlockedBeforeUnlockingRows,
    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// Transaction-fatal failure: the transaction has been marked ABORTED and
/// the caller must propagate and run `TransactionManager::abort`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

impl TransactionAbort {
    pub fn new(txn_id: TxnId, reason: AbortReason) -> Self {
        Self { txn_id, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
}

/// Undo surface of a table heap: aborting flips tuple visibility.
pub trait TableUndo: Send + Sync {
    fn mark_deleted(&self, rid: Rid);
    fn mark_live(&self, rid: Rid);
}

/// Undo surface of an index. Keys travel in their serialized form so the
/// write set stays untyped.
pub trait IndexUndo: Send + Sync {
    fn insert_entry(&self, key: &[u8], rid: Rid);
    fn delete_entry(&self, key: &[u8], rid: Rid);
}

/// One table heap modification, replayed backwards on abort.
pub struct TableWriteRecord {
    pub oid: TableOid,
    pub rid: Rid,
    pub op: WriteOp,
    pub table: Arc<dyn TableUndo>,
}

/// One index modification, replayed backwards on abort.
pub struct IndexWriteRecord {
    pub key: Vec<u8>,
    pub rid: Rid,
    pub op: WriteOp,
    pub index: Arc<dyn IndexUndo>,
}

/// Held locks, one bucket per granularity/mode. Guarded by the
/// transaction's own mutex.
#[derive(Default)]
struct LockSets {
    intention_shared_table: HashSet<TableOid>,
    intention_exclusive_table: HashSet<TableOid>,
    shared_table: HashSet<TableOid>,
    shared_intention_exclusive_table: HashSet<TableOid>,
    exclusive_table: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

/// An active database transaction.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSets>,
    write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
            write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn append_table_write_record(&self, record: TableWriteRecord) {
        self.write_set.lock().push(record);
    }

    pub fn append_index_write_record(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    pub(crate) fn take_write_set(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut self.write_set.lock())
    }

    pub(crate) fn take_index_write_set(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut self.index_write_set.lock())
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut locks = self.locks.lock();
        locks.table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut locks = self.locks.lock();
        locks.table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock();
        if let Some(rows) = locks.row_map_mut(mode) {
            rows.entry(oid).or_default().insert(rid);
        }
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock();
        if let Some(rows) = locks.row_map_mut(mode) {
            if let Some(set) = rows.get_mut(&oid) {
                set.remove(&rid);
            }
        }
    }

    /// The table lock mode this transaction holds on `oid`, if any. A
    /// transaction holds at most one mode per table; upgrades replace it.
    pub fn held_table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let locks = self.locks.lock();
        for mode in [
            LockMode::Exclusive,
            LockMode::SharedIntentionExclusive,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::IntentionShared,
        ] {
            if locks.table_set(mode).contains(&oid) {
                return Some(mode);
            }
        }
        None
    }

    /// Whether any row locks under `oid` are still held.
    pub fn has_row_locks_under(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.shared_rows.get(&oid).is_some_and(|s| !s.is_empty())
            || locks.exclusive_rows.get(&oid).is_some_and(|s| !s.is_empty())
    }

    /// Snapshot of every held lock, rows and tables separately, for release
    /// at commit/abort time.
    pub(crate) fn held_locks(&self) -> (Vec<(LockMode, TableOid)>, Vec<(TableOid, Rid)>) {
        let locks = self.locks.lock();
        let mut tables = Vec::new();
        for mode in [
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ] {
            for &oid in locks.table_set(mode) {
                tables.push((mode, oid));
            }
        }
        let mut rows = Vec::new();
        for map in [&locks.shared_rows, &locks.exclusive_rows] {
            for (&oid, rids) in map {
                for &rid in rids {
                    rows.push((oid, rid));
                }
            }
        }
        (tables, rows)
    }
}

impl LockSets {
    fn table_set(&self, mode: LockMode) -> &HashSet<TableOid> {
        match mode {
            LockMode::IntentionShared => &self.intention_shared_table,
            LockMode::IntentionExclusive => &self.intention_exclusive_table,
            LockMode::Shared => &self.shared_table,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_table,
            LockMode::Exclusive => &self.exclusive_table,
        }
    }

    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::IntentionShared => &mut self.intention_shared_table,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table,
            LockMode::Shared => &mut self.shared_table,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_table,
            LockMode::Exclusive => &mut self.exclusive_table,
        }
    }

    fn row_map_mut(&mut self, mode: LockMode) -> Option<&mut HashMap<TableOid, HashSet<Rid>>> {
        match mode {
            LockMode::Shared => Some(&mut self.shared_rows),
            LockMode::Exclusive => Some(&mut self.exclusive_rows),
            _ => None,
        }
    }
}

impl<K> IndexUndo for BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    fn insert_entry(&self, key: &[u8], rid: Rid) {
        match bincode::deserialize::<K>(key) {
            Ok(key) => {
                if let Err(e) = self.insert(key, rid) {
                    warn!("index {}: undo insert failed: {}", self.name(), e);
                }
            }
            Err(e) => warn!("index {}: undo key did not decode: {}", self.name(), e),
        }
    }

    fn delete_entry(&self, key: &[u8], _rid: Rid) {
        match bincode::deserialize::<K>(key) {
            Ok(key) => {
                if let Err(e) = self.remove(&key) {
                    warn!("index {}: undo delete failed: {}", self.name(), e);
                }
            }
            Err(e) => warn!("index {}: undo key did not decode: {}", self.name(), e),
        }
    }
}
