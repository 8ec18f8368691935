use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use kestreldb::common::types::{Rid, TableOid};
use kestreldb::storage::buffer::BufferPoolManager;
use kestreldb::transaction::concurrency::{
    IsolationLevel, LockManager, LockMode, TableUndo, TableWriteRecord, Transaction,
    TransactionAbort, WriteOp,
};

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Create a buffer pool manager backed by a temporary database file.
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let file = NamedTempFile::new()?;
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, file.path())?);
    Ok((bpm, file))
}

#[allow(dead_code)]
struct TestRow {
    value: i64,
    live: bool,
}

/// A minimal in-memory table heap: enough surface for the transaction
/// scenarios. Writers take IX table + X row locks, readers IS table + S row
/// locks (skipped entirely under READ_UNCOMMITTED, which may not take shared
/// locks at all).
#[allow(dead_code)]
pub struct TestTable {
    oid: TableOid,
    rows: Mutex<BTreeMap<Rid, TestRow>>,
    next_slot: AtomicU32,
}

#[allow(dead_code)]
impl TestTable {
    pub fn new(oid: TableOid, initial: &[i64]) -> Arc<Self> {
        let mut rows = BTreeMap::new();
        for (slot, &value) in initial.iter().enumerate() {
            rows.insert(Rid::new(oid, slot as u32), TestRow { value, live: true });
        }
        Arc::new(Self {
            oid,
            rows: Mutex::new(rows),
            next_slot: AtomicU32::new(initial.len() as u32),
        })
    }

    pub fn oid(&self) -> TableOid {
        self.oid
    }

    pub fn insert(
        self: &Arc<Self>,
        lock_manager: &LockManager,
        txn: &Arc<Transaction>,
        value: i64,
    ) -> Result<Rid, TransactionAbort> {
        lock_manager.lock_table(txn, LockMode::IntentionExclusive, self.oid)?;
        let rid = Rid::new(self.oid, self.next_slot.fetch_add(1, Ordering::SeqCst));
        lock_manager.lock_row(txn, LockMode::Exclusive, self.oid, rid)?;

        self.rows.lock().insert(rid, TestRow { value, live: true });
        txn.append_table_write_record(TableWriteRecord {
            oid: self.oid,
            rid,
            op: WriteOp::Insert,
            table: self.clone(),
        });
        Ok(rid)
    }

    pub fn delete(
        self: &Arc<Self>,
        lock_manager: &LockManager,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<(), TransactionAbort> {
        lock_manager.lock_table(txn, LockMode::IntentionExclusive, self.oid)?;
        lock_manager.lock_row(txn, LockMode::Exclusive, self.oid, rid)?;

        if let Some(row) = self.rows.lock().get_mut(&rid) {
            row.live = false;
        }
        txn.append_table_write_record(TableWriteRecord {
            oid: self.oid,
            rid,
            op: WriteOp::Delete,
            table: self.clone(),
        });
        Ok(())
    }

    pub fn find_rid(&self, value: i64) -> Option<Rid> {
        let rows = self.rows.lock();
        rows.iter()
            .find(|(_, row)| row.live && row.value == value)
            .map(|(&rid, _)| rid)
    }

    /// Scan live values in key order, taking read locks as the isolation
    /// level requires.
    pub fn scan(
        self: &Arc<Self>,
        lock_manager: &LockManager,
        txn: &Arc<Transaction>,
    ) -> Result<Vec<i64>, TransactionAbort> {
        let locking = txn.isolation_level() != IsolationLevel::ReadUncommitted;
        if locking {
            lock_manager.lock_table(txn, LockMode::IntentionShared, self.oid)?;
        }
        let rids: Vec<Rid> = self.rows.lock().keys().copied().collect();

        let mut values = Vec::new();
        for rid in rids {
            if locking {
                lock_manager.lock_row(txn, LockMode::Shared, self.oid, rid)?;
            }
            if let Some(row) = self.rows.lock().get(&rid) {
                if row.live {
                    values.push(row.value);
                }
            }
        }
        values.sort_unstable();
        Ok(values)
    }
}

impl TableUndo for TestTable {
    fn mark_deleted(&self, rid: Rid) {
        if let Some(row) = self.rows.lock().get_mut(&rid) {
            row.live = false;
        }
    }

    fn mark_live(&self, rid: Rid) {
        if let Some(row) = self.rows.lock().get_mut(&rid) {
            row.live = true;
        }
    }
}
