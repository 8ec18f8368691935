use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::warn;

use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState, WriteOp,
};

/// Creates transactions with monotonically increasing ids and drives
/// commit and abort.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.lock_manager.register_txn(txn.clone());
        txn
    }

    /// Commit: release every held lock, then transition to COMMITTED.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.release_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.lock_manager.deregister_txn(txn.id());
    }

    /// Abort: replay the write sets backwards to undo every change, then
    /// force-release all locks and transition to ABORTED.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        self.revert_write_sets(txn);
        self.release_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.deregister_txn(txn.id());
    }

    fn revert_write_sets(&self, txn: &Arc<Transaction>) {
        for record in txn.take_write_set().into_iter().rev() {
            match record.op {
                WriteOp::Insert => record.table.mark_deleted(record.rid),
                WriteOp::Delete => record.table.mark_live(record.rid),
            }
        }
        for record in txn.take_index_write_set().into_iter().rev() {
            match record.op {
                WriteOp::Insert => record.index.delete_entry(&record.key, record.rid),
                WriteOp::Delete => record.index.insert_entry(&record.key, record.rid),
            }
        }
    }

    /// Rows release before their tables so the row-before-table rule can
    /// never trip; `force` skips state transitions entirely.
    fn release_locks(&self, txn: &Arc<Transaction>) {
        let (tables, rows) = txn.held_locks();
        for (oid, rid) in rows {
            if let Err(e) = self.lock_manager.unlock_row(txn, oid, rid, true) {
                warn!("txn {}: releasing row lock failed: {}", txn.id(), e);
            }
        }
        for (_, oid) in tables {
            if let Err(e) = self.lock_manager.unlock_table_inner(txn, oid, true) {
                warn!("txn {}: releasing table lock failed: {}", txn.id(), e);
            }
        }
    }
}
