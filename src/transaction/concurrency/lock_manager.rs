use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbort, TransactionState,
};

mod deadlock;

/// Hierarchical lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }

    /// The standard multi-granularity compatibility matrix.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => !matches!(other, Exclusive),
            IntentionExclusive => matches!(other, IntentionShared | IntentionExclusive),
            Shared => matches!(other, IntentionShared | Shared),
            SharedIntentionExclusive => matches!(other, IntentionShared),
            Exclusive => false,
        }
    }

    /// The upgrade lattice: IS → {S, X, IX, SIX}, S/IX → {X, SIX}, SIX → {X}.
    pub fn can_upgrade_to(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => !matches!(requested, IntentionShared),
            Shared | IntentionExclusive => {
                matches!(requested, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => matches!(requested, Exclusive),
            Exclusive => false,
        }
    }

    /// Whether holding `self` already grants everything `requested` would.
    /// X satisfies every weaker mode.
    pub fn satisfies(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(requested, IntentionShared),
            IntentionExclusive => matches!(requested, IntentionShared | IntentionExclusive),
            Shared => matches!(requested, IntentionShared | Shared),
            SharedIntentionExclusive => !matches!(requested, Exclusive),
            Exclusive => true,
        }
    }
}

/// One transaction's position in a resource queue.
#[derive(Debug)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub mode: LockMode,
    pub granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

struct QueueState {
    requests: VecDeque<LockRequest>,
    /// The single transaction currently upgrading on this queue, if any.
    upgrading: Option<TxnId>,
}

/// FIFO request queue for one resource, with its own condition variable.
pub(crate) struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                upgrading: None,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Which resource a queue belongs to, for held-lock-set bookkeeping.
#[derive(Clone, Copy)]
enum Resource {
    Table(TableOid),
    Row(TableOid, Rid),
}

/// Multi-granularity two-phase lock manager over tables and rows, with a
/// background deadlock detector (see `deadlock`).
pub struct LockManager {
    table_locks: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_locks: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    enable_cycle_detection: AtomicBool,
    cycle_detection_interval: Duration,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(cycle_detection_interval: Duration) -> Self {
        Self {
            table_locks: Mutex::new(HashMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
            txns: Mutex::new(HashMap::new()),
            enable_cycle_detection: AtomicBool::new(false),
            cycle_detection_interval,
            detector: Mutex::new(None),
        }
    }

    /// Make a transaction visible to the deadlock detector.
    pub fn register_txn(&self, txn: Arc<Transaction>) {
        self.txns.lock().insert(txn.id(), txn);
    }

    pub fn deregister_txn(&self, txn_id: TxnId) {
        self.txns.lock().remove(&txn_id);
    }

    pub(crate) fn txn(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().get(&txn_id).cloned()
    }

    /// Acquire a table lock, blocking until it is grantable. Returns
    /// `Ok(false)` if the transaction is already aborted.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        if !self.can_txn_take_lock(txn, mode)? {
            return Ok(false);
        }
        let queue = {
            let mut map = self.table_locks.lock();
            map.entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new()))
                .clone()
        };
        self.acquire(txn, &queue, mode, Resource::Table(oid))
    }

    /// Release a table lock, transitioning 2PL state as the mode and
    /// isolation level dictate. All row locks under the table must have been
    /// released first.
    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        self.unlock_table_inner(txn, oid, false)
    }

    /// Acquire a row lock. Intention modes are rejected, and the matching
    /// table lock must already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        if !self.can_txn_take_lock(txn, mode)? {
            return Ok(false);
        }
        if mode.is_intention() {
            return Err(self.abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        if !self.table_lock_allows_row(txn, oid, mode) {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }
        let queue = {
            let mut map = self.row_locks.lock();
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new()))
                .clone()
        };
        self.acquire(txn, &queue, mode, Resource::Row(oid, rid))
    }

    /// Release a row lock. `force` (used while aborting) skips the held-lock
    /// and state-transition checks.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
        force: bool,
    ) -> Result<bool, TransactionAbort> {
        let queue = self.row_locks.lock().get(&rid).cloned();
        let Some(queue) = queue else {
            if force {
                return Ok(true);
            }
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            if force {
                return Ok(true);
            }
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mode = state.requests[pos].mode;
        if !force && !self.table_lock_allows_row(txn, oid, mode) {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }
        if !force {
            self.transition_on_release(txn, mode);
        }
        state.requests.remove(pos);
        txn.remove_row_lock(mode, oid, rid);
        drop(state);
        queue.cv.notify_all();
        Ok(true)
    }

    pub(crate) fn unlock_table_inner(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        force: bool,
    ) -> Result<bool, TransactionAbort> {
        let queue = self.table_locks.lock().get(&oid).cloned();
        let Some(queue) = queue else {
            if force {
                return Ok(true);
            }
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            if force {
                return Ok(true);
            }
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if !force && txn.has_row_locks_under(oid) {
            drop(state);
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        let mode = state.requests[pos].mode;
        if !force {
            self.transition_on_release(txn, mode);
        }
        state.requests.remove(pos);
        txn.remove_table_lock(mode, oid);
        drop(state);
        queue.cv.notify_all();
        Ok(true)
    }

    /// The shared acquire protocol: find or append this transaction's
    /// request, handle inline upgrades, then wait on the queue's condition
    /// variable until the request is compatible with every granted request
    /// and every earlier waiter.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        mode: LockMode,
        resource: Resource,
    ) -> Result<bool, TransactionAbort> {
        let txn_id = txn.id();
        let mut state = queue.state.lock();

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id == txn_id) {
            let held = state.requests[pos].mode;
            if state.requests[pos].granted && held.satisfies(mode) {
                return Ok(true);
            }
            if !held.can_upgrade_to(mode) {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
            }
            // Upgrade in place: the request keeps its queue position, which
            // is what prioritizes it over waiters that arrived later.
            state.upgrading = Some(txn_id);
            state.requests[pos].granted = false;
            state.requests[pos].mode = mode;
            self.remove_from_lock_sets(txn, held, resource);
        } else {
            state.requests.push_back(LockRequest::new(txn_id, mode));
        }

        while !Self::request_is_compatible(&state, txn_id, mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                // The deadlock detector picked us; clean up and unwind.
                state.requests.retain(|r| r.txn_id != txn_id);
                if state.upgrading == Some(txn_id) {
                    state.upgrading = None;
                }
                drop(state);
                queue.cv.notify_all();
                return Err(TransactionAbort::new(txn_id, AbortReason::Deadlock));
            }
        }

        if let Some(req) = state.requests.iter_mut().find(|r| r.txn_id == txn_id) {
            req.granted = true;
        }
        if state.upgrading == Some(txn_id) {
            state.upgrading = None;
        }
        self.add_to_lock_sets(txn, mode, resource);
        Ok(true)
    }

    /// A request is grantable when it is compatible with every granted
    /// request of another transaction, and with every ungranted request
    /// queued before it (so a stream of new readers cannot starve a waiting
    /// writer).
    fn request_is_compatible(state: &QueueState, txn_id: TxnId, mode: LockMode) -> bool {
        let mut before_self = true;
        for req in &state.requests {
            if req.txn_id == txn_id {
                before_self = false;
                continue;
            }
            if !req.mode.compatible_with(mode) && (req.granted || before_self) {
                return false;
            }
        }
        true
    }

    /// Isolation-level gating. Returns `Ok(false)` for an already-aborted
    /// transaction; illegal requests abort the transaction.
    fn can_txn_take_lock(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<bool, TransactionAbort> {
        let state = txn.state();
        if state == TransactionState::Aborted {
            return Ok(false);
        }
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared | LockMode::IntentionShared | LockMode::SharedIntentionExclusive
                ) {
                    return Err(self.abort_txn(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state != TransactionState::Growing {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, LockMode::Shared | LockMode::IntentionShared)
                {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(true)
    }

    /// Releasing X always enters the shrinking phase; releasing S does so
    /// only under REPEATABLE_READ. Intention releases never shrink.
    fn transition_on_release(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match mode {
            LockMode::Exclusive => true,
            LockMode::Shared => txn.isolation_level() == IsolationLevel::RepeatableRead,
            _ => false,
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    /// Whether the held table lock is strong enough for the requested row
    /// lock: X rows need X/IX/SIX on the table, S rows need any table lock.
    fn table_lock_allows_row(&self, txn: &Arc<Transaction>, oid: TableOid, mode: LockMode) -> bool {
        let Some(held) = txn.held_table_lock_mode(oid) else {
            return false;
        };
        match mode {
            LockMode::Exclusive => matches!(
                held,
                LockMode::Exclusive | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
            ),
            LockMode::Shared => true,
            _ => false,
        }
    }

    fn add_to_lock_sets(&self, txn: &Arc<Transaction>, mode: LockMode, resource: Resource) {
        match resource {
            Resource::Table(oid) => txn.add_table_lock(mode, oid),
            Resource::Row(oid, rid) => txn.add_row_lock(mode, oid, rid),
        }
    }

    fn remove_from_lock_sets(&self, txn: &Arc<Transaction>, mode: LockMode, resource: Resource) {
        match resource {
            Resource::Table(oid) => txn.remove_table_lock(mode, oid),
            Resource::Row(oid, rid) => txn.remove_row_lock(mode, oid, rid),
        }
    }

    fn abort_txn(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        TransactionAbort::new(txn.id(), reason)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.stop_deadlock_detection();
    }
}
