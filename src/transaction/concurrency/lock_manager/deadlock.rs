//! Background deadlock detection on a waits-for graph.
//!
//! The detector never touches the request queues beyond notifying their
//! condition variables: it rebuilds the graph wholesale, marks cycle victims
//! ABORTED, and lets the victims clean up their own queue entries when they
//! wake. This keeps the detector outside the queue mutex hierarchy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::{LockManager, LockRequestQueue};
use crate::transaction::concurrency::transaction::TransactionState;

type WaitsForGraph = BTreeMap<TxnId, BTreeSet<TxnId>>;

impl LockManager {
    /// Start the detector thread. It wakes every `cycle_detection_interval`,
    /// rebuilds the waits-for graph, and aborts victims until it is acyclic.
    pub fn start_deadlock_detection(self: &Arc<Self>) {
        if self.enable_cycle_detection.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.cycle_detection_interval;
        let handle = thread::spawn(move || loop {
            thread::sleep(interval);
            let Some(lock_manager) = weak.upgrade() else {
                break;
            };
            if !lock_manager.enable_cycle_detection.load(Ordering::SeqCst) {
                break;
            }
            lock_manager.run_detection_pass();
        });
        *self.detector.lock() = Some(handle);
    }

    /// Stop and join the detector thread.
    pub fn stop_deadlock_detection(&self) {
        self.enable_cycle_detection.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            if handle.join().is_err() {
                warn!("deadlock detector thread panicked");
            }
        }
    }

    /// Snapshot of the waits-for edges, sorted by (from, to).
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock();
        let mut edges = Vec::new();
        for (&from, tos) in graph.iter() {
            for &to in tos {
                edges.push((from, to));
            }
        }
        edges
    }

    pub(crate) fn run_detection_pass(&self) {
        self.build_waits_for();
        loop {
            let victim = {
                let graph = self.waits_for.lock();
                find_cycle(&graph).and_then(|cycle| cycle.into_iter().max())
            };
            let Some(victim) = victim else {
                break;
            };
            if let Some(txn) = self.txn(victim) {
                debug!("deadlock detected, aborting youngest txn {}", victim);
                txn.set_state(TransactionState::Aborted);
            }
            let mut graph = self.waits_for.lock();
            graph.remove(&victim);
            for targets in graph.values_mut() {
                targets.remove(&victim);
            }
        }
        // Aborted victims are parked on queue condition variables; wake
        // everything so they can unwind.
        self.notify_all_queues();
    }

    /// Rebuild the graph from scratch by scanning every request queue: an
    /// ungranted request waits on every earlier, non-aborted request of the
    /// same resource. Aborted waiters found along the way get their queue
    /// notified so they clean themselves up.
    fn build_waits_for(&self) {
        let mut graph = WaitsForGraph::new();
        let table_queues: Vec<Arc<LockRequestQueue>> =
            self.table_locks.lock().values().cloned().collect();
        let row_queues: Vec<Arc<LockRequestQueue>> =
            self.row_locks.lock().values().cloned().collect();

        for queue in table_queues.into_iter().chain(row_queues) {
            let state = queue.state.lock();
            let mut earlier: Vec<TxnId> = Vec::new();
            for request in &state.requests {
                let Some(txn) = self.txn(request.txn_id) else {
                    continue;
                };
                if txn.state() == TransactionState::Aborted {
                    queue.cv.notify_all();
                    continue;
                }
                if !request.granted {
                    let edges = graph.entry(request.txn_id).or_default();
                    edges.extend(earlier.iter().copied());
                }
                earlier.push(request.txn_id);
            }
        }

        *self.waits_for.lock() = graph;
    }

    fn notify_all_queues(&self) {
        let table_queues: Vec<Arc<LockRequestQueue>> =
            self.table_locks.lock().values().cloned().collect();
        for queue in table_queues {
            queue.cv.notify_all();
        }
        let row_queues: Vec<Arc<LockRequestQueue>> =
            self.row_locks.lock().values().cloned().collect();
        for queue in row_queues {
            queue.cv.notify_all();
        }
    }
}

/// Deterministic DFS cycle search: start vertices and neighbors are visited
/// in ascending txn id order, so the same graph always yields the same cycle.
fn find_cycle(graph: &WaitsForGraph) -> Option<Vec<TxnId>> {
    let mut visited = BTreeSet::new();
    for &start in graph.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut path = Vec::new();
        let mut on_path = BTreeSet::new();
        if let Some(cycle) = dfs(start, graph, &mut visited, &mut path, &mut on_path) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    node: TxnId,
    graph: &WaitsForGraph,
    visited: &mut BTreeSet<TxnId>,
    path: &mut Vec<TxnId>,
    on_path: &mut BTreeSet<TxnId>,
) -> Option<Vec<TxnId>> {
    visited.insert(node);
    on_path.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(&node) {
        for &next in neighbors {
            if on_path.contains(&next) {
                if let Some(pos) = path.iter().position(|&t| t == next) {
                    return Some(path[pos..].to_vec());
                }
            }
            if !visited.contains(&next) {
                if let Some(cycle) = dfs(next, graph, visited, path, on_path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    on_path.remove(&node);
    None
}
