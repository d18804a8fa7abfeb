//! Rebalancer
//!
//! Moves copies onto the replica sets the current ring assigns after a
//! membership change, then retires nodes that have left. Only one pass runs
//! at a time; triggers that arrive during a pass are folded into a single
//! re-run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::health::MembershipEvent;
use super::node::NodeId;
use super::registry::NodeRegistry;
use super::replication::{bounded, ReplicationStrategy};
use super::transport::NodeTransport;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::storage::Record;

/// Outcome of one `rebalance` call, summed over its passes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub passes: usize,
    pub keys_scanned: usize,
    /// Keys that received at least one new copy
    pub keys_copied: usize,
    pub copies_deleted: usize,
    /// Keys left for the next pass
    pub failed_keys: Vec<String>,
    /// Nodes whose contents could not be scanned
    pub unreachable_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
}

impl RebalanceReport {
    /// No key or node was left behind
    pub fn is_clean(&self) -> bool {
        self.failed_keys.is_empty() && self.unreachable_nodes.is_empty()
    }

    fn absorb(&mut self, pass: RebalanceReport) {
        self.passes += pass.passes;
        self.keys_scanned += pass.keys_scanned;
        self.keys_copied += pass.keys_copied;
        self.copies_deleted += pass.copies_deleted;
        // only the last pass's failures are outstanding
        self.failed_keys = pass.failed_keys;
        self.unreachable_nodes = pass.unreachable_nodes;
        self.removed_nodes.extend(pass.removed_nodes);
    }
}

/// Clears the running flag if a pass is dropped midway
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Copies held for one key during a pass; a tombstone counts as a copy
struct KeyCopies {
    holders: Vec<NodeId>,
    freshest: Record,
    stale: HashSet<NodeId>,
}

pub struct Rebalancer {
    strategy: ReplicationStrategy,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    metrics: Arc<CacheMetrics>,
    events: UnboundedSender<MembershipEvent>,
    call_timeout: Duration,
    running: AtomicBool,
    pending: AtomicBool,
}

impl Rebalancer {
    pub fn new(
        config: &CacheConfig,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<CacheMetrics>,
        events: UnboundedSender<MembershipEvent>,
    ) -> Self {
        Self {
            strategy: config.replication.clone(),
            registry,
            transport,
            metrics,
            events,
            call_timeout: config.probe_timeout,
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run passes until no trigger is outstanding.
    ///
    /// Returns `RebalanceInProgress` when another call is already running;
    /// that call picks up this trigger before it returns.
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        self.pending.store(true, Ordering::SeqCst);
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Rebalance already running, trigger absorbed");
            return Err(CacheError::RebalanceInProgress);
        }

        let mut report = RebalanceReport::default();
        let mut guard = RunningGuard(&self.running);
        loop {
            self.pending.store(false, Ordering::SeqCst);
            report.absorb(self.run_pass().await);
            if self.pending.load(Ordering::SeqCst) {
                continue;
            }

            drop(guard);
            // a trigger may have landed between the check and the release
            if !self.pending.load(Ordering::SeqCst) || self.running.swap(true, Ordering::SeqCst) {
                break;
            }
            guard = RunningGuard(&self.running);
        }

        info!(
            passes = report.passes,
            scanned = report.keys_scanned,
            copied = report.keys_copied,
            deleted = report.copies_deleted,
            failed = report.failed_keys.len(),
            removed = report.removed_nodes.len(),
            "Rebalance complete"
        );
        Ok(report)
    }

    async fn run_pass(&self) -> RebalanceReport {
        let mut report = RebalanceReport {
            passes: 1,
            ..Default::default()
        };
        let ring = self.registry.ring();
        let departing: Vec<NodeId> = self.registry.departed().into_iter().map(|n| n.id).collect();

        // dead nodes cannot be read; their copies are rebuilt from survivors
        let mut copies: HashMap<String, KeyCopies> = HashMap::new();
        for node in self.registry.nodes().into_iter().filter(|n| n.alive) {
            let records = match bounded(&node.id, self.call_timeout, self.transport.scan(&node.id)).await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(node = %node.id, error = %e, "Scan failed");
                    self.metrics.record_network_error();
                    report.unreachable_nodes.push(node.id);
                    continue;
                }
            };
            for record in records {
                match copies.get_mut(record.key()) {
                    Some(entry) => {
                        if record.newer_than(&entry.freshest) {
                            entry.stale.extend(entry.holders.iter().cloned());
                            entry.freshest = record;
                        } else if entry.freshest.newer_than(&record) {
                            entry.stale.insert(node.id.clone());
                        }
                        entry.holders.push(node.id.clone());
                    }
                    None => {
                        copies.insert(
                            record.key().to_string(),
                            KeyCopies {
                                holders: vec![node.id.clone()],
                                freshest: record,
                                stale: HashSet::new(),
                            },
                        );
                    }
                }
            }
        }

        for (key, entry) in copies {
            report.keys_scanned += 1;
            let targets = ring.replicas_for(&key, self.strategy.replication_factor);
            if targets.is_empty() {
                report.failed_keys.push(key);
                continue;
            }

            let missing: Vec<&NodeId> = targets
                .iter()
                .filter(|t| !entry.holders.contains(t) || entry.stale.contains(*t))
                .collect();
            let mut surplus: Vec<&NodeId> = entry
                .holders
                .iter()
                .filter(|h| !targets.contains(h))
                .collect();
            if missing.is_empty() && surplus.is_empty() {
                continue;
            }

            let mut copy_failed = false;
            let mut copied = false;
            for target in missing {
                let copy = self.copy_to(target, &entry.freshest);
                match bounded(target, self.call_timeout, copy).await {
                    Ok(_) => copied = true,
                    Err(e) => {
                        warn!(node = %target, key = %key, error = %e, "Copy failed");
                        if e.is_transport() {
                            self.metrics.record_network_error();
                        }
                        copy_failed = true;
                    }
                }
            }
            if copied {
                report.keys_copied += 1;
            }
            if copy_failed {
                report.failed_keys.push(key);
                continue;
            }

            // drop copies on nodes leaving the ring before idle eligible holders
            surplus.sort_by_key(|h| ring.contains(h));
            let floor = self.strategy.write_quorum.min(entry.holders.len());
            let mut live = targets.len() + surplus.len();
            let mut delete_failed = false;
            for holder in surplus {
                if live <= floor {
                    break;
                }
                match bounded(holder, self.call_timeout, self.transport.discard(holder, &key)).await
                {
                    Ok(_) => {
                        live -= 1;
                        report.copies_deleted += 1;
                    }
                    Err(e) => {
                        warn!(node = %holder, key = %key, error = %e, "Surplus delete failed");
                        delete_failed = true;
                    }
                }
            }
            if delete_failed {
                report.failed_keys.push(key);
            }
        }

        self.metrics.record_rebalance(report.keys_copied as u64);

        if report.is_clean() {
            for node_id in departing {
                let still_departed = self
                    .registry
                    .get(&node_id)
                    .map(|n| !n.is_eligible())
                    .unwrap_or(false);
                if !still_departed {
                    continue;
                }
                self.registry.deregister(&node_id);
                self.transport.disconnect(&node_id).await;
                info!(node = %node_id, "Node retired");
                if self.events.send(MembershipEvent::NodeRemoved(node_id.clone())).is_err() {
                    debug!("Membership channel closed");
                }
                report.removed_nodes.push(node_id);
            }
        } else {
            warn!(
                failed = report.failed_keys.len(),
                unreachable = ?report.unreachable_nodes,
                "Rebalance pass incomplete, retrying on next trigger"
            );
        }
        report
    }

    /// Write a value, or replay a delete, onto one node
    async fn copy_to(&self, target: &str, record: &Record) -> Result<bool> {
        match record {
            Record::Live(item) => self.transport.put(target, item.clone()).await,
            Record::Deleted(tombstone) => {
                self.transport
                    .delete(target, &tombstone.key, tombstone.deleted_at)
                    .await
            }
        }
    }
}
