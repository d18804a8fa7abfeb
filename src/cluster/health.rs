//! Health Monitor
//!
//! Probes every watched node on its own schedule and drives the
//! Alive -> Suspect -> Dead -> Removed state machine. Transitions that change
//! membership are sent to the cache as [`MembershipEvent`]s; the monitor
//! itself never touches the ring and never waits for a rebalance.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::node::NodeId;
use super::registry::NodeRegistry;
use super::transport::NodeTransport;

/// Response times kept per node
const RESPONSE_HISTORY: usize = 16;

/// Probe schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before a node is declared dead
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Alive,
    /// Missed at least one probe, still serving
    Suspect,
    /// Missed `failure_threshold` probes in a row
    Dead,
    /// Migrated away and no longer watched
    Removed,
}

/// Membership changes raised by the monitor and the rebalancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeFailed(NodeId),
    NodeRecovered(NodeId),
    NodeRemoved(NodeId),
}

/// Probe history of one node
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    response_times: VecDeque<Duration>,
}

impl NodeHealth {
    fn new() -> Self {
        Self {
            state: HealthState::Alive,
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
            response_times: VecDeque::with_capacity(RESPONSE_HISTORY),
        }
    }

    /// Recent successful probe times, oldest first
    pub fn response_times(&self) -> impl Iterator<Item = &Duration> {
        self.response_times.iter()
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        if self.response_times.is_empty() {
            return None;
        }
        let total: Duration = self.response_times.iter().sum();
        Some(total / self.response_times.len() as u32)
    }

    fn record_response(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_HISTORY {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }
}

/// Per-node failure detector
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    health: DashMap<NodeId, NodeHealth>,
    loops: DashMap<NodeId, CancellationToken>,
    events: UnboundedSender<MembershipEvent>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        events: UnboundedSender<MembershipEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            health: DashMap::new(),
            loops: DashMap::new(),
            events,
            shutdown,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start probing a node; the first probe runs one interval from now
    pub fn watch(self: &Arc<Self>, node_id: &str) {
        let cancel = match self.loops.entry(node_id.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => slot.insert(self.shutdown.child_token()).clone(),
        };
        self.health.insert(node_id.to_string(), NodeHealth::new());

        debug!(node = %node_id, interval = ?self.config.check_interval, "Watching node");
        let monitor = Arc::clone(self);
        let node_id = node_id.to_string();
        tokio::spawn(async move { monitor.probe_loop(node_id, cancel).await });
    }

    /// Stop probing a node and mark it removed
    pub fn unwatch(&self, node_id: &str) {
        if let Some((_, cancel)) = self.loops.remove(node_id) {
            cancel.cancel();
        }
        if let Some(mut health) = self.health.get_mut(node_id) {
            health.state = HealthState::Removed;
        }
        debug!(node = %node_id, "Stopped watching node");
    }

    pub fn state(&self, node_id: &str) -> Option<HealthState> {
        self.health.get(node_id).map(|h| h.state)
    }

    pub fn health(&self, node_id: &str) -> Option<NodeHealth> {
        self.health.get(node_id).map(|h| h.clone())
    }

    /// Nodes with a running probe loop
    pub fn watched(&self) -> usize {
        self.loops.len()
    }

    /// Cancel every probe loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn probe_loop(self: Arc<Self>, node_id: NodeId, cancel: CancellationToken) {
        let period = self.config.check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.probe(&node_id) => {}
                    }
                }
            }
        }
        debug!(node = %node_id, "Probe loop stopped");
    }

    /// Probe a node once and apply the result
    pub async fn probe(&self, node_id: &str) -> HealthState {
        let started = Instant::now();
        match timeout(self.config.probe_timeout, self.transport.probe(node_id)).await {
            Ok(Ok(report)) => {
                self.registry.record_probe(node_id, report.load_factor());
                self.record_success(node_id, started.elapsed())
            }
            Ok(Err(e)) => self.record_failure(node_id, e.to_string()),
            Err(_) => self.record_failure(
                node_id,
                format!("probe timed out after {:?}", self.config.probe_timeout),
            ),
        }
    }

    fn record_success(&self, node_id: &str, elapsed: Duration) -> HealthState {
        let previous = {
            let mut health = self
                .health
                .entry(node_id.to_string())
                .or_insert_with(NodeHealth::new);
            health.last_check = Some(Utc::now());
            health.record_response(elapsed);
            let previous = health.state;
            if previous != HealthState::Removed {
                health.state = HealthState::Alive;
                health.consecutive_failures = 0;
                health.last_error = None;
            }
            previous
        };

        match previous {
            HealthState::Suspect => {
                info!(node = %node_id, "Node answering again");
            }
            HealthState::Dead => {
                info!(node = %node_id, "Dead node recovered");
                self.send(MembershipEvent::NodeRecovered(node_id.to_string()));
            }
            HealthState::Removed => return HealthState::Removed,
            HealthState::Alive => {}
        }
        HealthState::Alive
    }

    fn record_failure(&self, node_id: &str, reason: String) -> HealthState {
        let (previous, state, failures) = {
            let mut health = self
                .health
                .entry(node_id.to_string())
                .or_insert_with(NodeHealth::new);
            health.last_check = Some(Utc::now());
            health.last_error = Some(reason.clone());
            let previous = health.state;
            if previous == HealthState::Removed {
                return HealthState::Removed;
            }

            health.consecutive_failures += 1;
            if health.consecutive_failures >= self.config.failure_threshold {
                health.state = HealthState::Dead;
            } else {
                health.state = HealthState::Suspect;
            }
            (previous, health.state, health.consecutive_failures)
        };

        warn!(node = %node_id, failures, error = %reason, "Probe failed");
        if state == HealthState::Dead && previous != HealthState::Dead {
            self.handle_node_failure(node_id);
        }
        state
    }

    /// Declare a node dead and ask the cache to drop it from the ring
    pub fn handle_node_failure(&self, node_id: &str) {
        if let Some(mut health) = self.health.get_mut(node_id) {
            if health.state == HealthState::Removed {
                return;
            }
            health.state = HealthState::Dead;
        }
        warn!(node = %node_id, "Node declared dead");
        self.send(MembershipEvent::NodeFailed(node_id.to_string()));
    }

    fn send(&self, event: MembershipEvent) {
        if self.events.send(event).is_err() {
            debug!("Membership channel closed");
        }
    }
}
