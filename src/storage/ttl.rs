//! TTL Sweeper
//!
//! Background task that periodically removes expired items and forgets
//! deletes older than the tombstone TTL.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Store;

/// Background TTL sweep task
pub struct TtlSweeper {
    store: Arc<Store>,
    interval: Duration,
}

impl TtlSweeper {
    pub fn new(store: Arc<Store>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run the sweeper until cancelled (should be spawned as a task)
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        info!("TTL sweeper started, interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.store.sweep_expired();
                    let purged = self.store.purge_tombstones();
                    if removed > 0 || purged > 0 {
                        debug!(removed, purged, "Swept expired items");
                    }
                }
            }
        }
        debug!("TTL sweeper stopped");
    }

    /// Spawn the sweeper as a background task
    pub fn spawn(
        store: Arc<Store>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Self::new(store, interval).run(cancel))
    }
}
