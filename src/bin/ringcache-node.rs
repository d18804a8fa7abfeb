//! ringcache Node Binary
//!
//! Boots an in-process cluster, runs a write/read workload against it and
//! optionally knocks one node out to show failure detection and
//! re-replication.

use clap::Parser;
use ringcache::{
    CacheConfig, CacheMetrics, ConsistencyLevel, DistributedCache, EvictionPolicy,
    LocalTransport, Node, ReplicationStrategy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// ringcache - Distributed In-Memory Cache
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of nodes in the demo cluster
    #[arg(short, long, default_value_t = 5)]
    nodes: usize,

    /// Ring positions per node
    #[arg(long, default_value_t = 150)]
    virtual_nodes: usize,

    /// Replicas per key
    #[arg(short, long, default_value_t = 3)]
    replication_factor: usize,

    /// Consistency level (eventual, quorum, strong)
    #[arg(short, long, default_value = "quorum")]
    consistency: ConsistencyLevel,

    /// Read quorum
    #[arg(long, default_value_t = 2)]
    read_quorum: usize,

    /// Write quorum
    #[arg(long, default_value_t = 2)]
    write_quorum: usize,

    /// Eviction policy (lru, lfu, ttl, fifo)
    #[arg(short, long, default_value = "lru")]
    eviction: EvictionPolicy,

    /// Memory budget per node in bytes (0 = unlimited)
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    max_memory: usize,

    /// Health check interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    health_interval_ms: u64,

    /// Probe timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    probe_timeout_ms: u64,

    /// Failed probes before a node is declared dead
    #[arg(long, default_value_t = 3)]
    failure_threshold: u32,

    /// Metrics report interval in seconds (0 = off)
    #[arg(long, default_value_t = 5)]
    metrics_interval: u64,

    /// Keys written by the demo workload
    #[arg(short, long, default_value_t = 1000)]
    keys: usize,

    /// Make one node unreachable after the workload
    #[arg(long, default_value_t = false)]
    simulate_failure: bool,
}

impl Args {
    fn config(&self) -> CacheConfig {
        let metrics_interval = match self.metrics_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        CacheConfig::default()
            .with_virtual_nodes(self.virtual_nodes)
            .with_replication(ReplicationStrategy::new(
                self.replication_factor,
                self.consistency,
                self.read_quorum,
                self.write_quorum,
            ))
            .with_eviction_policy(self.eviction)
            .with_max_memory(self.max_memory)
            .with_health_check_interval(Duration::from_millis(self.health_interval_ms))
            .with_probe_timeout(Duration::from_millis(self.probe_timeout_ms))
            .with_failure_threshold(self.failure_threshold)
            .with_metrics_interval(metrics_interval)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ringcache=info".parse()?))
        .init();

    let args = Args::parse();
    let config = args.config();

    let metrics = Arc::new(CacheMetrics::new());
    let transport = Arc::new(LocalTransport::from_config(&config, metrics.clone()));
    let cache = DistributedCache::new(config.clone(), transport.clone(), metrics)?;

    info!(
        "Starting ringcache cluster with {} nodes (R={}, {:?}, Rq={}, Wq={})",
        args.nodes,
        args.replication_factor,
        args.consistency,
        args.read_quorum,
        args.write_quorum
    );
    for i in 1..=args.nodes {
        let node = Node::new(format!("node-{}", i), format!("127.0.0.1:{}", 7000 + i));
        cache.add_node(node).await?;
    }

    let started = Instant::now();
    for i in 0..args.keys {
        cache
            .put(format!("key:{}", i), format!("value:{}", i), None)
            .await?;
    }
    info!(keys = args.keys, elapsed = ?started.elapsed(), "Workload written");

    let found = read_back(&cache, args.keys).await;
    info!(found, keys = args.keys, "Workload read back");

    if args.simulate_failure && args.nodes > 1 {
        let victim = "node-2";
        warn!(node = victim, "Simulating node failure");
        transport.set_reachable(victim, false);

        // threshold probes plus time for the rebalance pass
        let deadline = Instant::now()
            + config.health_check_interval * (config.failure_threshold + 2)
            + config.probe_timeout;
        while cache.registry().contains(victim) && Instant::now() < deadline {
            tokio::time::sleep(config.health_check_interval / 2).await;
        }

        if cache.registry().contains(victim) {
            warn!(node = victim, "Node still registered after deadline");
        } else {
            let found = read_back(&cache, args.keys).await;
            info!(found, keys = args.keys, "Keys readable after recovery");
        }
    }

    println!("{}", cache.metrics().summary());
    cache.shutdown();
    Ok(())
}

async fn read_back(cache: &DistributedCache, keys: usize) -> usize {
    let mut found = 0;
    for i in 0..keys {
        match cache.get(&format!("key:{}", i)).await {
            Ok(Some(_)) => found += 1,
            Ok(None) => {}
            Err(e) => warn!(key = i, error = %e, "Read failed"),
        }
    }
    found
}
