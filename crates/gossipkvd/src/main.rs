//! gossipkvd - in-process gossip KV cluster
//!
//! Starts a cluster of store nodes on a loopback network, writes heartbeat
//! counters on random nodes and reports whether the replicas agree.

use anyhow::{anyhow, Context};
use clap::Parser;
use gossipkv_core::codecs::{GCounter, G_COUNTER};
use gossipkv_core::CodecRegistry;
use gossipkv_net::{EventReceiver, LocalNetwork, Transport, TransportError};
use gossipkvd::{Config, Kv, KvConfig, KvInitService, StatusReport};
use rand::Rng;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const HEARTBEAT_KEY: &str = "heartbeats";

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "gossipkvd v{} - gossip-replicated key-value store",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let level = if config.verbose { "gossipkvd=debug" } else { "gossipkvd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let network = LocalNetwork::new();
    let registry = Arc::new(CodecRegistry::with_builtin());

    let services: Vec<Arc<KvInitService>> = (0..config.nodes)
        .map(|i| {
            let name = format!("{}-{}", config.node_name, i);
            let network = network.clone();
            Arc::new(KvInitService::new(
                config.kv_config(&name),
                registry.clone(),
                Box::new(
                    move |kv: &KvConfig| -> Result<(Arc<dyn Transport>, EventReceiver), TransportError> {
                        let (transport, events) = network.join(&kv.node_name)?;
                        Ok((transport as Arc<dyn Transport>, events))
                    },
                ),
            ))
        })
        .collect();

    // Initialize every node up front so a bad config fails fast
    let mut nodes = Vec::with_capacity(services.len());
    for service in &services {
        let kv = service
            .acquire()
            .with_context(|| format!("failed to start {}", service.node_name()))?;
        nodes.push(kv);
    }
    info!(nodes = nodes.len(), "Cluster running");

    // One supervisor per node; the first failure ends the cluster
    let mut runners = JoinSet::new();
    for service in &services {
        let service = service.clone();
        runners.spawn(async move {
            service
                .run()
                .await
                .map_err(|e| (service.node_name().to_string(), e))
        });
    }

    let writer = tokio::spawn(simulate_writes(
        nodes.clone(),
        Duration::from_millis(config.write_interval_ms),
    ));

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        Some(joined) = runners.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err((node, e))) => Err(anyhow!("node {} failed: {}", node, e)),
            Err(e) => Err(anyhow!("node runner aborted: {}", e)),
        },
    };

    // Shutdown
    writer.abort();
    for service in &services {
        if let Err(e) = service.stop().await {
            warn!(node = %service.node_name(), "Stop reported failure: {}", e);
        }
    }
    runners.shutdown().await;

    for kv in &nodes {
        match StatusReport::collect(kv) {
            Ok(report) => {
                info!(node = %report.node, keys = report.store.len(), digest = %report.digest, "Final state");
                match report.to_json() {
                    Ok(json) => debug!(node = %report.node, "{}", json),
                    Err(e) => warn!(node = %report.node, "Status report not serializable: {}", e),
                }
            }
            Err(e) => warn!(node = %kv.node_name(), "Status report failed: {}", e),
        }
    }

    outcome
}

/// Bump a heartbeat counter on a random node every `period`
async fn simulate_writes(nodes: Vec<Arc<Kv>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut round = 0u64;

    loop {
        ticker.tick().await;
        round += 1;

        let index = rand::thread_rng().gen_range(0..nodes.len());
        let kv = &nodes[index];
        let node = kv.node_name().to_string();

        let written = kv.store().cas_typed::<GCounter, _>(HEARTBEAT_KEY, G_COUNTER, |counter| {
            let mut next = counter.clone();
            next.increment(&node, 1);
            Some(next)
        });
        if let Err(e) = written {
            warn!(node = %node, "Heartbeat write failed: {}", e);
            continue;
        }

        // Converged when every replica reports the same digest
        let digests: Vec<String> = nodes.iter().filter_map(|kv| kv.digest().ok()).collect();
        let converged = digests.len() == nodes.len() && digests.windows(2).all(|w| w[0] == w[1]);
        let total = kv
            .store()
            .get_typed::<GCounter>(HEARTBEAT_KEY)
            .map_or(0, |c| c.value());
        info!(round, writer = %node, total, converged, "Heartbeat written");

        for (kv, digest) in nodes.iter().zip(&digests) {
            debug!(node = %kv.node_name(), digest = %digest, "Replica digest");
        }
    }
}
