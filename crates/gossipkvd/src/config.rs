//! Configuration for gossipkvd

use clap::Parser;
use std::time::Duration;

/// gossipkvd - gossip-replicated key-value store daemon
///
/// Runs an in-process cluster of store nodes connected by a loopback network.
#[derive(Parser, Debug, Clone)]
#[command(name = "gossipkvd")]
#[command(about = "Gossip-replicated key-value store daemon")]
pub struct Config {
    /// Node name prefix; simulated nodes are named `<prefix>-<index>`
    #[arg(long, env = "GOSSIPKV_NODE_NAME", default_value = "node")]
    pub node_name: String,

    /// Number of nodes in the simulated cluster
    #[arg(long, default_value = "3")]
    pub nodes: usize,

    /// Interval between incremental gossip rounds in milliseconds
    #[arg(long, default_value = "200")]
    pub gossip_interval_ms: u64,

    /// Interval between full-state broadcasts in seconds (0 disables)
    #[arg(long, default_value = "30")]
    pub full_state_interval_secs: u64,

    /// Attempts a local write makes before reporting a conflict
    #[arg(long, default_value = "10")]
    pub cas_retries: u32,

    /// Sent and received messages kept for diagnostics, per direction
    #[arg(long, default_value = "256")]
    pub message_history: usize,

    /// Maximum pairs carried by one broadcast
    #[arg(long, default_value = "128")]
    pub max_pairs_per_broadcast: usize,

    /// Interval between simulated writes in milliseconds
    #[arg(long, default_value = "1000")]
    pub write_interval_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("Node name cannot be empty");
        }
        if self.nodes == 0 {
            anyhow::bail!("Cluster needs at least one node");
        }
        if self.write_interval_ms == 0 {
            anyhow::bail!("Write interval must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        self.kv_config(&self.node_name)
            .validate()
            .map_err(anyhow::Error::msg)
    }

    /// Store configuration for one node
    pub fn kv_config(&self, node_name: &str) -> KvConfig {
        KvConfig {
            node_name: node_name.to_string(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            full_state_interval: match self.full_state_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            cas_retries: self.cas_retries,
            message_history: self.message_history,
            max_pairs_per_broadcast: self.max_pairs_per_broadcast,
        }
    }
}

/// Per-node store configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    /// Name this node gossips under
    pub node_name: String,
    /// Interval between incremental gossip rounds
    pub gossip_interval: Duration,
    /// Interval between full-state broadcasts, if any
    pub full_state_interval: Option<Duration>,
    /// Attempts a local write makes before reporting a conflict
    pub cas_retries: u32,
    /// Messages kept per direction in the message log (0 disables it)
    pub message_history: usize,
    /// Maximum pairs carried by one broadcast
    pub max_pairs_per_broadcast: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            gossip_interval: Duration::from_millis(200),
            full_state_interval: Some(Duration::from_secs(30)),
            cas_retries: 10,
            message_history: 256,
            max_pairs_per_broadcast: 128,
        }
    }
}

impl KvConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.node_name.is_empty() {
            return Err("node name cannot be empty".into());
        }
        if self.gossip_interval.is_zero() {
            return Err("gossip interval must be positive".into());
        }
        if self.full_state_interval.is_some_and(|d| d.is_zero()) {
            return Err("full-state interval must be positive".into());
        }
        if self.cas_retries == 0 {
            return Err("cas retries must be at least 1".into());
        }
        if self.max_pairs_per_broadcast == 0 {
            return Err("max pairs per broadcast must be positive".into());
        }
        Ok(())
    }
}
