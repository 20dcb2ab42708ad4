//! CLI and config handling.

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MIN_CONCURRENT_DOWNLOADS: usize = 10;
pub const DEFAULT_STALL_CHECK_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK: u64 = 10;
pub const DEFAULT_IMPORTANT_HEIGHT_MARGIN: u64 = 10;
pub const DEFAULT_CAUGHT_UP_RATE_CAP: u64 = 1024 * 1024;
pub const DEFAULT_LOG_JSON_FILTER: &str = "debug";
pub const DEFAULT_SIM_BLOCKS: u64 = 2_000;
pub const DEFAULT_SIM_PEERS: usize = 8;
pub const DEFAULT_SIM_BLOCK_SIZE: usize = 64 * 1024;
pub const DEFAULT_SIM_LATENCY_MS: u64 = 50;
pub const DEFAULT_SIM_BANDWIDTH_BYTES_PER_SEC: u64 = 4 * 1024 * 1024;

/// Block puller node configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(
    name = "block-puller-node",
    about = "Drives the block puller against a simulated peer network"
)]
pub struct NodeConfig {
    /// Increase log verbosity (-v debug, -vv trace, -vvv trace everywhere).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
    /// Also write JSON-lines logs to this file.
    #[arg(long)]
    pub log_json: Option<PathBuf>,
    /// Filter for the JSON log file.
    #[arg(long, default_value = DEFAULT_LOG_JSON_FILTER)]
    pub log_json_filter: String,

    /// Lower bound of the concurrent download budget.
    #[arg(long, default_value_t = DEFAULT_MIN_CONCURRENT_DOWNLOADS)]
    pub min_concurrent_downloads: usize,
    /// How often in-flight important blocks are checked for stalls.
    #[arg(long, default_value_t = DEFAULT_STALL_CHECK_INTERVAL_MS)]
    pub stall_check_interval_ms: u64,
    /// Seconds an important block may stay undelivered before its peer stalls.
    #[arg(long, default_value_t = DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK)]
    pub max_seconds_to_deliver_block: u64,
    /// Blocks up to this many past the consensus tip count as important.
    #[arg(long, default_value_t = DEFAULT_IMPORTANT_HEIGHT_MARGIN)]
    pub important_height_margin: u64,
    /// Delivery-rate ceiling used for scoring once out of initial block download.
    #[arg(long, default_value_t = DEFAULT_CAUGHT_UP_RATE_CAP)]
    pub caught_up_rate_cap_bytes_per_sec: u64,
    /// Seed for peer selection and the simulation.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Treat the node as being in initial block download.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub initial_block_download: bool,

    /// Length of the simulated main chain.
    #[arg(long, default_value_t = DEFAULT_SIM_BLOCKS)]
    pub sim_blocks: u64,
    /// Number of simulated peers.
    #[arg(long, default_value_t = DEFAULT_SIM_PEERS)]
    pub sim_peers: usize,
    /// Peers that accept requests but never deliver.
    #[arg(long, default_value_t = 0)]
    pub sim_stalling_peers: usize,
    /// Height at which a competing fork branches off the main chain.
    #[arg(long)]
    pub sim_fork_height: Option<u64>,
    /// Peers whose tip sits on the fork instead of the main chain.
    #[arg(long, default_value_t = 0)]
    pub sim_fork_peers: usize,
    /// Size in bytes of every simulated block.
    #[arg(long, default_value_t = DEFAULT_SIM_BLOCK_SIZE)]
    pub sim_block_size: usize,
    /// Base one-way latency of a simulated peer.
    #[arg(long, default_value_t = DEFAULT_SIM_LATENCY_MS)]
    pub sim_latency_ms: u64,
    /// Bandwidth of the fastest simulated peer; the others are slower.
    #[arg(long, default_value_t = DEFAULT_SIM_BANDWIDTH_BYTES_PER_SEC)]
    pub sim_bandwidth_bytes_per_sec: u64,
    /// Give up after this many seconds.
    #[arg(long)]
    pub sim_timeout_secs: Option<u64>,
}

impl NodeConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::puller::PullerConfig;
    use std::time::Duration;

    #[test]
    fn defaults_parse() {
        let config = NodeConfig::try_parse_from(["block-puller-node"]).expect("parse");
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.sim_blocks, DEFAULT_SIM_BLOCKS);
        assert!(config.initial_block_download);
        assert!(config.log_json.is_none());
    }

    #[test]
    fn flags_feed_puller_config() {
        let config = NodeConfig::try_parse_from([
            "block-puller-node",
            "-vv",
            "--min-concurrent-downloads",
            "4",
            "--max-seconds-to-deliver-block",
            "3",
            "--seed",
            "9",
            "--initial-block-download",
            "false",
        ])
        .expect("parse");
        assert_eq!(config.verbosity, 2);
        assert!(!config.initial_block_download);

        let puller = PullerConfig::from(&config);
        assert_eq!(puller.min_concurrent_downloads, 4);
        assert_eq!(puller.max_delivery_time, Duration::from_secs(3));
        assert_eq!(puller.rng_seed, Some(9));
        assert_eq!(puller.stall_check_interval, Duration::from_millis(500));
    }

    #[test]
    fn base_config_matches_defaults() {
        let parsed = NodeConfig::try_parse_from(["block-puller-node"]).expect("parse");
        let base = crate::test_utils::base_config();
        assert_eq!(base.sim_peers, parsed.sim_peers);
        assert_eq!(base.min_concurrent_downloads, parsed.min_concurrent_downloads);
    }
}
