use crate::chain::{extend_chain, BlockHeader, HeaderIndex};
use crate::cli::{
    NodeConfig, DEFAULT_CAUGHT_UP_RATE_CAP, DEFAULT_IMPORTANT_HEIGHT_MARGIN,
    DEFAULT_LOG_JSON_FILTER, DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK, DEFAULT_MIN_CONCURRENT_DOWNLOADS,
    DEFAULT_SIM_BANDWIDTH_BYTES_PER_SEC, DEFAULT_SIM_BLOCKS, DEFAULT_SIM_BLOCK_SIZE,
    DEFAULT_SIM_LATENCY_MS, DEFAULT_SIM_PEERS, DEFAULT_STALL_CHECK_INTERVAL_MS,
};
use crate::p2p::{BlockPeer, PeerCapabilities, PeerId, ServiceFlags};
use crate::sync::puller::DownloadResult;
use alloy_primitives::{B256, B512};
use async_trait::async_trait;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "block-puller-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

pub fn test_peer_id(id: u8) -> PeerId {
    B512::with_last_byte(id)
}

/// Fake peer that records every requested hash and never sends blocks on its own.
pub struct RecordingPeer {
    id: PeerId,
    capabilities: Mutex<PeerCapabilities>,
    requested: Mutex<Vec<B256>>,
    failing: AtomicBool,
}

impl RecordingPeer {
    pub fn new(id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            capabilities: Mutex::new(PeerCapabilities {
                protocol_version: 70_016,
                services: ServiceFlags::NETWORK,
            }),
            requested: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn with_capabilities(self: Arc<Self>, capabilities: PeerCapabilities) -> Arc<Self> {
        *self.capabilities.lock() = capabilities;
        self
    }

    /// Makes every following `request_blocks` call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn requested(&self) -> Vec<B256> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl BlockPeer for RecordingPeer {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    fn capabilities(&self) -> PeerCapabilities {
        *self.capabilities.lock()
    }

    async fn request_blocks(&self, hashes: Vec<B256>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(eyre!("connection reset"));
        }
        self.requested.lock().extend(hashes);
        Ok(())
    }
}

/// Index holding a single chain of `len` headers starting at genesis.
pub fn test_chain(len: u64) -> (Arc<HeaderIndex>, Vec<BlockHeader>) {
    let index = Arc::new(HeaderIndex::new());
    let headers = extend_chain(&index, None, len, 0).expect("fresh chain");
    (index, headers)
}

/// Collects results until `count` have arrived or `timeout` passes.
pub async fn collect_results(
    rx: &mut mpsc::UnboundedReceiver<DownloadResult>,
    count: usize,
    timeout: Duration,
) -> Vec<DownloadResult> {
    let mut results = Vec::with_capacity(count);
    let _ = tokio::time::timeout(timeout, async {
        while results.len() < count {
            match rx.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
    })
    .await;
    results
}

/// Polls `condition` on the runtime's clock until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn base_config() -> NodeConfig {
    NodeConfig {
        verbosity: 0,
        log_json: None,
        log_json_filter: DEFAULT_LOG_JSON_FILTER.to_string(),
        min_concurrent_downloads: DEFAULT_MIN_CONCURRENT_DOWNLOADS,
        stall_check_interval_ms: DEFAULT_STALL_CHECK_INTERVAL_MS,
        max_seconds_to_deliver_block: DEFAULT_MAX_SECONDS_TO_DELIVER_BLOCK,
        important_height_margin: DEFAULT_IMPORTANT_HEIGHT_MARGIN,
        caught_up_rate_cap_bytes_per_sec: DEFAULT_CAUGHT_UP_RATE_CAP,
        seed: None,
        sim_blocks: DEFAULT_SIM_BLOCKS,
        sim_peers: DEFAULT_SIM_PEERS,
        sim_stalling_peers: 0,
        sim_fork_height: None,
        sim_fork_peers: 0,
        sim_block_size: DEFAULT_SIM_BLOCK_SIZE,
        sim_latency_ms: DEFAULT_SIM_LATENCY_MS,
        sim_bandwidth_bytes_per_sec: DEFAULT_SIM_BANDWIDTH_BYTES_PER_SEC,
        sim_timeout_secs: None,
        initial_block_download: true,
    }
}
