//! In-process peer network that drives the puller end to end.

use crate::chain::{extend_chain, BlockHeader, HeaderIndex};
use crate::cli::NodeConfig;
use crate::metrics::percent;
use crate::p2p::{BlockPeer, PeerCapabilities, PeerId, ServiceFlags};
use crate::sync::puller::{
    BlockPuller, DownloadOutcome, DownloadResult, PeerSnapshot, PullerConfig, PullerSummary,
};
use alloy_primitives::{Bytes, B256, B512};
use async_trait::async_trait;
use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

/// A block handed back by a simulated peer.
#[derive(Debug, Clone)]
pub struct SimDelivery {
    pub peer_id: PeerId,
    pub hash: B256,
    pub block: Bytes,
}

/// Peer that serves every requested block after `latency` plus the time its
/// bandwidth needs for the block. Transfers on one peer are serialized.
pub struct SimulatedPeer {
    id: PeerId,
    capabilities: PeerCapabilities,
    latency: Duration,
    bytes_per_sec: f64,
    stalling: bool,
    block: Bytes,
    busy_until: Mutex<Instant>,
    deliveries: mpsc::UnboundedSender<SimDelivery>,
}

impl SimulatedPeer {
    pub fn new(
        id: PeerId,
        latency: Duration,
        bytes_per_sec: f64,
        block: Bytes,
        deliveries: mpsc::UnboundedSender<SimDelivery>,
    ) -> Self {
        Self {
            id,
            capabilities: PeerCapabilities {
                protocol_version: 70_016,
                services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            },
            latency,
            bytes_per_sec: bytes_per_sec.max(1.0),
            stalling: false,
            block,
            busy_until: Mutex::new(Instant::now()),
            deliveries,
        }
    }

    /// Accepts requests but never answers them.
    pub fn stalling(mut self) -> Self {
        self.stalling = true;
        self
    }

    pub fn is_stalling(&self) -> bool {
        self.stalling
    }

    fn transfer_time(&self) -> Duration {
        Duration::from_secs_f64(self.block.len() as f64 / self.bytes_per_sec)
    }
}

#[async_trait]
impl BlockPeer for SimulatedPeer {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    fn capabilities(&self) -> PeerCapabilities {
        self.capabilities
    }

    async fn request_blocks(&self, hashes: Vec<B256>) -> Result<()> {
        if self.stalling {
            tracing::trace!(peer_id = ?self.id, blocks = hashes.len(), "sim: stalling peer ignored request");
            return Ok(());
        }
        let transfer = self.transfer_time();
        let schedule: Vec<(B256, Instant)> = {
            let mut busy_until = self.busy_until.lock();
            let mut done = (*busy_until).max(Instant::now());
            let schedule = hashes
                .into_iter()
                .map(|hash| {
                    done += transfer;
                    (hash, done + self.latency)
                })
                .collect();
            *busy_until = done;
            schedule
        };

        let peer_id = self.id;
        let block = self.block.clone();
        let deliveries = self.deliveries.clone();
        tokio::spawn(async move {
            for (hash, at) in schedule {
                sleep_until(at).await;
                let delivery = SimDelivery {
                    peer_id,
                    hash,
                    block: block.clone(),
                };
                if deliveries.send(delivery).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

/// Feeds simulated deliveries into the puller.
pub fn spawn_delivery_forwarder(
    puller: Arc<BlockPuller>,
    mut deliveries: mpsc::UnboundedReceiver<SimDelivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let status = puller.block_delivered(delivery.peer_id, delivery.hash, delivery.block);
            tracing::trace!(peer_id = ?delivery.peer_id, status = ?status, "sim: delivery forwarded");
        }
    })
}

/// Result of one simulated download run.
#[derive(Debug, Serialize)]
pub struct SimReport {
    pub requested: u64,
    pub delivered: u64,
    pub not_found: u64,
    pub delivered_percent: Option<f64>,
    pub interrupted: bool,
    pub consensus_tip: u64,
    pub puller: PullerSummary,
    pub peers: Vec<PeerSnapshot>,
}

struct SimChain {
    index: Arc<HeaderIndex>,
    main: Vec<BlockHeader>,
    fork: Vec<BlockHeader>,
}

fn build_chain(config: &NodeConfig) -> Result<SimChain> {
    ensure!(config.sim_blocks > 0, "--sim-blocks must be at least 1");
    let index = Arc::new(HeaderIndex::new());
    index.set_initial_block_download(config.initial_block_download);
    let main = extend_chain(&index, None, config.sim_blocks, 0)
        .wrap_err("failed to build simulated main chain")?;
    let fork = match config.sim_fork_height {
        Some(height) if height + 1 < config.sim_blocks => {
            let parent = main[height as usize];
            let length = config.sim_blocks - height;
            extend_chain(&index, Some(parent), length, 1)
                .wrap_err("failed to build simulated fork")?
        }
        _ => Vec::new(),
    };
    Ok(SimChain { index, main, fork })
}

fn build_peers(
    config: &NodeConfig,
    rng: &mut StdRng,
    deliveries: &mpsc::UnboundedSender<SimDelivery>,
) -> Vec<Arc<SimulatedPeer>> {
    let block = Bytes::from(vec![0xab; config.sim_block_size]);
    let latency = Duration::from_millis(config.sim_latency_ms);
    let fastest = config.sim_bandwidth_bytes_per_sec as f64;
    (0..config.sim_peers)
        .map(|i| {
            let id = B512::with_last_byte((i % 255) as u8 + 1);
            let bandwidth = if i == 0 {
                fastest
            } else {
                fastest * rng.gen_range(0.2..=1.0)
            };
            let jitter = Duration::from_millis(rng.gen_range(0..=config.sim_latency_ms));
            let peer = SimulatedPeer::new(
                id,
                latency + jitter,
                bandwidth,
                block.clone(),
                deliveries.clone(),
            );
            // Stallers come from the end of the list.
            let peer = if i >= config.sim_peers.saturating_sub(config.sim_stalling_peers) {
                peer.stalling()
            } else {
                peer
            };
            Arc::new(peer)
        })
        .collect()
}

/// Builds a chain and a peer set from `config`, downloads the whole main
/// chain through the puller and reports what happened. Stops early when
/// `interrupt` completes or the configured timeout passes.
pub async fn run(config: &NodeConfig, interrupt: impl Future<Output = ()>) -> Result<SimReport> {
    let chain = build_chain(config)?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<DownloadResult>();
    let puller = BlockPuller::new(PullerConfig::from(config), chain.index.clone(), results_tx);
    puller.initialize();

    let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
    let peers = build_peers(config, &mut rng, &deliveries_tx);
    drop(deliveries_tx);
    let forwarder = spawn_delivery_forwarder(Arc::clone(&puller), deliveries_rx);

    let main_tip = chain.main[chain.main.len() - 1];
    let fork_tip = chain.fork.last().copied();
    for (i, peer) in peers.iter().enumerate() {
        let tip = match fork_tip {
            Some(fork_tip) if i < config.sim_fork_peers => fork_tip,
            _ => main_tip,
        };
        puller.peer_tip_claimed(Arc::clone(peer) as Arc<dyn BlockPeer>, tip);
    }
    tracing::info!(
        blocks = chain.main.len(),
        headers_indexed = chain.index.len(),
        best_height = ?chain.index.best_header().map(|h| h.number),
        peers = peers.len(),
        stalling = config.sim_stalling_peers.min(peers.len()),
        fork_peers = if fork_tip.is_some() { config.sim_fork_peers } else { 0 },
        "sim: starting download"
    );

    let heights: HashMap<B256, u64> = chain.main.iter().map(|h| (h.hash, h.number)).collect();
    let requested = chain.main.len() as u64;
    puller.request_download(chain.main.clone(), false);

    let mut delivered = 0u64;
    let mut not_found = 0u64;
    let mut done = vec![false; chain.main.len()];
    let mut consensus_tip = 0u64;
    let mut interrupted = false;

    let timeout = async {
        match config.sim_timeout_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout);
    tokio::pin!(interrupt);
    let mut progress = tokio::time::interval(Duration::from_secs(1));

    while delivered + not_found < requested {
        tokio::select! {
            result = results_rx.recv() => {
                let Some(result) = result else { break };
                match result.outcome {
                    DownloadOutcome::Delivered { .. } => delivered += 1,
                    DownloadOutcome::NotFound => not_found += 1,
                }
                if let Some(&height) = heights.get(&result.hash) {
                    done[height as usize] = true;
                    while (consensus_tip as usize + 1) < done.len()
                        && done[consensus_tip as usize + 1]
                    {
                        consensus_tip += 1;
                    }
                    chain.index.set_consensus_tip_height(consensus_tip);
                }
            }
            _ = progress.tick() => {
                tracing::info!(
                    delivered,
                    not_found,
                    in_flight = puller.in_flight_count(),
                    pending = puller.pending_header_count(),
                    max_concurrent = puller.max_concurrent_downloads(),
                    consensus_tip,
                    "sim: progress"
                );
            }
            _ = &mut interrupt => {
                tracing::warn!("sim: interrupted");
                interrupted = true;
                break;
            }
            _ = &mut timeout => {
                tracing::warn!(delivered, requested, "sim: timed out");
                interrupted = true;
                break;
            }
        }
    }

    let stats = puller.stats();
    tracing::info!(
        delivered = stats.blocks_delivered(),
        not_found = stats.headers_not_found(),
        discarded = stats.deliveries_discarded(),
        stalls = stats.stalls(),
        "sim: download finished"
    );
    for peer in peers.iter().filter(|peer| peer.is_stalling()) {
        tracing::debug!(
            peer_id = ?peer.peer_id(),
            quality_score = ?puller.peer_quality_score(&peer.peer_id()),
            "sim: stalling peer final score"
        );
    }
    let summary = puller.summary();
    let peer_rows = puller.peer_snapshot();
    puller.shutdown().await;
    forwarder.abort();

    Ok(SimReport {
        requested,
        delivered,
        not_found,
        delivered_percent: percent(delivered, requested),
        interrupted,
        consensus_tip,
        puller: summary,
        peers: peer_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::base_config;

    fn small_config() -> NodeConfig {
        let mut config = base_config();
        config.sim_blocks = 200;
        config.sim_peers = 4;
        config.sim_block_size = 10_000;
        config.sim_latency_ms = 20;
        config.sim_bandwidth_bytes_per_sec = 1_000_000;
        config.sim_timeout_secs = Some(3_600);
        config.seed = Some(1);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_peer_paces_deliveries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = SimulatedPeer::new(
            B512::with_last_byte(1),
            Duration::from_millis(100),
            1_000.0,
            Bytes::from(vec![0u8; 500]),
            tx,
        );
        let start = Instant::now();
        let hashes = vec![B256::with_last_byte(1), B256::with_last_byte(2)];
        peer.request_blocks(hashes.clone()).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.hash, hashes[0]);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600) && elapsed < Duration::from_millis(650));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.hash, hashes[1]);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_100) && elapsed < Duration::from_millis(1_150));
    }

    #[tokio::test(start_paused = true)]
    async fn stalling_peer_never_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = SimulatedPeer::new(
            B512::with_last_byte(1),
            Duration::from_millis(10),
            1_000_000.0,
            Bytes::from_static(b"block"),
            tx,
        )
        .stalling();
        peer.request_blocks(vec![B256::ZERO]).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_delivers_every_block() {
        let config = small_config();
        let report = run(&config, std::future::pending()).await.unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.delivered, 200);
        assert_eq!(report.not_found, 0);
        assert_eq!(report.consensus_tip, 199);
        assert_eq!(report.puller.blocks_delivered, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn stalling_peer_work_is_reassigned() {
        let mut config = small_config();
        config.sim_stalling_peers = 1;
        let report = run(&config, std::future::pending()).await.unwrap();
        assert_eq!(report.delivered, 200);
        assert!(report.puller.releases.stalled >= 1);
        assert_eq!(report.peers.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn headers_above_every_tip_are_not_found() {
        let mut config = small_config();
        config.sim_fork_height = Some(99);
        config.sim_fork_peers = 4;
        let report = run(&config, std::future::pending()).await.unwrap();
        assert_eq!(report.delivered, 100);
        assert_eq!(report.not_found, 100);
    }
}
