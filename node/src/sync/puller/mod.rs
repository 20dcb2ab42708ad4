//! Block puller: decides which peer downloads which block.
//!
//! State lives in three independent critical sections: the peer registry,
//! the queue/budget/throughput domain and the assignment table. No call path
//! holds two of them at once; data needed across domains is copied out of
//! one lock before the next is taken.

mod assignments;
mod peers;
mod scheduler;
mod stall;
mod stats;
mod throughput;
mod types;

use crate::chain::{BlockHeader, ChainState};
use crate::cli::NodeConfig;
use crate::p2p::{BlockPeer, PeerId, ServiceFlags};
use alloy_primitives::{Bytes, B256};
use assignments::{AssignmentTable, ReleasedJobs};
use eyre::eyre;
use futures::future::join_all;
use parking_lot::Mutex;
use peers::PeerRegistry;
use scheduler::QueueState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use throughput::{QualityScoring, ThroughputEstimator};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use peers::PeerSnapshot;
pub use stats::{PullerStats, PullerSummary};
pub use types::{
    AssignedDownload, DeliveryMismatch, DeliveryStatus, DownloadJob, DownloadOutcome,
    DownloadResult, ReleaseReason, TipClaim,
};

/// Puller configuration.
#[derive(Debug, Clone)]
pub struct PullerConfig {
    /// Floor of the concurrency budget.
    pub min_concurrent_downloads: usize,
    /// Window of the rolling average block size.
    pub block_size_samples: usize,
    /// Window of each peer's delivery rate.
    pub peer_rate_samples: usize,
    pub stall_check_interval: Duration,
    /// How long an important block may stay undelivered.
    pub max_delivery_time: Duration,
    /// Blocks up to `consensus tip + margin` are important.
    pub important_height_margin: u64,
    pub min_quality_score: f64,
    pub max_quality_score: f64,
    /// Rate ceiling used for scoring once the node has caught up.
    pub caught_up_rate_cap_bytes_per_sec: f64,
    /// Fraction of the budget that must be free before ordinary jobs are served.
    pub ordinary_slot_threshold: f64,
    pub min_protocol_version: u32,
    pub required_services: ServiceFlags,
    /// Seed for the weighted draws; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            min_concurrent_downloads: 10,
            block_size_samples: 1000,
            peer_rate_samples: 20,
            stall_check_interval: Duration::from_millis(500),
            max_delivery_time: Duration::from_secs(10),
            important_height_margin: 10,
            min_quality_score: 0.01,
            max_quality_score: 1.0,
            caught_up_rate_cap_bytes_per_sec: 1024.0 * 1024.0,
            ordinary_slot_threshold: 0.1,
            min_protocol_version: 70_012,
            required_services: ServiceFlags::NETWORK,
            rng_seed: None,
        }
    }
}

impl From<&NodeConfig> for PullerConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            min_concurrent_downloads: config.min_concurrent_downloads.max(1),
            stall_check_interval: Duration::from_millis(config.stall_check_interval_ms.max(1)),
            max_delivery_time: Duration::from_secs(config.max_seconds_to_deliver_block.max(1)),
            important_height_margin: config.important_height_margin,
            caught_up_rate_cap_bytes_per_sec: config.caught_up_rate_cap_bytes_per_sec as f64,
            rng_seed: config.seed,
            ..Self::default()
        }
    }
}

/// Scheduler for downloading blocks from a fluctuating peer set.
pub struct BlockPuller {
    config: PullerConfig,
    chain: Arc<dyn ChainState>,
    peers: Mutex<PeerRegistry>,
    queues: Mutex<QueueState>,
    assignments: Mutex<AssignmentTable>,
    /// Level-triggered: a notification with no waiter is kept for the next wait.
    wake: Notify,
    shutdown: CancellationToken,
    results: mpsc::UnboundedSender<DownloadResult>,
    next_job_id: AtomicU64,
    stats: PullerStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockPuller {
    pub fn new(
        config: PullerConfig,
        chain: Arc<dyn ChainState>,
        results: mpsc::UnboundedSender<DownloadResult>,
    ) -> Arc<Self> {
        let scoring = QualityScoring {
            min_score: config.min_quality_score,
            max_score: config.max_quality_score,
            caught_up_rate_cap: config.caught_up_rate_cap_bytes_per_sec,
        };
        let peers = PeerRegistry::new(
            scoring,
            config.peer_rate_samples,
            config.min_protocol_version,
            config.required_services,
        );
        let throughput =
            ThroughputEstimator::new(config.block_size_samples, config.min_concurrent_downloads);
        let queues = QueueState::new(throughput, config.rng_seed);
        Arc::new(Self {
            config,
            chain,
            peers: Mutex::new(peers),
            queues: Mutex::new(queues),
            assignments: Mutex::new(AssignmentTable::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            results,
            next_job_id: AtomicU64::new(1),
            stats: PullerStats::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the assigner loop and the stall-check loop.
    pub fn initialize(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        let puller = Arc::clone(self);
        tasks.push(tokio::spawn(async move { puller.run_assigner_loop().await }));
        let puller = Arc::clone(self);
        tasks.push(tokio::spawn(async move { puller.run_stall_loop().await }));
        tracing::info!(
            min_concurrent = self.config.min_concurrent_downloads,
            stall_check_ms = self.config.stall_check_interval.as_millis() as u64,
            max_delivery_secs = self.config.max_delivery_time.as_secs(),
            "puller: started"
        );
    }

    /// Stops both loops and drops all in-memory state. No result is emitted
    /// after this begins.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let dropped = {
            let mut table = self.assignments.lock();
            let dropped = table.len();
            table.clear();
            dropped
        };
        let pending = {
            let mut queues = self.queues.lock();
            let pending = queues.pending_headers();
            queues.clear();
            pending
        };
        tracing::info!(in_flight = dropped, pending, "puller: stopped");
    }

    /// Queues headers for download. High-priority jobs join the reassignment
    /// queue and bypass the slot budget. Returns the job id.
    ///
    /// A header already waiting or in flight is not queued twice and yields a
    /// single result.
    pub fn request_download(&self, headers: Vec<BlockHeader>, high_priority: bool) -> u64 {
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        if headers.is_empty() || self.shutdown.is_cancelled() {
            return job_id;
        }
        let count = headers.len();
        let first = headers.first().map_or(0, |h| h.number);
        let last = headers.last().map_or(0, |h| h.number);
        self.stats.record_requested(count as u64);
        let queued = self
            .queues
            .lock()
            .enqueue(DownloadJob::new(job_id, headers), high_priority);
        self.wake.notify_one();
        tracing::debug!(
            job_id,
            headers = count,
            duplicates = count - queued,
            range_start = first,
            range_end = last,
            high_priority,
            "puller: download requested"
        );
        job_id
    }

    /// A peer announced (or moved) its chain tip.
    pub fn peer_tip_claimed(&self, peer: Arc<dyn BlockPeer>, tip: BlockHeader) -> TipClaim {
        let peer_id = peer.peer_id();
        let claim = {
            let mut peers = self.peers.lock();
            let capable = peers.is_capable(peer.as_ref());
            peers.claim_tip(peer, capable, tip)
        };
        match claim {
            TipClaim::Registered => {
                self.stats.record_peer_registered();
                tracing::debug!(peer_id = ?peer_id, tip = tip.number, "puller: peer registered");
                self.wake.notify_one();
            }
            TipClaim::Updated => {
                tracing::trace!(peer_id = ?peer_id, tip = tip.number, "puller: peer tip updated");
            }
            TipClaim::Ignored => {
                tracing::debug!(peer_id = ?peer_id, "puller: ignoring tip from incapable peer");
            }
        }
        claim
    }

    pub fn peer_disconnected(&self, peer_id: PeerId) {
        self.release_peer(peer_id, ReleaseReason::Disconnected);
    }

    /// Adds required service bits; peers lacking them are dropped like disconnects.
    pub fn require_peer_services(&self, services: ServiceFlags) {
        let ibd = self.chain.is_initial_block_download();
        let pruned = self
            .peers
            .lock()
            .prune_by_required_services(services, ibd);
        if !pruned.is_empty() {
            tracing::info!(
                services = ?services,
                pruned = pruned.len(),
                "puller: dropping peers without required services"
            );
        }
        for peer_id in pruned {
            self.release_peer(peer_id, ReleaseReason::ServicesRequired);
        }
    }

    /// A block arrived from the network. Only the peer currently holding the
    /// assignment is credited; anything else is discarded.
    pub fn block_delivered(&self, peer_id: PeerId, hash: B256, block: Bytes) -> DeliveryStatus {
        let checked = {
            let mut table = self.assignments.lock();
            match table.get(&hash).map(|assigned| assigned.peer_id) {
                None => Err(DeliveryMismatch::NotAssigned),
                Some(assigned_to) if assigned_to != peer_id => {
                    Err(DeliveryMismatch::WrongPeer { assigned_to })
                }
                Some(_) => table.remove(&hash).ok_or(DeliveryMismatch::NotAssigned),
            }
        };
        let assigned = match checked {
            Ok(assigned) => assigned,
            Err(mismatch) => {
                self.stats.record_discarded();
                tracing::trace!(
                    peer_id = ?peer_id,
                    hash = %hash,
                    reason = ?mismatch,
                    "puller: discarding unexpected block"
                );
                return DeliveryStatus::Discarded(mismatch);
            }
        };

        let bytes = block.len() as u64;
        let seconds = assigned.assigned_at.elapsed().as_secs_f64();
        let ibd = self.chain.is_initial_block_download();
        let aggregate = {
            let mut peers = self.peers.lock();
            peers.record_samples(&peer_id, &[(bytes, seconds)], ibd);
            peers.aggregate_rate()
        };
        let max_concurrent = {
            let mut queues = self.queues.lock();
            queues.throughput.record_block_size(bytes);
            queues.throughput.update_budget(aggregate)
        };
        self.stats.record_delivered(bytes);
        self.wake.notify_one();

        tracing::trace!(
            peer_id = ?peer_id,
            height = assigned.header.number,
            bytes,
            elapsed_ms = (seconds * 1000.0) as u64,
            max_concurrent,
            "puller: block delivered"
        );
        self.emit(DownloadResult {
            hash,
            outcome: DownloadOutcome::Delivered { peer_id, block },
        });
        DeliveryStatus::Accepted
    }

    /// One assigner iteration: plan, commit, then ask peers to fetch.
    pub(crate) async fn assign_pending(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let candidates = self.peers.lock().candidates();
        let in_flight = self.assignments.lock().len();
        let plan = self.queues.lock().plan_assignments(
            in_flight,
            self.config.ordinary_slot_threshold,
            &candidates,
            self.chain.as_ref(),
        );
        self.stats.record_pass(plan.deferred);
        if plan.deferred {
            tracing::trace!(in_flight, "puller: ordinary work deferred, budget nearly full");
        }

        // A failed copy of a header that is already in flight leaves the result
        // to the in-flight assignment.
        let failed: Vec<B256> = if plan.failed.is_empty() {
            Vec::new()
        } else {
            let table = self.assignments.lock();
            plan.failed
                .iter()
                .filter(|hash| table.get(hash).is_none())
                .copied()
                .collect()
        };
        if !failed.is_empty() {
            self.stats.record_not_found(failed.len() as u64);
            tracing::debug!(
                headers = failed.len(),
                peers = candidates.len(),
                "puller: no peer claims requested headers"
            );
            for hash in failed {
                self.emit(DownloadResult {
                    hash,
                    outcome: DownloadOutcome::NotFound,
                });
            }
        }
        if plan.assigned.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut batches: HashMap<PeerId, (Arc<dyn BlockPeer>, Vec<B256>)> = HashMap::new();
        let mut duplicates = 0usize;
        {
            let mut table = self.assignments.lock();
            for planned in &plan.assigned {
                let candidate = &candidates[planned.peer_index];
                let inserted = table.insert(AssignedDownload {
                    job_id: planned.job_id,
                    peer_id: candidate.peer_id,
                    header: planned.header,
                    assigned_at: now,
                });
                if !inserted {
                    duplicates += 1;
                    continue;
                }
                batches
                    .entry(candidate.peer_id)
                    .or_insert_with(|| (Arc::clone(&candidate.peer), Vec::new()))
                    .1
                    .push(planned.header.hash);
            }
        }
        if duplicates > 0 {
            tracing::debug!(duplicates, "puller: skipped headers already in flight");
        }

        // A peer may have disconnected while the pass was planned.
        let gone: Vec<PeerId> = {
            let peers = self.peers.lock();
            let gone = batches
                .keys()
                .filter(|peer_id| !peers.contains(peer_id))
                .copied()
                .collect();
            gone
        };
        for peer_id in gone {
            batches.remove(&peer_id);
            self.release_peer(peer_id, ReleaseReason::Disconnected);
        }

        tracing::debug!(
            assigned = plan.assigned.len() - duplicates,
            reassigned = plan.reassigned,
            peers = batches.len(),
            "puller: assignment pass"
        );
        self.request_batches(batches).await;
    }

    /// Sends each peer its batch concurrently. A failed or cancelled request
    /// is handled exactly like a disconnect.
    async fn request_batches(&self, batches: HashMap<PeerId, (Arc<dyn BlockPeer>, Vec<B256>)>) {
        let requests = batches.into_iter().map(|(peer_id, (peer, hashes))| {
            let shutdown = self.shutdown.clone();
            async move {
                let blocks = hashes.len();
                let result = tokio::select! {
                    result = peer.request_blocks(hashes) => result,
                    _ = shutdown.cancelled() => Err(eyre!("request cancelled by shutdown")),
                };
                (peer_id, blocks, result)
            }
        });
        for (peer_id, blocks, result) in join_all(requests).await {
            match result {
                Ok(()) => {
                    tracing::trace!(peer_id = ?peer_id, blocks, "puller: blocks requested");
                }
                Err(err) => {
                    if self.shutdown.is_cancelled() {
                        continue;
                    }
                    tracing::warn!(
                        peer_id = ?peer_id,
                        blocks,
                        error = %err,
                        "puller: block request failed, releasing peer"
                    );
                    self.release_peer(peer_id, ReleaseReason::RequestFailed);
                }
            }
        }
    }

    /// Unregisters (unless stalled) and hands the peer's work back to the
    /// reassignment queue.
    fn release_peer(&self, peer_id: PeerId, reason: ReleaseReason) {
        let aggregate = if reason.unregisters_peer() {
            let ibd = self.chain.is_initial_block_download();
            let mut peers = self.peers.lock();
            peers.unregister(&peer_id, ibd);
            Some(peers.aggregate_rate())
        } else {
            None
        };
        let released = self.assignments.lock().release_for_peer(&peer_id);
        self.requeue_released(peer_id, reason, released, aggregate);
    }

    fn requeue_released(
        &self,
        peer_id: PeerId,
        reason: ReleaseReason,
        released: ReleasedJobs,
        aggregate_rate: Option<f64>,
    ) {
        let held: usize = released.iter().map(|(_, headers)| headers.len()).sum();
        let headers = {
            let mut queues = self.queues.lock();
            if let Some(aggregate) = aggregate_rate {
                queues.throughput.update_budget(aggregate);
            }
            queues.enqueue_released(released)
        };
        self.wake.notify_one();
        // Already released once, e.g. a disconnect followed by its failed request.
        if held == 0 {
            tracing::trace!(peer_id = ?peer_id, reason = %reason, "puller: released peer held no work");
            return;
        }
        self.stats.record_release(reason, headers as u64);
        tracing::debug!(
            peer_id = ?peer_id,
            reason = %reason,
            headers,
            "puller: peer assignments released"
        );
    }

    fn emit(&self, result: DownloadResult) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _ = self.results.send(result);
    }

    async fn run_assigner_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            self.assign_pending().await;
        }
        tracing::debug!("puller: assigner loop stopped");
    }

    pub fn in_flight_count(&self) -> usize {
        self.assignments.lock().len()
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.queues.lock().throughput.max_concurrent()
    }

    pub fn pending_header_count(&self) -> usize {
        self.queues.lock().pending_headers()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer_quality_score(&self, peer_id: &PeerId) -> Option<f64> {
        self.peers.lock().quality_score(peer_id)
    }

    pub fn peer_snapshot(&self) -> Vec<PeerSnapshot> {
        let in_flight = self.assignments.lock().per_peer_counts();
        self.peers.lock().snapshot(&in_flight)
    }

    pub fn stats(&self) -> &PullerStats {
        &self.stats
    }

    pub fn summary(&self) -> PullerSummary {
        let max_concurrent = self.max_concurrent_downloads();
        let peers = self.peer_count();
        self.stats.summary(max_concurrent, peers)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        self.assignments.lock().assert_consistent();
    }

    #[cfg(test)]
    fn in_flight_for(&self, peer_id: &PeerId) -> usize {
        self.assignments.lock().peer_count(peer_id)
    }

    #[cfg(test)]
    fn assigned_peer(&self, hash: &B256) -> Option<PeerId> {
        self.assignments.lock().get(hash).map(|assigned| assigned.peer_id)
    }
}
