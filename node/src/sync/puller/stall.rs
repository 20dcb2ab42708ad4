//! Stall detection for important blocks.

use super::assignments::{group_by_job, AssignmentTable};
use super::types::ReleaseReason;
use super::BlockPuller;
use crate::p2p::PeerId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Peers holding an overdue assignment at or below `important_limit`, in
/// ascending height order of their first overdue block.
pub(crate) fn find_stalled_peers(
    table: &AssignmentTable,
    important_limit: u64,
    max_delivery_time: Duration,
    now: Instant,
) -> Vec<PeerId> {
    let mut seen = HashSet::new();
    let mut stalled = Vec::new();
    for download in table.iter_by_height() {
        if download.header.number > important_limit {
            break;
        }
        let waited = now.saturating_duration_since(download.assigned_at);
        if waited > max_delivery_time && seen.insert(download.peer_id) {
            stalled.push(download.peer_id);
        }
    }
    stalled
}

impl BlockPuller {
    /// Releases the work of every peer that is late on an important block.
    /// Each of its assignments counts as a zero-byte sample, so the peer's
    /// score drops while it stays registered.
    pub(crate) fn check_stalls(&self) -> Vec<PeerId> {
        let important_limit = self
            .chain
            .consensus_tip_height()
            .saturating_add(self.config.important_height_margin);
        let now = Instant::now();
        let stalled = find_stalled_peers(
            &self.assignments.lock(),
            important_limit,
            self.config.max_delivery_time,
            now,
        );
        for peer_id in &stalled {
            self.penalize_stalled_peer(*peer_id, now);
        }
        stalled
    }

    fn penalize_stalled_peer(&self, peer_id: PeerId, now: Instant) {
        let downloads = self.assignments.lock().take_for_peer(&peer_id);
        if downloads.is_empty() {
            return;
        }
        let samples: Vec<(u64, f64)> = downloads
            .iter()
            .map(|download| {
                let waited = now.saturating_duration_since(download.assigned_at);
                (0, waited.as_secs_f64())
            })
            .collect();
        let ibd = self.chain.is_initial_block_download();
        let (aggregate, score) = {
            let mut peers = self.peers.lock();
            let score = peers.record_stall(&peer_id, &samples, ibd);
            (peers.aggregate_rate(), score)
        };
        tracing::warn!(
            peer_id = ?peer_id,
            assignments = downloads.len(),
            quality_score = ?score,
            "puller: peer stalled on important block"
        );
        self.requeue_released(
            peer_id,
            ReleaseReason::Stalled,
            group_by_job(downloads),
            Some(aggregate),
        );
    }

    pub(crate) async fn run_stall_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.stall_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_stalls();
                }
            }
        }
        tracing::debug!("puller: stall loop stopped");
    }
}
