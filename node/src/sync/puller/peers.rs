//! Per-peer records: claimed tip, delivery samples and quality score.

use super::throughput::{DeliverySamples, QualityScoring};
use super::types::TipClaim;
use crate::chain::BlockHeader;
use crate::p2p::{BlockPeer, PeerId, ServiceFlags};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Score multiplier for a stall that the delivery rate alone does not punish.
const STALL_SCORE_FACTOR: f64 = 0.5;

pub(crate) struct PeerRecord {
    pub(crate) peer: Arc<dyn BlockPeer>,
    pub(crate) tip: BlockHeader,
    pub(crate) quality_score: f64,
    samples: DeliverySamples,
}

impl PeerRecord {
    pub(crate) fn delivery_rate(&self) -> f64 {
        self.samples.rate()
    }
}

/// Copy of the fields the scheduler needs, taken out of the registry lock.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub(crate) peer_id: PeerId,
    pub(crate) tip: BlockHeader,
    pub(crate) quality_score: f64,
    pub(crate) peer: Arc<dyn BlockPeer>,
}

/// Diagnostic row for one registered peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub tip_height: u64,
    pub quality_score: f64,
    pub delivery_rate_bytes_per_sec: f64,
    pub in_flight: usize,
}

pub(crate) struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
    scoring: QualityScoring,
    rate_samples: usize,
    min_protocol_version: u32,
    required_services: ServiceFlags,
}

impl PeerRegistry {
    pub(crate) fn new(
        scoring: QualityScoring,
        rate_samples: usize,
        min_protocol_version: u32,
        required_services: ServiceFlags,
    ) -> Self {
        Self {
            peers: HashMap::new(),
            scoring,
            rate_samples,
            min_protocol_version,
            required_services,
        }
    }

    /// Capability check against the current requirements.
    pub(crate) fn is_capable(&self, peer: &dyn BlockPeer) -> bool {
        peer.capabilities()
            .satisfies(self.min_protocol_version, self.required_services)
    }

    /// Register an unknown capable peer, or move a known peer's tip.
    pub(crate) fn claim_tip(
        &mut self,
        peer: Arc<dyn BlockPeer>,
        capability_ok: bool,
        tip: BlockHeader,
    ) -> TipClaim {
        let peer_id = peer.peer_id();
        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.tip = tip;
            return TipClaim::Updated;
        }
        if !capability_ok {
            return TipClaim::Ignored;
        }
        self.peers.insert(
            peer_id,
            PeerRecord {
                peer,
                tip,
                quality_score: self.scoring.initial_score(),
                samples: DeliverySamples::new(self.rate_samples),
            },
        );
        TipClaim::Registered
    }

    /// Removes a peer; scores are recomputed if it was the baseline.
    pub(crate) fn unregister(&mut self, peer_id: &PeerId, initial_block_download: bool) -> bool {
        let was_baseline = self.baseline_peer() == Some(*peer_id);
        let removed = self.peers.remove(peer_id).is_some();
        if removed && was_baseline {
            self.rescore_all(initial_block_download);
        }
        removed
    }

    pub(crate) fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn quality_score(&self, peer_id: &PeerId) -> Option<f64> {
        self.peers.get(peer_id).map(|record| record.quality_score)
    }

    pub(crate) fn candidates(&self) -> Vec<Candidate> {
        self.peers
            .iter()
            .map(|(peer_id, record)| Candidate {
                peer_id: *peer_id,
                tip: record.tip,
                quality_score: record.quality_score,
                peer: Arc::clone(&record.peer),
            })
            .collect()
    }

    /// Sets the new service requirement and drops every peer lacking it.
    pub(crate) fn prune_by_required_services(
        &mut self,
        required: ServiceFlags,
        initial_block_download: bool,
    ) -> Vec<PeerId> {
        let baseline = self.baseline_peer();
        self.required_services = self.required_services | required;
        let required = self.required_services;
        let pruned: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, record)| !record.peer.capabilities().services.contains(required))
            .map(|(peer_id, _)| *peer_id)
            .collect();
        for peer_id in &pruned {
            self.peers.remove(peer_id);
        }
        if baseline.is_some_and(|baseline| pruned.contains(&baseline)) {
            self.rescore_all(initial_block_download);
        }
        pruned
    }

    /// Feeds delivery or stall samples for one peer and rescores.
    ///
    /// Only the reporter is rescored unless it was or becomes the baseline
    /// peer, in which case every score moves with the baseline.
    pub(crate) fn record_samples(
        &mut self,
        peer_id: &PeerId,
        samples: &[(u64, f64)],
        initial_block_download: bool,
    ) -> bool {
        let baseline_before = self.baseline_peer();
        let Some(record) = self.peers.get_mut(peer_id) else {
            return false;
        };
        for (bytes, seconds) in samples {
            record.samples.record(*bytes, *seconds);
        }
        let baseline_after = self.baseline_peer();
        if baseline_before == Some(*peer_id) || baseline_after == Some(*peer_id) {
            self.rescore_all(initial_block_download);
        } else {
            self.rescore_one(peer_id, initial_block_download);
        }
        true
    }

    /// Feeds a stalled peer's zero-byte samples and returns its new score.
    ///
    /// The stalled peer is scored against the baseline as it stood before the
    /// stall, so a baseline peer cannot keep the top score by dragging the
    /// baseline down with it. If the rate alone does not lower the score (both
    /// rates above the caught-up cap), the previous score is halved.
    pub(crate) fn record_stall(
        &mut self,
        peer_id: &PeerId,
        samples: &[(u64, f64)],
        initial_block_download: bool,
    ) -> Option<f64> {
        let before = self.quality_score(peer_id)?;
        let baseline = self.baseline_rate(initial_block_download);
        self.record_samples(peer_id, samples, initial_block_download);
        let scoring = self.scoring;
        let record = self.peers.get_mut(peer_id)?;
        let by_rate = scoring.score(record.delivery_rate(), baseline, initial_block_download);
        record.quality_score = if by_rate < before {
            by_rate
        } else {
            scoring.clamp(before * STALL_SCORE_FACTOR)
        };
        Some(record.quality_score)
    }

    /// Sum of every registered peer's delivery rate.
    pub(crate) fn aggregate_rate(&self) -> f64 {
        self.peers.values().map(PeerRecord::delivery_rate).sum()
    }

    fn baseline_peer(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(_, record)| record.samples.has_samples())
            .max_by(|a, b| a.1.delivery_rate().total_cmp(&b.1.delivery_rate()))
            .map(|(peer_id, _)| *peer_id)
    }

    fn baseline_rate(&self, initial_block_download: bool) -> f64 {
        let best = self
            .peers
            .values()
            .map(PeerRecord::delivery_rate)
            .fold(0.0, f64::max);
        self.scoring.baseline(best, initial_block_download)
    }

    fn rescore_one(&mut self, peer_id: &PeerId, initial_block_download: bool) {
        let baseline = self.baseline_rate(initial_block_download);
        let scoring = self.scoring;
        if let Some(record) = self.peers.get_mut(peer_id) {
            if record.samples.has_samples() {
                record.quality_score =
                    scoring.score(record.delivery_rate(), baseline, initial_block_download);
            }
        }
    }

    fn rescore_all(&mut self, initial_block_download: bool) {
        let baseline = self.baseline_rate(initial_block_download);
        let scoring = self.scoring;
        for record in self.peers.values_mut() {
            if record.samples.has_samples() {
                record.quality_score =
                    scoring.score(record.delivery_rate(), baseline, initial_block_download);
            }
        }
    }

    pub(crate) fn snapshot(&self, in_flight: &HashMap<PeerId, usize>) -> Vec<PeerSnapshot> {
        let mut rows: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|(peer_id, record)| PeerSnapshot {
                peer_id: format!("{peer_id:?}"),
                tip_height: record.tip.number,
                quality_score: record.quality_score,
                delivery_rate_bytes_per_sec: record.delivery_rate(),
                in_flight: in_flight.get(peer_id).copied().unwrap_or(0),
            })
            .collect();
        rows.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
        rows
    }
}
