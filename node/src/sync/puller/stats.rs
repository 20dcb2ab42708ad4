//! Puller counters and run summary.

use super::types::ReleaseReason;
use crate::metrics::rate_per_sec;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct PullerStats {
    started_at: Instant,
    headers_requested: AtomicU64,
    blocks_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    headers_not_found: AtomicU64,
    deliveries_discarded: AtomicU64,
    peers_registered: AtomicU64,
    released_disconnected: AtomicU64,
    released_request_failed: AtomicU64,
    released_stalled: AtomicU64,
    released_services: AtomicU64,
    headers_reassigned: AtomicU64,
    assignment_passes: AtomicU64,
    deferred_passes: AtomicU64,
}

impl Default for PullerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PullerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            headers_requested: AtomicU64::new(0),
            blocks_delivered: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            headers_not_found: AtomicU64::new(0),
            deliveries_discarded: AtomicU64::new(0),
            peers_registered: AtomicU64::new(0),
            released_disconnected: AtomicU64::new(0),
            released_request_failed: AtomicU64::new(0),
            released_stalled: AtomicU64::new(0),
            released_services: AtomicU64::new(0),
            headers_reassigned: AtomicU64::new(0),
            assignment_passes: AtomicU64::new(0),
            deferred_passes: AtomicU64::new(0),
        }
    }

    pub fn record_requested(&self, headers: u64) {
        self.headers_requested.fetch_add(headers, Ordering::SeqCst);
    }

    pub fn record_delivered(&self, bytes: u64) {
        self.blocks_delivered.fetch_add(1, Ordering::SeqCst);
        self.bytes_delivered.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn record_not_found(&self, headers: u64) {
        self.headers_not_found.fetch_add(headers, Ordering::SeqCst);
    }

    pub fn record_discarded(&self) {
        self.deliveries_discarded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_peer_registered(&self) {
        self.peers_registered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_release(&self, reason: ReleaseReason, headers: u64) {
        let counter = match reason {
            ReleaseReason::Disconnected => &self.released_disconnected,
            ReleaseReason::RequestFailed => &self.released_request_failed,
            ReleaseReason::Stalled => &self.released_stalled,
            ReleaseReason::ServicesRequired => &self.released_services,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.headers_reassigned.fetch_add(headers, Ordering::SeqCst);
    }

    pub fn record_pass(&self, deferred: bool) {
        self.assignment_passes.fetch_add(1, Ordering::SeqCst);
        if deferred {
            self.deferred_passes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn blocks_delivered(&self) -> u64 {
        self.blocks_delivered.load(Ordering::SeqCst)
    }

    pub fn headers_not_found(&self) -> u64 {
        self.headers_not_found.load(Ordering::SeqCst)
    }

    pub fn deliveries_discarded(&self) -> u64 {
        self.deliveries_discarded.load(Ordering::SeqCst)
    }

    pub fn stalls(&self) -> u64 {
        self.released_stalled.load(Ordering::SeqCst)
    }

    pub fn summary(&self, max_concurrent: usize, peers: usize) -> PullerSummary {
        let elapsed = self.started_at.elapsed();
        let blocks_delivered = self.blocks_delivered.load(Ordering::SeqCst);
        let bytes_delivered = self.bytes_delivered.load(Ordering::SeqCst);
        PullerSummary {
            elapsed_ms: elapsed.as_millis() as u64,
            headers_requested: self.headers_requested.load(Ordering::SeqCst),
            blocks_delivered,
            bytes_delivered,
            headers_not_found: self.headers_not_found.load(Ordering::SeqCst),
            deliveries_discarded: self.deliveries_discarded.load(Ordering::SeqCst),
            blocks_per_sec: rate_per_sec(blocks_delivered, elapsed),
            bytes_per_sec: rate_per_sec(bytes_delivered, elapsed),
            peers_registered: self.peers_registered.load(Ordering::SeqCst),
            peers_active: peers as u64,
            releases: ReleaseSummary {
                disconnected: self.released_disconnected.load(Ordering::SeqCst),
                request_failed: self.released_request_failed.load(Ordering::SeqCst),
                stalled: self.released_stalled.load(Ordering::SeqCst),
                services_required: self.released_services.load(Ordering::SeqCst),
                headers_reassigned: self.headers_reassigned.load(Ordering::SeqCst),
            },
            assignment_passes: self.assignment_passes.load(Ordering::SeqCst),
            deferred_passes: self.deferred_passes.load(Ordering::SeqCst),
            max_concurrent_downloads: max_concurrent as u64,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseSummary {
    pub disconnected: u64,
    pub request_failed: u64,
    pub stalled: u64,
    pub services_required: u64,
    pub headers_reassigned: u64,
}

#[derive(Debug, Serialize)]
pub struct PullerSummary {
    pub elapsed_ms: u64,
    pub headers_requested: u64,
    pub blocks_delivered: u64,
    pub bytes_delivered: u64,
    pub headers_not_found: u64,
    pub deliveries_discarded: u64,
    pub blocks_per_sec: Option<f64>,
    pub bytes_per_sec: Option<f64>,
    pub peers_registered: u64,
    pub peers_active: u64,
    pub releases: ReleaseSummary,
    pub assignment_passes: u64,
    pub deferred_passes: u64,
    pub max_concurrent_downloads: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_are_counted_per_reason() {
        let stats = PullerStats::new();
        stats.record_release(ReleaseReason::Stalled, 3);
        stats.record_release(ReleaseReason::Disconnected, 2);
        stats.record_release(ReleaseReason::Stalled, 1);
        let summary = stats.summary(10, 2);
        assert_eq!(summary.releases.stalled, 2);
        assert_eq!(summary.releases.disconnected, 1);
        assert_eq!(summary.releases.headers_reassigned, 6);
        assert_eq!(stats.stalls(), 2);
    }

    #[test]
    fn summary_serializes() {
        let stats = PullerStats::new();
        stats.record_requested(4);
        stats.record_delivered(1_000);
        stats.record_not_found(3);
        let json = serde_json::to_value(stats.summary(10, 1)).unwrap();
        assert_eq!(json["headers_requested"], 4);
        assert_eq!(json["bytes_delivered"], 1_000);
        assert_eq!(json["headers_not_found"], 3);
        assert_eq!(json["max_concurrent_downloads"], 10);
    }
}
