//! Shared types for the block puller.

use crate::chain::BlockHeader;
use crate::p2p::PeerId;
use alloy_primitives::{Bytes, B256};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// A batch of headers whose blocks a caller wants.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: u64,
    /// Consumed from the front as headers are assigned or declared failed.
    pub headers: VecDeque<BlockHeader>,
}

impl DownloadJob {
    pub fn new(id: u64, headers: impl IntoIterator<Item = BlockHeader>) -> Self {
        Self {
            id,
            headers: headers.into_iter().collect(),
        }
    }
}

/// A header committed to a single peer.
#[derive(Debug, Clone, Copy)]
pub struct AssignedDownload {
    pub job_id: u64,
    pub peer_id: PeerId,
    pub header: BlockHeader,
    pub assigned_at: Instant,
}

/// Final result for one requested header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Delivered { peer_id: PeerId, block: Bytes },
    /// No currently known peer claims the header.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub hash: B256,
    pub outcome: DownloadOutcome,
}

/// Why a delivery was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMismatch {
    NotAssigned,
    WrongPeer { assigned_to: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Accepted,
    Discarded(DeliveryMismatch),
}

/// Why a peer's assignments were handed back to the reassignment queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Disconnected,
    RequestFailed,
    Stalled,
    ServicesRequired,
}

impl ReleaseReason {
    /// Stalled peers keep their registration; every other reason removes it.
    pub fn unregisters_peer(self) -> bool {
        !matches!(self, Self::Stalled)
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::RequestFailed => "request_failed",
            Self::Stalled => "stalled",
            Self::ServicesRequired => "services_required",
        };
        f.write_str(label)
    }
}

/// Result of a tip claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipClaim {
    Registered,
    Updated,
    /// Unknown peer that failed the capability check.
    Ignored,
}
