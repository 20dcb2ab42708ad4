//! Peer-connection boundary.
//!
//! Transport, handshake and framing live outside this crate. A peer is
//! anything that can report its capabilities and accept a "send me these
//! blocks" request; deliveries come back through `BlockPuller::block_delivered`.

use alloy_primitives::{B256, B512};
use async_trait::async_trait;
use eyre::Result;
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Node identity of a remote peer (64-byte public key).
pub type PeerId = B512;

/// Service bits advertised in the version handshake.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ServiceFlags(u64);

impl ServiceFlags {
    pub const NONE: Self = Self(0);
    /// Serves the full block history.
    pub const NETWORK: Self = Self(1);
    /// Serves blocks with witness data.
    pub const WITNESS: Self = Self(1 << 3);
    /// True when every bit of `required` is also set in `self`.
    pub const fn contains(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }
}

impl BitOr for ServiceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for ServiceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceFlags({:#x})", self.0)
    }
}

/// What a peer negotiated during its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCapabilities {
    pub protocol_version: u32,
    pub services: ServiceFlags,
}

impl PeerCapabilities {
    /// Minimum protocol version plus required service bits.
    pub fn satisfies(&self, min_protocol_version: u32, required: ServiceFlags) -> bool {
        self.protocol_version >= min_protocol_version && self.services.contains(required)
    }
}

/// A connected peer that blocks can be requested from.
#[async_trait]
pub trait BlockPeer: Send + Sync {
    fn peer_id(&self) -> PeerId;

    fn capabilities(&self) -> PeerCapabilities;

    /// Ask the peer to send the given blocks. Completes once the request is
    /// on the wire; blocks arrive asynchronously.
    async fn request_blocks(&self, hashes: Vec<B256>) -> Result<()>;
}
