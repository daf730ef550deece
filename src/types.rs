//! Shared identifiers and small value types used across the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Client id carried in every packet header. 0 is reserved for the server.
pub type ClientId = u32;

/// Source id the discovery server and session hosts stamp on their packets.
pub const SERVER_CLIENT_ID: ClientId = 0;

/// Participant identifier inside a conference session. Random per join,
/// lexicographic order of these bytes defines the collection ring.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub [u8; 16]);

impl ParticipantId {
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

/// How a participant reaches the rest of the session. Ordered from best
/// to worst for election tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NatTier {
    LocalLan,
    PublicIp,
    UpnpMapped,
    StunReflexive,
    TurnRelay,
}

impl NatTier {
    /// Relayed candidates are score-penalized during election.
    pub fn is_relayed(&self) -> bool {
        matches!(self, NatTier::TurnRelay)
    }
}

/// Transport flavor a peer link ended up on after the connect cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Direct,
    Relayed,
}

/// Link quality metrics one participant reports for itself each round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub upload_kbps: u64,
    pub rtt_ns: u64,
    pub jitter_ns: u64,
    pub loss_pct: f32,
    pub measurement_time_ns: u64,
    pub measurement_window_ns: u64,
}

impl NetworkMetrics {
    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ns / 1_000_000
    }
}

/// Everything the ring knows about one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub nat_tier: NatTier,
    pub connection_type: ConnectionType,
    pub public_addr: Option<SocketAddr>,
    pub metrics: Option<NetworkMetrics>,
}

impl Participant {
    pub fn new(participant_id: ParticipantId, nat_tier: NatTier) -> Self {
        let connection_type = if nat_tier.is_relayed() {
            ConnectionType::Relayed
        } else {
            ConnectionType::Direct
        };
        Self {
            participant_id,
            nat_tier,
            connection_type,
            public_addr: None,
            metrics: None,
        }
    }
}

/// Current UNIX time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current UNIX time in nanoseconds, for metric timestamps.
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Process exit codes. Scripts depend on these staying stable.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const MITM_DETECTED: i32 = 2;
    pub const HANDSHAKE_FAILED: i32 = 3;
    pub const NETWORK_UNREACHABLE: i32 = 4;
    pub const CONFIG_INVALID: i32 = 5;
}
