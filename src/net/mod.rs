//! Networking layer: transports, NAT traversal, per-connection sessions.

pub mod connection;
pub mod natpmp;
pub mod orchestrator;
pub mod relay;
pub mod stun;
pub mod transport;

// Re-exports
pub use connection::{
    run_connection, Connection, ConnectionConfig, SessionError, SessionEvent, SessionState, Step,
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, MAX_MISSED_PONGS,
};
pub use natpmp::{request_mapping, PortMapping};
pub use orchestrator::{discover_reflexive, establish, ConnectPlan, RelayPlan, STAGE2_HEAD_START};
pub use relay::{RelayBind, BIND_ACK_PAIRED, BIND_HEADER_LEN, RELAY_MAGIC};
pub use stun::query_reflexive;
pub use transport::{connect_direct, Transport, TransportError, TransportKind};
