//! Discovery: session strings, the ACDS client, and the ACDS server.

pub mod client;
pub mod server;
pub mod strings;

pub use client::{
    connect, fetch_server_pubkey, spawn_client, AcdsHandle, DiscoveryError, PushReceiver,
    ACDS_MAX_MISSED_PINGS, ACDS_PING_INTERVAL,
};
pub use server::{run_relay, AcdsServer, KEEPALIVE_GRACE, RESERVATION_TTL};
pub use strings::{generate as generate_session_string, is_valid as is_valid_session_string};
