//! Per-connection session lifecycle.
//!
//! ```text
//! State Transitions:
//!
//! ┌─────────┐      ┌──────────────┐      ┌─────────────┐      ┌──────┐
//! │ Version │─────►│ CapsExchange │─────►│ KeyExchange │─────►│ Auth │
//! └─────────┘      └──────────────┘      └──────┬──────┘      └──┬───┘
//!                                               │                │
//!                            1109 (both allow)  │                ▼
//!                                               │           ┌────────┐
//!                                               └──────────►│ Active │◄──┐
//!                                                           └───┬────┘   │
//!                                                 rekey trigger │        │ REKEY_COMPLETE
//!                                                               ▼        │
//!                                                         ┌──────────┐   │
//!                                                         │ Rekeying │───┘
//!                                                         └──────────┘
//!
//! Any state ── violation / crypto failure / keepalive loss ──► Closed
//! ```
//!
//! The state machine is sans-I/O: packets in, packets out, a `tick` for
//! the clock. `run_connection` drives it over a transport. Keys are
//! zeroized on every exit path because `SessionCrypto` wipes on drop.

use crate::codec::{CodecError, RawPacket};
use crate::crypto::{
    CryptoError, Handshake, HandshakeConfig, HandshakeRole, KnownHosts, PinVerdict, SessionCrypto,
    SessionKeys,
};
use crate::net::transport::{Transport, TransportError, TransportWriter};
use crate::packet::{
    CipherSuite, EncryptedEnvelope, Packet, PacketType, PingMsg, PongMsg, ProtocolVersionMsg,
    RekeyMsg, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::policy::Policy;
use crate::types::ClientId;
use rand::rngs::OsRng;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Keepalive cadence and tolerance: a ping every 5 s, dead after three
/// unanswered.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_MISSED_PONGS: u32 = 3;

/// A handshake that hasn't finished by now is not going to.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("peer stopped answering keepalives")]
    KeepaliveTimeout,

    #[error("incompatible protocol version: ours {ours}, peer {theirs} (min {their_min})")]
    VersionMismatch { ours: u16, theirs: u16, their_min: u16 },

    #[error("connection closed")]
    Closed,
}

/// Lifecycle states, in handshake order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Version,
    CapsExchange,
    KeyExchange,
    Auth,
    Active,
    Rekeying,
    Closed,
}

/// What the connection surfaces to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake finished; the session is usable.
    Established { peer_identity: Option<[u8; 32]> },
    /// An application packet arrived.
    App(Packet),
    /// The peer piggybacked its failover address on a keepalive.
    BackupAddr(SocketAddr),
    /// Orderly or error teardown.
    Closed,
}

/// One turn's output: packets to encode normally, packets already sealed
/// to wire bytes (used when the seal must happen under superseded keys),
/// and events for the owner.
#[derive(Debug, Default)]
pub struct Step {
    pub send: Vec<Packet>,
    pub send_wire: Vec<Vec<u8>>,
    pub events: Vec<SessionEvent>,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }

    fn send(send: Vec<Packet>) -> Self {
        Self {
            send,
            ..Self::default()
        }
    }
}

/// Everything a connection needs at construction.
pub struct ConnectionConfig {
    pub policy: Policy,
    pub handshake: HandshakeConfig,
    /// Shared pin store; `None` only for the discovery server's
    /// unauthenticated links.
    pub known_hosts: Option<Arc<RwLock<KnownHosts>>>,
    /// Endpoint string used as the known-hosts key, e.g. `host:port`.
    pub endpoint: String,
    pub local_id: ClientId,
}

pub struct Connection {
    role: HandshakeRole,
    state: SessionState,
    config: ConnectionConfig,

    handshake: Option<Handshake>,
    crypto: Option<SessionCrypto>,
    peer_identity: Option<[u8; 32]>,

    started_at: Instant,
    last_rx: Instant,
    last_ping_sent: Option<Instant>,
    outstanding_ping: Option<u64>,
    missed_pongs: u32,

    last_rekey_at: Instant,
    rekey_ephemeral: Option<EphemeralSecret>,

    /// Failover address piggybacked on our keepalives while we host.
    backup_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn new(role: HandshakeRole, config: ConnectionConfig, now: Instant) -> Self {
        let handshake = Handshake::new(role, config.handshake.clone());
        Self {
            role,
            state: SessionState::Version,
            config,
            handshake: Some(handshake),
            crypto: None,
            peer_identity: None,
            started_at: now,
            last_rx: now,
            last_ping_sent: None,
            outstanding_ping: None,
            missed_pongs: 0,
            last_rekey_at: now,
            rekey_ephemeral: None,
            backup_addr: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_identity(&self) -> Option<[u8; 32]> {
        self.peer_identity
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Rekeying)
    }

    /// Set the failover address advertised on keepalives (host role).
    pub fn set_backup_addr(&mut self, addr: Option<SocketAddr>) {
        self.backup_addr = addr;
    }

    /// Opening move. The client leads with the version probe.
    pub fn start(&mut self) -> Result<Step, SessionError> {
        match self.role {
            HandshakeRole::Client => Ok(Step::send(vec![Packet::ProtocolVersion(ProtocolVersionMsg {
                version: PROTOCOL_VERSION,
                min_supported: MIN_PROTOCOL_VERSION,
            })])),
            HandshakeRole::Server => Ok(Step::none()),
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Feed one decoded packet through the state machine.
    pub fn on_packet(&mut self, packet: &Packet, source_id: u32, now: Instant) -> Result<Step, SessionError> {
        self.last_rx = now;
        let packet_type = packet.packet_type();

        if matches!(self.state, SessionState::Closed) {
            return Err(SessionError::Closed);
        }

        if !self.is_active() {
            if !PacketType::allowed_pre_session(packet_type) {
                return Err(SessionError::ProtocolViolation(
                    "application packet before handshake completed",
                ));
            }
            return self.on_handshake_packet(packet, now);
        }

        match packet {
            Packet::PacketEncrypted(envelope) => {
                let crypto = self
                    .crypto
                    .as_mut()
                    .ok_or(SessionError::ProtocolViolation("envelope without session keys"))?;
                let (inner_type, body) = crypto.open(envelope.counter, &envelope.ciphertext, source_id)?;
                let raw = RawPacket {
                    packet_type: inner_type,
                    payload: body,
                    source_id,
                };
                let inner = Packet::decode(&raw)?;
                self.on_session_packet(&inner, true, now)
            }
            _ => self.on_session_packet(packet, false, now),
        }
    }

    fn on_handshake_packet(&mut self, packet: &Packet, now: Instant) -> Result<Step, SessionError> {
        // Version probe is its own mini-exchange before the crypto layer.
        if let Packet::ProtocolVersion(version) = packet {
            return self.on_version(version);
        }
        if matches!(self.state, SessionState::Version) {
            return Err(SessionError::ProtocolViolation("expected version probe first"));
        }

        self.state = match packet.packet_type() {
            1000 | 1100 | 1101 => SessionState::CapsExchange,
            1102 | 1103 => SessionState::KeyExchange,
            _ => SessionState::Auth,
        };

        let handshake = self
            .handshake
            .as_mut()
            .ok_or(SessionError::ProtocolViolation("handshake already finished"))?;
        let step = handshake.step(packet)?;

        let mut out = Step::send(step.send);
        if let Some(outcome) = step.outcome {
            self.verify_pin(&outcome.peer_identity)?;
            self.peer_identity = outcome.peer_identity;
            self.crypto = match outcome.suite {
                CipherSuite::Null => None,
                CipherSuite::XSalsa20Poly1305 => Some(SessionCrypto::new(
                    outcome.keys,
                    outcome.suite,
                    self.config.policy.effective_replay_window(),
                )),
            };
            self.handshake = None;
            self.state = SessionState::Active;
            self.last_rekey_at = now;
            info!(
                "Session established with {} ({:?}, {:?})",
                self.config.endpoint, outcome.suite, outcome.auth_mode
            );
            out.events.push(SessionEvent::Established {
                peer_identity: self.peer_identity,
            });
        }
        Ok(out)
    }

    fn on_version(&mut self, version: &ProtocolVersionMsg) -> Result<Step, SessionError> {
        if !matches!(self.state, SessionState::Version) {
            return Err(SessionError::ProtocolViolation("duplicate version probe"));
        }
        if version.min_supported > PROTOCOL_VERSION || version.version < MIN_PROTOCOL_VERSION {
            return Err(SessionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: version.version,
                their_min: version.min_supported,
            });
        }

        self.state = SessionState::CapsExchange;
        match self.role {
            HandshakeRole::Server => {
                // Answer the probe; the client's hello follows.
                Ok(Step::send(vec![Packet::ProtocolVersion(ProtocolVersionMsg {
                    version: PROTOCOL_VERSION,
                    min_supported: MIN_PROTOCOL_VERSION,
                })]))
            }
            HandshakeRole::Client => {
                let handshake = self
                    .handshake
                    .as_mut()
                    .ok_or(SessionError::ProtocolViolation("handshake already finished"))?;
                Ok(Step::send(handshake.initiate()?))
            }
        }
    }

    fn verify_pin(&mut self, peer_identity: &Option<[u8; 32]>) -> Result<(), SessionError> {
        // Only the dialing side has a meaningful endpoint to pin against;
        // inbound peers connect from ephemeral ports.
        if !matches!(self.role, HandshakeRole::Client) {
            return Ok(());
        }
        let Some(store) = self.config.known_hosts.clone() else {
            return Ok(());
        };
        let Some(pubkey) = peer_identity else {
            if self.config.policy.require_pinning {
                return Err(CryptoError::PolicyRequiresPinning.into());
            }
            return Ok(());
        };

        if self.config.policy.insecure_skip_tofu {
            warn!(
                "Identity check for {} SKIPPED by insecure override",
                self.config.endpoint
            );
            return Ok(());
        }

        let mut store = store.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let verdict = store.verify(&self.config.endpoint, pubkey)?;
        match verdict {
            PinVerdict::Match => Ok(()),
            PinVerdict::PinnedFirstUse => {
                if self.config.policy.require_pinning {
                    Err(CryptoError::PolicyRequiresPinning.into())
                } else {
                    Ok(())
                }
            }
            PinVerdict::Mismatch => {
                let pinned = store.lookup(&self.config.endpoint).unwrap_or_default();
                KnownHosts::mitm_banner(&self.config.endpoint, &pinned, pubkey);
                Err(CryptoError::PeerKeyChanged {
                    endpoint: self.config.endpoint.clone(),
                    pinned: crate::crypto::fingerprint(&pinned),
                    received: crate::crypto::fingerprint(pubkey),
                }
                .into())
            }
        }
    }

    fn on_session_packet(&mut self, packet: &Packet, decrypted: bool, now: Instant) -> Result<Step, SessionError> {
        let packet_type = packet.packet_type();
        if !decrypted && PacketType::must_be_encrypted(packet_type) && self.crypto.is_some() {
            return Err(SessionError::ProtocolViolation(
                "cleartext packet on an encrypted session",
            ));
        }
        if PacketType::allowed_pre_session(packet_type) {
            return Err(SessionError::ProtocolViolation("handshake packet after session start"));
        }

        match packet {
            Packet::Ping(ping) => {
                let mut step = Step::send(vec![Packet::Pong(PongMsg { nonce: ping.nonce })]);
                if let Some(addr) = ping.backup_addr {
                    step.events.push(SessionEvent::BackupAddr(addr));
                }
                Ok(step)
            }
            Packet::Pong(pong) => {
                if self.outstanding_ping == Some(pong.nonce) {
                    self.outstanding_ping = None;
                    self.missed_pongs = 0;
                }
                Ok(Step::none())
            }
            Packet::ClientLeave => {
                debug!("Peer {} left the session", self.config.endpoint);
                self.close();
                Ok(Step {
                    events: vec![SessionEvent::Closed],
                    ..Step::default()
                })
            }
            Packet::CryptoRekeyRequest(msg) => self.on_rekey_request(msg, now),
            Packet::CryptoRekeyResponse(msg) => self.on_rekey_response(msg, now),
            Packet::CryptoRekeyComplete => {
                // Arrival under the new keys is itself the confirmation;
                // SessionCrypto already retired the old set to open it.
                self.state = SessionState::Active;
                Ok(Step::none())
            }
            other => {
                let mut step = Step::none();
                step.events.push(SessionEvent::App(other.clone()));
                Ok(step)
            }
        }
    }

    // =========================================================================
    // REKEY
    // =========================================================================

    /// Begin a rekey as initiator. No-op when one is already running.
    pub fn begin_rekey(&mut self) -> Result<Step, SessionError> {
        if !matches!(self.state, SessionState::Active) || self.crypto.is_none() {
            return Ok(Step::none());
        }
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let pubkey = PublicKey::from(&ephemeral);
        self.rekey_ephemeral = Some(ephemeral);
        self.state = SessionState::Rekeying;
        debug!("Initiating rekey with {}", self.config.endpoint);
        Ok(Step::send(vec![Packet::CryptoRekeyRequest(RekeyMsg {
            x25519_pubkey: *pubkey.as_bytes(),
        })]))
    }

    fn on_rekey_request(&mut self, msg: &RekeyMsg, now: Instant) -> Result<Step, SessionError> {
        if matches!(self.state, SessionState::Rekeying) {
            match self.role {
                // Both sides initiated at once; the client's attempt wins
                // and the server folds into the responder role.
                HandshakeRole::Server => {
                    self.rekey_ephemeral = None;
                }
                HandshakeRole::Client => return Ok(Step::none()),
            }
        }

        let crypto = self
            .crypto
            .as_mut()
            .ok_or(SessionError::ProtocolViolation("rekey without session keys"))?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let our_pubkey = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(msg.x25519_pubkey));

        // The response must stay readable for a peer that still holds only
        // the old keys, so it is sealed before the new set is installed.
        let response = Packet::CryptoRekeyResponse(RekeyMsg {
            x25519_pubkey: *our_pubkey.as_bytes(),
        });
        let body = response.encode_body()?;
        let (counter, ciphertext) = crypto.seal(response.packet_type(), &body, self.config.local_id)?;
        let envelope = Packet::PacketEncrypted(EncryptedEnvelope { counter, ciphertext });
        let wire = envelope.encode(self.config.local_id)?;

        let is_client = matches!(self.role, HandshakeRole::Client);
        let keys = SessionKeys::derive(shared.as_bytes(), *crypto.session_id(), is_client);
        crypto.install_rekeyed(keys);
        self.state = SessionState::Rekeying;
        self.last_rekey_at = now;

        Ok(Step {
            send_wire: vec![wire],
            ..Step::default()
        })
    }

    fn on_rekey_response(&mut self, msg: &RekeyMsg, now: Instant) -> Result<Step, SessionError> {
        let ephemeral = self
            .rekey_ephemeral
            .take()
            .ok_or(SessionError::ProtocolViolation("unsolicited rekey response"))?;
        let crypto = self
            .crypto
            .as_mut()
            .ok_or(SessionError::ProtocolViolation("rekey without session keys"))?;

        let shared = ephemeral.diffie_hellman(&PublicKey::from(msg.x25519_pubkey));
        let is_client = matches!(self.role, HandshakeRole::Client);
        let keys = SessionKeys::derive(shared.as_bytes(), *crypto.session_id(), is_client);
        crypto.install_rekeyed(keys);
        self.state = SessionState::Active;
        self.last_rekey_at = now;

        // Sealed under the new keys by the normal encode path.
        Ok(Step::send(vec![Packet::CryptoRekeyComplete]))
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    /// Periodic work: handshake deadline, keepalive, rekey triggers.
    pub fn tick(&mut self, now: Instant) -> Result<Step, SessionError> {
        if matches!(self.state, SessionState::Closed) {
            return Err(SessionError::Closed);
        }

        if !self.is_active() {
            if now.duration_since(self.started_at) > HANDSHAKE_TIMEOUT {
                return Err(CryptoError::Timeout.into());
            }
            return Ok(Step::none());
        }

        let mut step = Step::none();

        // Keepalive
        let due = self
            .last_ping_sent
            .map(|at| now.duration_since(at) >= KEEPALIVE_INTERVAL)
            .unwrap_or(true);
        if due {
            if self.outstanding_ping.is_some() {
                self.missed_pongs += 1;
                if self.missed_pongs >= MAX_MISSED_PONGS {
                    self.close();
                    return Err(SessionError::KeepaliveTimeout);
                }
            }
            let nonce = rand::random();
            self.outstanding_ping = Some(nonce);
            self.last_ping_sent = Some(now);
            step.send.push(Packet::Ping(PingMsg {
                nonce,
                backup_addr: self.backup_addr,
            }));
        }

        // Rekey policy
        if matches!(self.state, SessionState::Active) {
            if let Some(crypto) = &self.crypto {
                let overdue_bytes = crypto.bytes_since_rekey >= self.config.policy.rekey_bytes;
                let overdue_time = now.duration_since(self.last_rekey_at)
                    >= Duration::from_secs(self.config.policy.rekey_seconds as u64);
                if overdue_bytes || overdue_time || crypto.counter_near_exhaustion() {
                    let rekey = self.begin_rekey()?;
                    step.send.extend(rekey.send);
                }
            }
        }

        Ok(step)
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Encode a packet for the wire, sealing it when the session requires.
    pub fn encode_outgoing(&mut self, packet: &Packet) -> Result<Vec<u8>, SessionError> {
        let packet_type = packet.packet_type();
        let needs_seal = self.crypto.is_some() && PacketType::must_be_encrypted(packet_type);
        if !needs_seal {
            return Ok(packet.encode(self.config.local_id)?);
        }
        let crypto = self
            .crypto
            .as_mut()
            .ok_or(SessionError::ProtocolViolation("no session keys"))?;
        let body = packet.encode_body()?;
        let (counter, ciphertext) = crypto.seal(packet_type, &body, self.config.local_id)?;
        let envelope = Packet::PacketEncrypted(EncryptedEnvelope { counter, ciphertext });
        Ok(envelope.encode(self.config.local_id)?)
    }

    /// Best-effort leave notice for orderly teardown.
    pub fn leave(&mut self) -> Result<Vec<u8>, SessionError> {
        let wire = self.encode_outgoing(&Packet::ClientLeave);
        self.close();
        wire
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        // Dropping the crypto state zeroizes every key it holds.
        self.crypto = None;
        self.handshake = None;
        self.rekey_ephemeral = None;
    }
}

// =============================================================================
// ASYNC DRIVER
// =============================================================================

/// Drive a connection over its transport: one reader loop, one timer, one
/// outbound queue. Returns when the session ends either way.
pub async fn run_connection(
    mut conn: Connection,
    transport: Transport,
    mut outbound: mpsc::Receiver<Packet>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    let (mut reader, mut writer) = transport.split();

    // A dedicated reader task keeps packet reads atomic: select! may drop
    // a branch mid-poll, and a half-finished read_exact would desync the
    // stream. Channel receives are drop-safe.
    let (raw_tx, mut raw_rx) = mpsc::channel::<Result<crate::codec::RawPacket, TransportError>>(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let result = reader.read_packet().await;
            let failed = result.is_err();
            if raw_tx.send(result).await.is_err() || failed {
                return;
            }
        }
    });
    // Reader task dies with the channel when this function returns.
    let _abort_reader = AbortOnDrop(reader_task);

    let start = conn.start()?;
    flush_step(&mut conn, start, &mut writer, &events).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let raw = raw.ok_or(SessionError::Closed)??;
                let packet = Packet::decode(&raw)?;
                let step = match conn.on_packet(&packet, raw.source_id, Instant::now()) {
                    Ok(step) => step,
                    Err(e) => {
                        let _ = events.send(SessionEvent::Closed).await;
                        return Err(e);
                    }
                };
                let closed = conn.state() == SessionState::Closed;
                flush_step(&mut conn, step, &mut writer, &events).await?;
                if closed {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                let step = match conn.tick(Instant::now()) {
                    Ok(step) => step,
                    Err(e) => {
                        let _ = events.send(SessionEvent::Closed).await;
                        return Err(e);
                    }
                };
                flush_step(&mut conn, step, &mut writer, &events).await?;
            }
            packet = outbound.recv() => {
                match packet {
                    Some(packet) => {
                        let wire = conn.encode_outgoing(&packet)?;
                        writer.write_bytes(&wire).await?;
                    }
                    None => {
                        // Owner hung up; leave politely.
                        if let Ok(wire) = conn.leave() {
                            let _ = writer.write_bytes(&wire).await;
                        }
                        let _ = events.send(SessionEvent::Closed).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn flush_step(
    conn: &mut Connection,
    step: Step,
    writer: &mut TransportWriter,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    for wire in step.send_wire {
        writer.write_bytes(&wire).await?;
    }
    for packet in step.send {
        let wire = conn.encode_outgoing(&packet)?;
        writer.write_bytes(&wire).await?;
    }
    for event in step.events {
        if events.send(event).await.is_err() {
            return Err(SessionError::Closed);
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
