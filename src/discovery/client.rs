//! ACDS client: rendezvous, string reservation, signaling relay.
//!
//! One dedicated task owns the server connection; every logical producer
//! goes through a bounded command channel. Requests are answered in
//! order, pushes (signaling, participant lists, ring traffic) are fanned
//! out on a separate channel.

use super::strings;
use crate::codec::CodecError;
use crate::net::transport::{connect_direct, Transport, TransportError};
use crate::packet::{
    acds_error, AcdsCreateSessionMsg, AcdsErrorMsg, AcdsJoinMsg, AcdsJoinedMsg, AcdsKeepaliveMsg,
    AcdsLeaveMsg, AcdsLookupMsg, AcdsSessionCreatedMsg, AcdsSessionInfoMsg, CandidateAddr,
    DiscoveryPingMsg, Packet, SignalRelayMsg, StringReserveMsg,
};
use crate::types::{NatTier, ParticipantId};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Ping cadence on the discovery link; three misses force a re-resolve.
pub const ACDS_PING_INTERVAL: Duration = Duration::from_secs(25);
pub const ACDS_MAX_MISSED_PINGS: u32 = 3;

/// One request may wait this long before the link is declared dead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session string already reserved")]
    StringConflict,

    #[error("discovery server unavailable: {0}")]
    AcdsUnavailable(String),

    #[error("discovery server identity mismatch")]
    ServerIdentity,

    #[error("malformed discovery traffic: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

fn server_err(msg: &AcdsErrorMsg) -> DiscoveryError {
    match msg.code {
        acds_error::SESSION_NOT_FOUND => DiscoveryError::SessionNotFound,
        acds_error::STRING_CONFLICT => DiscoveryError::StringConflict,
        _ => DiscoveryError::Server {
            code: msg.code,
            message: msg.message.clone(),
        },
    }
}

/// Packets the server may send unprompted.
fn is_push(packet_type: u16) -> bool {
    matches!(packet_type, 6020 | 6050 | 6060..=6066)
}

enum Command {
    Request {
        packet: Packet,
        reply: oneshot::Sender<Result<Packet, DiscoveryError>>,
    },
    Send(Packet),
}

/// Cloneable handle for the rest of the runtime.
#[derive(Clone)]
pub struct AcdsHandle {
    commands: mpsc::Sender<Command>,
}

impl AcdsHandle {
    async fn request(&self, packet: Packet) -> Result<Packet, DiscoveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                packet,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DiscoveryError::AcdsUnavailable("client task gone".into()))?;
        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DiscoveryError::AcdsUnavailable("client task gone".into())),
            Err(_) => Err(DiscoveryError::AcdsUnavailable("request timed out".into())),
        }
    }

    /// Fire-and-forget send (signaling, keepalive).
    pub async fn send(&self, packet: Packet) -> Result<(), DiscoveryError> {
        self.commands
            .send(Command::Send(packet))
            .await
            .map_err(|_| DiscoveryError::AcdsUnavailable("client task gone".into()))
    }

    pub async fn create_session(
        &self,
        host_pubkey: [u8; 32],
        preferred_string: Option<String>,
        candidates: Vec<CandidateAddr>,
    ) -> Result<AcdsSessionCreatedMsg, DiscoveryError> {
        if let Some(s) = &preferred_string {
            if !strings::is_valid(s) {
                return Err(DiscoveryError::Protocol(format!("invalid session string {s}")));
            }
        }
        let reply = self
            .request(Packet::AcdsCreateSession(AcdsCreateSessionMsg {
                host_pubkey,
                preferred_string,
                candidates,
            }))
            .await?;
        match reply {
            Packet::AcdsSessionCreated(msg) => Ok(msg),
            Packet::AcdsError(e) => Err(server_err(&e)),
            other => Err(DiscoveryError::Protocol(format!("unexpected reply {}", other.packet_type()))),
        }
    }

    pub async fn lookup(&self, session_string: &str) -> Result<AcdsSessionInfoMsg, DiscoveryError> {
        if !strings::is_valid(session_string) {
            return Err(DiscoveryError::Protocol(format!(
                "invalid session string {session_string}"
            )));
        }
        let reply = self
            .request(Packet::AcdsLookup(AcdsLookupMsg {
                session_string: session_string.to_string(),
            }))
            .await?;
        match reply {
            Packet::AcdsSessionInfo(msg) => Ok(msg),
            Packet::AcdsError(e) => Err(server_err(&e)),
            other => Err(DiscoveryError::Protocol(format!("unexpected reply {}", other.packet_type()))),
        }
    }

    pub async fn join(
        &self,
        session_id: [u8; 16],
        participant_id: ParticipantId,
        nat_tier: NatTier,
        candidates: Vec<CandidateAddr>,
    ) -> Result<AcdsJoinedMsg, DiscoveryError> {
        let reply = self
            .request(Packet::AcdsJoin(AcdsJoinMsg {
                session_id,
                participant_id,
                nat_tier,
                candidates,
            }))
            .await?;
        match reply {
            Packet::AcdsJoined(msg) => Ok(msg),
            Packet::AcdsError(e) => Err(server_err(&e)),
            other => Err(DiscoveryError::Protocol(format!("unexpected reply {}", other.packet_type()))),
        }
    }

    pub async fn leave(&self, session_id: [u8; 16], participant_id: ParticipantId) -> Result<(), DiscoveryError> {
        self.send(Packet::AcdsLeave(AcdsLeaveMsg {
            session_id,
            participant_id,
        }))
        .await
    }

    pub async fn keepalive(&self, session_id: [u8; 16], participant_id: ParticipantId) -> Result<(), DiscoveryError> {
        self.send(Packet::AcdsKeepalive(AcdsKeepaliveMsg {
            session_id,
            participant_id,
        }))
        .await
    }

    pub async fn reserve_string(&self, session_string: &str) -> Result<u32, DiscoveryError> {
        if !strings::is_valid(session_string) {
            return Err(DiscoveryError::Protocol(format!(
                "invalid session string {session_string}"
            )));
        }
        let reply = self
            .request(Packet::StringReserve(StringReserveMsg {
                session_string: session_string.to_string(),
            }))
            .await?;
        match reply {
            Packet::StringReserved(msg) => Ok(msg.ttl_secs),
            Packet::AcdsError(e) => Err(server_err(&e)),
            other => Err(DiscoveryError::Protocol(format!("unexpected reply {}", other.packet_type()))),
        }
    }

    pub async fn renew_string(&self, session_string: &str) -> Result<u32, DiscoveryError> {
        let reply = self
            .request(Packet::StringRenew(StringReserveMsg {
                session_string: session_string.to_string(),
            }))
            .await?;
        match reply {
            Packet::StringReserved(msg) => Ok(msg.ttl_secs),
            Packet::AcdsError(e) => Err(server_err(&e)),
            other => Err(DiscoveryError::Protocol(format!("unexpected reply {}", other.packet_type()))),
        }
    }

    pub async fn release_string(&self, session_string: &str) -> Result<(), DiscoveryError> {
        self.send(Packet::StringRelease(StringReserveMsg {
            session_string: session_string.to_string(),
        }))
        .await
    }

    /// Relay an opaque signaling blob to another participant.
    pub async fn signal(
        &self,
        session_id: [u8; 16],
        from: ParticipantId,
        to: ParticipantId,
        payload: Vec<u8>,
    ) -> Result<(), DiscoveryError> {
        self.send(Packet::SignalRelay(SignalRelayMsg {
            session_id,
            from,
            to,
            payload,
        }))
        .await
    }

    /// Challenge the server to prove the identity published out of band.
    pub async fn verify_server_identity(&self, expected_pubkey: &[u8; 32]) -> Result<(), DiscoveryError> {
        let nonce: u64 = rand::random();
        let reply = self
            .request(Packet::DiscoveryPing(DiscoveryPingMsg {
                nonce,
                signature: None,
            }))
            .await?;
        let Packet::DiscoveryPing(pong) = reply else {
            return Err(DiscoveryError::ServerIdentity);
        };
        if pong.nonce != nonce {
            return Err(DiscoveryError::ServerIdentity);
        }
        let Some(signature) = pong.signature else {
            return Err(DiscoveryError::ServerIdentity);
        };
        let key = VerifyingKey::from_bytes(expected_pubkey).map_err(|_| DiscoveryError::ServerIdentity)?;
        let sig_bytes: [u8; 64] = signature
            .as_slice()
            .try_into()
            .map_err(|_| DiscoveryError::ServerIdentity)?;
        key.verify(&nonce.to_be_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| DiscoveryError::ServerIdentity)
    }
}

/// Fetch the discovery server's published identity key over HTTPS.
/// This is the trust bootstrap: the web PKI vouches for the key once,
/// then every discovery session challenges against it.
pub async fn fetch_server_pubkey(url: &str) -> Result<[u8; 32], DiscoveryError> {
    let body = reqwest::get(url)
        .await
        .map_err(|e| DiscoveryError::AcdsUnavailable(e.to_string()))?
        .error_for_status()
        .map_err(|e| DiscoveryError::AcdsUnavailable(e.to_string()))?
        .text()
        .await
        .map_err(|e| DiscoveryError::AcdsUnavailable(e.to_string()))?;
    let hex_key = body.trim();
    let bytes = hex::decode(hex_key).map_err(|e| DiscoveryError::Protocol(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| DiscoveryError::Protocol("server key must be 32 bytes".into()))
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pushes delivered to the session layer.
pub type PushReceiver = mpsc::Receiver<Packet>;

/// Connect to ACDS and spawn the connection task.
pub async fn connect(
    server: SocketAddr,
    connect_budget: Duration,
) -> Result<(AcdsHandle, PushReceiver, tokio::task::JoinHandle<Result<(), DiscoveryError>>), DiscoveryError> {
    let transport = connect_direct(server, connect_budget).await?;
    Ok(spawn_client(transport))
}

/// Spawn the client task over an established transport (tests inject
/// in-memory duplex transports here).
pub fn spawn_client(
    transport: Transport,
) -> (AcdsHandle, PushReceiver, tokio::task::JoinHandle<Result<(), DiscoveryError>>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (push_tx, push_rx) = mpsc::channel(64);
    let task = tokio::spawn(client_task(transport, command_rx, push_tx));
    (AcdsHandle { commands: command_tx }, push_rx, task)
}

async fn client_task(
    transport: Transport,
    mut commands: mpsc::Receiver<Command>,
    pushes: mpsc::Sender<Packet>,
) -> Result<(), DiscoveryError> {
    let (mut reader, mut writer) = transport.split();

    // Reads run in their own task so a select! drop can never abandon a
    // half-read frame and desync the stream.
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
    let _abort = AbortOnDrop(reader_task);
    // Each pending slot records whether it expects a ping reply, so
    // keepalive pongs are never mistaken for a request's answer.
    let mut pending: VecDeque<(bool, oneshot::Sender<Result<Packet, DiscoveryError>>)> = VecDeque::new();
    let mut missed_pings: u32 = 0;
    let mut ping_outstanding = false;

    let mut ping_timer = tokio::time::interval(ACDS_PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Request { packet, reply }) => {
                        let expects_pong = matches!(packet, Packet::DiscoveryPing(_));
                        let wire = packet.encode(0)?;
                        writer.write_bytes(&wire).await?;
                        pending.push_back((expects_pong, reply));
                    }
                    Some(Command::Send(packet)) => {
                        let wire = packet.encode(0)?;
                        writer.write_bytes(&wire).await?;
                    }
                    None => return Ok(()),
                }
            }
            raw = raw_rx.recv() => {
                let raw = raw.ok_or_else(|| DiscoveryError::AcdsUnavailable("link closed".into()))??;
                let packet = Packet::decode(&raw)?;
                let packet_type = packet.packet_type();

                if matches!(packet, Packet::DiscoveryPing(_)) {
                    let front_expects_pong = pending.front().map(|(p, _)| *p).unwrap_or(false);
                    if !front_expects_pong {
                        // Keepalive pong outside a request cycle.
                        ping_outstanding = false;
                        missed_pings = 0;
                        continue;
                    }
                }

                if is_push(packet_type) {
                    // An owner that stopped listening for pushes still
                    // keeps the link alive for requests and keepalive.
                    if pushes.send(packet).await.is_err() {
                        debug!("push receiver gone; dropping {packet_type}");
                    }
                    continue;
                }

                match pending.pop_front() {
                    Some((_, reply)) => {
                        let _ = reply.send(Ok(packet));
                    }
                    None => {
                        debug!("unsolicited discovery packet {packet_type}, dropping");
                    }
                }
            }
            _ = ping_timer.tick() => {
                if ping_outstanding {
                    missed_pings += 1;
                    if missed_pings >= ACDS_MAX_MISSED_PINGS {
                        warn!("discovery server missed {missed_pings} pings; re-resolving");
                        return Err(DiscoveryError::AcdsUnavailable("keepalive lost".into()));
                    }
                }
                ping_outstanding = true;
                let ping = Packet::DiscoveryPing(DiscoveryPingMsg {
                    nonce: rand::random(),
                    signature: None,
                });
                writer.write_bytes(&ping.encode(0)?).await?;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_PAYLOAD_SIZE;
    use crate::net::transport::TransportKind;

    /// A scripted in-memory server side.
    async fn serve_one(
        stream: tokio::io::DuplexStream,
        respond: impl Fn(Packet) -> Option<Packet> + Send + 'static,
    ) {
        let mut transport = Transport::from_duplex(
            stream,
            TransportKind::DirectTcp,
            "127.0.0.1:1".parse().unwrap(),
        );
        while let Ok(raw) = transport.read_packet().await {
            let packet = Packet::decode(&raw).unwrap();
            if let Some(reply) = respond(packet) {
                let wire = reply.encode(0).unwrap();
                let raw = crate::codec::decode_packet(&wire, MAX_PAYLOAD_SIZE).unwrap();
                transport
                    .write_packet(raw.packet_type, &raw.payload, 0)
                    .await
                    .unwrap();
            }
        }
    }

    fn client_pair(
        respond: impl Fn(Packet) -> Option<Packet> + Send + 'static,
    ) -> (AcdsHandle, PushReceiver) {
        let (a, b) = tokio::io::duplex(1 << 16);
        tokio::spawn(serve_one(b, respond));
        let transport =
            Transport::from_duplex(a, TransportKind::DirectTcp, "127.0.0.1:1".parse().unwrap());
        let (handle, pushes, _task) = spawn_client(transport);
        (handle, pushes)
    }

    #[tokio::test]
    async fn lookup_roundtrip() {
        let (handle, _pushes) = client_pair(|packet| match packet {
            Packet::AcdsLookup(msg) => {
                assert_eq!(msg.session_string, "quick-silver-fox");
                Some(Packet::AcdsSessionInfo(AcdsSessionInfoMsg {
                    session_id: [4u8; 16],
                    host_pubkey: [5u8; 32],
                    candidates: vec![],
                    participant_count: 2,
                }))
            }
            _ => None,
        });

        let info = handle.lookup("quick-silver-fox").await.unwrap();
        assert_eq!(info.session_id, [4u8; 16]);
        assert_eq!(info.participant_count, 2);
    }

    #[tokio::test]
    async fn not_found_maps_to_typed_error() {
        let (handle, _pushes) = client_pair(|packet| match packet {
            Packet::AcdsLookup(_) => Some(Packet::AcdsError(AcdsErrorMsg {
                code: acds_error::SESSION_NOT_FOUND,
                message: "no such session".into(),
            })),
            _ => None,
        });

        assert!(matches!(
            handle.lookup("quick-silver-fox").await,
            Err(DiscoveryError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn invalid_string_rejected_client_side() {
        let (handle, _pushes) = client_pair(|_| None);
        assert!(matches!(
            handle.lookup("Bad-String").await,
            Err(DiscoveryError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn reserve_string_roundtrip() {
        let (handle, mut pushes) = client_pair(|packet| match packet {
            Packet::StringReserve(msg) => Some(Packet::StringReserved(crate::packet::StringReservedMsg {
                session_string: msg.session_string,
                ttl_secs: 300,
            })),
            _ => None,
        });

        let ttl = handle.reserve_string("quick-silver-fox").await.unwrap();
        assert_eq!(ttl, 300);
        assert!(pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn pushes_are_fanned_out() {
        // The server answers a keepalive with a signaling push first.
        let (handle, mut pushes) = client_pair(|packet| match packet {
            Packet::AcdsKeepalive(msg) => Some(Packet::SignalRelay(SignalRelayMsg {
                session_id: msg.session_id,
                from: ParticipantId([9u8; 16]),
                to: msg.participant_id,
                payload: b"offer".to_vec(),
            })),
            _ => None,
        });

        handle.keepalive([1u8; 16], ParticipantId([2u8; 16])).await.unwrap();
        let push = pushes.recv().await.unwrap();
        match push {
            Packet::SignalRelay(msg) => assert_eq!(msg.payload, b"offer"),
            other => panic!("expected signaling push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_identity_challenge() {
        let identity = std::sync::Arc::new(crate::crypto::Identity::generate());
        let pubkey = identity.public_bytes();
        let signer = identity.clone();
        let (handle, _pushes) = client_pair(move |packet| match packet {
            Packet::DiscoveryPing(ping) => Some(Packet::DiscoveryPing(DiscoveryPingMsg {
                nonce: ping.nonce,
                signature: Some(signer.sign(&ping.nonce.to_be_bytes()).unwrap().to_vec()),
            })),
            _ => None,
        });

        handle.verify_server_identity(&pubkey).await.unwrap();
        let other = crate::crypto::Identity::generate().public_bytes();
        assert!(matches!(
            handle.verify_server_identity(&other).await,
            Err(DiscoveryError::ServerIdentity)
        ));
    }
}
