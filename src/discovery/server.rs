//! The ACDS rendezvous server.
//!
//! Holds the only server-side state in the system: an ephemeral session
//! table. Sessions exist from `create` until their keepalives stop plus
//! a grace period; nothing is persisted. The server never sees media or
//! session keys, only discovery-range packets and connection metadata.

use super::strings;
use crate::net::relay;
use crate::packet::{
    acds_error, AcdsErrorMsg, AcdsJoinedMsg, AcdsSessionCreatedMsg, AcdsSessionInfoMsg,
    CandidateAddr, DiscoveryPingMsg, Packet, ParticipantListMsg, StringReservedMsg,
};
use crate::crypto::Identity;
use crate::net::transport::Transport;
use crate::types::{Participant, ParticipantId, SERVER_CLIENT_ID};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// A session with no keepalive for this long is swept.
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(90);

/// Soft reservation lifetime for session strings.
pub const RESERVATION_TTL: Duration = Duration::from_secs(300);

/// Sweep cadence for expired sessions and reservations.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound push queue per connected client.
const CLIENT_QUEUE: usize = 64;

struct ParticipantEntry {
    participant: Participant,
    push: mpsc::Sender<Packet>,
}

struct SessionRecord {
    session_string: String,
    session_id: [u8; 16],
    host_pubkey: [u8; 32],
    host_candidates: Vec<CandidateAddr>,
    participants: BTreeMap<ParticipantId, ParticipantEntry>,
    epoch: u64,
    last_keepalive: Instant,
}

impl SessionRecord {
    fn participant_list(&self) -> Packet {
        Packet::ParticipantList(ParticipantListMsg {
            session_id: self.session_id,
            epoch: self.epoch,
            ring: self
                .participants
                .values()
                .map(|e| e.participant.clone())
                .collect(),
        })
    }

    async fn broadcast(&self, packet: &Packet) {
        for entry in self.participants.values() {
            let _ = entry.push.send(packet.clone()).await;
        }
    }
}

#[derive(Default)]
struct Table {
    sessions: HashMap<[u8; 16], SessionRecord>,
    by_string: HashMap<String, [u8; 16]>,
    reservations: HashMap<String, Instant>,
}

impl Table {
    fn string_taken(&self, s: &str, now: Instant) -> bool {
        if self.by_string.contains_key(s) {
            return true;
        }
        self.reservations.get(s).is_some_and(|expires| *expires > now)
    }

    fn sweep(&mut self, now: Instant) {
        self.reservations.retain(|_, expires| *expires > now);
        let expired: Vec<[u8; 16]> = self
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_keepalive) > KEEPALIVE_GRACE)
            .map(|s| s.session_id)
            .collect();
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                info!("sweeping idle session {}", session.session_string);
                self.by_string.remove(&session.session_string);
            }
        }
    }
}

/// The discovery server: session table + listeners.
pub struct AcdsServer {
    identity: Option<Arc<Identity>>,
    table: Arc<Mutex<Table>>,
}

impl AcdsServer {
    pub fn new(identity: Option<Arc<Identity>>) -> Self {
        Self {
            identity,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Accept discovery clients on `listener` until the task is aborted.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let sweeper = self.table.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                timer.tick().await;
                sweeper.lock().await.sweep(Instant::now());
            }
        });

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_client(stream, peer).await {
                    debug!("discovery client {peer} ended: {e}");
                }
            });
        }
    }

    async fn serve_client(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        debug!("discovery client connected from {peer}");
        let transport = Transport::direct(stream)?;
        let (mut reader, mut writer) = transport.split();
        let (push_tx, mut push_rx) = mpsc::channel::<Packet>(CLIENT_QUEUE);

        // Dedicated reader task: select! drops must never abandon a
        // half-read frame.
        let (raw_tx, mut raw_rx) = mpsc::channel(CLIENT_QUEUE);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = reader.read_packet().await;
                let failed = result.is_err();
                if raw_tx.send(result).await.is_err() || failed {
                    return;
                }
            }
        });

        // Session memberships and reservations owned by this connection,
        // cleaned up when it goes away.
        let mut memberships: Vec<([u8; 16], ParticipantId)> = Vec::new();
        let mut owned_reservations: Vec<String> = Vec::new();

        let result = loop {
            tokio::select! {
                raw = raw_rx.recv() => {
                    let raw = match raw {
                        Some(Ok(raw)) => raw,
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    };
                    let packet = match Packet::decode(&raw) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("malformed packet from {peer}: {e}");
                            let reply = Packet::AcdsError(AcdsErrorMsg {
                                code: acds_error::MALFORMED,
                                message: e.to_string(),
                            });
                            if let Ok(wire) = reply.encode(SERVER_CLIENT_ID) {
                                let _ = writer.write_bytes(&wire).await;
                            }
                            continue;
                        }
                    };
                    let replies = self
                        .handle(packet, &push_tx, &mut memberships, &mut owned_reservations)
                        .await;
                    let mut write_failed = false;
                    for reply in replies {
                        match reply.encode(SERVER_CLIENT_ID) {
                            Ok(wire) => {
                                if writer.write_bytes(&wire).await.is_err() {
                                    write_failed = true;
                                    break;
                                }
                            }
                            Err(e) => warn!("failed to encode reply: {e}"),
                        }
                    }
                    if write_failed {
                        break Ok(());
                    }
                }
                push = push_rx.recv() => {
                    let Some(packet) = push else { break Ok(()) };
                    if let Ok(wire) = packet.encode(SERVER_CLIENT_ID) {
                        if writer.write_bytes(&wire).await.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
        };

        reader_task.abort();

        // Connection gone: drop memberships and reservations it owned.
        let mut table = self.table.lock().await;
        for (session_id, pid) in memberships {
            if let Some(session) = table.sessions.get_mut(&session_id) {
                if session.participants.remove(&pid).is_some() {
                    session.epoch += 1;
                    let list = session.participant_list();
                    session.broadcast(&list).await;
                }
            }
        }
        for s in owned_reservations {
            table.reservations.remove(&s);
        }

        result.map_err(|e| std::io::Error::other(e.to_string()))
    }

    async fn handle(
        &self,
        packet: Packet,
        push: &mpsc::Sender<Packet>,
        memberships: &mut Vec<([u8; 16], ParticipantId)>,
        owned_reservations: &mut Vec<String>,
    ) -> Vec<Packet> {
        let now = Instant::now();
        match packet {
            Packet::DiscoveryPing(ping) => {
                let signature = self.identity.as_ref().and_then(|id| {
                    match id.sign(&ping.nonce.to_be_bytes()) {
                        Ok(sig) => Some(sig.to_vec()),
                        Err(e) => {
                            warn!("cannot sign discovery ping: {e}");
                            None
                        }
                    }
                });
                vec![Packet::DiscoveryPing(DiscoveryPingMsg {
                    nonce: ping.nonce,
                    signature,
                })]
            }

            Packet::AcdsCreateSession(msg) => {
                let mut table = self.table.lock().await;
                let session_string = match msg.preferred_string {
                    Some(s) if strings::is_valid(&s) => {
                        let reserved_by_us = owned_reservations.contains(&s);
                        if table.string_taken(&s, now) && !reserved_by_us {
                            return vec![error(acds_error::STRING_CONFLICT, "string in use")];
                        }
                        s
                    }
                    Some(_) => return vec![error(acds_error::MALFORMED, "invalid session string")],
                    None => loop {
                        let s = strings::generate();
                        if !table.string_taken(&s, now) {
                            break s;
                        }
                    },
                };

                let mut session_id = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut session_id);
                info!("session {} created", session_string);
                table.by_string.insert(session_string.clone(), session_id);
                table.sessions.insert(
                    session_id,
                    SessionRecord {
                        session_string: session_string.clone(),
                        session_id,
                        host_pubkey: msg.host_pubkey,
                        host_candidates: msg.candidates,
                        participants: BTreeMap::new(),
                        epoch: 0,
                        last_keepalive: now,
                    },
                );
                vec![Packet::AcdsSessionCreated(AcdsSessionCreatedMsg {
                    session_string,
                    session_id,
                })]
            }

            Packet::AcdsLookup(msg) => {
                let table = self.table.lock().await;
                let Some(session) = table
                    .by_string
                    .get(&msg.session_string)
                    .and_then(|id| table.sessions.get(id))
                else {
                    return vec![error(acds_error::SESSION_NOT_FOUND, "no such session")];
                };
                vec![Packet::AcdsSessionInfo(AcdsSessionInfoMsg {
                    session_id: session.session_id,
                    host_pubkey: session.host_pubkey,
                    candidates: session.host_candidates.clone(),
                    participant_count: session.participants.len() as u32,
                })]
            }

            Packet::AcdsJoin(msg) => {
                let mut table = self.table.lock().await;
                let Some(session) = table.sessions.get_mut(&msg.session_id) else {
                    return vec![error(acds_error::SESSION_NOT_FOUND, "no such session")];
                };

                let mut participant = Participant::new(msg.participant_id, msg.nat_tier);
                participant.public_addr = msg.candidates.first().map(|c| c.addr);
                session.participants.insert(
                    msg.participant_id,
                    ParticipantEntry {
                        participant: participant.clone(),
                        push: push.clone(),
                    },
                );
                session.epoch += 1;
                session.last_keepalive = now;
                memberships.push((msg.session_id, msg.participant_id));

                let list = session.participant_list();
                session.broadcast(&list).await;

                vec![Packet::AcdsJoined(AcdsJoinedMsg {
                    participant,
                    ring: session.participants.keys().copied().collect(),
                })]
            }

            Packet::AcdsLeave(msg) => {
                let mut table = self.table.lock().await;
                if let Some(session) = table.sessions.get_mut(&msg.session_id) {
                    if session.participants.remove(&msg.participant_id).is_some() {
                        session.epoch += 1;
                        let list = session.participant_list();
                        session.broadcast(&list).await;
                    }
                }
                memberships.retain(|(sid, pid)| (*sid, *pid) != (msg.session_id, msg.participant_id));
                Vec::new()
            }

            Packet::AcdsKeepalive(msg) => {
                let mut table = self.table.lock().await;
                if let Some(session) = table.sessions.get_mut(&msg.session_id) {
                    session.last_keepalive = now;
                }
                Vec::new()
            }

            Packet::StringReserve(msg) | Packet::StringRenew(msg) => {
                if !strings::is_valid(&msg.session_string) {
                    return vec![error(acds_error::MALFORMED, "invalid session string")];
                }
                let mut table = self.table.lock().await;
                let renewing = owned_reservations.contains(&msg.session_string);
                if table.string_taken(&msg.session_string, now) && !renewing {
                    return vec![error(acds_error::STRING_CONFLICT, "string in use")];
                }
                table
                    .reservations
                    .insert(msg.session_string.clone(), now + RESERVATION_TTL);
                if !renewing {
                    owned_reservations.push(msg.session_string.clone());
                }
                vec![Packet::StringReserved(StringReservedMsg {
                    session_string: msg.session_string,
                    ttl_secs: RESERVATION_TTL.as_secs() as u32,
                })]
            }

            Packet::StringRelease(msg) => {
                let mut table = self.table.lock().await;
                table.reservations.remove(&msg.session_string);
                owned_reservations.retain(|s| s != &msg.session_string);
                Vec::new()
            }

            Packet::SignalRelay(msg) => {
                // Opaque relay: forwarded verbatim, never inspected.
                let table = self.table.lock().await;
                let Some(session) = table.sessions.get(&msg.session_id) else {
                    return vec![error(acds_error::SESSION_NOT_FOUND, "no such session")];
                };
                match session.participants.get(&msg.to) {
                    Some(entry) => {
                        let _ = entry.push.send(Packet::SignalRelay(msg)).await;
                        Vec::new()
                    }
                    None => vec![error(acds_error::SESSION_NOT_FOUND, "no such participant")],
                }
            }

            other => {
                debug!("unhandled discovery packet {}", other.packet_type());
                vec![error(acds_error::MALFORMED, "unexpected packet type")]
            }
        }
    }
}

fn error(code: u16, message: &str) -> Packet {
    Packet::AcdsError(AcdsErrorMsg {
        code,
        message: message.to_string(),
    })
}

// =============================================================================
// RELAY LISTENER
// =============================================================================

/// Accept relay binds and splice paired streams. The first two distinct
/// participants binding with the same session id get spliced together.
pub async fn run_relay(listener: TcpListener) -> std::io::Result<()> {
    let waiting: Arc<Mutex<HashMap<[u8; 16], (relay::RelayBind, TcpStream)>>> =
        Arc::new(Mutex::new(HashMap::new()));

    loop {
        let (stream, peer) = listener.accept().await?;
        let waiting = waiting.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let Ok(Some(bind)) = relay::read_bind(&mut stream).await else {
                debug!("relay bind from {peer} malformed, dropping");
                return;
            };

            let other = {
                let mut waiting = waiting.lock().await;
                match waiting.remove(&bind.session_id) {
                    Some((held_bind, held_stream)) if held_bind.participant_id != bind.participant_id => {
                        Some(held_stream)
                    }
                    Some(entry) => {
                        // Same participant re-binding; keep the newer one.
                        drop(entry);
                        waiting.insert(bind.session_id, (bind, stream));
                        return;
                    }
                    None => {
                        waiting.insert(bind.session_id, (bind, stream));
                        return;
                    }
                }
            };

            let Some(mut a) = other else { return };
            let mut b = stream;
            use tokio::io::AsyncWriteExt;
            let ack = [relay::BIND_ACK_PAIRED];
            if a.write_all(&ack).await.is_err() || b.write_all(&ack).await.is_err() {
                return;
            }
            info!("relay pair established for session {}", hex::encode(bind.session_id));
            let _ = tokio::io::copy_bidirectional(&mut a, &mut b).await;
        });
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::client::{spawn_client, DiscoveryError};
    use crate::net::transport::connect_direct;
    use crate::types::NatTier;

    async fn start_server(identity: Option<Arc<Identity>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(AcdsServer::new(identity));
        tokio::spawn(server.run(listener));
        addr
    }

    async fn client(addr: SocketAddr) -> crate::discovery::client::AcdsHandle {
        let transport = connect_direct(addr, Duration::from_secs(2)).await.unwrap();
        let (handle, _pushes, _task) = spawn_client(transport);
        handle
    }

    #[tokio::test]
    async fn create_lookup_join_leave() {
        let addr = start_server(None).await;
        let host = client(addr).await;

        let created = host
            .create_session([7u8; 32], None, vec![])
            .await
            .unwrap();
        assert!(strings::is_valid(&created.session_string));

        let guest = client(addr).await;
        let info = guest.lookup(&created.session_string).await.unwrap();
        assert_eq!(info.session_id, created.session_id);
        assert_eq!(info.host_pubkey, [7u8; 32]);
        assert_eq!(info.participant_count, 0);

        let pid = ParticipantId([1u8; 16]);
        let joined = guest
            .join(created.session_id, pid, NatTier::PublicIp, vec![])
            .await
            .unwrap();
        assert_eq!(joined.ring, vec![pid]);

        let info = guest.lookup(&created.session_string).await.unwrap();
        assert_eq!(info.participant_count, 1);

        guest.leave(created.session_id, pid).await.unwrap();
        // Leave is fire-and-forget; poll until the table reflects it.
        for _ in 0..50 {
            let info = guest.lookup(&created.session_string).await.unwrap();
            if info.participant_count == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("leave was not applied");
    }

    #[tokio::test]
    async fn lookup_unknown_session_fails() {
        let addr = start_server(None).await;
        let handle = client(addr).await;
        assert!(matches!(
            handle.lookup("quick-silver-fox").await,
            Err(DiscoveryError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn string_reservation_conflicts() {
        let addr = start_server(None).await;
        let alice = client(addr).await;
        let bob = client(addr).await;

        let ttl = alice.reserve_string("amber-river-stone").await.unwrap();
        assert!(ttl > 0);
        // Renewal by the owner succeeds; a stranger conflicts.
        alice.renew_string("amber-river-stone").await.unwrap();
        assert!(matches!(
            bob.reserve_string("amber-river-stone").await,
            Err(DiscoveryError::StringConflict)
        ));

        // Owner can create the session under the reserved name.
        let created = alice
            .create_session([1u8; 32], Some("amber-river-stone".into()), vec![])
            .await
            .unwrap();
        assert_eq!(created.session_string, "amber-river-stone");
    }

    #[tokio::test]
    async fn signaling_relays_opaque_blobs() {
        let addr = start_server(None).await;
        let host = client(addr).await;
        let created = host.create_session([0u8; 32], None, vec![]).await.unwrap();

        // Two participants join on distinct connections.
        let a_transport = connect_direct(addr, Duration::from_secs(2)).await.unwrap();
        let (a, _a_pushes, _t1) = spawn_client(a_transport);
        let b_transport = connect_direct(addr, Duration::from_secs(2)).await.unwrap();
        let (b, mut b_pushes, _t2) = spawn_client(b_transport);

        let pid_a = ParticipantId([1u8; 16]);
        let pid_b = ParticipantId([2u8; 16]);
        a.join(created.session_id, pid_a, NatTier::PublicIp, vec![]).await.unwrap();
        b.join(created.session_id, pid_b, NatTier::StunReflexive, vec![]).await.unwrap();

        a.signal(created.session_id, pid_a, pid_b, b"ice-candidate".to_vec())
            .await
            .unwrap();

        // B sees the relayed blob (plus participant list pushes).
        for _ in 0..10 {
            if let Some(Packet::SignalRelay(msg)) = b_pushes.recv().await {
                assert_eq!(msg.from, pid_a);
                assert_eq!(msg.payload, b"ice-candidate");
                return;
            }
        }
        panic!("signaling blob never arrived");
    }

    #[tokio::test]
    async fn server_signs_ping_when_it_has_identity() {
        let identity = Arc::new(Identity::generate());
        let pubkey = identity.public_bytes();
        let addr = start_server(Some(identity)).await;
        let handle = client(addr).await;
        handle.verify_server_identity(&pubkey).await.unwrap();
    }

    #[tokio::test]
    async fn relay_pairs_two_binds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_relay(listener));

        let bind_a = relay::RelayBind {
            session_id: [9u8; 16],
            participant_id: ParticipantId([1u8; 16]),
        };
        let bind_b = relay::RelayBind {
            session_id: [9u8; 16],
            participant_id: ParticipantId([2u8; 16]),
        };

        let mut a = TcpStream::connect(addr).await.unwrap();
        let task = tokio::spawn(async move {
            assert!(relay::bind(&mut a, bind_a).await.unwrap());
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            a.write_all(b"through the relay").await.unwrap();
            let mut buf = [0u8; 4];
            a.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let mut b = TcpStream::connect(addr).await.unwrap();
        assert!(relay::bind(&mut b, bind_b).await.unwrap());
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = [0u8; 17];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the relay");
        b.write_all(b"pong").await.unwrap();
        task.await.unwrap();
    }
}
