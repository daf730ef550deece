//! The `acip` peer: host a conference or join one.
//!
//! Media capture and the terminal sink live in separate components; this
//! binary owns the runtime they plug into: discovery, NAT traversal, the
//! encrypted session layer, and ring consensus.

mod codec;
mod consensus;
mod crypto;
mod discovery;
mod media;
mod net;
mod packet;
mod policy;
mod types;

use crate::consensus::{ConsensusAction, ConsensusConfig, ConsensusEngine};
use crate::crypto::{HandshakeConfig, HandshakeRole, Identity, KeySource, KnownHosts, LoadedKey};
use crate::discovery::{AcdsHandle, DiscoveryError};
use crate::net::{
    run_connection, Connection, ConnectionConfig, ConnectPlan, RelayPlan, SessionError,
    SessionEvent, Transport, TransportError,
};
use crate::packet::{CandidateAddr, ClientJoinMsg, NetworkQualityMsg, Packet};
use crate::policy::Policy;
use crate::types::{exit_code, now_ns, ClientId, NatTier, NetworkMetrics, ParticipantId};
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "acip", version, about = "ACIP terminal video chat peer")]
struct Args {
    /// Listen for peers on this port (host role)
    #[arg(short, long)]
    listen: Option<u16>,

    /// Join a session: a session string (with --acds) or host:port
    #[arg(short, long)]
    connect: Option<String>,

    /// Discovery server address
    #[arg(long)]
    acds: Option<SocketAddr>,

    /// HTTPS URL publishing the discovery server's identity key
    #[arg(long)]
    acds_key_url: Option<String>,

    /// Relay listener address (stage-3 fallback)
    #[arg(long)]
    relay: Option<SocketAddr>,

    /// STUN server for reflexive-address discovery
    #[arg(long)]
    stun: Option<SocketAddr>,

    /// Gateway for the startup NAT-PMP mapping attempt (host role)
    #[arg(long)]
    gateway: Option<Ipv4Addr>,

    /// Identity key source: path, agent:<sock>, gpg:<id>, github:<user>.keys
    #[arg(short, long)]
    key: Option<String>,

    /// Shared session password (also binds the handshake to it)
    #[arg(long)]
    password: Option<String>,

    /// Preferred session string to reserve when hosting
    #[arg(long)]
    session_string: Option<String>,

    /// Display name announced to the session
    #[arg(long, default_value = "anonymous")]
    name: String,

    /// Known-hosts file (defaults to the user config directory)
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Permit unencrypted sessions when the peer insists
    #[arg(long)]
    insecure_no_encryption: bool,

    /// Refuse peers whose identity is not already pinned
    #[arg(long)]
    require_pinning: bool,

    /// Estimated upload bandwidth reported to host election, kbit/s.
    /// The capture pipeline refines this while streaming.
    #[arg(long, default_value = "5000")]
    upload_kbps: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("acip=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    info!("acip v{VERSION}");

    let code = match run(args).await {
        Ok(()) => exit_code::OK,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("{0}")]
    Discovery(#[from] DiscoveryError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RunError {
    fn exit_code(&self) -> i32 {
        match self {
            RunError::Session(SessionError::Crypto(e)) | RunError::Crypto(e) => match e {
                crate::crypto::CryptoError::PeerKeyChanged { .. } => exit_code::MITM_DETECTED,
                _ => exit_code::HANDSHAKE_FAILED,
            },
            RunError::Session(_) => exit_code::HANDSHAKE_FAILED,
            RunError::Transport(_) => exit_code::NETWORK_UNREACHABLE,
            RunError::Discovery(_) => exit_code::NETWORK_UNREACHABLE,
            RunError::Io(_) => exit_code::FAILURE,
            RunError::Config(_) => exit_code::CONFIG_INVALID,
        }
    }
}

struct Node {
    policy: Policy,
    identity: Option<Arc<Identity>>,
    password: Option<String>,
    known_hosts: Arc<RwLock<KnownHosts>>,
    participant_id: ParticipantId,
    display_name: String,
    upload_kbps: u64,
}

impl Node {
    fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            identity: self.identity.clone(),
            password: self.password.clone(),
            allow_null_cipher: !self.policy.require_encryption,
        }
    }

    fn connection_config(&self, endpoint: String, local_id: ClientId) -> ConnectionConfig {
        ConnectionConfig {
            policy: self.policy.clone(),
            handshake: self.handshake_config(),
            known_hosts: Some(self.known_hosts.clone()),
            endpoint,
            local_id,
        }
    }

    fn own_metrics(&self) -> NetworkMetrics {
        NetworkMetrics {
            upload_kbps: self.upload_kbps,
            rtt_ns: 0,
            jitter_ns: 0,
            loss_pct: 0.0,
            measurement_time_ns: now_ns(),
            measurement_window_ns: Duration::from_secs(5).as_nanos() as u64,
        }
    }
}

async fn run(args: Args) -> Result<(), RunError> {
    let mut policy = Policy::from_env();
    policy.require_encryption = !args.insecure_no_encryption;
    policy.require_pinning = args.require_pinning;

    let identity = load_identity(&args).await?;
    if let Some(id) = &identity {
        info!("identity: {}", id.fingerprint());
    } else {
        warn!("no identity key loaded; authenticating by key exchange only");
    }

    let known_hosts_path = args
        .known_hosts
        .clone()
        .unwrap_or_else(KnownHosts::default_path);
    let known_hosts = Arc::new(RwLock::new(KnownHosts::load(known_hosts_path)?));

    let node = Arc::new(Node {
        policy,
        identity,
        password: args.password.clone(),
        known_hosts,
        participant_id: ParticipantId::random(),
        display_name: args.name.clone(),
        upload_kbps: args.upload_kbps,
    });

    match (&args.listen, &args.connect) {
        (Some(port), None) => host(node, *port, args).await,
        (None, Some(target)) => join(node, target.clone(), args).await,
        _ => Err(RunError::Config(
            "exactly one of --listen or --connect is required".into(),
        )),
    }
}

async fn load_identity(args: &Args) -> Result<Option<Arc<Identity>>, RunError> {
    let Some(uri) = &args.key else {
        return Ok(None);
    };
    let source = KeySource::parse(uri)?;
    let passphrase = Policy::key_password();
    match source.load(passphrase.as_deref()).await? {
        LoadedKey::Full(identity) => Ok(Some(Arc::new(identity))),
        LoadedKey::PublicOnly(_) => Err(RunError::Config(format!(
            "{uri} yields a verification-only key; a host/client identity needs the private half"
        ))),
    }
}

// =============================================================================
// HOST ROLE
// =============================================================================

async fn host(node: Arc<Node>, port: u16, args: Args) -> Result<(), RunError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;
    info!("hosting on {local_addr}");

    // One NAT-PMP attempt at startup, 1 s budget; an extra published
    // candidate when the gateway cooperates.
    let mut candidates: Vec<CandidateAddr> = Vec::new();
    if let Some(gateway) = args.gateway {
        match crate::net::request_mapping(gateway, port, 3600, Duration::from_secs(1)).await {
            Ok(mapping) => {
                info!("NAT-PMP mapping: {}", mapping.external_addr);
                candidates.push(CandidateAddr {
                    addr: mapping.external_addr,
                    tier: NatTier::UpnpMapped,
                });
            }
            Err(e) => info!("NAT-PMP unavailable: {e}"),
        }
    }
    if let Some(stun) = args.stun {
        match crate::net::discover_reflexive(stun, Duration::from_secs(2)).await {
            Ok(addr) => candidates.push(CandidateAddr {
                addr,
                tier: NatTier::StunReflexive,
            }),
            Err(e) => info!("STUN discovery failed: {e}"),
        }
    }

    // Publish the session through ACDS when configured.
    if let Some(acds_addr) = args.acds {
        let handle = connect_acds(&args, acds_addr).await?;
        let host_pubkey = node
            .identity
            .as_ref()
            .map(|id| id.public_bytes())
            .unwrap_or_default();
        let created = handle
            .create_session(host_pubkey, args.session_string.clone(), candidates.clone())
            .await?;
        info!("session string: {}", created.session_string);

        let keepalive_handle = handle.clone();
        let session_id = created.session_id;
        let pid = node.participant_id;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(25));
            loop {
                timer.tick().await;
                if keepalive_handle.keepalive(session_id, pid).await.is_err() {
                    warn!("discovery keepalive failed");
                    break;
                }
            }
        });
    }

    // Consensus: the host coordinates collection rounds over its peer
    // links and is the initial media host.
    let (peer_tx, mut peer_events) = mpsc::channel::<(ClientId, SessionEvent)>(256);
    let mut peers: std::collections::HashMap<ClientId, mpsc::Sender<Packet>> =
        std::collections::HashMap::new();
    // Participant ids announced via CLIENT_JOIN, for token routing.
    let mut participant_links: std::collections::HashMap<ParticipantId, ClientId> =
        std::collections::HashMap::new();
    let mut engine = ConsensusEngine::new(ConsensusConfig::coordinator(
        node.participant_id,
        Duration::from_millis(node.policy.round_deadline_ms as u64),
    ));

    let mut next_client_id: ClientId = 1;
    let mut consensus_tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let client_id = next_client_id;
                next_client_id += 1;
                info!("peer {peer_addr} connected (client id {client_id})");

                let transport = Transport::direct(stream)?;
                let conn = Connection::new(
                    HandshakeRole::Server,
                    node.connection_config(peer_addr.to_string(), 0),
                    Instant::now(),
                );
                let (outbound_tx, outbound_rx) = mpsc::channel(64);
                let (event_tx, mut event_rx) = mpsc::channel(64);
                peers.insert(client_id, outbound_tx);

                let fanout = peer_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        if fanout.send((client_id, event)).await.is_err() {
                            break;
                        }
                    }
                });
                tokio::spawn(async move {
                    if let Err(e) = run_connection(conn, transport, outbound_rx, event_tx).await {
                        info!("peer session {client_id} ended: {e}");
                    }
                });
            }
            Some((client_id, event)) = peer_events.recv() => {
                match event {
                    SessionEvent::Established { peer_identity } => {
                        info!(
                            "peer {client_id} session established ({})",
                            peer_identity
                                .map(|k| crate::crypto::fingerprint(&k))
                                .unwrap_or_else(|| "anonymous".into())
                        );
                    }
                    SessionEvent::App(packet) => {
                        if let Packet::ClientJoin(join) = &packet {
                            participant_links.insert(join.participant_id, client_id);
                        }
                        let actions = consensus_input(&mut engine, &node, &packet);
                        apply_consensus_actions(actions, &mut engine, &node, &peers, &participant_links).await;
                        log_app_packet(client_id, &packet);
                    }
                    SessionEvent::BackupAddr(addr) => info!("peer {client_id} backup addr {addr}"),
                    SessionEvent::Closed => {
                        peers.remove(&client_id);
                        participant_links.retain(|_, c| *c != client_id);
                        info!("peer {client_id} closed");
                    }
                }
            }
            _ = consensus_tick.tick() => {
                let actions = engine.poll(Instant::now());
                apply_consensus_actions(actions, &mut engine, &node, &peers, &participant_links).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

fn consensus_input(engine: &mut ConsensusEngine, node: &Node, packet: &Packet) -> Vec<ConsensusAction> {
    let now = Instant::now();
    match packet {
        Packet::ParticipantList(msg) => engine.on_participant_list(msg),
        Packet::NetworkQuality(msg) => engine.on_network_quality(msg, now),
        Packet::RingCollect(msg) => engine.on_ring_collect(msg, node.own_metrics()),
        Packet::HostDesignated(msg) => engine.on_host_designated(msg),
        Packet::FutureHostElected(msg) => engine.on_future_host_elected(msg),
        Packet::HostLost(msg) => engine.on_host_lost(msg, now),
        Packet::SettingsSync(settings) => engine.on_settings_sync(settings),
        _ => Vec::new(),
    }
}

/// Worklist over consensus actions: token sends addressed to ourselves
/// feed straight back into the engine as our own metrics report.
async fn apply_consensus_actions(
    actions: Vec<ConsensusAction>,
    engine: &mut ConsensusEngine,
    node: &Node,
    peers: &std::collections::HashMap<ClientId, mpsc::Sender<Packet>>,
    participant_links: &std::collections::HashMap<ParticipantId, ClientId>,
) {
    let mut worklist = actions;
    while !worklist.is_empty() {
        let mut next = Vec::new();
        for action in worklist {
            match action {
                ConsensusAction::Broadcast(packet) => {
                    for tx in peers.values() {
                        let _ = tx.send(packet.clone()).await;
                    }
                }
                ConsensusAction::Send { to, packet } => {
                    if to == node.participant_id {
                        // The token reached the coordinator itself.
                        if let Packet::RingCollect(msg) = &packet {
                            next.extend(engine.on_network_quality(
                                &NetworkQualityMsg {
                                    participant_id: node.participant_id,
                                    round: msg.round,
                                    metrics: node.own_metrics(),
                                },
                                Instant::now(),
                            ));
                        }
                    } else if let Some(tx) = participant_links.get(&to).and_then(|c| peers.get(c)) {
                        let _ = tx.send(packet).await;
                    }
                }
                ConsensusAction::HostChanged { host, backup, failover } => {
                    info!(
                        "host changed to {host} (backup {:?}{})",
                        backup,
                        if failover { ", failover" } else { "" }
                    );
                }
                ConsensusAction::RoundIncomplete { reported, next_deadline } => {
                    warn!("collection round incomplete ({reported} reports); retry in {next_deadline:?}");
                }
                ConsensusAction::SettingsChanged(settings) => {
                    info!("settings epoch {} in effect", settings.epoch);
                }
            }
        }
        worklist = next;
    }
}

fn log_app_packet(client_id: ClientId, packet: &Packet) {
    match packet {
        Packet::ImageFrame(frame) => {
            info!("frame {}x{} from client {client_id}", frame.width, frame.height);
        }
        Packet::TextMessage(msg) => info!("[{client_id}] {}", msg.text),
        Packet::ClientJoin(msg) => info!("client {client_id} joined as {}", msg.display_name),
        _ => {}
    }
}

// =============================================================================
// CLIENT ROLE
// =============================================================================

async fn join(node: Arc<Node>, target: String, args: Args) -> Result<(), RunError> {
    // The discovery handle stays alive for the whole session so the
    // link keeps pinging and our table entry survives.
    let (plan, _acds) = build_plan(&node, &target, &args).await?;
    let transport = crate::net::establish(&plan, &node.policy).await?;
    let endpoint = transport.peer_addr().to_string();
    info!("transport up to {endpoint} ({:?})", transport.kind());

    // Nonzero source id derived from the participant id; zero is the
    // server's.
    let local_id = u32::from_be_bytes(node.participant_id.0[..4].try_into().expect("4 bytes")) | 1;
    let conn = Connection::new(
        HandshakeRole::Client,
        node.connection_config(endpoint, local_id),
        Instant::now(),
    );
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let driver = tokio::spawn(run_connection(conn, transport, outbound_rx, event_tx));

    let mut engine = ConsensusEngine::new(ConsensusConfig::participant(
        node.participant_id,
        Duration::from_millis(node.policy.round_deadline_ms as u64),
    ));

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Established { peer_identity } => {
                        info!(
                            "session established ({})",
                            peer_identity
                                .map(|k| crate::crypto::fingerprint(&k))
                                .unwrap_or_else(|| "anonymous".into())
                        );
                        outbound_tx
                            .send(Packet::ClientJoin(ClientJoinMsg {
                                participant_id: node.participant_id,
                                display_name: node.display_name.clone(),
                            }))
                            .await
                            .ok();
                    }
                    SessionEvent::App(packet) => {
                        for action in consensus_input(&mut engine, &node, &packet) {
                            match action {
                                ConsensusAction::Broadcast(p) | ConsensusAction::Send { packet: p, .. } => {
                                    outbound_tx.send(p).await.ok();
                                }
                                other => {
                                    if let ConsensusAction::HostChanged { host, failover, .. } = other {
                                        info!("host changed to {host} (failover: {failover})");
                                    }
                                }
                            }
                        }
                        log_app_packet(0, &packet);
                    }
                    SessionEvent::BackupAddr(addr) => info!("host backup addr: {addr}"),
                    SessionEvent::Closed => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("leaving session");
                drop(outbound_tx);
                break;
            }
        }
    }

    match driver.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(()),
    }
}

async fn build_plan(
    node: &Node,
    target: &str,
    args: &Args,
) -> Result<(ConnectPlan, Option<AcdsHandle>), RunError> {
    // A bare socket address is a direct dial.
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok((
            ConnectPlan {
                direct: Some(addr),
                reflexive: None,
                relay: None,
            },
            None,
        ));
    }

    // Otherwise it is a session string resolved through ACDS.
    let acds_addr = args
        .acds
        .ok_or_else(|| RunError::Config("session strings need --acds".into()))?;
    let handle = connect_acds(args, acds_addr).await?;
    let info = handle.lookup(target).await?;
    handle
        .join(info.session_id, node.participant_id, NatTier::StunReflexive, vec![])
        .await?;

    let direct = info
        .candidates
        .iter()
        .find(|c| !matches!(c.tier, NatTier::StunReflexive | NatTier::TurnRelay))
        .map(|c| c.addr);
    let reflexive = info
        .candidates
        .iter()
        .find(|c| matches!(c.tier, NatTier::StunReflexive))
        .map(|c| c.addr);
    let relay = args.relay.map(|relay_addr| RelayPlan {
        relay_addr,
        session_id: info.session_id,
        participant_id: node.participant_id,
    });

    if direct.is_none() && reflexive.is_none() && relay.is_none() {
        return Err(RunError::Config(format!("no usable candidates for {target}")));
    }
    Ok((
        ConnectPlan {
            direct,
            reflexive,
            relay,
        },
        Some(handle),
    ))
}

async fn connect_acds(args: &Args, addr: SocketAddr) -> Result<AcdsHandle, RunError> {
    let (handle, _pushes, _task) = crate::discovery::connect(addr, Duration::from_secs(5)).await?;
    if let Some(url) = &args.acds_key_url {
        let expected = crate::discovery::fetch_server_pubkey(url).await?;
        handle.verify_server_identity(&expected).await?;
        info!("discovery server identity verified");
    }
    Ok(handle)
}
