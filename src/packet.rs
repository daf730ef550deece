//! Typed ACIP packet registry.
//!
//! This module is the authoritative mapping between on-wire `u16` packet
//! types and typed payloads. Payload bodies are postcard-encoded serde
//! structs; the fixed header around them is produced by [`crate::codec`].

use crate::codec::{self, CodecError, RawPacket, EXTENSION_RANGE_START};
use crate::media::{AsciiFrame, AudioBatch, ImageFrame};
use crate::types::{NatTier, NetworkMetrics, Participant, ParticipantId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// =============================================================================
// TYPE REGISTRY
// =============================================================================

/// Every packet type ACIP speaks, with its wire discriminant.
///
/// Ranges:
///   1           protocol version probe
///   1000–1199   crypto handshake (cleartext by necessity)
///   1200–1203   encrypted envelope + rekey
///   2000–2004   control messages
///   3000–3001   video frames
///   4000–4001   audio
///   5000–5008   session control & keepalive
///   6000–6068   discovery + ring consensus
///   6100, 6199  discovery ping / error
///   0xF000+     extension range, carried opaque
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    ProtocolVersion = 1,

    CryptoClientHello = 1000,
    CryptoCapabilities = 1100,
    CryptoCapabilitiesAck = 1101,
    CryptoServerPubkey = 1102,
    CryptoClientPubkey = 1103,
    CryptoAuthChallenge = 1104,
    CryptoAuthResponse = 1105,
    CryptoAuthOk = 1107,
    CryptoHandshakeComplete = 1108,
    CryptoNoEncryption = 1109,

    PacketEncrypted = 1200,
    CryptoRekeyRequest = 1201,
    CryptoRekeyResponse = 1202,
    CryptoRekeyComplete = 1203,

    SizeMessage = 2000,
    AudioMessage = 2001,
    TextMessage = 2002,
    ErrorMessage = 2003,
    RemoteLog = 2004,

    AsciiFrame = 3000,
    ImageFrame = 3001,

    AudioBatch = 4000,
    AudioOpusBatch = 4001,

    ClientCapabilities = 5000,
    Ping = 5001,
    Pong = 5002,
    ClientJoin = 5003,
    ClientLeave = 5004,
    StreamStart = 5005,
    StreamStop = 5006,
    ClearConsole = 5007,
    ServerState = 5008,

    AcdsCreateSession = 6000,
    AcdsSessionCreated = 6001,
    AcdsLookup = 6002,
    AcdsSessionInfo = 6003,
    AcdsJoin = 6004,
    AcdsJoined = 6005,
    AcdsLeave = 6006,
    AcdsKeepalive = 6007,
    StringReserve = 6010,
    StringReserved = 6011,
    StringRenew = 6012,
    StringRelease = 6013,
    SignalRelay = 6020,
    ParticipantList = 6050,
    NetworkQuality = 6060,
    RingCollect = 6061,
    HostDesignated = 6062,
    SettingsSync = 6063,
    SettingsAck = 6064,
    HostLost = 6065,
    FutureHostElected = 6066,
    DiscoveryPing = 6100,
    AcdsError = 6199,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Option<Self> {
        use PacketType::*;
        Some(match value {
            1 => ProtocolVersion,
            1000 => CryptoClientHello,
            1100 => CryptoCapabilities,
            1101 => CryptoCapabilitiesAck,
            1102 => CryptoServerPubkey,
            1103 => CryptoClientPubkey,
            1104 => CryptoAuthChallenge,
            1105 => CryptoAuthResponse,
            1107 => CryptoAuthOk,
            1108 => CryptoHandshakeComplete,
            1109 => CryptoNoEncryption,
            1200 => PacketEncrypted,
            1201 => CryptoRekeyRequest,
            1202 => CryptoRekeyResponse,
            1203 => CryptoRekeyComplete,
            2000 => SizeMessage,
            2001 => AudioMessage,
            2002 => TextMessage,
            2003 => ErrorMessage,
            2004 => RemoteLog,
            3000 => AsciiFrame,
            3001 => ImageFrame,
            4000 => AudioBatch,
            4001 => AudioOpusBatch,
            5000 => ClientCapabilities,
            5001 => Ping,
            5002 => Pong,
            5003 => ClientJoin,
            5004 => ClientLeave,
            5005 => StreamStart,
            5006 => StreamStop,
            5007 => ClearConsole,
            5008 => ServerState,
            6000 => AcdsCreateSession,
            6001 => AcdsSessionCreated,
            6002 => AcdsLookup,
            6003 => AcdsSessionInfo,
            6004 => AcdsJoin,
            6005 => AcdsJoined,
            6006 => AcdsLeave,
            6007 => AcdsKeepalive,
            6010 => StringReserve,
            6011 => StringReserved,
            6012 => StringRenew,
            6013 => StringRelease,
            6020 => SignalRelay,
            6050 => ParticipantList,
            6060 => NetworkQuality,
            6061 => RingCollect,
            6062 => HostDesignated,
            6063 => SettingsSync,
            6064 => SettingsAck,
            6065 => HostLost,
            6066 => FutureHostElected,
            6100 => DiscoveryPing,
            6199 => AcdsError,
            _ => return None,
        })
    }

    /// Types a connection may receive before the crypto handshake finishes.
    pub fn allowed_pre_session(value: u16) -> bool {
        value == 1 || (1000..=1109).contains(&value)
    }

    /// Types that must ride inside a `PacketEncrypted` envelope once
    /// session keys exist: rekeying and everything at or above 2000.
    /// The discovery link never negotiates session keys and bypasses
    /// this gate entirely.
    pub fn must_be_encrypted(value: u16) -> bool {
        (1201..=1203).contains(&value) || value >= 2000
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Version probe, the first packet on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersionMsg {
    pub version: u16,
    pub min_supported: u16,
}

/// Current protocol revision. Bump on breaking wire changes.
pub const PROTOCOL_VERSION: u16 = 3;
pub const MIN_PROTOCOL_VERSION: u16 = 3;

/// Negotiable AEAD suites, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherSuite {
    /// XSalsa20-Poly1305 secretbox, 24-byte nonce.
    XSalsa20Poly1305,
    /// Cleartext session; only when both policies allow it.
    Null,
}

/// Peer authentication modes for the challenge-response step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// Ed25519 signature with the long-term identity key.
    Ed25519,
    /// HMAC-SHA-256; used when no identity key is available.
    Hmac,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoClientHelloMsg {
    /// Long-term Ed25519 identity, absent for anonymous clients.
    pub identity_pubkey: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoCapabilitiesMsg {
    pub ciphers: Vec<CipherSuite>,
    pub auth_modes: Vec<AuthMode>,
    pub password_bound: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoCapabilitiesAckMsg {
    /// Server's long-term Ed25519 identity, absent when anonymous.
    pub identity_pubkey: Option<[u8; 32]>,
    /// Session id chosen by the server; feeds the nonce and the KDF salt.
    pub session_id: [u8; 16],
    pub cipher: CipherSuite,
    pub auth_mode: AuthMode,
    pub password_bound: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoPubkeyMsg {
    pub x25519_pubkey: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoAuthChallengeMsg {
    pub challenge: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoAuthResponseMsg {
    /// Ed25519 signature or HMAC over challenge ‖ shared secret ‖ tag.
    pub proof: Vec<u8>,
    /// Password binding MAC, present when a session password is configured.
    pub password_proof: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoAuthOkMsg {
    /// The responder's own proof, bound to the same challenge and secret.
    pub proof: Vec<u8>,
    pub password_proof: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyMsg {
    pub x25519_pubkey: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeMessageMsg {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMessageMsg {
    pub pcm_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessageMsg {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessageMsg {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLogMsg {
    pub level: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioOpusBatchMsg {
    pub sample_rate: u32,
    pub channels: u8,
    pub opus_frames: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilitiesMsg {
    pub term_width: u16,
    pub term_height: u16,
    pub color: bool,
    pub wants_audio: bool,
    pub display_name: String,
}

/// Keepalive. The elected host piggybacks its backup address here so
/// peers can reconnect on host loss without an ACDS round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMsg {
    pub nonce: u64,
    pub backup_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMsg {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoinMsg {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStateMsg {
    pub connected_clients: u32,
    pub host: Option<ParticipantId>,
}

// ---- discovery & consensus ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAddr {
    pub addr: SocketAddr,
    pub tier: NatTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsCreateSessionMsg {
    pub host_pubkey: [u8; 32],
    pub preferred_string: Option<String>,
    pub candidates: Vec<CandidateAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsSessionCreatedMsg {
    pub session_string: String,
    pub session_id: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsLookupMsg {
    pub session_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsSessionInfoMsg {
    pub session_id: [u8; 16],
    pub host_pubkey: [u8; 32],
    pub candidates: Vec<CandidateAddr>,
    pub participant_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsJoinMsg {
    pub session_id: [u8; 16],
    pub participant_id: ParticipantId,
    pub nat_tier: NatTier,
    pub candidates: Vec<CandidateAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcdsJoinedMsg {
    pub participant: Participant,
    pub ring: Vec<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsLeaveMsg {
    pub session_id: [u8; 16],
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsKeepaliveMsg {
    pub session_id: [u8; 16],
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringReserveMsg {
    pub session_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringReservedMsg {
    pub session_string: String,
    pub ttl_secs: u32,
}

/// Opaque signaling blob relayed by ACDS between two participants.
/// The server forwards it without inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRelayMsg {
    pub session_id: [u8; 16],
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantListMsg {
    pub session_id: [u8; 16],
    pub epoch: u64,
    pub ring: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkQualityMsg {
    pub participant_id: ParticipantId,
    pub round: u64,
    pub metrics: NetworkMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingCollectMsg {
    pub round: u64,
    pub deadline_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDesignatedMsg {
    pub epoch: u64,
    pub host: ParticipantId,
    pub backup: Option<ParticipantId>,
}

/// Conference settings, replicated through the host with a monotonic epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub epoch: u64,
    pub color: bool,
    pub fps_cap: u8,
    pub audio_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsAckMsg {
    pub epoch: u64,
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLostMsg {
    pub reporter: ParticipantId,
    pub last_seen_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureHostElectedMsg {
    pub host: ParticipantId,
}

/// Liveness probe for the discovery link. The server's reply carries an
/// Ed25519 signature over the nonce so clients can check it against the
/// out-of-band published key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPingMsg {
    pub nonce: u64,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcdsErrorMsg {
    pub code: u16,
    pub message: String,
}

/// ACDS error codes.
pub mod acds_error {
    pub const SESSION_NOT_FOUND: u16 = 1;
    pub const STRING_CONFLICT: u16 = 2;
    pub const MALFORMED: u16 = 3;
    pub const SESSION_FULL: u16 = 4;
}

// =============================================================================
// TYPED PACKET
// =============================================================================

/// A fully decoded packet: the tagged union the rest of the runtime
/// dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ProtocolVersion(ProtocolVersionMsg),
    CryptoClientHello(CryptoClientHelloMsg),
    CryptoCapabilities(CryptoCapabilitiesMsg),
    CryptoCapabilitiesAck(CryptoCapabilitiesAckMsg),
    CryptoServerPubkey(CryptoPubkeyMsg),
    CryptoClientPubkey(CryptoPubkeyMsg),
    CryptoAuthChallenge(CryptoAuthChallengeMsg),
    CryptoAuthResponse(CryptoAuthResponseMsg),
    CryptoAuthOk(CryptoAuthOkMsg),
    CryptoHandshakeComplete,
    CryptoNoEncryption,
    PacketEncrypted(EncryptedEnvelope),
    CryptoRekeyRequest(RekeyMsg),
    CryptoRekeyResponse(RekeyMsg),
    CryptoRekeyComplete,
    SizeMessage(SizeMessageMsg),
    AudioMessage(AudioMessageMsg),
    TextMessage(TextMessageMsg),
    ErrorMessage(ErrorMessageMsg),
    RemoteLog(RemoteLogMsg),
    AsciiFrame(AsciiFrame),
    ImageFrame(ImageFrame),
    AudioBatch(AudioBatch),
    AudioOpusBatch(AudioOpusBatchMsg),
    ClientCapabilities(ClientCapabilitiesMsg),
    Ping(PingMsg),
    Pong(PongMsg),
    ClientJoin(ClientJoinMsg),
    ClientLeave,
    StreamStart,
    StreamStop,
    ClearConsole,
    ServerState(ServerStateMsg),
    AcdsCreateSession(AcdsCreateSessionMsg),
    AcdsSessionCreated(AcdsSessionCreatedMsg),
    AcdsLookup(AcdsLookupMsg),
    AcdsSessionInfo(AcdsSessionInfoMsg),
    AcdsJoin(AcdsJoinMsg),
    AcdsJoined(AcdsJoinedMsg),
    AcdsLeave(AcdsLeaveMsg),
    AcdsKeepalive(AcdsKeepaliveMsg),
    StringReserve(StringReserveMsg),
    StringReserved(StringReservedMsg),
    StringRenew(StringReserveMsg),
    StringRelease(StringReserveMsg),
    SignalRelay(SignalRelayMsg),
    ParticipantList(ParticipantListMsg),
    NetworkQuality(NetworkQualityMsg),
    RingCollect(RingCollectMsg),
    HostDesignated(HostDesignatedMsg),
    SettingsSync(SessionSettings),
    SettingsAck(SettingsAckMsg),
    HostLost(HostLostMsg),
    FutureHostElected(FutureHostElectedMsg),
    DiscoveryPing(DiscoveryPingMsg),
    AcdsError(AcdsErrorMsg),
    /// Unknown type in the extension range, carried opaque.
    Extension { packet_type: u16, payload: Vec<u8> },
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Payload(e.to_string()))
}

fn parse<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Payload(e.to_string()))
}

impl Packet {
    pub fn packet_type(&self) -> u16 {
        use Packet::*;
        match self {
            ProtocolVersion(_) => 1,
            CryptoClientHello(_) => 1000,
            CryptoCapabilities(_) => 1100,
            CryptoCapabilitiesAck(_) => 1101,
            CryptoServerPubkey(_) => 1102,
            CryptoClientPubkey(_) => 1103,
            CryptoAuthChallenge(_) => 1104,
            CryptoAuthResponse(_) => 1105,
            CryptoAuthOk(_) => 1107,
            CryptoHandshakeComplete => 1108,
            CryptoNoEncryption => 1109,
            PacketEncrypted(_) => 1200,
            CryptoRekeyRequest(_) => 1201,
            CryptoRekeyResponse(_) => 1202,
            CryptoRekeyComplete => 1203,
            SizeMessage(_) => 2000,
            AudioMessage(_) => 2001,
            TextMessage(_) => 2002,
            ErrorMessage(_) => 2003,
            RemoteLog(_) => 2004,
            AsciiFrame(_) => 3000,
            ImageFrame(_) => 3001,
            AudioBatch(_) => 4000,
            AudioOpusBatch(_) => 4001,
            ClientCapabilities(_) => 5000,
            Ping(_) => 5001,
            Pong(_) => 5002,
            ClientJoin(_) => 5003,
            ClientLeave => 5004,
            StreamStart => 5005,
            StreamStop => 5006,
            ClearConsole => 5007,
            ServerState(_) => 5008,
            AcdsCreateSession(_) => 6000,
            AcdsSessionCreated(_) => 6001,
            AcdsLookup(_) => 6002,
            AcdsSessionInfo(_) => 6003,
            AcdsJoin(_) => 6004,
            AcdsJoined(_) => 6005,
            AcdsLeave(_) => 6006,
            AcdsKeepalive(_) => 6007,
            StringReserve(_) => 6010,
            StringReserved(_) => 6011,
            StringRenew(_) => 6012,
            StringRelease(_) => 6013,
            SignalRelay(_) => 6020,
            ParticipantList(_) => 6050,
            NetworkQuality(_) => 6060,
            RingCollect(_) => 6061,
            HostDesignated(_) => 6062,
            SettingsSync(_) => 6063,
            SettingsAck(_) => 6064,
            HostLost(_) => 6065,
            FutureHostElected(_) => 6066,
            DiscoveryPing(_) => 6100,
            AcdsError(_) => 6199,
            Extension { packet_type, .. } => *packet_type,
        }
    }

    /// Encode this packet's body. Image frames go through the inline
    /// compression path; everything else is a plain postcard body.
    pub fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
        use Packet::*;
        match self {
            ProtocolVersion(m) => body(m),
            CryptoClientHello(m) => body(m),
            CryptoCapabilities(m) => body(m),
            CryptoCapabilitiesAck(m) => body(m),
            CryptoServerPubkey(m) | CryptoClientPubkey(m) => body(m),
            CryptoAuthChallenge(m) => body(m),
            CryptoAuthResponse(m) => body(m),
            CryptoAuthOk(m) => body(m),
            CryptoHandshakeComplete | CryptoNoEncryption | CryptoRekeyComplete => Ok(Vec::new()),
            PacketEncrypted(m) => body(m),
            CryptoRekeyRequest(m) | CryptoRekeyResponse(m) => body(m),
            SizeMessage(m) => body(m),
            AudioMessage(m) => body(m),
            TextMessage(m) => body(m),
            ErrorMessage(m) => body(m),
            RemoteLog(m) => body(m),
            AsciiFrame(m) => body(m),
            ImageFrame(m) => codec::compress_frame_body(&body(m)?),
            AudioBatch(m) => body(m),
            AudioOpusBatch(m) => body(m),
            ClientCapabilities(m) => body(m),
            Ping(m) => body(m),
            Pong(m) => body(m),
            ClientJoin(m) => body(m),
            ClientLeave | StreamStart | StreamStop | ClearConsole => Ok(Vec::new()),
            ServerState(m) => body(m),
            AcdsCreateSession(m) => body(m),
            AcdsSessionCreated(m) => body(m),
            AcdsLookup(m) => body(m),
            AcdsSessionInfo(m) => body(m),
            AcdsJoin(m) => body(m),
            AcdsJoined(m) => body(m),
            AcdsLeave(m) => body(m),
            AcdsKeepalive(m) => body(m),
            StringReserve(m) | StringRenew(m) | StringRelease(m) => body(m),
            StringReserved(m) => body(m),
            SignalRelay(m) => body(m),
            ParticipantList(m) => body(m),
            NetworkQuality(m) => body(m),
            RingCollect(m) => body(m),
            HostDesignated(m) => body(m),
            SettingsSync(m) => body(m),
            SettingsAck(m) => body(m),
            HostLost(m) => body(m),
            FutureHostElected(m) => body(m),
            DiscoveryPing(m) => body(m),
            AcdsError(m) => body(m),
            Extension { payload, .. } => Ok(payload.clone()),
        }
    }

    /// Encode into a complete wire packet.
    pub fn encode(&self, source_id: u32) -> Result<Vec<u8>, CodecError> {
        codec::encode_packet(self.packet_type(), &self.encode_body()?, source_id)
    }

    /// Decode a raw packet into its typed form. Unknown types outside the
    /// extension range are a protocol error.
    pub fn decode(raw: &RawPacket) -> Result<Self, CodecError> {
        use Packet as P;
        let Some(packet_type) = PacketType::from_u16(raw.packet_type) else {
            if raw.packet_type >= EXTENSION_RANGE_START {
                return Ok(P::Extension {
                    packet_type: raw.packet_type,
                    payload: raw.payload.clone(),
                });
            }
            return Err(CodecError::UnknownType(raw.packet_type));
        };

        let b = &raw.payload;
        Ok(match packet_type {
            PacketType::ProtocolVersion => P::ProtocolVersion(parse(b)?),
            PacketType::CryptoClientHello => P::CryptoClientHello(parse(b)?),
            PacketType::CryptoCapabilities => P::CryptoCapabilities(parse(b)?),
            PacketType::CryptoCapabilitiesAck => P::CryptoCapabilitiesAck(parse(b)?),
            PacketType::CryptoServerPubkey => P::CryptoServerPubkey(parse(b)?),
            PacketType::CryptoClientPubkey => P::CryptoClientPubkey(parse(b)?),
            PacketType::CryptoAuthChallenge => P::CryptoAuthChallenge(parse(b)?),
            PacketType::CryptoAuthResponse => P::CryptoAuthResponse(parse(b)?),
            PacketType::CryptoAuthOk => P::CryptoAuthOk(parse(b)?),
            PacketType::CryptoHandshakeComplete => P::CryptoHandshakeComplete,
            PacketType::CryptoNoEncryption => P::CryptoNoEncryption,
            PacketType::PacketEncrypted => P::PacketEncrypted(parse(b)?),
            PacketType::CryptoRekeyRequest => P::CryptoRekeyRequest(parse(b)?),
            PacketType::CryptoRekeyResponse => P::CryptoRekeyResponse(parse(b)?),
            PacketType::CryptoRekeyComplete => P::CryptoRekeyComplete,
            PacketType::SizeMessage => P::SizeMessage(parse(b)?),
            PacketType::AudioMessage => P::AudioMessage(parse(b)?),
            PacketType::TextMessage => P::TextMessage(parse(b)?),
            PacketType::ErrorMessage => P::ErrorMessage(parse(b)?),
            PacketType::RemoteLog => P::RemoteLog(parse(b)?),
            PacketType::AsciiFrame => P::AsciiFrame(parse(b)?),
            PacketType::ImageFrame => {
                let inner = codec::decompress_frame_body(b)?;
                P::ImageFrame(parse(&inner)?)
            }
            PacketType::AudioBatch => P::AudioBatch(parse(b)?),
            PacketType::AudioOpusBatch => P::AudioOpusBatch(parse(b)?),
            PacketType::ClientCapabilities => P::ClientCapabilities(parse(b)?),
            PacketType::Ping => P::Ping(parse(b)?),
            PacketType::Pong => P::Pong(parse(b)?),
            PacketType::ClientJoin => P::ClientJoin(parse(b)?),
            PacketType::ClientLeave => P::ClientLeave,
            PacketType::StreamStart => P::StreamStart,
            PacketType::StreamStop => P::StreamStop,
            PacketType::ClearConsole => P::ClearConsole,
            PacketType::ServerState => P::ServerState(parse(b)?),
            PacketType::AcdsCreateSession => P::AcdsCreateSession(parse(b)?),
            PacketType::AcdsSessionCreated => P::AcdsSessionCreated(parse(b)?),
            PacketType::AcdsLookup => P::AcdsLookup(parse(b)?),
            PacketType::AcdsSessionInfo => P::AcdsSessionInfo(parse(b)?),
            PacketType::AcdsJoin => P::AcdsJoin(parse(b)?),
            PacketType::AcdsJoined => P::AcdsJoined(parse(b)?),
            PacketType::AcdsLeave => P::AcdsLeave(parse(b)?),
            PacketType::AcdsKeepalive => P::AcdsKeepalive(parse(b)?),
            PacketType::StringReserve => P::StringReserve(parse(b)?),
            PacketType::StringReserved => P::StringReserved(parse(b)?),
            PacketType::StringRenew => P::StringRenew(parse(b)?),
            PacketType::StringRelease => P::StringRelease(parse(b)?),
            PacketType::SignalRelay => P::SignalRelay(parse(b)?),
            PacketType::ParticipantList => P::ParticipantList(parse(b)?),
            PacketType::NetworkQuality => P::NetworkQuality(parse(b)?),
            PacketType::RingCollect => P::RingCollect(parse(b)?),
            PacketType::HostDesignated => P::HostDesignated(parse(b)?),
            PacketType::SettingsSync => P::SettingsSync(parse(b)?),
            PacketType::SettingsAck => P::SettingsAck(parse(b)?),
            PacketType::HostLost => P::HostLost(parse(b)?),
            PacketType::FutureHostElected => P::FutureHostElected(parse(b)?),
            PacketType::DiscoveryPing => P::DiscoveryPing(parse(b)?),
            PacketType::AcdsError => P::AcdsError(parse(b)?),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
