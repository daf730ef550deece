//! The crypto handshake state machine.
//!
//! Pure state transitions: packets in, packets out. The connection layer
//! owns the transport and the clock; this module owns the secrets. Both
//! roles bind their authentication proof to the ECDH shared secret, so a
//! middle box that terminates the key exchange cannot produce a valid
//! proof even when it knows the session password.

use super::identity::Identity;
use super::session::SessionKeys;
use super::{auth_mac, ct_eq, CryptoError, SecretKey};
use crate::packet::{
    AuthMode, CipherSuite, CryptoAuthChallengeMsg, CryptoAuthOkMsg, CryptoAuthResponseMsg,
    CryptoCapabilitiesAckMsg, CryptoCapabilitiesMsg, CryptoClientHelloMsg, CryptoPubkeyMsg, Packet,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Domain tags mixed into the authentication transcript, one per
/// direction so a proof cannot be reflected back at its author.
const CLIENT_AUTH_TAG: &[u8] = b"acip.auth.client";
const SERVER_AUTH_TAG: &[u8] = b"acip.auth.server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

/// What a completed handshake hands back to the connection.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub keys: SessionKeys,
    pub suite: CipherSuite,
    pub auth_mode: AuthMode,
    /// The peer's long-term identity key, for TOFU pinning.
    pub peer_identity: Option<[u8; 32]>,
}

/// One turn of the state machine: packets to send, and the outcome once
/// the handshake is done.
#[derive(Debug)]
pub struct HandshakeStep {
    pub send: Vec<Packet>,
    pub outcome: Option<HandshakeOutcome>,
}

impl HandshakeStep {
    fn send(send: Vec<Packet>) -> Self {
        Self { send, outcome: None }
    }

    fn done(send: Vec<Packet>, outcome: HandshakeOutcome) -> Self {
        Self {
            send,
            outcome: Some(outcome),
        }
    }
}

/// Local configuration feeding a handshake.
#[derive(Clone)]
pub struct HandshakeConfig {
    pub identity: Option<Arc<Identity>>,
    pub password: Option<String>,
    /// Mirrors `Policy::require_encryption`.
    pub allow_null_cipher: bool,
}

enum State {
    // Client side
    ClientStart,
    ClientAwaitCapsAck,
    ClientAwaitServerPubkey,
    ClientAwaitChallenge,
    ClientAwaitAuthOk,
    ClientAwaitComplete,
    // Server side
    ServerAwaitHello,
    ServerAwaitCaps,
    ServerAwaitClientPubkey,
    ServerAwaitAuthResponse,
    // Terminal
    Done,
    Failed,
}

pub struct Handshake {
    role: HandshakeRole,
    config: HandshakeConfig,
    state: State,

    // Negotiated parameters
    suite: CipherSuite,
    auth_mode: AuthMode,
    session_id: [u8; 16],
    peer_identity: Option<[u8; 32]>,

    // Secrets in flight
    ephemeral: Option<EphemeralSecret>,
    shared: Option<SecretKey>,
    password_key: Option<SecretKey>,
    challenge: [u8; 32],
}

impl Handshake {
    pub fn new(role: HandshakeRole, config: HandshakeConfig) -> Self {
        let state = match role {
            HandshakeRole::Client => State::ClientStart,
            HandshakeRole::Server => State::ServerAwaitHello,
        };
        Self {
            role,
            config,
            state,
            suite: CipherSuite::XSalsa20Poly1305,
            auth_mode: AuthMode::Hmac,
            session_id: [0u8; 16],
            peer_identity: None,
            ephemeral: None,
            shared: None,
            password_key: None,
            challenge: [0u8; 32],
        }
    }

    /// Client opening move: hello + capabilities.
    pub fn initiate(&mut self) -> Result<Vec<Packet>, CryptoError> {
        if !matches!(self.role, HandshakeRole::Client) || !matches!(self.state, State::ClientStart) {
            return Err(CryptoError::HandshakeViolation("initiate on wrong state"));
        }
        self.state = State::ClientAwaitCapsAck;
        Ok(vec![
            Packet::CryptoClientHello(CryptoClientHelloMsg {
                identity_pubkey: self.local_identity_pubkey(),
            }),
            Packet::CryptoCapabilities(self.local_capabilities()),
        ])
    }

    fn local_identity_pubkey(&self) -> Option<[u8; 32]> {
        self.config.identity.as_ref().map(|id| id.public_bytes())
    }

    fn local_capabilities(&self) -> CryptoCapabilitiesMsg {
        let mut ciphers = vec![CipherSuite::XSalsa20Poly1305];
        if self.config.allow_null_cipher {
            ciphers.push(CipherSuite::Null);
        }
        let mut auth_modes = vec![AuthMode::Hmac];
        if self.config.identity.is_some() {
            auth_modes.insert(0, AuthMode::Ed25519);
        }
        CryptoCapabilitiesMsg {
            ciphers,
            auth_modes,
            password_bound: self.config.password.is_some(),
        }
    }

    /// Advance the state machine with one inbound packet.
    pub fn step(&mut self, packet: &Packet) -> Result<HandshakeStep, CryptoError> {
        let result = match self.role {
            HandshakeRole::Client => self.step_client(packet),
            HandshakeRole::Server => self.step_server(packet),
        };
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    // =========================================================================
    // CLIENT
    // =========================================================================

    fn step_client(&mut self, packet: &Packet) -> Result<HandshakeStep, CryptoError> {
        match (&self.state, packet) {
            (State::ClientAwaitCapsAck, Packet::CryptoCapabilitiesAck(ack)) => {
                self.accept_caps_ack(ack)?;
                self.state = State::ClientAwaitServerPubkey;
                Ok(HandshakeStep::send(Vec::new()))
            }
            (State::ClientAwaitCapsAck, Packet::CryptoNoEncryption) => {
                if !self.config.allow_null_cipher {
                    return Err(CryptoError::EncryptionRequired);
                }
                self.suite = CipherSuite::Null;
                self.state = State::Done;
                Ok(HandshakeStep::done(Vec::new(), self.null_outcome()))
            }
            (State::ClientAwaitServerPubkey, Packet::CryptoServerPubkey(msg)) => {
                let reply = self.exchange_keys_as_client(msg)?;
                self.state = State::ClientAwaitChallenge;
                Ok(HandshakeStep::send(vec![reply]))
            }
            (State::ClientAwaitChallenge, Packet::CryptoAuthChallenge(msg)) => {
                self.challenge = msg.challenge;
                let response = self.build_auth_response(CLIENT_AUTH_TAG)?;
                self.state = State::ClientAwaitAuthOk;
                Ok(HandshakeStep::send(vec![Packet::CryptoAuthResponse(
                    CryptoAuthResponseMsg {
                        proof: response.0,
                        password_proof: response.1,
                    },
                )]))
            }
            (State::ClientAwaitAuthOk, Packet::CryptoAuthOk(msg)) => {
                self.verify_auth_proof(&msg.proof, msg.password_proof.as_ref(), SERVER_AUTH_TAG)?;
                self.state = State::ClientAwaitComplete;
                Ok(HandshakeStep::send(Vec::new()))
            }
            (State::ClientAwaitComplete, Packet::CryptoHandshakeComplete) => {
                let outcome = self.finish(true)?;
                self.state = State::Done;
                Ok(HandshakeStep::done(Vec::new(), outcome))
            }
            _ => Err(CryptoError::HandshakeViolation("unexpected packet for state")),
        }
    }

    fn accept_caps_ack(&mut self, ack: &CryptoCapabilitiesAckMsg) -> Result<(), CryptoError> {
        if matches!(ack.cipher, CipherSuite::Null) && !self.config.allow_null_cipher {
            return Err(CryptoError::EncryptionRequired);
        }
        if ack.password_bound != self.config.password.is_some() {
            return Err(CryptoError::PasswordRequired);
        }
        if matches!(ack.auth_mode, AuthMode::Ed25519)
            && (ack.identity_pubkey.is_none() || self.config.identity.is_none())
        {
            return Err(CryptoError::HandshakeViolation("ed25519 auth without identities"));
        }
        self.suite = ack.cipher;
        self.auth_mode = ack.auth_mode;
        self.session_id = ack.session_id;
        self.peer_identity = ack.identity_pubkey;
        Ok(())
    }

    fn exchange_keys_as_client(&mut self, msg: &CryptoPubkeyMsg) -> Result<Packet, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let our_pubkey = PublicKey::from(&ephemeral);
        let their_pubkey = PublicKey::from(msg.x25519_pubkey);
        let shared = ephemeral.diffie_hellman(&their_pubkey);
        self.install_shared(*shared.as_bytes())?;
        Ok(Packet::CryptoClientPubkey(CryptoPubkeyMsg {
            x25519_pubkey: *our_pubkey.as_bytes(),
        }))
    }

    // =========================================================================
    // SERVER
    // =========================================================================

    fn step_server(&mut self, packet: &Packet) -> Result<HandshakeStep, CryptoError> {
        match (&self.state, packet) {
            (State::ServerAwaitHello, Packet::CryptoClientHello(hello)) => {
                self.peer_identity = hello.identity_pubkey;
                self.state = State::ServerAwaitCaps;
                Ok(HandshakeStep::send(Vec::new()))
            }
            (State::ServerAwaitCaps, Packet::CryptoCapabilities(caps)) => self.negotiate(caps),
            (State::ServerAwaitClientPubkey, Packet::CryptoClientPubkey(msg)) => {
                let ephemeral = self
                    .ephemeral
                    .take()
                    .ok_or(CryptoError::HandshakeViolation("missing ephemeral"))?;
                let shared = ephemeral.diffie_hellman(&PublicKey::from(msg.x25519_pubkey));
                self.install_shared(*shared.as_bytes())?;

                OsRng.fill_bytes(&mut self.challenge);
                self.state = State::ServerAwaitAuthResponse;
                Ok(HandshakeStep::send(vec![Packet::CryptoAuthChallenge(
                    CryptoAuthChallengeMsg {
                        challenge: self.challenge,
                    },
                )]))
            }
            (State::ServerAwaitAuthResponse, Packet::CryptoAuthResponse(msg)) => {
                self.verify_auth_proof(&msg.proof, msg.password_proof.as_ref(), CLIENT_AUTH_TAG)?;
                let (proof, password_proof) = self.build_auth_response(SERVER_AUTH_TAG)?;
                let outcome = self.finish(false)?;
                self.state = State::Done;
                Ok(HandshakeStep::done(
                    vec![
                        Packet::CryptoAuthOk(CryptoAuthOkMsg {
                            proof,
                            password_proof,
                        }),
                        Packet::CryptoHandshakeComplete,
                    ],
                    outcome,
                ))
            }
            _ => Err(CryptoError::HandshakeViolation("unexpected packet for state")),
        }
    }

    fn negotiate(&mut self, caps: &CryptoCapabilitiesMsg) -> Result<HandshakeStep, CryptoError> {
        if caps.password_bound != self.config.password.is_some() {
            return Err(CryptoError::PasswordRequired);
        }
        let offers_real_cipher = caps.ciphers.contains(&CipherSuite::XSalsa20Poly1305);
        if !offers_real_cipher {
            // Peer can only run in the clear.
            if !self.config.allow_null_cipher || !caps.ciphers.contains(&CipherSuite::Null) {
                return Err(CryptoError::EncryptionRequired);
            }
            self.suite = CipherSuite::Null;
            self.state = State::Done;
            return Ok(HandshakeStep::done(
                vec![Packet::CryptoNoEncryption],
                self.null_outcome(),
            ));
        }

        self.suite = CipherSuite::XSalsa20Poly1305;
        self.auth_mode = if caps.auth_modes.contains(&AuthMode::Ed25519)
            && self.peer_identity.is_some()
            && self.config.identity.is_some()
        {
            AuthMode::Ed25519
        } else {
            AuthMode::Hmac
        };

        OsRng.fill_bytes(&mut self.session_id);
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let pubkey = PublicKey::from(&ephemeral);
        self.ephemeral = Some(ephemeral);

        self.state = State::ServerAwaitClientPubkey;
        Ok(HandshakeStep::send(vec![
            Packet::CryptoCapabilitiesAck(CryptoCapabilitiesAckMsg {
                identity_pubkey: self.local_identity_pubkey(),
                session_id: self.session_id,
                cipher: self.suite,
                auth_mode: self.auth_mode,
                password_bound: self.config.password.is_some(),
            }),
            Packet::CryptoServerPubkey(CryptoPubkeyMsg {
                x25519_pubkey: *pubkey.as_bytes(),
            }),
        ]))
    }

    // =========================================================================
    // SHARED HELPERS
    // =========================================================================

    fn install_shared(&mut self, shared: [u8; 32]) -> Result<(), CryptoError> {
        if let Some(password) = &self.config.password {
            self.password_key = Some(derive_password_key(password.as_bytes(), &self.session_id)?);
        }
        self.shared = Some(SecretKey(shared));
        Ok(())
    }

    fn shared(&self) -> Result<&SecretKey, CryptoError> {
        self.shared
            .as_ref()
            .ok_or(CryptoError::HandshakeViolation("no shared secret yet"))
    }

    /// Build `(proof, password_proof)` for the given direction tag.
    fn build_auth_response(&self, tag: &[u8]) -> Result<(Vec<u8>, Option<[u8; 32]>), CryptoError> {
        let shared = self.shared()?;
        let proof = match self.auth_mode {
            AuthMode::Ed25519 => {
                let identity = self
                    .config
                    .identity
                    .as_ref()
                    .ok_or(CryptoError::HandshakeViolation("ed25519 auth without a key"))?;
                let mut message = Vec::with_capacity(32 + 32 + tag.len());
                message.extend_from_slice(&self.challenge);
                message.extend_from_slice(shared.as_bytes());
                message.extend_from_slice(tag);
                identity.sign(&message)?.to_vec()
            }
            AuthMode::Hmac => auth_mac(shared.as_bytes(), &[&self.challenge, tag]).to_vec(),
        };

        let password_proof = self
            .password_key
            .as_ref()
            .map(|key| auth_mac(key.as_bytes(), &[&self.challenge, shared.as_bytes()]));
        Ok((proof, password_proof))
    }

    /// Verify the peer's proof for the given direction tag, including the
    /// password binding when one is configured. All comparisons are
    /// constant-time.
    fn verify_auth_proof(
        &self,
        proof: &[u8],
        password_proof: Option<&[u8; 32]>,
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        let shared = self.shared()?;
        match self.auth_mode {
            AuthMode::Ed25519 => {
                let pubkey = self
                    .peer_identity
                    .ok_or(CryptoError::HandshakeViolation("no peer identity"))?;
                let key = VerifyingKey::from_bytes(&pubkey).map_err(|_| CryptoError::BadSignature)?;
                let sig_bytes: [u8; 64] = proof.try_into().map_err(|_| CryptoError::BadSignature)?;
                let signature = Signature::from_bytes(&sig_bytes);
                let mut message = Vec::with_capacity(32 + 32 + tag.len());
                message.extend_from_slice(&self.challenge);
                message.extend_from_slice(shared.as_bytes());
                message.extend_from_slice(tag);
                key.verify(&message, &signature)
                    .map_err(|_| CryptoError::BadSignature)?;
            }
            AuthMode::Hmac => {
                let expected = auth_mac(shared.as_bytes(), &[&self.challenge, tag]);
                if !ct_eq(&expected, proof) {
                    return Err(CryptoError::BadSignature);
                }
            }
        }

        if let Some(key) = &self.password_key {
            let expected = auth_mac(key.as_bytes(), &[&self.challenge, shared.as_bytes()]);
            let Some(received) = password_proof else {
                return Err(CryptoError::PasswordRequired);
            };
            if !ct_eq(&expected, received) {
                return Err(CryptoError::BadSignature);
            }
        }
        Ok(())
    }

    fn finish(&mut self, is_client: bool) -> Result<HandshakeOutcome, CryptoError> {
        let shared = self.shared.take().ok_or(CryptoError::HandshakeViolation("no shared secret"))?;
        let keys = SessionKeys::derive(shared.as_bytes(), self.session_id, is_client);
        Ok(HandshakeOutcome {
            keys,
            suite: self.suite,
            auth_mode: self.auth_mode,
            peer_identity: self.peer_identity,
        })
    }

    fn null_outcome(&self) -> HandshakeOutcome {
        HandshakeOutcome {
            keys: SessionKeys {
                session_id: [0u8; 16],
                tx_key: [0u8; 32],
                rx_key: [0u8; 32],
            },
            suite: CipherSuite::Null,
            auth_mode: self.auth_mode,
            peer_identity: self.peer_identity,
        }
    }
}

/// Password-binding key: memory-hard KDF over the password, salted with
/// the session id so captured responses never transfer across sessions.
pub fn derive_password_key(password: &[u8], session_id: &[u8; 16]) -> Result<SecretKey, CryptoError> {
    super::memory_hard_kdf(password, session_id)
}

// =============================================================================
// TESTS
// =============================================================================
