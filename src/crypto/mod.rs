//! Crypto engine: identity keys, handshake, session AEAD, known hosts.
//!
//! All long-term key material is owned here and crosses module boundaries
//! only as borrowed public values or zero-on-drop session keys.

pub mod handshake;
pub mod identity;
pub mod known_hosts;
pub mod secretbox;
pub mod session;

pub use handshake::{Handshake, HandshakeConfig, HandshakeOutcome, HandshakeRole, HandshakeStep};
pub use identity::{Identity, KeySource, LoadedKey};
pub use known_hosts::{KnownHosts, PinVerdict};
pub use session::{SessionCrypto, SessionKeys};

use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, Update};
use blake2::Blake2bMac;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad signature or MAC")]
    BadSignature,

    #[error("peer identity key changed for {endpoint}: pinned {pinned}, received {received}")]
    PeerKeyChanged {
        endpoint: String,
        pinned: String,
        received: String,
    },

    #[error("packet counter rolled back")]
    CounterRollback,

    #[error("replayed packet detected")]
    ReplayDetected,

    #[error("handshake timed out")]
    Timeout,

    #[error("policy requires encryption but peer offered none")]
    EncryptionRequired,

    #[error("policy requires a pinned peer identity")]
    PolicyRequiresPinning,

    #[error("session password required")]
    PasswordRequired,

    #[error("handshake protocol violation: {0}")]
    HandshakeViolation(&'static str),

    #[error("counter exhausted; rekey overdue")]
    CounterExhausted,

    #[error("aead failure")]
    Aead,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key source unavailable: {0}")]
    KeySource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// DERIVATION PRIMITIVES
// =============================================================================

/// 32-byte secret that wipes itself when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Argon2id cost parameters used everywhere a human secret becomes a key
/// (identity key at rest, session password binding): 64 MiB, 3 passes,
/// 1 lane.
pub const KDF_M_COST_KIB: u32 = 64 * 1024;
pub const KDF_T_COST: u32 = 3;
pub const KDF_P_COST: u32 = 1;

/// Memory-hard KDF: Argon2id with the parameters above.
pub fn memory_hard_kdf(secret: &[u8], salt: &[u8]) -> Result<SecretKey, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};
    let params = Params::new(KDF_M_COST_KIB, KDF_T_COST, KDF_P_COST, Some(32))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon
        .hash_password_into(secret, salt, &mut out)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(SecretKey(out))
}

/// Direction tags for the session KDF. Sixteen-byte BLAKE2b salts.
pub const DIR_CLIENT_TO_SERVER: &[u8; 16] = b"acip.dir.c-to-s\0";
pub const DIR_SERVER_TO_CLIENT: &[u8; 16] = b"acip.dir.s-to-c\0";

const KDF_PERSONA: &[u8; 16] = b"acip.session.kdf";

/// Derive one directional session key: keyed BLAKE2b over the session id,
/// keyed with the ECDH shared secret and salted with the direction tag.
pub fn derive_session_key(shared: &[u8; 32], session_id: &[u8; 16], direction: &[u8; 16]) -> SecretKey {
    let mut mac = Blake2bMac::<U32>::new_with_salt_and_personal(shared, direction, KDF_PERSONA)
        .expect("fixed-size KDF parameters");
    Update::update(&mut mac, session_id);
    let out = mac.finalize_fixed();
    SecretKey(out.into())
}

/// HMAC-SHA-256 over the concatenated parts. Used for the negotiated
/// HMAC auth-response mode and for password binding.
pub fn auth_mac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time equality for MACs and pinned keys.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Short hex fingerprint for logs and the MITM banner.
pub fn fingerprint(pubkey: &[u8]) -> String {
    let hexed = hex::encode(pubkey);
    let mut out = String::with_capacity(hexed.len() + hexed.len() / 4);
    for (i, chunk) in hexed.as_bytes().chunks(4).enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
    }
    out
}
