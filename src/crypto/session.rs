//! Per-session AEAD state: nonce discipline, replay protection, rekeying.

use super::secretbox::XSalsa20Poly1305;
use super::{derive_session_key, CryptoError, SecretKey, DIR_CLIENT_TO_SERVER, DIR_SERVER_TO_CLIENT};
use crate::codec::PACKET_MAGIC;
use crate::packet::CipherSuite;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Refuse to send once the counter gets this close to 2^63; the session
/// must rekey long before, this is the hard stop.
const COUNTER_HARD_LIMIT: u64 = 1 << 63;

/// The symmetric state both sides hold after a completed handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub session_id: [u8; 16],
    pub tx_key: [u8; 32],
    pub rx_key: [u8; 32],
}

impl SessionKeys {
    /// Derive directional keys from the ECDH shared secret. `is_client`
    /// decides which direction tag feeds which key.
    pub fn derive(shared: &[u8; 32], session_id: [u8; 16], is_client: bool) -> Self {
        let c2s = derive_session_key(shared, &session_id, DIR_CLIENT_TO_SERVER);
        let s2c = derive_session_key(shared, &session_id, DIR_SERVER_TO_CLIENT);
        let (tx, rx) = if is_client { (&c2s, &s2c) } else { (&s2c, &c2s) };
        Self {
            session_id,
            tx_key: tx.0,
            rx_key: rx.0,
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKeys(session_id={})", hex::encode(self.session_id))
    }
}

// =============================================================================
// ANTI-REPLAY WINDOW
// =============================================================================

/// Sliding bitmap over received counters (RFC 6479 shape). Counters below
/// the window are a rollback; counters inside the window replay-check
/// against the bitmap.
struct ReplayWindow {
    /// Highest counter accepted so far; u64::MAX means none yet.
    highest: u64,
    bits: Vec<u64>,
    window: u64,
}

impl ReplayWindow {
    fn new(window: u64) -> Self {
        let blocks = (window as usize).div_ceil(64);
        Self {
            highest: u64::MAX,
            bits: vec![0; blocks],
            window: blocks as u64 * 64,
        }
    }

    fn check_and_update(&mut self, counter: u64) -> Result<(), CryptoError> {
        if self.highest == u64::MAX {
            self.highest = counter;
            self.set_bit(counter);
            return Ok(());
        }

        if counter > self.highest {
            let advance = counter - self.highest;
            if advance >= self.window {
                for b in self.bits.iter_mut() {
                    *b = 0;
                }
            } else {
                for c in (self.highest + 1)..=counter {
                    self.clear_bit(c);
                }
            }
            self.highest = counter;
            self.set_bit(counter);
            return Ok(());
        }

        let age = self.highest - counter;
        if age >= self.window {
            return Err(CryptoError::CounterRollback);
        }
        if self.is_set(counter) {
            return Err(CryptoError::ReplayDetected);
        }
        self.set_bit(counter);
        Ok(())
    }

    fn bit_index(&self, counter: u64) -> (usize, u64) {
        let slot = counter % self.window;
        ((slot / 64) as usize, slot % 64)
    }

    fn set_bit(&mut self, counter: u64) {
        let (block, bit) = self.bit_index(counter);
        self.bits[block] |= 1 << bit;
    }

    fn clear_bit(&mut self, counter: u64) {
        let (block, bit) = self.bit_index(counter);
        self.bits[block] &= !(1 << bit);
    }

    fn is_set(&self, counter: u64) -> bool {
        let (block, bit) = self.bit_index(counter);
        self.bits[block] & (1 << bit) != 0
    }
}

// =============================================================================
// SESSION CRYPTO
// =============================================================================

struct DirectionState {
    cipher: Option<XSalsa20Poly1305>,
    key: SecretKey,
}

impl DirectionState {
    fn new(key: [u8; 32], suite: CipherSuite) -> Self {
        let cipher = match suite {
            CipherSuite::XSalsa20Poly1305 => Some(XSalsa20Poly1305::new(&key)),
            CipherSuite::Null => None,
        };
        Self {
            cipher,
            key: SecretKey(key),
        }
    }
}

/// Superseded key set kept alive until the first inbound packet under the
/// new keys verifies, so packets in flight at rekey time still decrypt.
struct PreviousKeys {
    rx: DirectionState,
    replay: ReplayWindow,
}

/// Owns everything needed to seal and open packets for one session.
pub struct SessionCrypto {
    suite: CipherSuite,
    session_id: [u8; 16],
    tx: DirectionState,
    rx: DirectionState,
    tx_counter: u64,
    replay: ReplayWindow,
    prev: Option<PreviousKeys>,
    replay_window: u64,
    /// Payload bytes sealed since the last rekey, for the policy trigger.
    pub bytes_since_rekey: u64,
}

impl SessionCrypto {
    pub fn new(keys: SessionKeys, suite: CipherSuite, replay_window: u64) -> Self {
        Self {
            suite,
            session_id: keys.session_id,
            tx: DirectionState::new(keys.tx_key, suite),
            rx: DirectionState::new(keys.rx_key, suite),
            tx_counter: 0,
            replay: ReplayWindow::new(replay_window),
            prev: None,
            replay_window,
            bytes_since_rekey: 0,
        }
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn is_null(&self) -> bool {
        matches!(self.suite, CipherSuite::Null)
    }

    pub fn session_id(&self) -> &[u8; 16] {
        &self.session_id
    }

    pub fn tx_counter(&self) -> u64 {
        self.tx_counter
    }

    /// True once the counter is within one rekey period of the hard stop.
    pub fn counter_near_exhaustion(&self) -> bool {
        self.tx_counter >= COUNTER_HARD_LIMIT - (1 << 20)
    }

    fn nonce(&self, counter: u64) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..16].copy_from_slice(&self.session_id);
        nonce[16..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Associated data for the encrypted envelope: the outer header fields
    /// that are fixed before encryption (magic, envelope type, source id).
    pub fn envelope_aad(source_id: u32) -> [u8; 14] {
        let mut aad = [0u8; 14];
        aad[..8].copy_from_slice(&PACKET_MAGIC.to_be_bytes());
        aad[8..10].copy_from_slice(&1200u16.to_be_bytes());
        aad[10..].copy_from_slice(&source_id.to_be_bytes());
        aad
    }

    /// Seal an inner packet (`type_be(2) || body`) and return the envelope
    /// counter plus ciphertext. Counters are strictly monotonic; reuse is
    /// structurally impossible.
    pub fn seal(&mut self, inner_type: u16, body: &[u8], source_id: u32) -> Result<(u64, Vec<u8>), CryptoError> {
        if self.tx_counter >= COUNTER_HARD_LIMIT {
            return Err(CryptoError::CounterExhausted);
        }
        let counter = self.tx_counter;
        self.tx_counter += 1;
        self.bytes_since_rekey += body.len() as u64;

        let mut plaintext = Vec::with_capacity(2 + body.len());
        plaintext.extend_from_slice(&inner_type.to_be_bytes());
        plaintext.extend_from_slice(body);

        let Some(cipher) = &self.tx.cipher else {
            return Ok((counter, plaintext));
        };

        let nonce = self.nonce(counter);
        let aad = Self::envelope_aad(source_id);
        let ciphertext = cipher.seal(&nonce, &aad, &plaintext);
        Ok((counter, ciphertext))
    }

    /// Open an envelope and return `(inner_type, body)`. Falls back to the
    /// pre-rekey keys for packets that were in flight when the keys
    /// changed; the first packet that verifies under the current keys
    /// retires the old set.
    pub fn open(&mut self, counter: u64, ciphertext: &[u8], source_id: u32) -> Result<(u16, Vec<u8>), CryptoError> {
        let plaintext = if self.rx.cipher.is_some() {
            let nonce = self.nonce(counter);
            let aad = Self::envelope_aad(source_id);
            match Self::try_open(&self.rx, &nonce, ciphertext, &aad) {
                Some(pt) => {
                    self.replay.check_and_update(counter)?;
                    self.retire_previous();
                    pt
                }
                None => {
                    let prev = self.prev.as_mut().ok_or(CryptoError::BadSignature)?;
                    let pt = Self::try_open(&prev.rx, &nonce, ciphertext, &aad).ok_or(CryptoError::BadSignature)?;
                    prev.replay.check_and_update(counter)?;
                    pt
                }
            }
        } else {
            self.replay.check_and_update(counter)?;
            ciphertext.to_vec()
        };

        if plaintext.len() < 2 {
            return Err(CryptoError::Aead);
        }
        let inner_type = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        Ok((inner_type, plaintext[2..].to_vec()))
    }

    fn try_open(dir: &DirectionState, nonce: &[u8; 24], ciphertext: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        dir.cipher.as_ref()?.open(nonce, aad, ciphertext)
    }

    /// Install freshly derived keys, keeping the old receive state as a
    /// fallback. Transmit switches over immediately and the counter
    /// restarts under the new keys.
    pub fn install_rekeyed(&mut self, keys: SessionKeys) {
        let old_rx = std::mem::replace(&mut self.rx, DirectionState::new(keys.rx_key, self.suite));
        let old_replay = std::mem::replace(&mut self.replay, ReplayWindow::new(self.replay_window));
        self.prev = Some(PreviousKeys {
            rx: old_rx,
            replay: old_replay,
        });
        self.tx = DirectionState::new(keys.tx_key, self.suite);
        self.tx_counter = 0;
        self.bytes_since_rekey = 0;
    }

    /// Drop the superseded key set and wipe it.
    fn retire_previous(&mut self) {
        if let Some(mut prev) = self.prev.take() {
            prev.rx.key.zeroize();
        }
    }

    /// Whether the pre-rekey keys are still being held.
    pub fn has_previous_keys(&self) -> bool {
        self.prev.is_some()
    }
}

impl Drop for SessionCrypto {
    fn drop(&mut self) {
        self.tx.key.zeroize();
        self.rx.key.zeroize();
        self.retire_previous();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionCrypto, SessionCrypto) {
        let shared = [42u8; 32];
        let session_id = [5u8; 16];
        let client = SessionKeys::derive(&shared, session_id, true);
        let server = SessionKeys::derive(&shared, session_id, false);
        (
            SessionCrypto::new(client, CipherSuite::XSalsa20Poly1305, 64),
            SessionCrypto::new(server, CipherSuite::XSalsa20Poly1305, 64),
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let (mut client, mut server) = pair();
        let (counter, ct) = client.seal(3000, b"frame bytes", 4).unwrap();
        assert_eq!(counter, 0);
        let (inner_type, body) = server.open(counter, &ct, 4).unwrap();
        assert_eq!(inner_type, 3000);
        assert_eq!(body, b"frame bytes");
    }

    #[test]
    fn counters_strictly_monotonic() {
        let (mut client, _) = pair();
        for expected in 0..16 {
            let (counter, _) = client.seal(5001, b"", 1).unwrap();
            assert_eq!(counter, expected);
        }
    }

    #[test]
    fn replay_is_rejected() {
        let (mut client, mut server) = pair();
        let (counter, ct) = client.seal(2002, b"hi", 1).unwrap();
        server.open(counter, &ct, 1).unwrap();
        assert!(matches!(
            server.open(counter, &ct, 1),
            Err(CryptoError::ReplayDetected)
        ));
    }

    #[test]
    fn rollback_below_window_is_rejected() {
        let (mut client, mut server) = pair();
        let mut packets = Vec::new();
        for _ in 0..100 {
            packets.push(client.seal(2002, b"x", 1).unwrap());
        }
        // Deliver the most recent one, then one far below the window.
        let (c, ct) = &packets[99];
        server.open(*c, ct, 1).unwrap();
        let (c, ct) = &packets[0];
        assert!(matches!(
            server.open(*c, ct, 1),
            Err(CryptoError::CounterRollback)
        ));
    }

    #[test]
    fn reordering_within_window_is_accepted() {
        let (mut client, mut server) = pair();
        let a = client.seal(2002, b"a", 1).unwrap();
        let b = client.seal(2002, b"b", 1).unwrap();
        server.open(b.0, &b.1, 1).unwrap();
        let (t, body) = server.open(a.0, &a.1, 1).unwrap();
        assert_eq!((t, body.as_slice()), (2002, b"a".as_slice()));
    }

    #[test]
    fn tampered_aad_fails() {
        let (mut client, mut server) = pair();
        let (counter, ct) = client.seal(2002, b"hi", 1).unwrap();
        // Same ciphertext presented with a different claimed source id.
        assert!(matches!(server.open(counter, &ct, 2), Err(CryptoError::BadSignature)));
    }

    #[test]
    fn wrong_key_fails() {
        let (mut client, _) = pair();
        let shared = [43u8; 32];
        let other = SessionKeys::derive(&shared, [5u8; 16], false);
        let mut other = SessionCrypto::new(other, CipherSuite::XSalsa20Poly1305, 64);
        let (counter, ct) = client.seal(2002, b"hi", 1).unwrap();
        assert!(other.open(counter, &ct, 1).is_err());
    }

    #[test]
    fn rekey_keeps_old_keys_until_new_traffic_verifies() {
        let (mut client, mut server) = pair();

        // A packet sealed under the old keys, still in flight.
        let in_flight = client.seal(2002, b"old", 1).unwrap();

        let shared2 = [99u8; 32];
        let session_id = *client.session_id();
        client.install_rekeyed(SessionKeys::derive(&shared2, session_id, true));
        server.install_rekeyed(SessionKeys::derive(&shared2, session_id, false));
        assert!(server.has_previous_keys());

        // Old-key packet opens through the fallback path.
        let (t, body) = server.open(in_flight.0, &in_flight.1, 1).unwrap();
        assert_eq!((t, body.as_slice()), (2002, b"old".as_slice()));
        assert!(server.has_previous_keys());

        // First new-key packet retires the fallback.
        let fresh = client.seal(2002, b"new", 1).unwrap();
        assert_eq!(fresh.0, 0);
        server.open(fresh.0, &fresh.1, 1).unwrap();
        assert!(!server.has_previous_keys());

        // Replaying the old-key packet now fails outright.
        assert!(server.open(in_flight.0, &in_flight.1, 1).is_err());
    }

    #[test]
    fn null_suite_passes_through_with_counters() {
        let keys = SessionKeys {
            session_id: [0u8; 16],
            tx_key: [0u8; 32],
            rx_key: [0u8; 32],
        };
        let mut a = SessionCrypto::new(keys, CipherSuite::Null, 64);
        let (counter, ct) = a.seal(2002, b"clear", 1).unwrap();
        assert_eq!(&ct[2..], b"clear");

        let keys = SessionKeys {
            session_id: [0u8; 16],
            tx_key: [0u8; 32],
            rx_key: [0u8; 32],
        };
        let mut b = SessionCrypto::new(keys, CipherSuite::Null, 64);
        let (t, body) = b.open(counter, &ct, 1).unwrap();
        assert_eq!((t, body.as_slice()), (2002, b"clear".as_slice()));
    }
}
