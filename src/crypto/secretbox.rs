//! XSalsa20-Poly1305 secretbox, extended with associated data.
//!
//! The classic construction: the first 32 bytes of the XSalsa20
//! keystream key a one-time Poly1305, the message is encrypted with the
//! keystream from byte 32 onward, and the tag is appended to the
//! ciphertext. The tag covers `associated_data ‖ ciphertext`; with empty
//! associated data the bytes are exactly classic secretbox (modulo tag
//! placement). Callers bind fixed-width context only, so the
//! concatenation is unambiguous.

use super::{ct_eq, SecretKey};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::XSalsa20;
use zeroize::Zeroize;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

pub struct XSalsa20Poly1305 {
    key: SecretKey,
}

impl XSalsa20Poly1305 {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            key: SecretKey(*key),
        }
    }

    /// Split the keystream: a one-time MAC key from the first block, and
    /// the cipher positioned at byte 32 for the message itself.
    fn prepare(&self, nonce: &[u8; NONCE_SIZE]) -> (poly1305::Key, XSalsa20) {
        let mut cipher = XSalsa20::new(
            salsa20::Key::from_slice(self.key.as_bytes()),
            salsa20::XNonce::from_slice(nonce),
        );
        let mut mac_key = [0u8; 32];
        cipher.apply_keystream(&mut mac_key);
        let key = *poly1305::Key::from_slice(&mac_key);
        mac_key.zeroize();
        (key, cipher)
    }

    fn tag(mac_key: &poly1305::Key, aad: &[u8], ciphertext: &[u8]) -> poly1305::Tag {
        let mut mac_input = Vec::with_capacity(aad.len() + ciphertext.len());
        mac_input.extend_from_slice(aad);
        mac_input.extend_from_slice(ciphertext);
        Poly1305::new(mac_key).compute_unpadded(&mac_input)
    }

    /// Encrypt and authenticate. Returns `ciphertext ‖ tag(16)`.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let (mac_key, mut cipher) = self.prepare(nonce);

        let mut out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        out.extend_from_slice(plaintext);
        cipher.apply_keystream(&mut out);

        let tag = Self::tag(&mac_key, aad, &out);
        out.extend_from_slice(tag.as_slice());
        out
    }

    /// Verify (constant-time) and decrypt. `None` on any mismatch.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < TAG_SIZE {
            return None;
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
        let (mac_key, mut cipher) = self.prepare(nonce);

        let expected = Self::tag(&mac_key, aad, ciphertext);
        if !ct_eq(expected.as_slice(), tag) {
            return None;
        }

        let mut plaintext = ciphertext.to_vec();
        cipher.apply_keystream(&mut plaintext);
        Some(plaintext)
    }
}

// =============================================================================
// TESTS
// =============================================================================
