//! Trust-on-first-use pinning of peer identity keys.
//!
//! One endpoint per line in `<config>/acip/known_hosts`:
//!
//! ```text
//! <host>[:port] x25519 <hex32> [comment...]
//! ```
//!
//! IPv6 endpoints use `[addr]:port`. Duplicate endpoints are a hard load
//! error: a file that disagrees with itself cannot be trusted.

use super::{ct_eq, fingerprint, CryptoError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Key-type token in the file format.
const KEY_TYPE: &str = "x25519";

/// Verdict of checking a peer key against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVerdict {
    /// Endpoint was unknown; the key has been pinned.
    PinnedFirstUse,
    /// Endpoint known and the key matches the pin.
    Match,
    /// Endpoint known but the key differs. Refuse unless overridden.
    Mismatch,
}

#[derive(Debug, Clone)]
struct Pin {
    pubkey: [u8; 32],
    comment: Option<String>,
}

/// The known-hosts store. Reads are cheap; every mutation rewrites the
/// file, serialized by `&mut self` (single writer).
#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    pins: BTreeMap<String, Pin>,
}

impl KnownHosts {
    /// Default location under the user's config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("acip")
            .join("known_hosts")
    }

    /// Load the store, creating an empty one if the file is absent.
    pub fn load(path: PathBuf) -> Result<Self, CryptoError> {
        let mut pins = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (endpoint, pin) = parse_line(line).map_err(|e| {
                        CryptoError::InvalidKey(format!("{path:?}:{}: {e}", line_no + 1))
                    })?;
                    if pins.insert(endpoint.clone(), pin).is_some() {
                        return Err(CryptoError::InvalidKey(format!(
                            "{path:?}:{}: duplicate entry for {endpoint}",
                            line_no + 1
                        )));
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path, pins })
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn lookup(&self, endpoint: &str) -> Option<[u8; 32]> {
        self.pins.get(endpoint).map(|p| p.pubkey)
    }

    /// TOFU check. First contact pins the key and persists immediately;
    /// later contacts compare in constant time.
    pub fn verify(&mut self, endpoint: &str, pubkey: &[u8; 32]) -> Result<PinVerdict, CryptoError> {
        match self.pins.get(endpoint) {
            None => {
                self.pins.insert(
                    endpoint.to_string(),
                    Pin {
                        pubkey: *pubkey,
                        comment: None,
                    },
                );
                self.persist()?;
                info!(
                    "Pinned new identity for {} ({})",
                    endpoint,
                    fingerprint(pubkey)
                );
                Ok(PinVerdict::PinnedFirstUse)
            }
            Some(pin) => {
                if ct_eq(&pin.pubkey, pubkey) {
                    Ok(PinVerdict::Match)
                } else {
                    Ok(PinVerdict::Mismatch)
                }
            }
        }
    }

    /// The fixed, unmistakable banner shown when a pinned key changed.
    pub fn mitm_banner(endpoint: &str, pinned: &[u8; 32], received: &[u8; 32]) {
        error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
        error!("@  WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED             @");
        error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
        error!("Someone could be eavesdropping on you right now");
        error!("(man-in-the-middle attack), or the host key was replaced.");
        error!("Endpoint:     {endpoint}");
        error!("Expected key: {}", fingerprint(pinned));
        error!("Received key: {}", fingerprint(received));
        error!("Remove the stale entry from the known_hosts file only if you");
        error!("have verified the new key out of band.");
    }

    /// Drop a pin. Manual intervention path, used by the CLI.
    pub fn remove(&mut self, endpoint: &str) -> Result<bool, CryptoError> {
        let removed = self.pins.remove(endpoint).is_some();
        if removed {
            self.persist()?;
            warn!("Removed pinned identity for {endpoint}");
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for (endpoint, pin) in &self.pins {
            out.push_str(endpoint);
            out.push(' ');
            out.push_str(KEY_TYPE);
            out.push(' ');
            out.push_str(&hex::encode(pin.pubkey));
            if let Some(comment) = &pin.comment {
                out.push(' ');
                out.push_str(comment);
            }
            out.push('\n');
        }
        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Result<(String, Pin), String> {
    let mut parts = line.split_whitespace();
    let endpoint = parts.next().ok_or("missing endpoint")?;
    validate_endpoint(endpoint)?;
    let key_type = parts.next().ok_or("missing key type")?;
    if key_type != KEY_TYPE {
        return Err(format!("unsupported key type {key_type}"));
    }
    let key_hex = parts.next().ok_or("missing key")?;
    let bytes = hex::decode(key_hex).map_err(|e| e.to_string())?;
    let pubkey: [u8; 32] = bytes.try_into().map_err(|_| "key must be 32 bytes")?;
    let comment: Vec<&str> = parts.collect();
    let comment = if comment.is_empty() {
        None
    } else {
        Some(comment.join(" "))
    };
    Ok((endpoint.to_string(), Pin { pubkey, comment }))
}

fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    if endpoint.is_empty() {
        return Err("empty endpoint".into());
    }
    // Bracketed IPv6 must close the bracket before any port suffix.
    if endpoint.starts_with('[') && !endpoint.contains(']') {
        return Err(format!("unterminated IPv6 bracket in {endpoint}"));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
