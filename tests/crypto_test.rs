//! Crypto engine integration: handshake liveness, MITM defeat, TOFU,
//! forward secrecy after rekey.

use acip::crypto::{
    CryptoError, Handshake, HandshakeConfig, HandshakeOutcome, HandshakeRole, Identity, KnownHosts,
    PinVerdict, SessionCrypto,
};
use acip::packet::{CipherSuite, Packet};
use std::sync::Arc;

fn config(identity: Option<Arc<Identity>>) -> HandshakeConfig {
    HandshakeConfig {
        identity,
        password: None,
        allow_null_cipher: false,
    }
}

/// Pump packets between two handshakes until both complete, recording
/// the full transcript of type ids.
fn complete(
    mut client: Handshake,
    mut server: Handshake,
) -> (HandshakeOutcome, HandshakeOutcome, Vec<u16>) {
    let mut transcript = Vec::new();
    let mut to_server = client.initiate().expect("initiate");
    let mut to_client: Vec<Packet> = Vec::new();
    let mut client_done = None;
    let mut server_done = None;

    for _ in 0..8 {
        for packet in to_server.drain(..) {
            transcript.push(packet.packet_type());
            let step = server.step(&packet).expect("server step");
            to_client.extend(step.send);
            if let Some(outcome) = step.outcome {
                server_done = Some(outcome);
            }
        }
        for packet in to_client.drain(..) {
            transcript.push(packet.packet_type());
            let step = client.step(&packet).expect("client step");
            to_server.extend(step.send);
            if let Some(outcome) = step.outcome {
                client_done = Some(outcome);
            }
        }
        if client_done.is_some() && server_done.is_some() {
            break;
        }
    }
    (
        client_done.expect("client finished"),
        server_done.expect("server finished"),
        transcript,
    )
}

#[test]
fn handshake_liveness_exact_sequence() {
    let client_id = Arc::new(Identity::generate());
    let server_id = Arc::new(Identity::generate());
    let (client, server, transcript) = complete(
        Handshake::new(HandshakeRole::Client, config(Some(client_id))),
        Handshake::new(HandshakeRole::Server, config(Some(server_id.clone()))),
    );

    // No extra and no omitted packets, in exactly this order.
    assert_eq!(transcript, [1000, 1100, 1101, 1102, 1103, 1104, 1105, 1107, 1108]);

    // Directional keys line up and the peer identity is the server's.
    assert_eq!(client.keys.tx_key, server.keys.rx_key);
    assert_eq!(client.keys.rx_key, server.keys.tx_key);
    assert_ne!(client.keys.tx_key, client.keys.rx_key);
    assert_eq!(client.peer_identity, Some(server_id.public_bytes()));
}

#[test]
fn sessions_from_independent_handshakes_interoperate() {
    let (client, server, _) = complete(
        Handshake::new(HandshakeRole::Client, config(None)),
        Handshake::new(HandshakeRole::Server, config(None)),
    );

    let mut tx = SessionCrypto::new(client.keys, CipherSuite::XSalsa20Poly1305, 64);
    let mut rx = SessionCrypto::new(server.keys, CipherSuite::XSalsa20Poly1305, 64);

    for i in 0u64..32 {
        let body = format!("frame {i}");
        let (counter, ct) = tx.seal(3000, body.as_bytes(), 1).unwrap();
        assert_eq!(counter, i);
        let (inner, plain) = rx.open(counter, &ct, 1).unwrap();
        assert_eq!(inner, 3000);
        assert_eq!(plain, body.as_bytes());
    }
}

#[test]
fn password_bound_mitm_is_defeated() {
    // Both victims share "hunter2". The attacker terminates the DH on
    // each leg but cannot forge the auth response: it binds the genuine
    // shared secret, which the attacker replaced.
    let password = || HandshakeConfig {
        identity: None,
        password: Some("hunter2".into()),
        allow_null_cipher: false,
    };
    let mut client = Handshake::new(HandshakeRole::Client, password());
    let mut server = Handshake::new(HandshakeRole::Server, password());

    let attacker_secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let attacker_pub = x25519_dalek::PublicKey::from(&attacker_secret);

    let mut to_server = client.initiate().unwrap();
    let mut to_client: Vec<Packet> = Vec::new();
    let mut failure = None;

    'outer: for _ in 0..8 {
        for packet in to_server.drain(..) {
            match server.step(&packet) {
                Ok(step) => to_client.extend(step.send),
                Err(e) => {
                    failure = Some(e);
                    break 'outer;
                }
            }
        }
        for packet in to_client.drain(..) {
            // The attacker swaps the server's ephemeral key.
            let delivered = match &packet {
                Packet::CryptoServerPubkey(_) => {
                    Packet::CryptoServerPubkey(acip::packet::CryptoPubkeyMsg {
                        x25519_pubkey: *attacker_pub.as_bytes(),
                    })
                }
                other => other.clone(),
            };
            match client.step(&delivered) {
                Ok(step) => to_server.extend(step.send),
                Err(e) => {
                    failure = Some(e);
                    break 'outer;
                }
            }
        }
    }

    assert!(matches!(failure, Some(CryptoError::BadSignature)));
}

#[test]
fn tofu_pins_then_detects_key_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut hosts = KnownHosts::load(dir.path().join("known_hosts")).unwrap();

    let original = Identity::generate().public_bytes();
    let replaced = Identity::generate().public_bytes();
    let endpoint = "198.51.100.7:9000";

    assert_eq!(
        hosts.verify(endpoint, &original).unwrap(),
        PinVerdict::PinnedFirstUse
    );
    // Second contact with the same key is silent.
    assert_eq!(hosts.verify(endpoint, &original).unwrap(), PinVerdict::Match);
    // A different key is the MITM signal (exit code 2 at the CLI).
    assert_eq!(hosts.verify(endpoint, &replaced).unwrap(), PinVerdict::Mismatch);
    // And the original pin is still what is on disk.
    let reloaded = KnownHosts::load(dir.path().join("known_hosts")).unwrap();
    assert_eq!(reloaded.lookup(endpoint), Some(original));
}

#[test]
fn rekey_provides_forward_secrecy_for_recorded_traffic() {
    let (client, server, _) = complete(
        Handshake::new(HandshakeRole::Client, config(None)),
        Handshake::new(HandshakeRole::Server, config(None)),
    );
    let session_id = client.keys.session_id;
    let mut tx = SessionCrypto::new(client.keys, CipherSuite::XSalsa20Poly1305, 64);
    let mut rx = SessionCrypto::new(server.keys, CipherSuite::XSalsa20Poly1305, 64);

    // The adversary records this ciphertext off the wire.
    let (recorded_counter, recorded) = tx.seal(2002, b"before rekey", 1).unwrap();
    rx.open(recorded_counter, &recorded, 1).unwrap();

    // Fresh ECDH, new keys installed on both sides.
    let eph_a = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let eph_b = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let pub_a = x25519_dalek::PublicKey::from(&eph_a);
    let pub_b = x25519_dalek::PublicKey::from(&eph_b);
    let shared_a = eph_a.diffie_hellman(&pub_b);
    let shared_b = eph_b.diffie_hellman(&pub_a);
    tx.install_rekeyed(acip::crypto::SessionKeys::derive(
        shared_a.as_bytes(),
        session_id,
        true,
    ));
    rx.install_rekeyed(acip::crypto::SessionKeys::derive(
        shared_b.as_bytes(),
        session_id,
        false,
    ));

    // First packet under the new keys retires the old receive set.
    let (c, ct) = tx.seal(2002, b"after rekey", 1).unwrap();
    rx.open(c, &ct, 1).unwrap();

    // The recorded ciphertext is now undecryptable by either endpoint:
    // the keys that sealed it were zeroized, and nothing derivable from
    // the current state or the long-term identity recovers them.
    assert!(rx.open(recorded_counter, &recorded, 1).is_err());
}

#[test]
fn null_cipher_is_refused_unless_policy_allows() {
    let strict = Handshake::new(HandshakeRole::Client, config(None));
    let mut strict = strict;
    strict.initiate().unwrap();
    let err = strict.step(&Packet::CryptoNoEncryption).unwrap_err();
    assert!(matches!(err, CryptoError::EncryptionRequired));

    let mut permissive = Handshake::new(
        HandshakeRole::Client,
        HandshakeConfig {
            identity: None,
            password: None,
            allow_null_cipher: true,
        },
    );
    permissive.initiate().unwrap();
    let step = permissive.step(&Packet::CryptoNoEncryption).unwrap();
    assert!(matches!(
        step.outcome.map(|o| o.suite),
        Some(CipherSuite::Null)
    ));
}
