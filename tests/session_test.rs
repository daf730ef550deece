//! End-to-end session tests over real sockets: the happy path, frame
//! delivery latency, and rekey under live traffic.

use acip::crypto::{HandshakeConfig, HandshakeRole};
use acip::media::AsciiFrame;
use acip::net::{run_connection, Connection, ConnectionConfig, SessionEvent, Transport};
use acip::packet::{Packet, TextMessageMsg};
use acip::policy::Policy;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn config(endpoint: &str, policy: Policy) -> ConnectionConfig {
    ConnectionConfig {
        policy,
        handshake: HandshakeConfig {
            identity: None,
            password: None,
            allow_null_cipher: false,
        },
        known_hosts: None,
        endpoint: endpoint.into(),
        local_id: 1,
    }
}

struct Peer {
    outbound: mpsc::Sender<Packet>,
    events: mpsc::Receiver<SessionEvent>,
}

/// Spin up a connected client/server pair over loopback TCP.
async fn live_pair(policy: Policy) -> (Peer, Peer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_policy = policy.clone();
    let server = tokio::spawn(async move {
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let transport = Transport::direct(stream).unwrap();
        let conn = Connection::new(
            HandshakeRole::Server,
            config(&peer_addr.to_string(), server_policy),
            Instant::now(),
        );
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(run_connection(conn, transport, outbound_rx, event_tx));
        Peer {
            outbound: outbound_tx,
            events: event_rx,
        }
    });

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let transport = Transport::direct(stream).unwrap();
    let conn = Connection::new(
        HandshakeRole::Client,
        config(&addr.to_string(), policy),
        Instant::now(),
    );
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    tokio::spawn(run_connection(conn, transport, outbound_rx, event_tx));

    let client = Peer {
        outbound: outbound_tx,
        events: event_rx,
    };
    (client, server.await.unwrap())
}

async fn wait_established(peer: &mut Peer) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), peer.events.recv())
            .await
            .expect("established in time")
            .expect("events open")
        {
            SessionEvent::Established { .. } => return,
            SessionEvent::Closed => panic!("closed before established"),
            _ => {}
        }
    }
}

async fn next_app(peer: &mut Peer, budget: Duration) -> Packet {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, peer.events.recv())
            .await
            .expect("packet in time")
            .expect("events open")
        {
            SessionEvent::App(packet) => return packet,
            SessionEvent::Closed => panic!("session closed while waiting"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn happy_path_first_frame_within_500ms() {
    let (mut client, mut server) = live_pair(Policy::default()).await;
    wait_established(&mut client).await;
    wait_established(&mut server).await;

    // Server pushes the first rendered frame; the client must see it
    // within the 500 ms freshness budget.
    let sent_at = Instant::now();
    server
        .outbound
        .send(Packet::AsciiFrame(AsciiFrame {
            width: 80,
            height: 24,
            ansi_bytes: b"\x1b[2J\x1b[H*".to_vec(),
        }))
        .await
        .unwrap();

    let packet = next_app(&mut client, Duration::from_millis(500)).await;
    assert!(sent_at.elapsed() < Duration::from_millis(500));
    match packet {
        Packet::AsciiFrame(frame) => assert_eq!(frame.width, 80),
        other => panic!("expected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn bidirectional_traffic_flows_encrypted() {
    let (mut client, mut server) = live_pair(Policy::default()).await;
    wait_established(&mut client).await;
    wait_established(&mut server).await;

    for i in 0..16 {
        client
            .outbound
            .send(Packet::TextMessage(TextMessageMsg {
                text: format!("c{i}"),
            }))
            .await
            .unwrap();
        let got = next_app(&mut server, Duration::from_secs(2)).await;
        assert_eq!(
            got,
            Packet::TextMessage(TextMessageMsg {
                text: format!("c{i}")
            })
        );

        server
            .outbound
            .send(Packet::TextMessage(TextMessageMsg {
                text: format!("s{i}"),
            }))
            .await
            .unwrap();
        let got = next_app(&mut client, Duration::from_secs(2)).await;
        assert_eq!(
            got,
            Packet::TextMessage(TextMessageMsg {
                text: format!("s{i}")
            })
        );
    }
}

#[tokio::test]
async fn rekey_mid_stream_loses_nothing() {
    // An aggressive byte budget forces a rekey between the two frame
    // bursts without any test hook into the connection.
    let policy = Policy {
        rekey_bytes: 64,
        ..Policy::default()
    };
    let (mut client, mut server) = live_pair(policy).await;
    wait_established(&mut client).await;
    wait_established(&mut server).await;

    // 64 frames, a pause long enough for the timer task to trigger the
    // rekey, then 64 more.
    for i in 0..64 {
        client
            .outbound
            .send(Packet::AsciiFrame(AsciiFrame {
                width: 80,
                height: 24,
                ansi_bytes: format!("frame-{i:03}").into_bytes(),
            }))
            .await
            .unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..64 {
        if let Packet::AsciiFrame(f) = next_app(&mut server, Duration::from_secs(5)).await {
            seen.push(String::from_utf8(f.ansi_bytes).unwrap());
        }
    }

    // Give the 1 s tick a chance to run the rekey.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    for i in 64..128 {
        client
            .outbound
            .send(Packet::AsciiFrame(AsciiFrame {
                width: 80,
                height: 24,
                ansi_bytes: format!("frame-{i:03}").into_bytes(),
            }))
            .await
            .unwrap();
    }
    for _ in 0..64 {
        if let Packet::AsciiFrame(f) = next_app(&mut server, Duration::from_secs(5)).await {
            seen.push(String::from_utf8(f.ansi_bytes).unwrap());
        }
    }

    // No loss, no duplication, in order.
    assert_eq!(seen.len(), 128);
    for (i, name) in seen.iter().enumerate() {
        assert_eq!(name, &format!("frame-{i:03}"));
    }
}

#[tokio::test]
async fn orderly_leave_reaches_the_peer() {
    let (mut client, mut server) = live_pair(Policy::default()).await;
    wait_established(&mut client).await;
    wait_established(&mut server).await;

    // Dropping the outbound queue triggers the best-effort CLIENT_LEAVE.
    drop(client.outbound);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, server.events.recv()).await {
            Ok(Some(SessionEvent::Closed)) | Ok(None) => return,
            Ok(Some(_)) => {}
            Err(_) => panic!("peer never observed the leave"),
        }
    }
}
