//! Ring consensus scenarios: election, agreement, migration, failover.

use acip::consensus::{ConsensusAction, ConsensusConfig, ConsensusEngine};
use acip::packet::{HostDesignatedMsg, HostLostMsg, NetworkQualityMsg, Packet, ParticipantListMsg};
use acip::types::{NatTier, NetworkMetrics, Participant, ParticipantId};
use std::time::{Duration, Instant};

fn pid(b: u8) -> ParticipantId {
    ParticipantId([b; 16])
}

fn metrics(upload_kbps: u64) -> NetworkMetrics {
    NetworkMetrics {
        upload_kbps,
        rtt_ns: 20_000_000,
        jitter_ns: 500_000,
        loss_pct: 0.0,
        measurement_time_ns: acip::types::now_ns(),
        measurement_window_ns: 5_000_000_000,
    }
}

fn list(ids: &[u8], epoch: u64) -> ParticipantListMsg {
    ParticipantListMsg {
        session_id: [0u8; 16],
        epoch,
        ring: ids
            .iter()
            .map(|b| Participant::new(pid(*b), NatTier::PublicIp))
            .collect(),
    }
}

fn coordinator(self_id: u8) -> ConsensusEngine {
    ConsensusEngine::new(ConsensusConfig::coordinator(
        pid(self_id),
        Duration::from_secs(5),
    ))
}

fn participant(self_id: u8) -> ConsensusEngine {
    ConsensusEngine::new(ConsensusConfig::participant(
        pid(self_id),
        Duration::from_secs(5),
    ))
}

/// Drive one complete collection round on the coordinator.
fn run_round(
    engine: &mut ConsensusEngine,
    now: Instant,
    uploads: &[(u8, u64)],
) -> Vec<ConsensusAction> {
    let mut actions = engine.poll(now);
    let round = match actions.first() {
        Some(ConsensusAction::Send {
            packet: Packet::RingCollect(msg),
            ..
        }) => msg.round,
        other => panic!("expected the collection token, got {other:?}"),
    };
    for (b, upload) in uploads {
        actions.extend(engine.on_network_quality(
            &NetworkQualityMsg {
                participant_id: pid(*b),
                round,
                metrics: metrics(*upload),
            },
            now,
        ));
    }
    actions
}

fn designated(actions: &[ConsensusAction]) -> Option<HostDesignatedMsg> {
    actions.iter().find_map(|a| match a {
        ConsensusAction::Broadcast(Packet::HostDesignated(msg)) => Some(msg.clone()),
        _ => None,
    })
}

#[test]
fn three_participants_elect_b_with_backup_a() {
    // IDs A < B < C, uploads 1000 / 5000 / 800, all public.
    let mut engine = coordinator(0);
    engine.on_participant_list(&list(&[1, 2, 3], 1));

    let actions = run_round(&mut engine, Instant::now(), &[(1, 1000), (2, 5000), (3, 800)]);
    let msg = designated(&actions).expect("designation");
    assert_eq!(msg.host, pid(2));
    assert_eq!(msg.backup, Some(pid(1)));
}

#[test]
fn all_replicas_agree_within_one_round() {
    // 64 participants: the coordinator elects once, every replica that
    // applies the broadcast lands on the same (host, backup).
    let ids: Vec<u8> = (1..=64).collect();
    let mut engine = coordinator(0);
    engine.on_participant_list(&list(&ids, 1));

    let uploads: Vec<(u8, u64)> = ids.iter().map(|b| (*b, 100 * *b as u64)).collect();
    let actions = run_round(&mut engine, Instant::now(), &uploads);
    let msg = designated(&actions).expect("designation");
    assert_eq!(msg.host, pid(64));
    assert_eq!(msg.backup, Some(pid(63)));

    let mut replicas: Vec<ConsensusEngine> = ids.iter().map(|b| participant(*b)).collect();
    for replica in replicas.iter_mut() {
        replica.on_participant_list(&list(&ids, 1));
        replica.on_host_designated(&msg);
        assert_eq!(replica.host(), Some(pid(64)));
        assert_eq!(replica.backup(), Some(pid(63)));
    }
}

#[test]
fn migration_after_two_stable_rounds() {
    let mut engine = coordinator(0);
    engine.on_participant_list(&list(&[1, 2, 3], 1));
    let mut now = Instant::now();

    let actions = run_round(&mut engine, now, &[(1, 1000), (2, 5000), (3, 800)]);
    assert_eq!(designated(&actions).unwrap().host, pid(2));

    // C rises to 6200 for two consecutive rounds; only the second round
    // triggers the migration, and no crypto re-handshake is implied.
    now += Duration::from_secs(10);
    let actions = run_round(&mut engine, now, &[(1, 1000), (2, 5000), (3, 6200)]);
    assert!(designated(&actions).is_none());

    now += Duration::from_secs(10);
    let actions = run_round(&mut engine, now, &[(1, 1000), (2, 5000), (3, 6200)]);
    let msg = designated(&actions).expect("migration designation");
    assert_eq!(msg.host, pid(3));
    assert_eq!(engine.host(), Some(pid(3)));
}

#[test]
fn failover_to_backup_within_budget_and_without_discovery() {
    // B hosts with backup A. B dies; A and C observe the loss. Quorum is
    // ⌈3/2⌉ = 2, and the whole thing resolves inside the 500 ms window
    // with no discovery traffic at all.
    let mut replica_a = participant(1);
    let mut replica_c = participant(3);
    for replica in [&mut replica_a, &mut replica_c] {
        replica.on_participant_list(&list(&[1, 2, 3], 1));
        replica.on_host_designated(&HostDesignatedMsg {
            epoch: 1,
            host: pid(2),
            backup: Some(pid(1)),
        });
    }

    let t0 = Instant::now();

    // A notices first and broadcasts; C does the same 80 ms later.
    let a_actions = replica_a.report_host_lost(t0);
    let a_report = a_actions
        .iter()
        .find_map(|a| match a {
            ConsensusAction::Broadcast(Packet::HostLost(msg)) => Some(msg.clone()),
            _ => None,
        })
        .expect("loss broadcast");

    let c_actions = replica_c.report_host_lost(t0 + Duration::from_millis(80));
    let c_report = c_actions
        .iter()
        .find_map(|a| match a {
            ConsensusAction::Broadcast(Packet::HostLost(msg)) => Some(msg.clone()),
            _ => None,
        })
        .expect("loss broadcast");

    // Cross-deliver the reports.
    let a_after = replica_a.on_host_lost(&c_report, t0 + Duration::from_millis(120));
    let c_after = replica_c.on_host_lost(&a_report, t0 + Duration::from_millis(120));

    for (name, actions, engine) in [
        ("A", &a_after, &replica_a),
        ("C", &c_after, &replica_c),
    ] {
        let changed = actions.iter().find_map(|a| match a {
            ConsensusAction::HostChanged { host, failover, .. } => Some((*host, *failover)),
            _ => None,
        });
        assert_eq!(changed, Some((pid(1), true)), "replica {name}");
        assert_eq!(engine.host(), Some(pid(1)), "replica {name}");
        // Nothing in the action stream asks for a discovery query; the
        // stored backup was enough.
        for action in actions.iter() {
            if let ConsensusAction::Broadcast(packet) = action {
                assert!(
                    !matches!(packet.packet_type(), 6000..=6013),
                    "replica {name} queried discovery during failover"
                );
            }
        }
    }
    assert!(replica_a.is_self_host());
    assert!(t0.elapsed() < Duration::from_millis(500));
}

#[test]
fn relayed_candidate_held_to_floor_in_full_round() {
    let mut engine = coordinator(0);
    let mut msg = list(&[1, 2], 1);
    msg.ring[1] = Participant::new(pid(2), NatTier::TurnRelay);
    engine.on_participant_list(&msg);

    // Relay has better raw numbers but under 120% of the best direct.
    let actions = run_round(&mut engine, Instant::now(), &[(1, 10_000), (2, 11_000)]);
    assert_eq!(designated(&actions).unwrap().host, pid(1));
}

#[test]
fn dead_host_reports_after_designation_are_ignored() {
    let mut engine = participant(1);
    engine.on_participant_list(&list(&[1, 2, 3], 1));
    engine.on_host_designated(&HostDesignatedMsg {
        epoch: 1,
        host: pid(2),
        backup: Some(pid(1)),
    });

    // A report claiming to come from the host itself does not count.
    let now = Instant::now();
    let actions = engine.on_host_lost(
        &HostLostMsg {
            reporter: pid(2),
            last_seen_ns: 0,
        },
        now,
    );
    assert!(actions.is_empty());
    assert_eq!(engine.host(), Some(pid(2)));
}
