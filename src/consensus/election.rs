//! Host election: scoring, NAT-tier floor, migration hysteresis.

use super::ring::Ring;
use crate::types::{NetworkMetrics, Participant, ParticipantId};

/// Score weights. Upload dominates because the host mixes and fans out
/// every participant's video; latency and loss terms break near-ties.
const ALPHA_UPLOAD: f64 = 1.0;
const BETA_RTT: f64 = 0.01;
const GAMMA_LOSS: f64 = 0.5;

/// A relayed candidate must beat the best direct candidate by this factor
/// before it may host; relaying everyone's media through a relay is paid
/// for twice.
const RELAY_SCORE_FLOOR: f64 = 1.2;

/// Advantage a challenger needs over the sitting host before migration.
const MIGRATION_ADVANTAGE: f64 = 1.2;

/// Consecutive winning rounds before a migration is considered stable.
const MIGRATION_STABLE_ROUNDS: u32 = 2;

pub fn score(metrics: &NetworkMetrics) -> f64 {
    let rtt_ms = metrics.rtt_ms() as f64;
    ALPHA_UPLOAD * metrics.upload_kbps as f64
        + BETA_RTT * (10_000.0 - rtt_ms)
        + GAMMA_LOSS * (100.0 - metrics.loss_pct as f64)
}

fn scored(p: &Participant) -> Option<(ParticipantId, f64, bool)> {
    let metrics = p.metrics.as_ref()?;
    Some((p.participant_id, score(metrics), p.nat_tier.is_relayed()))
}

/// Election result for one round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectionResult {
    pub host: ParticipantId,
    pub host_score: f64,
    pub backup: Option<ParticipantId>,
}

/// Pick host and backup from the ring's current metrics.
///
/// Candidates without metrics are skipped. The NAT-tier floor keeps a
/// relay-bound candidate from winning on raw numbers alone: it must beat
/// the best non-relayed score by `RELAY_SCORE_FLOOR`.
pub fn elect(ring: &Ring) -> Option<ElectionResult> {
    let mut candidates: Vec<(ParticipantId, f64, bool)> =
        ring.participants().filter_map(scored).collect();
    if candidates.is_empty() {
        return None;
    }

    let best_direct = candidates
        .iter()
        .filter(|(_, _, relayed)| !relayed)
        .map(|(_, s, _)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    // Effective ordering: relayed candidates only rank by their raw score
    // if they clear the floor; otherwise they rank below every direct one.
    let effective = |(_, s, relayed): &(ParticipantId, f64, bool)| -> f64 {
        if *relayed && best_direct.is_finite() && *s < best_direct * RELAY_SCORE_FLOOR {
            f64::NEG_INFINITY
        } else {
            *s
        }
    };

    candidates.sort_by(|a, b| {
        effective(b)
            .partial_cmp(&effective(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            // Deterministic tie-break on id keeps every replica agreed.
            .then_with(|| a.0.cmp(&b.0))
    });

    let (host, host_score, _) = candidates[0];
    let backup = candidates.get(1).map(|(id, _, _)| *id);
    Some(ElectionResult {
        host,
        host_score,
        backup,
    })
}

/// Hysteresis for host migration: a challenger must win
/// `MIGRATION_STABLE_ROUNDS` consecutive elections with a
/// `MIGRATION_ADVANTAGE` score edge over the sitting host.
#[derive(Debug, Default)]
pub struct MigrationTracker {
    challenger: Option<ParticipantId>,
    consecutive_wins: u32,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one election outcome. Returns true when the challenger has
    /// earned the migration.
    pub fn observe(
        &mut self,
        result: &ElectionResult,
        current_host: ParticipantId,
        current_host_score: Option<f64>,
    ) -> bool {
        if result.host == current_host {
            self.challenger = None;
            self.consecutive_wins = 0;
            return false;
        }

        if self.challenger == Some(result.host) {
            self.consecutive_wins += 1;
        } else {
            self.challenger = Some(result.host);
            self.consecutive_wins = 1;
        }

        if self.consecutive_wins < MIGRATION_STABLE_ROUNDS {
            return false;
        }
        match current_host_score {
            Some(incumbent) => result.host_score >= incumbent * MIGRATION_ADVANTAGE,
            // Host has no metrics at all; any stable winner takes over.
            None => true,
        }
    }

    pub fn reset(&mut self) {
        self.challenger = None;
        self.consecutive_wins = 0;
    }
}
