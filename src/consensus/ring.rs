//! The participant ring and per-round metric collection.

use crate::types::{NetworkMetrics, Participant, ParticipantId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Replica of the coordinator's participant list. The BTreeMap keeps the
/// ring in lexicographic id order, which is the collection topology.
#[derive(Debug, Default)]
pub struct Ring {
    participants: BTreeMap<ParticipantId, Participant>,
    epoch: u64,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the replica from an authoritative participant list.
    /// Stale epochs are ignored; the coordinator is the only writer.
    pub fn apply_list(&mut self, epoch: u64, list: Vec<Participant>) -> bool {
        if epoch < self.epoch {
            return false;
        }
        self.epoch = epoch;
        self.participants = list
            .into_iter()
            .map(|p| (p.participant_id, p))
            .collect();
        true
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Ring order: sorted participant ids.
    pub fn order(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Token successor: the next id in sorted order, wrapping.
    pub fn next_after(&self, id: &ParticipantId) -> Option<ParticipantId> {
        if self.participants.is_empty() {
            return None;
        }
        self.participants
            .range(*id..)
            .map(|(k, _)| *k)
            .find(|k| k != id)
            .or_else(|| self.participants.keys().next().copied())
    }

    /// Record a metrics report. Older measurements never overwrite newer
    /// ones; cross-transport reordering is resolved by timestamp.
    pub fn record_metrics(&mut self, id: &ParticipantId, metrics: NetworkMetrics) -> bool {
        let Some(participant) = self.participants.get_mut(id) else {
            return false;
        };
        if let Some(existing) = &participant.metrics {
            if existing.measurement_time_ns > metrics.measurement_time_ns {
                return false;
            }
        }
        participant.metrics = Some(metrics);
        true
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }
}

/// One collection round, driven by the coordinator. The token names the
/// participant whose report is being waited for; it walks the ring in
/// sorted order, skipping anyone who already reported out of turn.
#[derive(Debug)]
pub struct Round {
    pub number: u64,
    pub started: Instant,
    pub deadline: Duration,
    pub token: Option<ParticipantId>,
    reported: BTreeMap<ParticipantId, NetworkMetrics>,
}

impl Round {
    pub fn new(number: u64, started: Instant, deadline: Duration, first_token: Option<ParticipantId>) -> Self {
        Self {
            number,
            started,
            deadline,
            token: first_token,
            reported: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, id: ParticipantId, metrics: NetworkMetrics) {
        self.reported.insert(id, metrics);
    }

    pub fn has_reported(&self, id: &ParticipantId) -> bool {
        self.reported.contains_key(id)
    }

    /// Move the token to the next ring member still owing a report.
    pub fn advance_token(&mut self, ring: &Ring) -> Option<ParticipantId> {
        self.token = ring
            .order()
            .into_iter()
            .find(|id| !self.reported.contains_key(id));
        self.token
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }

    /// Everyone in the ring has reported.
    pub fn is_complete(&self, ring: &Ring) -> bool {
        ring.order().iter().all(|id| self.reported.contains_key(id))
    }

    pub fn deadline_elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NatTier;

    fn pid(b: u8) -> ParticipantId {
        ParticipantId([b; 16])
    }

    fn participant(b: u8) -> Participant {
        Participant::new(pid(b), NatTier::PublicIp)
    }

    #[test]
    fn ring_orders_lexicographically() {
        let mut ring = Ring::new();
        ring.apply_list(1, vec![participant(3), participant(1), participant(2)]);
        assert_eq!(ring.order(), vec![pid(1), pid(2), pid(3)]);
    }

    #[test]
    fn token_wraps_around() {
        let mut ring = Ring::new();
        ring.apply_list(1, vec![participant(1), participant(2), participant(3)]);
        assert_eq!(ring.next_after(&pid(1)), Some(pid(2)));
        assert_eq!(ring.next_after(&pid(3)), Some(pid(1)));
    }

    #[test]
    fn stale_list_epoch_ignored() {
        let mut ring = Ring::new();
        assert!(ring.apply_list(5, vec![participant(1)]));
        assert!(!ring.apply_list(4, vec![participant(2)]));
        assert!(ring.contains(&pid(1)));
        assert!(!ring.contains(&pid(2)));
    }

    #[test]
    fn older_measurement_does_not_overwrite() {
        let mut ring = Ring::new();
        ring.apply_list(1, vec![participant(1)]);

        let newer = NetworkMetrics {
            upload_kbps: 100,
            rtt_ns: 0,
            jitter_ns: 0,
            loss_pct: 0.0,
            measurement_time_ns: 2_000,
            measurement_window_ns: 1_000,
        };
        let older = NetworkMetrics {
            upload_kbps: 50,
            measurement_time_ns: 1_000,
            ..newer.clone()
        };
        assert!(ring.record_metrics(&pid(1), newer));
        assert!(!ring.record_metrics(&pid(1), older));
        assert_eq!(ring.get(&pid(1)).unwrap().metrics.as_ref().unwrap().upload_kbps, 100);
    }

    #[test]
    fn round_completion() {
        let mut ring = Ring::new();
        ring.apply_list(1, vec![participant(1), participant(2)]);

        let now = Instant::now();
        let mut round = Round::new(1, now, Duration::from_secs(5), Some(pid(1)));
        assert!(!round.is_complete(&ring));

        let metrics = NetworkMetrics {
            upload_kbps: 1,
            rtt_ns: 0,
            jitter_ns: 0,
            loss_pct: 0.0,
            measurement_time_ns: 1,
            measurement_window_ns: 1,
        };
        round.record(pid(1), metrics.clone());
        round.record(pid(2), metrics);
        assert!(round.is_complete(&ring));
        assert!(!round.deadline_elapsed(now + Duration::from_secs(4)));
        assert!(round.deadline_elapsed(now + Duration::from_secs(5)));
    }

    #[test]
    fn token_walks_past_early_reporters() {
        let mut ring = Ring::new();
        ring.apply_list(1, vec![participant(1), participant(2), participant(3)]);

        let metrics = NetworkMetrics {
            upload_kbps: 1,
            rtt_ns: 0,
            jitter_ns: 0,
            loss_pct: 0.0,
            measurement_time_ns: 1,
            measurement_window_ns: 1,
        };
        let mut round = Round::new(1, Instant::now(), Duration::from_secs(5), Some(pid(1)));
        // pid 2 answers out of turn; the walk skips straight to pid 3.
        round.record(pid(2), metrics.clone());
        round.record(pid(1), metrics.clone());
        assert_eq!(round.advance_token(&ring), Some(pid(3)));
        round.record(pid(3), metrics);
        assert_eq!(round.advance_token(&ring), None);
        assert!(round.is_complete(&ring));
    }
}
