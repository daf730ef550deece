//! Ring consensus: metrics collection, host election, failover.
//!
//! One engine instance runs inside the consensus task of each session.
//! It is deterministic and non-blocking: inputs are packets and an
//! injected clock, outputs are [`ConsensusAction`]s the task turns into
//! sends. The coordinator role (ACDS or a designated participant) drives
//! collection rounds; every replica applies the same designation rules,
//! so a participant never assumes hosting without an explicit
//! `HOST_DESIGNATED` naming it.

pub mod election;
pub mod ring;

pub use election::{elect, score, ElectionResult, MigrationTracker};
pub use ring::{Ring, Round};

use crate::packet::{
    FutureHostElectedMsg, HostDesignatedMsg, HostLostMsg, NetworkQualityMsg, Packet,
    ParticipantListMsg, RingCollectMsg, SessionSettings, SettingsAckMsg,
};
use crate::types::{NetworkMetrics, ParticipantId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Floor for the halving round deadline.
pub const MIN_ROUND_DEADLINE: Duration = Duration::from_millis(500);

/// Window in which host-loss reports count toward the quorum, and the
/// recovery budget for failover.
pub const HOST_LOSS_WINDOW: Duration = Duration::from_millis(500);

/// Pause between completed collection rounds.
pub const ROUND_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("no quorum: {got} of {needed} reports")]
    NoQuorum { got: usize, needed: usize },

    #[error("host lost and no backup available")]
    HostLost,

    #[error("collection round timed out")]
    RoundTimeout,
}

/// What the engine wants done after an input or a poll.
#[derive(Debug)]
pub enum ConsensusAction {
    /// Send to every ring member.
    Broadcast(Packet),
    /// Send to one ring member (the collection token).
    Send { to: ParticipantId, packet: Packet },
    /// The session's host/backup changed; media routing must follow.
    HostChanged {
        host: ParticipantId,
        backup: Option<ParticipantId>,
        failover: bool,
    },
    /// A round missed its deadline; the retry uses the shorter one.
    RoundIncomplete { reported: usize, next_deadline: Duration },
    /// New settings took effect.
    SettingsChanged(SessionSettings),
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub self_id: ParticipantId,
    /// Whether this node drives collection rounds.
    pub coordinator: bool,
    /// Initial round deadline, from policy. Halves on miss.
    pub round_deadline: Duration,
    pub round_interval: Duration,
}

impl ConsensusConfig {
    pub fn participant(self_id: ParticipantId, round_deadline: Duration) -> Self {
        Self {
            self_id,
            coordinator: false,
            round_deadline,
            round_interval: ROUND_INTERVAL,
        }
    }

    pub fn coordinator(self_id: ParticipantId, round_deadline: Duration) -> Self {
        Self {
            self_id,
            coordinator: true,
            round_deadline,
            round_interval: ROUND_INTERVAL,
        }
    }
}

pub struct ConsensusEngine {
    config: ConsensusConfig,
    ring: Ring,

    // Election state
    migration: MigrationTracker,
    host: Option<ParticipantId>,
    backup: Option<ParticipantId>,
    host_epoch: u64,

    // Coordinator round state
    round_number: u64,
    current_round: Option<Round>,
    current_deadline: Duration,
    last_round_ended: Option<Instant>,

    // Host-loss quorum
    loss_reports: Vec<(ParticipantId, Instant)>,

    // Settings replication
    settings: Option<SessionSettings>,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        let current_deadline = config.round_deadline;
        Self {
            config,
            ring: Ring::new(),
            migration: MigrationTracker::new(),
            host: None,
            backup: None,
            host_epoch: 0,
            round_number: 0,
            current_round: None,
            current_deadline,
            last_round_ended: None,
            loss_reports: Vec::new(),
            settings: None,
        }
    }

    pub fn host(&self) -> Option<ParticipantId> {
        self.host
    }

    pub fn backup(&self) -> Option<ParticipantId> {
        self.backup
    }

    pub fn is_self_host(&self) -> bool {
        self.host == Some(self.config.self_id)
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn settings(&self) -> Option<&SessionSettings> {
        self.settings.as_ref()
    }

    // =========================================================================
    // INPUTS
    // =========================================================================

    /// Authoritative participant list from the coordinator.
    pub fn on_participant_list(&mut self, msg: &ParticipantListMsg) -> Vec<ConsensusAction> {
        if !self.ring.apply_list(msg.epoch, msg.ring.clone()) {
            debug!("ignoring stale participant list (epoch {})", msg.epoch);
        }
        Vec::new()
    }

    /// The collection token reached us: answer with our own metrics.
    /// The caller supplies the measurements; the engine only routes them.
    pub fn on_ring_collect(&mut self, msg: &RingCollectMsg, own_metrics: NetworkMetrics) -> Vec<ConsensusAction> {
        vec![ConsensusAction::Broadcast(Packet::NetworkQuality(NetworkQualityMsg {
            participant_id: self.config.self_id,
            round: msg.round,
            metrics: own_metrics,
        }))]
    }

    /// A participant's metrics report. When it came from the token
    /// holder, the token walks on to the next member still owing one.
    pub fn on_network_quality(&mut self, msg: &NetworkQualityMsg, now: Instant) -> Vec<ConsensusAction> {
        self.ring.record_metrics(&msg.participant_id, msg.metrics.clone());
        let mut actions = Vec::new();
        if let Some(round) = &mut self.current_round {
            if round.number == msg.round {
                let was_token = round.token == Some(msg.participant_id);
                round.record(msg.participant_id, msg.metrics.clone());
                if was_token {
                    if let Some(next) = round.advance_token(&self.ring) {
                        actions.push(ConsensusAction::Send {
                            to: next,
                            packet: Packet::RingCollect(RingCollectMsg {
                                round: round.number,
                                deadline_ms: round.deadline.as_millis() as u32,
                            }),
                        });
                    }
                }
            }
        }
        actions.extend(self.poll(now));
        actions
    }

    /// A host designation from the coordinator. Every replica adopts it;
    /// stale epochs are dropped.
    pub fn on_host_designated(&mut self, msg: &HostDesignatedMsg) -> Vec<ConsensusAction> {
        if msg.epoch <= self.host_epoch && self.host.is_some() {
            return Vec::new();
        }
        self.host_epoch = msg.epoch;
        let failover = false;
        self.adopt(msg.host, msg.backup, failover)
    }

    /// Failover designation naming the pre-elected backup.
    pub fn on_future_host_elected(&mut self, msg: &FutureHostElectedMsg) -> Vec<ConsensusAction> {
        if self.host == Some(msg.host) {
            return Vec::new();
        }
        self.adopt(msg.host, None, true)
    }

    fn adopt(&mut self, host: ParticipantId, backup: Option<ParticipantId>, failover: bool) -> Vec<ConsensusAction> {
        info!(
            "host designated: {} (backup {:?}{})",
            host,
            backup,
            if failover { ", failover" } else { "" }
        );
        self.host = Some(host);
        self.backup = backup;
        self.migration.reset();
        self.loss_reports.clear();
        vec![ConsensusAction::HostChanged { host, backup, failover }]
    }

    /// We observed keepalive loss from the host ourselves.
    pub fn report_host_lost(&mut self, now: Instant) -> Vec<ConsensusAction> {
        let mut actions = vec![ConsensusAction::Broadcast(Packet::HostLost(HostLostMsg {
            reporter: self.config.self_id,
            last_seen_ns: crate::types::now_ns(),
        }))];
        actions.extend(self.record_loss_report(self.config.self_id, now));
        actions
    }

    /// Another participant reported the host lost.
    pub fn on_host_lost(&mut self, msg: &HostLostMsg, now: Instant) -> Vec<ConsensusAction> {
        self.record_loss_report(msg.reporter, now)
    }

    fn record_loss_report(&mut self, reporter: ParticipantId, now: Instant) -> Vec<ConsensusAction> {
        // Reports about a host we no longer have are noise.
        let Some(lost_host) = self.host else {
            return Vec::new();
        };
        if reporter == lost_host {
            return Vec::new();
        }

        self.loss_reports
            .retain(|(_, at)| now.duration_since(*at) < HOST_LOSS_WINDOW);
        if !self.loss_reports.iter().any(|(r, _)| *r == reporter) {
            self.loss_reports.push((reporter, now));
        }

        let n = self.ring.len().max(1);
        let quorum = n.div_ceil(2);
        if self.loss_reports.len() < quorum {
            return Vec::new();
        }

        let Some(backup) = self.backup else {
            warn!("host {} lost with no backup elected", lost_host);
            return Vec::new();
        };

        info!(
            "host {} lost ({}/{} reports); failing over to backup {}",
            lost_host,
            self.loss_reports.len(),
            quorum,
            backup
        );
        self.ring.remove(&lost_host);
        let mut actions = Vec::new();
        if self.config.coordinator {
            self.host_epoch += 1;
            actions.push(ConsensusAction::Broadcast(Packet::FutureHostElected(
                FutureHostElectedMsg { host: backup },
            )));
        }
        actions.extend(self.adopt(backup, None, true));
        actions
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Settings proposal addressed to (or rebroadcast by) the host.
    pub fn on_settings_sync(&mut self, settings: &SessionSettings) -> Vec<ConsensusAction> {
        if let Some(current) = &self.settings {
            if settings.epoch <= current.epoch {
                debug!("ignoring stale settings epoch {}", settings.epoch);
                return Vec::new();
            }
        }
        self.settings = Some(settings.clone());

        let mut actions = Vec::new();
        if self.is_self_host() {
            // Host rebroadcasts to the ring.
            actions.push(ConsensusAction::Broadcast(Packet::SettingsSync(settings.clone())));
        }
        actions.push(ConsensusAction::Broadcast(Packet::SettingsAck(SettingsAckMsg {
            epoch: settings.epoch,
            participant_id: self.config.self_id,
        })));
        actions.push(ConsensusAction::SettingsChanged(settings.clone()));
        actions
    }

    // =========================================================================
    // ROUND DRIVER (coordinator)
    // =========================================================================

    /// Non-blocking advance. Call on every input and on a timer tick.
    pub fn poll(&mut self, now: Instant) -> Vec<ConsensusAction> {
        if !self.config.coordinator {
            return Vec::new();
        }

        match &self.current_round {
            None => {
                if self.ring.is_empty() {
                    return Vec::new();
                }
                let idle_over = self
                    .last_round_ended
                    .map(|at| now.duration_since(at) >= self.config.round_interval)
                    .unwrap_or(true);
                if !idle_over {
                    return Vec::new();
                }
                self.round_number += 1;
                let first_token = self.ring.order().first().copied();
                let round = Round::new(self.round_number, now, self.current_deadline, first_token);
                debug!(
                    "starting collection round {} (deadline {:?}, token {:?})",
                    self.round_number, self.current_deadline, first_token
                );
                self.current_round = Some(round);
                match first_token {
                    Some(to) => vec![ConsensusAction::Send {
                        to,
                        packet: Packet::RingCollect(RingCollectMsg {
                            round: self.round_number,
                            deadline_ms: self.current_deadline.as_millis() as u32,
                        }),
                    }],
                    None => Vec::new(),
                }
            }
            Some(round) => {
                if round.is_complete(&self.ring) {
                    self.current_deadline = self.config.round_deadline;
                    self.finish_round(now)
                } else if round.deadline_elapsed(now) {
                    let reported = round.reported_count();
                    // Halve the deadline for the retry, floor at 500 ms.
                    self.current_deadline = (self.current_deadline / 2).max(MIN_ROUND_DEADLINE);
                    warn!(
                        "round {} incomplete ({} of {} reports); retrying with {:?}",
                        round.number,
                        reported,
                        self.ring.len(),
                        self.current_deadline
                    );
                    self.current_round = None;
                    self.last_round_ended = None; // retry immediately
                    vec![ConsensusAction::RoundIncomplete {
                        reported,
                        next_deadline: self.current_deadline,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn finish_round(&mut self, now: Instant) -> Vec<ConsensusAction> {
        self.current_round = None;
        self.last_round_ended = Some(now);

        let Some(result) = elect(&self.ring) else {
            return Vec::new();
        };

        let designate = match self.host {
            None => true,
            Some(current) => {
                let incumbent_score = self
                    .ring
                    .get(&current)
                    .and_then(|p| p.metrics.as_ref())
                    .map(score);
                self.migration.observe(&result, current, incumbent_score)
            }
        };

        if !designate {
            return Vec::new();
        }

        self.host_epoch += 1;
        let mut actions = vec![ConsensusAction::Broadcast(Packet::HostDesignated(
            HostDesignatedMsg {
                epoch: self.host_epoch,
                host: result.host,
                backup: result.backup,
            },
        ))];
        actions.extend(self.adopt(result.host, result.backup, false));
        actions
    }
}

// =============================================================================
// TESTS
// =============================================================================
