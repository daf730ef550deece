//! Connection orchestrator: the staged connect cascade.
//!
//! ```text
//! t=0      stage 1: direct TCP to the published address      (3 s budget)
//! t=500ms  stage 2: hole-punched connect to the reflexive
//!                   address learned via STUN                 (8 s budget)
//! after 2  stage 3: relay bind through the rendezvous server (15 s budget)
//! ```
//!
//! The first stream to come up wins and cancels everything behind it.
//! Dropping a stage's future aborts its pending socket work, so
//! cancellation needs no extra plumbing.

use super::relay::{self, RelayBind};
use super::stun;
use super::transport::{connect_direct, Transport, TransportError};
use crate::policy::Policy;
use crate::types::ParticipantId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// How long after stage 1 starts before stage 2 is tried speculatively.
pub const STAGE2_HEAD_START: Duration = Duration::from_millis(500);

/// Retry cadence while punching at a reflexive address.
const PUNCH_RETRY: Duration = Duration::from_millis(250);
const PUNCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Addresses a connect attempt may use, gathered from ACDS.
#[derive(Debug, Clone, Default)]
pub struct ConnectPlan {
    /// Published direct address (stage 1).
    pub direct: Option<SocketAddr>,
    /// Peer's server-reflexive address (stage 2).
    pub reflexive: Option<SocketAddr>,
    /// Relay listener plus bind parameters (stage 3).
    pub relay: Option<RelayPlan>,
}

#[derive(Debug, Clone)]
pub struct RelayPlan {
    pub relay_addr: SocketAddr,
    pub session_id: [u8; 16],
    pub participant_id: ParticipantId,
}

/// Discover our own reflexive address for candidate publication.
/// A thin wrapper so callers don't touch the STUN module directly.
pub async fn discover_reflexive(
    stun_server: SocketAddr,
    budget: Duration,
) -> Result<SocketAddr, TransportError> {
    stun::query_reflexive(stun_server, budget).await
}

/// Run the cascade. Returns the first transport that comes up, or the
/// last stage's error once every stage is exhausted.
pub async fn establish(plan: &ConnectPlan, policy: &Policy) -> Result<Transport, TransportError> {
    let started = Instant::now();

    let stage1 = async {
        match plan.direct {
            Some(addr) => {
                debug!("stage 1: direct connect to {addr}");
                connect_direct(addr, policy.stage_budget(0)).await
            }
            None => Err(TransportError::DeadlineExceeded),
        }
    };

    let stage2 = async {
        tokio::time::sleep(STAGE2_HEAD_START).await;
        match plan.reflexive {
            Some(addr) => {
                debug!("stage 2: hole punch toward {addr}");
                punch(addr, policy.stage_budget(1)).await
            }
            None => Err(TransportError::DeadlineExceeded),
        }
    };

    tokio::pin!(stage1, stage2);
    let mut stage1_err: Option<TransportError> = None;
    let mut stage2_err: Option<TransportError> = None;

    // Race stages 1 and 2; either success aborts the other by drop.
    while stage1_err.is_none() || stage2_err.is_none() {
        tokio::select! {
            r = &mut stage1, if stage1_err.is_none() => match r {
                Ok(transport) => {
                    info!(
                        "connected direct to {} in {:?}",
                        transport.peer_addr(),
                        started.elapsed()
                    );
                    return Ok(transport);
                }
                Err(e) => stage1_err = Some(e),
            },
            r = &mut stage2, if stage2_err.is_none() => match r {
                Ok(transport) => {
                    info!(
                        "connected p2p to {} in {:?}",
                        transport.peer_addr(),
                        started.elapsed()
                    );
                    return Ok(transport);
                }
                Err(e) => stage2_err = Some(e),
            },
        }
    }

    // Stage 3 only runs once both faster stages have failed.
    let Some(relay_plan) = &plan.relay else {
        return Err(stage2_err
            .filter(|e| !matches!(e, TransportError::DeadlineExceeded))
            .or(stage1_err)
            .unwrap_or(TransportError::DeadlineExceeded));
    };
    debug!("stage 3: relay bind via {}", relay_plan.relay_addr);
    let transport = connect_relay(relay_plan, policy.stage_budget(2)).await?;
    info!(
        "connected via relay {} in {:?}",
        relay_plan.relay_addr,
        started.elapsed()
    );
    Ok(transport)
}

/// Stage 2: repeated short TCP connects toward the peer's reflexive
/// address. With both sides doing this, a pair of SYNs crossing inside
/// the NAT window completes one side's connect.
async fn punch(addr: SocketAddr, budget: Duration) -> Result<Transport, TransportError> {
    let attempt = async {
        loop {
            match tokio::time::timeout(PUNCH_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Transport::datachannel(stream).map_err(TransportError::from),
                Ok(Err(_)) | Err(_) => tokio::time::sleep(PUNCH_RETRY).await,
            }
        }
    };
    match tokio::time::timeout(budget, attempt).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            addr,
            budget_ms: budget.as_millis() as u64,
        }),
    }
}

/// Stage 3: TCP to the relay, bind, wait for pairing.
async fn connect_relay(plan: &RelayPlan, budget: Duration) -> Result<Transport, TransportError> {
    let attempt = async {
        let mut stream = TcpStream::connect(plan.relay_addr).await?;
        let paired = relay::bind(
            &mut stream,
            RelayBind {
                session_id: plan.session_id,
                participant_id: plan.participant_id,
            },
        )
        .await?;
        if !paired {
            return Err(TransportError::RelayRefused);
        }
        Ok(Transport::relayed(stream)?)
    };
    match tokio::time::timeout(budget, attempt).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            addr: plan.relay_addr,
            budget_ms: budget.as_millis() as u64,
        }),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::TransportKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn fast_policy() -> Policy {
        Policy {
            stage_budgets_ms: (500, 2_000, 2_000),
            ..Policy::default()
        }
    }

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn direct_wins_when_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let plan = ConnectPlan {
            direct: Some(addr),
            reflexive: None,
            relay: None,
        };
        let transport = establish(&plan, &fast_policy()).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::DirectTcp);
    }

    #[tokio::test]
    async fn stage2_adopted_when_direct_refused_and_relay_untouched() {
        let direct = refused_addr().await;

        let p2p_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let p2p_addr = p2p_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = p2p_listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        // A relay that flags if anything ever connects to it.
        let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_listener.local_addr().unwrap();
        let relay_touched = Arc::new(AtomicBool::new(false));
        let touched = relay_touched.clone();
        tokio::spawn(async move {
            if relay_listener.accept().await.is_ok() {
                touched.store(true, Ordering::SeqCst);
            }
        });

        let plan = ConnectPlan {
            direct: Some(direct),
            reflexive: Some(p2p_addr),
            relay: Some(RelayPlan {
                relay_addr,
                session_id: [1u8; 16],
                participant_id: ParticipantId([2u8; 16]),
            }),
        };
        let transport = establish(&plan, &fast_policy()).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::P2pDatachannel);
        assert!(!relay_touched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn falls_through_to_relay() {
        let direct = refused_addr().await;

        // Relay pairs two binds; spawn our own far end.
        let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut a, _) = relay_listener.accept().await.unwrap();
            let bind = relay::read_bind(&mut a).await.unwrap().unwrap();
            assert_eq!(bind.session_id, [1u8; 16]);
            use tokio::io::AsyncWriteExt;
            a.write_all(&[relay::BIND_ACK_PAIRED]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let plan = ConnectPlan {
            direct: Some(direct),
            reflexive: None,
            relay: Some(RelayPlan {
                relay_addr,
                session_id: [1u8; 16],
                participant_id: ParticipantId([2u8; 16]),
            }),
        };
        let transport = establish(&plan, &fast_policy()).await.unwrap();
        assert_eq!(transport.kind(), TransportKind::Relayed);
    }

    #[tokio::test]
    async fn total_budget_is_bounded() {
        let plan = ConnectPlan {
            direct: Some(refused_addr().await),
            reflexive: None,
            relay: None,
        };
        let started = Instant::now();
        let result = establish(&plan, &fast_policy()).await;
        assert!(result.is_err());
        // Well under the sum of the three budgets.
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
