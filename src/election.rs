//! Bully leader election and leader monitoring
//!
//! The coordinator drives the message side of the bully algorithm; actual
//! promotion (loading the snapshot, starting the pending-buy drainer,
//! broadcasting `Leader`) is performed by the owning peer when it receives
//! the `promoted` event, so election logic never touches trading state.
//!
//! # Protocol
//!
//! ```text
//! StartElection ──▶ Election to every higher-id running peer
//!                   │
//!        OK arrives │ no OK within OK_TIMEOUT
//!          ▼        ▼
//!       back off   declare self leader (unless barred)
//! ```
//!
//! Peers in the previous-leaders set ignore `Election` probes and never
//! declare themselves; the set accumulates across failures.

use crate::config::MarketConfig;
use crate::core_types::PeerId;
use crate::messages::PeerMessage;
use crate::registry::PeerRegistry;
use crate::transport::Datagram;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ElectionCoordinator {
    peer_id: PeerId,
    registry: Arc<PeerRegistry>,
    net: Datagram,
    ok_timeout: Duration,
    in_election: AtomicBool,
    ok_received: AtomicBool,
    promoted_tx: mpsc::UnboundedSender<()>,
}

impl ElectionCoordinator {
    /// Returns the coordinator and the promotion event stream the owning
    /// peer must service.
    pub fn new(
        peer_id: PeerId,
        registry: Arc<PeerRegistry>,
        net: Datagram,
        ok_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (promoted_tx, promoted_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                peer_id,
                registry,
                net,
                ok_timeout,
                in_election: AtomicBool::new(false),
                ok_received: AtomicBool::new(false),
                promoted_tx,
            }),
            promoted_rx,
        )
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Initiate an election. Re-entrant calls while one is running are
    /// ignored.
    pub async fn start_election(self: &Arc<Self>) {
        if self.in_election.swap(true, Ordering::SeqCst) {
            debug!(peer = self.peer_id, "election already in progress");
            return;
        }
        self.ok_received.store(false, Ordering::SeqCst);
        info!(peer = self.peer_id, "initiating election");

        let probe = PeerMessage::Election {
            peer_id: self.peer_id,
        };
        for (id, addr) in self.registry.running_peers_above(self.peer_id) {
            debug!(peer = self.peer_id, target = id, "sending election probe");
            self.net.send(addr, &probe).await;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.await_ok_window().await;
        });
    }

    /// Wait OK_TIMEOUT; with no OK and no bar, this peer wins.
    async fn await_ok_window(self: Arc<Self>) {
        tokio::time::sleep(self.ok_timeout).await;

        if self.ok_received.load(Ordering::SeqCst) {
            debug!(peer = self.peer_id, "OK received, backing off");
            return;
        }
        if self.registry.is_barred(self.peer_id) {
            debug!(peer = self.peer_id, "barred from election, backing off");
            self.in_election.store(false, Ordering::SeqCst);
            return;
        }

        info!(peer = self.peer_id, "no OK received, declaring self leader");
        // The peer performs promotion: snapshot load, drainer start, and
        // the Leader broadcast - in that order.
        if self.promoted_tx.send(()).is_err() {
            warn!(peer = self.peer_id, "peer gone, dropping promotion");
        }
        self.in_election.store(false, Ordering::SeqCst);
    }

    /// A lower-id peer probed us. Barred peers stay silent.
    pub async fn handle_election(self: &Arc<Self>, from: PeerId) {
        if self.registry.is_barred(self.peer_id) {
            debug!(peer = self.peer_id, from, "ignoring election probe (barred)");
            return;
        }
        if self.peer_id <= from {
            return;
        }
        if let Some(addr) = self.registry.addr_of(from) {
            self.net
                .send(
                    addr,
                    &PeerMessage::Ok {
                        peer_id: self.peer_id,
                    },
                )
                .await;
        }
        self.start_election().await;
    }

    /// A higher-id peer is alive; give up on winning this round.
    pub fn handle_ok(&self, from: PeerId) {
        debug!(peer = self.peer_id, from, "received OK");
        self.ok_received.store(true, Ordering::SeqCst);
        self.in_election.store(false, Ordering::SeqCst);
    }

    /// A leader announcement settled the election.
    pub fn election_settled(&self) {
        self.in_election.store(false, Ordering::SeqCst);
        self.ok_received.store(false, Ordering::SeqCst);
    }
}

// ============================================================
// LEADER MONITOR (gen-2)
// ============================================================

/// Periodically simulate leader failure and trigger re-election.
///
/// On each TIME_QUANTUM tick, if the current leader is running, it fails
/// with LEADER_FAILURE_PROBABILITY: it is marked inactive, barred from
/// re-election, every peer's leader reference is cleared, and a randomly
/// chosen alive peer starts the next election.
pub async fn run_leader_monitor(
    registry: Arc<PeerRegistry>,
    coordinators: Vec<Arc<ElectionCoordinator>>,
    config: MarketConfig,
) {
    let mut tick = tokio::time::interval(config.time_quantum());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // first tick is immediate

    loop {
        tick.tick().await;

        let Some(leader) = registry.leader() else {
            debug!("no leader to monitor");
            continue;
        };
        if !registry.is_alive(leader.id) {
            continue;
        }

        let roll: f64 = rand::random();
        if roll >= config.leader_failure_probability {
            continue;
        }

        info!(leader = leader.id, "simulated leader failure");
        registry.set_alive(leader.id, false);
        registry.bar_from_election(leader.id);
        registry.set_leader(None);

        let candidates: Vec<&Arc<ElectionCoordinator>> = coordinators
            .iter()
            .filter(|c| registry.is_alive(c.peer_id()))
            .collect();
        let Some(initiator) = candidates.choose(&mut rand::thread_rng()) else {
            warn!("no alive peer left to initiate election");
            continue;
        };
        info!(initiator = initiator.peer_id(), "starting election");
        initiator.start_election().await;
    }
}
