//! Market peer - receive loop, worker pool, and message dispatch
//!
//! Each peer owns one UDP endpoint and one receive loop. Incoming frames
//! have their vector clock merged first, then are handed to a handler on
//! a bounded worker pool (a semaphore with `max_workers` permits). All
//! sends happen with no peer lock held.

use crate::clock::PeerClock;
use crate::config::{Generation, MarketConfig};
use crate::core_types::{PeerId, Product, RequestId};
use crate::election::ElectionCoordinator;
use crate::gossip::{GossipEngine, LookupAction, ReplyAction, SellerView};
use crate::messages::{PathHop, PeerMessage};
use crate::registry::{LeaderInfo, PeerRegistry};
use crate::snapshot::SnapshotStore;
use crate::transport::Datagram;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

use super::buyer::BuyerState;
use super::seller::SellerState;
use super::trader::{PendingBuy, TraderState};

/// Capabilities a peer is created with. Any combination is legal.
#[derive(Debug, Clone, Default)]
pub struct RoleSpec {
    pub buyer: bool,
    pub seller: Option<Product>,
    /// Assume trader duties immediately at startup (bootstrap leader).
    pub trader: bool,
}

/// How many distinct request ids a peer remembers for duplicate
/// suppression before FIFO eviction kicks in.
const DUP_CACHE_CAPACITY: usize = 1024;

pub struct MarketPeer {
    pub(crate) id: PeerId,
    pub(crate) generation: Generation,
    pub(crate) config: Arc<MarketConfig>,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) net: Datagram,
    pub(crate) clock: PeerClock,
    pub(crate) gossip: GossipEngine,
    pub(crate) election: Arc<ElectionCoordinator>,
    promoted_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    pub(crate) buyer: Option<BuyerState>,
    pub(crate) seller: Option<SellerState>,
    pub(crate) trader: Mutex<Option<Arc<TraderState>>>,
    pub(crate) snapshot_store: SnapshotStore,
    pub(crate) running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    workers: Arc<Semaphore>,
    start_as_trader: bool,
}

impl MarketPeer {
    /// Bind a UDP endpoint, register with the registry, and build the
    /// peer. No tasks run until [`MarketPeer::start`].
    pub async fn new(
        id: PeerId,
        generation: Generation,
        role: RoleSpec,
        total_peers: usize,
        config: Arc<MarketConfig>,
        registry: Arc<PeerRegistry>,
        snapshot_store: SnapshotStore,
    ) -> std::io::Result<Arc<Self>> {
        let net = Datagram::bind("127.0.0.1:0".parse().unwrap()).await?;
        registry.register(id, net.local_addr());

        let (election, promoted_rx) = ElectionCoordinator::new(
            id,
            Arc::clone(&registry),
            net.clone(),
            config.ok_timeout(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id,
            generation,
            clock: PeerClock::new(total_peers, id),
            gossip: GossipEngine::new(DUP_CACHE_CAPACITY),
            election,
            promoted_rx: Mutex::new(Some(promoted_rx)),
            buyer: role.buyer.then(BuyerState::new),
            seller: role.seller.map(|product| SellerState::new(product, config.seller_stock)),
            trader: Mutex::new(None),
            snapshot_store,
            running: AtomicBool::new(true),
            shutdown_tx,
            workers: Arc::new(Semaphore::new(config.max_workers)),
            start_as_trader: role.trader,
            config,
            registry,
            net,
        }))
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.net.local_addr()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn election(&self) -> &Arc<ElectionCoordinator> {
        &self.election
    }

    pub fn buyer_state(&self) -> Option<&BuyerState> {
        self.buyer.as_ref()
    }

    pub fn seller_state(&self) -> Option<&SellerState> {
        self.seller.as_ref()
    }

    /// Whether this peer currently mediates trades.
    pub fn is_leading(&self) -> bool {
        self.trader.lock().unwrap().is_some()
    }

    /// The active trader state, when leading.
    pub fn trader_state(&self) -> Option<Arc<TraderState>> {
        self.trader.lock().unwrap().clone()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn the peer's background tasks: receive loop, promotion
    /// listener, and (for buyers) the pending-request timeout scanner.
    /// A bootstrap trader assumes leadership before returning.
    pub async fn start(self: &Arc<Self>) {
        info!(
            peer = self.id,
            addr = %self.addr(),
            buyer = self.buyer.is_some(),
            seller = self.seller.is_some(),
            "peer listening"
        );

        tokio::spawn(Arc::clone(self).receive_loop());

        if let Some(promoted_rx) = self.promoted_rx.lock().unwrap().take() {
            tokio::spawn(Arc::clone(self).promotion_listener(promoted_rx));
        }

        if self.buyer.is_some() {
            tokio::spawn(Arc::clone(self).run_pending_scanner());
        }

        if self.start_as_trader {
            self.promote().await;
        }
    }

    /// Stop the peer: mark it dead in the registry and wake every task.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(peer = self.id, "shutting down peer");
        self.registry.set_alive(self.id, false);
        let _ = self.shutdown_tx.send(true);
    }

    // ========================================================
    // SEND PATH
    // ========================================================

    /// Stamp the current clock into a trading-plane message and send it.
    /// The stamp happens with no other peer lock held.
    pub(crate) async fn send_clocked(&self, addr: SocketAddr, mut msg: PeerMessage) {
        if let Some(clock) = msg.clock_mut() {
            *clock = self.clock.stamp();
        }
        self.net.send(addr, &msg).await;
    }

    // ========================================================
    // RECEIVE LOOP + DISPATCH
    // ========================================================

    async fn receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        loop {
            let (msg, from) = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.net.recv() => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        if self.is_running() {
                            warn!(peer = self.id, error = %e, "receive loop error");
                        }
                        break;
                    }
                },
            };

            if !self.is_running() {
                break;
            }

            // Merge the enclosed clock before the handler runs.
            if let Some(clock) = msg.clock() {
                self.clock.observe(clock);
            }

            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            let peer = Arc::clone(&self);
            tokio::spawn(async move {
                peer.dispatch(msg, from).await;
                drop(permit);
            });
        }
        debug!(peer = self.id, "receive loop exited");
    }

    async fn dispatch(self: Arc<Self>, msg: PeerMessage, from: SocketAddr) {
        match msg {
            PeerMessage::Lookup {
                request_id,
                buyer_id,
                product,
                hop_count,
                search_path,
                clock,
            } => {
                self.handle_lookup(request_id, buyer_id, product, hop_count, search_path, clock)
                    .await;
            }

            PeerMessage::Reply {
                request_id,
                seller_id,
                seller_addr,
                product,
                reply_path,
                clock,
            } => {
                let action = GossipEngine::handle_reply(
                    request_id,
                    seller_id,
                    seller_addr,
                    product,
                    reply_path,
                    clock,
                );
                match action {
                    ReplyAction::Forward { to, message } => self.send_clocked(to, message).await,
                    ReplyAction::Offer {
                        request_id,
                        seller_id,
                        seller_addr,
                        product,
                    } => {
                        self.handle_offer(request_id, seller_id, seller_addr, product)
                            .await;
                    }
                }
            }

            PeerMessage::Buy {
                request_id,
                buyer_id,
                buyer_addr,
                product,
                quantity,
                clock,
            } => match self.generation {
                Generation::Gossip => {
                    self.handle_direct_buy(request_id, buyer_id, buyer_addr, product, quantity)
                        .await;
                }
                _ => {
                    self.handle_mediated_buy(PendingBuy {
                        request_id,
                        buyer_id,
                        buyer_addr,
                        product,
                        quantity,
                        clock,
                    });
                }
            },

            PeerMessage::BuyConfirmation {
                request_id,
                buyer_id,
                product,
                status,
                quantity,
                seller_id,
                reason,
                ..
            } => {
                self.handle_buy_confirmation(
                    request_id, buyer_id, product, status, quantity, seller_id, reason,
                )
                .await;
            }

            PeerMessage::SellConfirmation {
                product,
                status,
                quantity,
                payment_amount,
                ..
            } => {
                self.handle_sell_confirmation(product, status, quantity, payment_amount)
                    .await;
            }

            PeerMessage::UpdateInventory {
                seller_id,
                addr,
                product,
                stock,
                clock,
            } => {
                let trader = self.trader.lock().unwrap().clone();
                match trader {
                    Some(state) => state.merge_inventory(seller_id, addr, &product, stock, clock),
                    None => {
                        debug!(peer = self.id, seller = seller_id, "inventory update but not leader")
                    }
                }
            }

            PeerMessage::Election { peer_id } => self.election.handle_election(peer_id).await,
            PeerMessage::Ok { peer_id } => self.election.handle_ok(peer_id),

            PeerMessage::Leader { leader_id, addr } => self.handle_leader(leader_id, addr).await,

            PeerMessage::Heartbeat => self.net.send(from, &PeerMessage::HeartbeatAck).await,
            PeerMessage::HeartbeatAck => {}

            PeerMessage::SoloTrader { survivor_port } => {
                // Gen-3 failover runs on the stream plane; seeing it here
                // means a misdirected frame.
                debug!(peer = self.id, survivor_port, "ignoring SOLOTRADER on datagram plane");
            }
        }
    }

    async fn handle_lookup(
        self: &Arc<Self>,
        request_id: RequestId,
        buyer_id: PeerId,
        product: Product,
        hop_count: u8,
        search_path: Vec<PathHop>,
        clock: crate::clock::VectorClock,
    ) {
        let offer = self.seller.as_ref().map(|s| s.offer_snapshot());
        let seller_view = offer.as_ref().map(|(product, stock)| SellerView {
            product,
            stock: *stock,
        });
        let neighbors = self.registry.neighbors_of(self.id);

        let action = self.gossip.handle_lookup(
            self.id,
            self.addr(),
            seller_view,
            &neighbors,
            request_id,
            buyer_id,
            product,
            hop_count,
            search_path,
            clock,
        );

        match action {
            LookupAction::Reply { to, message } => self.send_clocked(to, message).await,
            LookupAction::Forward { targets, message } => {
                // One stamp for the whole flood so every branch carries
                // the same causal snapshot.
                let mut message = message;
                if let Some(clock) = message.clock_mut() {
                    *clock = self.clock.stamp();
                }
                for target in targets {
                    self.net.send(target, &message).await;
                }
            }
            LookupAction::Drop => {}
        }
    }

    fn handle_mediated_buy(&self, buy: PendingBuy) {
        let trader = self.trader.lock().unwrap().clone();
        match trader {
            Some(state) => {
                debug!(peer = self.id, buyer = buy.buyer_id, product = %buy.product, "buy queued");
                state.enqueue_buy(buy);
            }
            None => warn!(
                peer = self.id,
                buyer = buy.buyer_id,
                "buy received but this peer is not the leader"
            ),
        }
    }

    // ========================================================
    // LEADERSHIP
    // ========================================================

    async fn promotion_listener(self: Arc<Self>, mut promoted_rx: mpsc::UnboundedReceiver<()>) {
        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = promoted_rx.recv() => match event {
                    Some(()) => self.promote().await,
                    None => break,
                },
            }
        }
    }

    /// Assume trader duties: load the persisted snapshot, start the
    /// pending-buy drainer, publish and broadcast leadership. Idempotent.
    pub async fn promote(self: &Arc<Self>) {
        let state = {
            let mut guard = self.trader.lock().unwrap();
            if guard.is_some() {
                None
            } else {
                let state = TraderState::load(self.snapshot_store.clone(), Arc::clone(&self.config));
                *guard = Some(Arc::clone(&state));
                Some(state)
            }
        };
        let Some(state) = state else {
            debug!(peer = self.id, "already leading");
            self.registry.set_leader(Some(LeaderInfo {
                id: self.id,
                addr: self.addr(),
            }));
            return;
        };

        info!(peer = self.id, "assuming trader duties");
        tokio::spawn(run_drainer(Arc::clone(self), state));

        self.registry.set_leader(Some(LeaderInfo {
            id: self.id,
            addr: self.addr(),
        }));

        let announcement = PeerMessage::Leader {
            leader_id: self.id,
            addr: self.addr(),
        };
        for (peer_id, addr) in self.registry.running_peers() {
            if peer_id != self.id {
                self.net.send(addr, &announcement).await;
            }
        }
    }

    async fn handle_leader(self: &Arc<Self>, leader_id: PeerId, addr: SocketAddr) {
        info!(peer = self.id, leader = leader_id, "leader announced");
        self.election.election_settled();
        if leader_id == self.id {
            self.promote().await;
        } else {
            self.registry
                .set_leader(Some(LeaderInfo { id: leader_id, addr }));
        }
    }

    /// Step down voluntarily: state is already persisted, so just clear
    /// the leadership and kick off a fresh election.
    pub async fn resign(self: &Arc<Self>) {
        let had_state = self.trader.lock().unwrap().take().is_some();
        if !had_state {
            return;
        }
        info!(peer = self.id, "resigning as leader");
        self.registry.set_leader(None);
        self.election.start_election().await;
    }
}

/// The pending-buy drainer: woken on every enqueue and inventory update,
/// drains in causal order, then sends the paired confirmations.
async fn run_drainer(peer: Arc<MarketPeer>, state: Arc<TraderState>) {
    let mut shutdown = peer.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = state.wake().notified() => {}
        }

        for outcome in state.drain() {
            let confirmation = PeerMessage::BuyConfirmation {
                request_id: outcome.request_id.clone(),
                buyer_id: outcome.buyer_id,
                product: outcome.product.clone(),
                status: outcome.status,
                quantity: outcome.quantity,
                seller_id: outcome.fill.as_ref().map(|f| f.seller_id),
                reason: outcome.reason.clone(),
                clock: crate::clock::VectorClock::default(),
            };
            peer.send_clocked(outcome.buyer_addr, confirmation).await;

            if let Some(fill) = outcome.fill {
                let sell = PeerMessage::SellConfirmation {
                    request_id: outcome.request_id,
                    buyer_id: outcome.buyer_id,
                    product: outcome.product,
                    status: outcome.status,
                    quantity: outcome.quantity,
                    payment_amount: outcome.payment,
                    clock: crate::clock::VectorClock::default(),
                };
                peer.send_clocked(fill.seller_addr, sell).await;
            }
        }
    }
    debug!(peer = peer.id, "drainer exited");
}
