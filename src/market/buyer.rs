//! Buyer behavior - issuing buys, timeouts, retries, shutdown
//!
//! A buyer issues one request at a time and is driven by responses: a
//! confirmation schedules the next buy (probability permitting), a
//! timeout retries a different product. Products that time out are
//! recorded as exhausted; when every product is exhausted the buyer
//! shuts down. Reaching the transaction cap also shuts the peer down.

use crate::config::Generation;
use crate::core_types::{PeerId, Product, Qty, RequestId, new_request_id};
use crate::gossip::GossipEngine;
use crate::messages::{PeerMessage, TradeStatus};
use crate::registry::LeaderInfo;
use rand::Rng;
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::peer::MarketPeer;

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub product: Product,
    pub sent_at: Instant,
}

/// Per-buyer bookkeeping.
pub struct BuyerState {
    pub(crate) pending: Mutex<FxHashMap<RequestId, PendingRequest>>,
    pub(crate) exhausted: Mutex<HashSet<Product>>,
    pub(crate) items_bought: AtomicU32,
    first_buy_at: Mutex<Option<Instant>>,
}

impl BuyerState {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(FxHashMap::default()),
            exhausted: Mutex::new(HashSet::new()),
            items_bought: AtomicU32::new(0),
            first_buy_at: Mutex::new(None),
        }
    }

    pub fn items_bought(&self) -> u32 {
        self.items_bought.load(Ordering::SeqCst)
    }
}

impl Default for BuyerState {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketPeer {
    /// Kick off this buyer's first purchase.
    pub async fn start_buying(self: &Arc<Self>) {
        let Some(product) = self.pick_product(None) else {
            warn!(peer = self.id, "no products to buy, shutting down");
            self.shutdown();
            return;
        };
        let quantity = self.draw_quantity();
        self.issue_buy(product, quantity).await;
    }

    fn draw_quantity(&self) -> Qty {
        match self.generation {
            Generation::Gossip => 1,
            _ => rand::thread_rng().gen_range(1..=5),
        }
    }

    /// A random product that is neither exhausted nor `exclude`.
    fn pick_product(&self, exclude: Option<&str>) -> Option<Product> {
        let Some(buyer) = &self.buyer else { return None };
        let exhausted = buyer.exhausted.lock().unwrap();
        let candidates: Vec<&String> = self
            .config
            .products
            .iter()
            .filter(|p| !exhausted.contains(p.as_str()) && Some(p.as_str()) != exclude)
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|p| (*p).clone())
    }

    /// Issue a buy for `product`. Gen-1 floods a lookup; gen-2 blocks
    /// until a leader is active, then sends the buy to it.
    pub(crate) async fn issue_buy(self: &Arc<Self>, product: Product, quantity: Qty) {
        if !self.is_running() {
            return;
        }
        let Some(buyer) = &self.buyer else { return };

        {
            let mut first = buyer.first_buy_at.lock().unwrap();
            if first.is_none() {
                *first = Some(Instant::now());
            }
        }
        let request_id = new_request_id(self.id, &product);

        match self.generation {
            Generation::Gossip => {
                info!(peer = self.id, product = %product, "initiating lookup");
                let mut lookup = GossipEngine::initial_lookup(
                    request_id.clone(),
                    self.id,
                    self.addr(),
                    product.clone(),
                    self.registry.hop_budget(),
                    crate::clock::VectorClock::default(),
                );
                if let Some(clock) = lookup.clock_mut() {
                    *clock = self.clock.stamp();
                }
                self.gossip.note_request(&request_id);
                buyer.pending.lock().unwrap().insert(
                    request_id,
                    PendingRequest {
                        product,
                        sent_at: Instant::now(),
                    },
                );
                for (neighbor_id, neighbor_addr) in self.registry.neighbors_of(self.id) {
                    debug!(peer = self.id, neighbor = neighbor_id, "flooding lookup");
                    self.net.send(neighbor_addr, &lookup).await;
                }
            }
            _ => {
                let Some(leader) = self.wait_for_leader_or_shutdown().await else {
                    return;
                };
                info!(peer = self.id, product = %product, quantity, leader = leader.id, "initiating buy with trader");
                buyer.pending.lock().unwrap().insert(
                    request_id.clone(),
                    PendingRequest {
                        product: product.clone(),
                        sent_at: Instant::now(),
                    },
                );
                self.send_clocked(
                    leader.addr,
                    PeerMessage::Buy {
                        request_id,
                        buyer_id: self.id,
                        buyer_addr: self.addr(),
                        product,
                        quantity,
                        clock: crate::clock::VectorClock::default(),
                    },
                )
                .await;
            }
        }
    }

    pub(crate) async fn wait_for_leader_or_shutdown(&self) -> Option<LeaderInfo> {
        let mut shutdown = self.shutdown_rx();
        if !self.is_running() {
            return None;
        }
        tokio::select! {
            _ = shutdown.changed() => None,
            leader = self.registry.wait_for_leader() => leader,
        }
    }

    /// Gen-1: a reply walked all the way back; buy from the offering
    /// seller directly.
    pub(crate) async fn handle_offer(
        self: &Arc<Self>,
        request_id: RequestId,
        seller_id: PeerId,
        seller_addr: SocketAddr,
        product: Product,
    ) {
        let Some(buyer) = &self.buyer else {
            debug!(peer = self.id, "reply reached a non-buyer");
            return;
        };
        info!(peer = self.id, seller = seller_id, product = %product, "offer received, buying");

        // Keep the pending entry alive until the confirmation lands; the
        // direct buy restarts its timeout window.
        if let Some(entry) = buyer.pending.lock().unwrap().get_mut(&request_id) {
            entry.sent_at = Instant::now();
        }

        self.send_clocked(
            seller_addr,
            PeerMessage::Buy {
                request_id,
                buyer_id: self.id,
                buyer_addr: self.addr(),
                product,
                quantity: 1,
                clock: crate::clock::VectorClock::default(),
            },
        )
        .await;
    }

    /// Confirmation from a seller (gen-1) or the trader (gen-2).
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn handle_buy_confirmation(
        self: &Arc<Self>,
        request_id: RequestId,
        buyer_id: PeerId,
        product: Product,
        status: TradeStatus,
        quantity: Qty,
        seller_id: Option<PeerId>,
        reason: Option<String>,
    ) {
        let Some(buyer) = &self.buyer else { return };
        if buyer_id != self.id {
            debug!(peer = self.id, "confirmation not intended for this peer");
            return;
        }
        buyer.pending.lock().unwrap().remove(&request_id);

        if !status.is_ok() {
            warn!(
                peer = self.id,
                product = %product,
                reason = reason.as_deref().unwrap_or("unknown"),
                "purchase failed, trying another product"
            );
            let Some(next) = self.pick_product(Some(&product)) else {
                self.shutdown();
                return;
            };
            let quantity = self.draw_quantity();
            self.issue_buy(next, quantity).await;
            return;
        }

        let total = buyer.items_bought.fetch_add(quantity, Ordering::SeqCst) + quantity;
        info!(
            peer = self.id,
            product = %product,
            quantity,
            seller = ?seller_id,
            total,
            "purchase confirmed"
        );

        if total >= self.config.max_transactions {
            let average_rtt = buyer
                .first_buy_at
                .lock()
                .unwrap()
                .map(|t0| t0.elapsed().as_secs_f64() / self.config.max_transactions as f64)
                .unwrap_or_default();
            info!(
                peer = self.id,
                average_rtt, "transaction cap reached, shutting down"
            );
            self.shutdown();
            return;
        }

        let roll: f64 = rand::random();
        if roll >= self.config.buy_probability {
            info!(peer = self.id, "buyer satisfied, stopping");
            self.shutdown();
            return;
        }

        let Some(next) = self.pick_product(Some(&product)) else {
            self.shutdown();
            return;
        };
        let quantity = self.draw_quantity();
        let delay = {
            let base = self.config.inter_buy_delay_secs;
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.5..1.5) * base)
        };
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            peer.issue_buy(next, quantity).await;
        });
    }

    /// Scan pending requests; expired ones mark their product exhausted
    /// and retry a different one.
    pub(crate) async fn run_pending_scanner(self: Arc<Self>) {
        let Some(buyer) = &self.buyer else { return };
        let timeout = self.config.timeout();
        let period = (timeout / 4).max(Duration::from_millis(50));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_rx();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }

            let expired: Vec<(RequestId, Product)> = {
                let mut pending = buyer.pending.lock().unwrap();
                let now = Instant::now();
                let stale: Vec<RequestId> = pending
                    .iter()
                    .filter(|(_, req)| now.duration_since(req.sent_at) > timeout)
                    .map(|(rid, _)| rid.clone())
                    .collect();
                stale
                    .into_iter()
                    .filter_map(|rid| pending.remove(&rid).map(|req| (rid, req.product)))
                    .collect()
            };

            for (request_id, product) in expired {
                warn!(
                    peer = self.id,
                    %request_id,
                    product = %product,
                    "no response, marking product exhausted"
                );
                buyer.exhausted.lock().unwrap().insert(product.clone());

                let Some(next) = self.pick_product(None) else {
                    info!(peer = self.id, "all products exhausted, shutting down");
                    self.shutdown();
                    return;
                };
                let quantity = self.draw_quantity();
                info!(peer = self.id, product = %next, "retrying with a new product");
                self.issue_buy(next, quantity).await;
            }
        }
    }
}
