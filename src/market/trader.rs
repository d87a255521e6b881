//! Trading core - the elected leader's inventory and pending-buy queue
//!
//! The trader serializes concurrent buys by draining its pending queue in
//! vector-clock order (ties broken by buyer id) on a dedicated task. The
//! drainer is woken by a [`Notify`] on every new buy *and* every inventory
//! update, never by a polling timer.
//!
//! Locking: the inventory and the pending queue have their own mutexes;
//! both are released before any confirmation is sent. Every mutation is
//! followed by an atomic snapshot rewrite so a successor leader can resume
//! with the same stock records and earnings.

use crate::clock::{VectorClock, total_cmp};
use crate::config::MarketConfig;
use crate::core_types::{PeerId, Product, Qty, RequestId};
use crate::inventory::{Fill, TraderInventory};
use crate::messages::TradeStatus;
use crate::snapshot::{SnapshotStore, TraderSnapshot};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// A buy waiting its turn in the trader's queue.
#[derive(Debug, Clone)]
pub struct PendingBuy {
    pub request_id: RequestId,
    pub buyer_id: PeerId,
    pub buyer_addr: SocketAddr,
    pub product: Product,
    pub quantity: Qty,
    pub clock: VectorClock,
}

/// Result of fulfilling (or failing) one pending buy; the drainer turns
/// these into confirmations after all locks are released.
#[derive(Debug, Clone)]
pub struct BuyOutcome {
    pub request_id: RequestId,
    pub buyer_id: PeerId,
    pub buyer_addr: SocketAddr,
    pub product: Product,
    pub quantity: Qty,
    pub status: TradeStatus,
    pub fill: Option<Fill>,
    /// Seller payout on success: `price·qty − commission·price·qty`.
    pub payment: f64,
    pub reason: Option<String>,
}

pub struct TraderState {
    config: Arc<MarketConfig>,
    inventory: Mutex<TraderInventory>,
    earnings: Mutex<f64>,
    pending: Mutex<Vec<PendingBuy>>,
    wake: Notify,
    store: SnapshotStore,
}

impl TraderState {
    /// Initialize trader state, resuming from the persisted snapshot when
    /// one exists (inventory *and* earnings survive failover).
    pub fn load(store: SnapshotStore, config: Arc<MarketConfig>) -> Arc<Self> {
        let snapshot = match store.load() {
            Ok(Some(snapshot)) => {
                info!(
                    earnings = snapshot.earnings,
                    "resuming from persisted trader snapshot"
                );
                snapshot
            }
            Ok(None) => TraderSnapshot::default(),
            Err(e) => {
                error!(error = %e, "snapshot unreadable, starting fresh");
                TraderSnapshot::default()
            }
        };
        Arc::new(Self {
            config,
            inventory: Mutex::new(snapshot.inventory),
            earnings: Mutex::new(snapshot.earnings),
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
            store,
        })
    }

    /// Awaited by the drainer task.
    pub fn wake(&self) -> &Notify {
        &self.wake
    }

    /// Merge a seller announcement and persist. Wakes the drainer: new
    /// stock may unblock queued buys.
    pub fn merge_inventory(
        &self,
        seller_id: PeerId,
        addr: SocketAddr,
        product: &str,
        stock: Qty,
        clock: VectorClock,
    ) {
        let snapshot = {
            let mut inventory = self.inventory.lock().unwrap();
            inventory.merge(seller_id, addr, product, stock, clock);
            TraderSnapshot {
                inventory: inventory.clone(),
                earnings: *self.earnings.lock().unwrap(),
            }
        };
        self.persist(snapshot);
        info!(seller = seller_id, product, stock, "inventory updated");
        self.wake.notify_one();
    }

    /// Queue a buy and wake the drainer.
    pub fn enqueue_buy(&self, buy: PendingBuy) {
        self.pending.lock().unwrap().push(buy);
        self.wake.notify_one();
    }

    /// Drain the queue in (happens-before, buyer id) order.
    ///
    /// Every request currently queued is decided: fulfilled against the
    /// causally-earliest capable seller, or failed. Confirmations are the
    /// caller's job, after this returns with no locks held.
    pub fn drain(&self) -> Vec<BuyOutcome> {
        let mut batch = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Vec::new();
        }
        batch.sort_by(|a, b| total_cmp(&a.clock, a.buyer_id, &b.clock, b.buyer_id));

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut mutated = false;

        let snapshot = {
            let mut inventory = self.inventory.lock().unwrap();
            let mut earnings = self.earnings.lock().unwrap();

            for buy in batch.drain(..) {
                match inventory.fulfill(&buy.product, buy.quantity) {
                    Some(fill) => {
                        *earnings += self.config.trader_commission(buy.quantity);
                        mutated = true;
                        outcomes.push(BuyOutcome {
                            payment: self.config.seller_payment(buy.quantity),
                            status: TradeStatus::Ok,
                            fill: Some(fill),
                            reason: None,
                            request_id: buy.request_id,
                            buyer_id: buy.buyer_id,
                            buyer_addr: buy.buyer_addr,
                            product: buy.product,
                            quantity: buy.quantity,
                        });
                    }
                    None => {
                        warn!(
                            buyer = buy.buyer_id,
                            product = %buy.product,
                            quantity = buy.quantity,
                            "no seller can cover buy"
                        );
                        outcomes.push(BuyOutcome {
                            payment: 0.0,
                            status: TradeStatus::Fail,
                            fill: None,
                            reason: Some(format!("insufficient inventory for {}", buy.product)),
                            request_id: buy.request_id,
                            buyer_id: buy.buyer_id,
                            buyer_addr: buy.buyer_addr,
                            product: buy.product,
                            quantity: buy.quantity,
                        });
                    }
                }
            }

            mutated.then(|| TraderSnapshot {
                inventory: inventory.clone(),
                earnings: *earnings,
            })
        };

        if let Some(snapshot) = snapshot {
            self.persist(snapshot);
        }
        outcomes
    }

    fn persist(&self, snapshot: TraderSnapshot) {
        if let Err(e) = self.store.save(&snapshot) {
            error!(error = %e, "failed to persist trader snapshot");
        }
    }

    pub fn earnings(&self) -> f64 {
        *self.earnings.lock().unwrap()
    }

    pub fn total_stock(&self, product: &str) -> Qty {
        self.inventory.lock().unwrap().total_stock(product)
    }
}
