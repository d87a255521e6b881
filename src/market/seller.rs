//! Seller behavior - stock, restocks, and inventory announcements
//!
//! Gen-1 sellers fulfil direct buys out of their own stock. Gen-2 sellers
//! announce their stock to the trader and learn of fills through
//! `SellConfirmation`; either way, stock hitting zero triggers a restock
//! with a different product.

use crate::config::Generation;
use crate::core_types::{PeerId, Product, Qty, RequestId};
use crate::messages::{PeerMessage, TradeStatus};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::peer::MarketPeer;

/// What a seller currently has on offer.
pub struct SellerState {
    offer: Mutex<(Product, Qty)>,
}

impl SellerState {
    pub fn new(product: Product, stock: Qty) -> Self {
        Self {
            offer: Mutex::new((product, stock)),
        }
    }

    pub(crate) fn offer_snapshot(&self) -> (Product, Qty) {
        self.offer.lock().unwrap().clone()
    }

    pub fn stock(&self) -> Qty {
        self.offer.lock().unwrap().1
    }

    pub fn product(&self) -> Product {
        self.offer.lock().unwrap().0.clone()
    }
}

impl MarketPeer {
    /// Gen-2: announce current stock to the trader, blocking until a
    /// leader is active.
    pub async fn announce_inventory(self: &Arc<Self>) {
        let Some(seller) = &self.seller else { return };
        let Some(leader) = self.wait_for_leader_or_shutdown().await else {
            return;
        };

        let (product, stock) = seller.offer_snapshot();
        info!(peer = self.id, product = %product, stock, leader = leader.id, "announcing inventory");
        self.send_clocked(
            leader.addr,
            PeerMessage::UpdateInventory {
                seller_id: self.id,
                addr: self.addr(),
                product,
                stock,
                clock: crate::clock::VectorClock::default(),
            },
        )
        .await;
    }

    /// Gen-1: fulfil a buy out of local stock and confirm either way.
    /// A sell-out picks a different product and resets to SELLER_STOCK.
    pub(crate) async fn handle_direct_buy(
        self: &Arc<Self>,
        request_id: RequestId,
        buyer_id: PeerId,
        buyer_addr: SocketAddr,
        product: Product,
        quantity: Qty,
    ) {
        let Some(seller) = &self.seller else {
            debug!(peer = self.id, "buy reached a non-seller");
            return;
        };

        let status = {
            let mut offer = seller.offer.lock().unwrap();
            if offer.0 == product && offer.1 >= quantity {
                offer.1 -= quantity;
                info!(
                    peer = self.id,
                    buyer = buyer_id,
                    product = %product,
                    remaining = offer.1,
                    "sold item"
                );
                if offer.1 == 0 {
                    let next = self.restock_choice(&product);
                    info!(peer = self.id, sold_out = %product, now_selling = %next, "restocking");
                    *offer = (next, self.config.seller_stock);
                }
                TradeStatus::Ok
            } else {
                warn!(peer = self.id, buyer = buyer_id, product = %product, "cannot fulfil buy");
                TradeStatus::Fail
            }
        };

        let reason = (status == TradeStatus::Fail).then(|| format!("out of {}", product));
        self.send_clocked(
            buyer_addr,
            PeerMessage::BuyConfirmation {
                request_id,
                buyer_id,
                product,
                status,
                quantity,
                seller_id: Some(self.id),
                reason,
                clock: crate::clock::VectorClock::default(),
            },
        )
        .await;
    }

    /// Gen-2: the trader sold on our behalf. Decrement stock; on hitting
    /// zero, restock and re-announce with a fresh clock.
    pub(crate) async fn handle_sell_confirmation(
        self: &Arc<Self>,
        product: Product,
        status: TradeStatus,
        quantity: Qty,
        payment_amount: f64,
    ) {
        let Some(seller) = &self.seller else { return };
        if !status.is_ok() {
            return;
        }

        let restocked = {
            let mut offer = seller.offer.lock().unwrap();
            if offer.0 != product {
                return;
            }
            offer.1 = offer.1.saturating_sub(quantity);
            info!(
                peer = self.id,
                product = %product,
                quantity,
                payment = payment_amount,
                remaining = offer.1,
                "sale confirmed by trader"
            );
            if offer.1 == 0 {
                let next = self.restock_choice(&product);
                info!(peer = self.id, sold_out = %product, now_selling = %next, "restocking");
                *offer = (next, self.config.seller_stock);
                true
            } else {
                false
            }
        };

        if restocked && self.generation != Generation::Gossip {
            self.announce_inventory().await;
        }
    }

    /// A different product to sell next.
    fn restock_choice(&self, current: &str) -> Product {
        let candidates: Vec<&String> = self
            .config
            .products
            .iter()
            .filter(|p| p.as_str() != current)
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|p| (*p).clone())
            .unwrap_or_else(|| current.to_string())
    }
}
