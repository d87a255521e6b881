//! Messages - peer-to-peer wire types
//!
//! Every datagram on the gen-1/2 plane is one of these variants, bincode
//! encoded behind a length prefix (see [`crate::transport`]).
//!
//! # Message Flow
//!
//! ```text
//! gen-1:  Buyer → Lookup → (flood) → Seller → Reply → (reverse path) → Buyer
//!         Buyer → Buy → Seller → BuyConfirmation → Buyer
//!
//! gen-2:  Seller → UpdateInventory → Trader
//!         Buyer → Buy → Trader → BuyConfirmation → Buyer
//!                               → SellConfirmation → Seller
//!         anyone → Election / Ok / Leader → anyone   (bully plane)
//! ```
//!
//! Trading-plane variants carry a [`VectorClock`] snapshot, stamped by the
//! sender immediately before serialization; the control plane (election,
//! heartbeat) is clockless.

use crate::clock::VectorClock;
use crate::core_types::{PeerId, Product, Qty, RequestId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One hop on a lookup's forward path, recorded in send order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHop {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

/// Outcome reported in buy/sell confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Ok,
    Fail,
}

impl TradeStatus {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == TradeStatus::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Ok => "ok",
            TradeStatus::Fail => "fail",
        }
    }
}

/// Peer-to-peer wire message, tagged by variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// gen-1 flooded item query.
    Lookup {
        request_id: RequestId,
        buyer_id: PeerId,
        product: Product,
        /// Remaining forwards; dropped silently at zero.
        hop_count: u8,
        /// Forward path in send order; replies consume it tail-first.
        search_path: Vec<PathHop>,
        clock: VectorClock,
    },

    /// gen-1 seller answer, walking the reverse path back to the buyer.
    Reply {
        request_id: RequestId,
        seller_id: PeerId,
        seller_addr: SocketAddr,
        product: Product,
        reply_path: Vec<PathHop>,
        clock: VectorClock,
    },

    /// Purchase request. Direct to the seller in gen-1, to the trader in gen-2.
    Buy {
        request_id: RequestId,
        buyer_id: PeerId,
        buyer_addr: SocketAddr,
        product: Product,
        quantity: Qty,
        clock: VectorClock,
    },

    /// Outcome of a buy, sent to the buyer.
    BuyConfirmation {
        request_id: RequestId,
        buyer_id: PeerId,
        product: Product,
        status: TradeStatus,
        quantity: Qty,
        /// Seller that fulfilled the buy (successful mediated buys only).
        seller_id: Option<PeerId>,
        /// Failure detail (failed buys only).
        reason: Option<String>,
        clock: VectorClock,
    },

    /// Fill notice to the seller whose stock was consumed (gen-2).
    SellConfirmation {
        request_id: RequestId,
        buyer_id: PeerId,
        product: Product,
        status: TradeStatus,
        quantity: Qty,
        /// `price·qty − commission·price·qty`
        payment_amount: f64,
        clock: VectorClock,
    },

    /// Seller announcing (re)stock to the trader (gen-2).
    UpdateInventory {
        seller_id: PeerId,
        addr: SocketAddr,
        product: Product,
        stock: Qty,
        clock: VectorClock,
    },

    /// Bully election probe, sent to strictly-higher-id peers.
    Election { peer_id: PeerId },

    /// A higher-id peer is alive; the receiver gives up on winning.
    Ok { peer_id: PeerId },

    /// Leader announcement, broadcast by the winner.
    Leader { leader_id: PeerId, addr: SocketAddr },

    Heartbeat,
    HeartbeatAck,

    /// A gen-3 trader survived its peer; clients should retry there.
    SoloTrader { survivor_port: u16 },
}

impl PeerMessage {
    /// Discriminator used for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Lookup { .. } => "lookup",
            PeerMessage::Reply { .. } => "reply",
            PeerMessage::Buy { .. } => "buy",
            PeerMessage::BuyConfirmation { .. } => "buy_confirmation",
            PeerMessage::SellConfirmation { .. } => "sell_confirmation",
            PeerMessage::UpdateInventory { .. } => "update_inventory",
            PeerMessage::Election { .. } => "election",
            PeerMessage::Ok { .. } => "OK",
            PeerMessage::Leader { .. } => "leader",
            PeerMessage::Heartbeat => "heartbeat",
            PeerMessage::HeartbeatAck => "heartbeat_ack",
            PeerMessage::SoloTrader { .. } => "SOLOTRADER",
        }
    }

    /// The enclosed clock, for trading-plane variants.
    pub fn clock(&self) -> Option<&VectorClock> {
        match self {
            PeerMessage::Lookup { clock, .. }
            | PeerMessage::Reply { clock, .. }
            | PeerMessage::Buy { clock, .. }
            | PeerMessage::BuyConfirmation { clock, .. }
            | PeerMessage::SellConfirmation { clock, .. }
            | PeerMessage::UpdateInventory { clock, .. } => Some(clock),
            _ => None,
        }
    }

    /// Mutable access for the send-path clock stamp.
    pub fn clock_mut(&mut self) -> Option<&mut VectorClock> {
        match self {
            PeerMessage::Lookup { clock, .. }
            | PeerMessage::Reply { clock, .. }
            | PeerMessage::Buy { clock, .. }
            | PeerMessage::BuyConfirmation { clock, .. }
            | PeerMessage::SellConfirmation { clock, .. }
            | PeerMessage::UpdateInventory { clock, .. } => Some(clock),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_kind_tags() {
        let msg = PeerMessage::Election { peer_id: 2 };
        assert_eq!(msg.kind(), "election");
        assert_eq!(PeerMessage::Heartbeat.kind(), "heartbeat");
        assert_eq!(
            PeerMessage::SoloTrader { survivor_port: 5003 }.kind(),
            "SOLOTRADER"
        );
    }

    #[test]
    fn test_control_plane_is_clockless() {
        assert!(PeerMessage::Election { peer_id: 1 }.clock().is_none());
        assert!(PeerMessage::Heartbeat.clock().is_none());

        let buy = PeerMessage::Buy {
            request_id: "rid".into(),
            buyer_id: 4,
            buyer_addr: sample_addr(),
            product: "fish".into(),
            quantity: 2,
            clock: VectorClock::new(3),
        };
        assert!(buy.clock().is_some());
    }

    #[test]
    fn test_clock_stamp_reaches_wire_value() {
        let mut msg = PeerMessage::UpdateInventory {
            seller_id: 1,
            addr: sample_addr(),
            product: "salt".into(),
            stock: 10,
            clock: VectorClock::new(2),
        };
        msg.clock_mut().unwrap().tick(1);
        assert_eq!(msg.clock().unwrap().get(1), 1);
    }
}
