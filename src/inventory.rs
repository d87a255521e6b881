//! Trader inventory - per-product multi-seller stock records
//!
//! This module contains only the data structure; the process logic (queue
//! draining, confirmations) lives in `market::trader`.
//!
//! # Key Design:
//! - Each product maps to the seller entries currently offering it.
//! - Fulfilment picks the entry with the *earliest* vector clock under
//!   happens-before, concurrent entries broken by numeric seller id. This
//!   makes the pick deterministic across trader restarts.
//! - Invariant: quantity > 0 for every stored entry; an entry drained to
//!   zero is removed.

use crate::clock::{VectorClock, total_cmp};
use crate::core_types::{PeerId, Product, Qty};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// One seller's stock of one product, as last announced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerEntry {
    pub seller_id: PeerId,
    pub addr: SocketAddr,
    pub quantity: Qty,
    pub clock: VectorClock,
}

/// Outcome of a fulfilment attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub seller_id: PeerId,
    pub seller_addr: SocketAddr,
    pub quantity: Qty,
}

/// The trader's full view of what every seller has on offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraderInventory {
    records: BTreeMap<Product, Vec<SellerEntry>>,
}

impl TraderInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an inventory announcement: accumulate quantity for an
    /// existing `(product, seller)` pair, overwrite its clock; otherwise
    /// append a new entry.
    pub fn merge(
        &mut self,
        seller_id: PeerId,
        addr: SocketAddr,
        product: &str,
        quantity: Qty,
        clock: VectorClock,
    ) {
        let entries = self.records.entry(product.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.seller_id == seller_id) {
            entry.quantity += quantity;
            entry.addr = addr;
            entry.clock = clock;
        } else {
            entries.push(SellerEntry {
                seller_id,
                addr,
                quantity,
                clock,
            });
        }
    }

    /// Fulfil a buy: among entries with `quantity >= requested`, pick the
    /// one minimal under (happens-before, then seller id), decrement it,
    /// and drop it if drained. `None` when no seller can cover the ask.
    pub fn fulfill(&mut self, product: &str, requested: Qty) -> Option<Fill> {
        let entries = self.records.get_mut(product)?;

        let pick = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.quantity >= requested)
            .min_by(|(_, a), (_, b)| {
                total_cmp(&a.clock, a.seller_id, &b.clock, b.seller_id)
            })
            .map(|(i, _)| i)?;

        let fill = {
            let entry = &mut entries[pick];
            entry.quantity -= requested;
            Fill {
                seller_id: entry.seller_id,
                seller_addr: entry.addr,
                quantity: requested,
            }
        };
        if entries[pick].quantity == 0 {
            entries.remove(pick);
        }
        if entries.is_empty() {
            self.records.remove(product);
        }
        Some(fill)
    }

    /// Total stock of a product across all sellers.
    pub fn total_stock(&self, product: &str) -> Qty {
        self.records
            .get(product)
            .map(|entries| entries.iter().map(|e| e.quantity).sum())
            .unwrap_or(0)
    }

    pub fn sellers_of(&self, product: &str) -> &[SellerEntry] {
        self.records
            .get(product)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.records.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn clock(slots: &[u64]) -> VectorClock {
        let mut c = VectorClock::new(slots.len());
        for (i, &v) in slots.iter().enumerate() {
            for _ in 0..v {
                c.tick(i as PeerId);
            }
        }
        c
    }

    #[test]
    fn test_merge_accumulates_and_overwrites_clock() {
        let mut inv = TraderInventory::new();
        inv.merge(1, addr(6001), "fish", 5, clock(&[1, 0]));
        inv.merge(1, addr(6001), "fish", 3, clock(&[2, 0]));

        let entries = inv.sellers_of("fish");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quantity, 8);
        assert_eq!(entries[0].clock, clock(&[2, 0]));
    }

    #[test]
    fn test_fulfill_prefers_causally_earlier_seller() {
        // Seller 5 announced before seller 1 observed it ([0,1,0] < [0,1,2]):
        // causality beats the id tie-break.
        let mut inv = TraderInventory::new();
        inv.merge(5, addr(6005), "fish", 5, clock(&[0, 1, 0]));
        inv.merge(1, addr(6001), "fish", 5, clock(&[0, 1, 2]));

        let fill = inv.fulfill("fish", 2).unwrap();
        assert_eq!(fill.seller_id, 5);
        let remaining = inv
            .sellers_of("fish")
            .iter()
            .find(|e| e.seller_id == 5)
            .unwrap()
            .quantity;
        assert_eq!(remaining, 3);
    }

    #[test]
    fn test_fulfill_concurrent_clocks_break_by_id() {
        // Sellers announce "fish" with clocks [1,0,0] and [0,1,0]
        // (concurrent): the smaller numeric id wins.
        let mut inv = TraderInventory::new();
        inv.merge(2, addr(6002), "fish", 10, clock(&[0, 1, 0]));
        inv.merge(1, addr(6001), "fish", 10, clock(&[1, 0, 0]));

        let fill = inv.fulfill("fish", 4).unwrap();
        assert_eq!(fill.seller_id, 1);
        assert_eq!(inv.total_stock("fish"), 16);
    }

    #[test]
    fn test_fulfill_skips_entries_below_request() {
        let mut inv = TraderInventory::new();
        inv.merge(1, addr(6001), "salt", 2, clock(&[1, 0]));
        inv.merge(2, addr(6002), "salt", 9, clock(&[0, 1]));

        // Seller 1 is preferred by id but cannot cover 5 units.
        let fill = inv.fulfill("salt", 5).unwrap();
        assert_eq!(fill.seller_id, 2);
    }

    #[test]
    fn test_drained_entry_is_removed() {
        let mut inv = TraderInventory::new();
        inv.merge(1, addr(6001), "boar", 4, clock(&[1]));
        assert!(inv.fulfill("boar", 4).is_some());
        assert!(inv.sellers_of("boar").is_empty());
        assert!(inv.fulfill("boar", 1).is_none());
        assert!(inv.is_empty());
    }

    #[test]
    fn test_no_seller_covers_request() {
        let mut inv = TraderInventory::new();
        inv.merge(1, addr(6001), "salt", 3, clock(&[1]));
        assert!(inv.fulfill("salt", 4).is_none());
        // Failed fulfilment must not mutate stock.
        assert_eq!(inv.total_stock("salt"), 3);
    }

    #[test]
    fn test_stock_conservation() {
        // total = sum of announced minus sum of fulfilled
        let mut inv = TraderInventory::new();
        inv.merge(1, addr(6001), "fish", 10, clock(&[1, 0]));
        inv.merge(2, addr(6002), "fish", 7, clock(&[0, 1]));
        inv.fulfill("fish", 4).unwrap();
        inv.fulfill("fish", 6).unwrap();
        assert_eq!(inv.total_stock("fish"), 10 + 7 - 4 - 6);
    }
}
