//! Trader-side warehouse cache
//!
//! Maps product → last-known warehouse quantity. The trader consults it
//! before forwarding buys (failing fast on a cache miss - the under-sell
//! case) and updates it optimistically on sells. Disagreements with the
//! warehouse are counted:
//!
//! - **over-sell**: cache said yes, warehouse said no. Counted and
//!   followed by a full refresh.
//! - **under-sell**: cache said no; the buyer is rejected without asking
//!   the warehouse. Tolerated for the reduced load.
//!
//! Between refreshes a single trader's cache is monotonic; two traders'
//! caches are not synchronized and reconcile at their next refresh.

use crate::core_types::{Product, Qty};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct TraderCache {
    entries: Mutex<HashMap<Product, Qty>>,
    total_buy_requests: AtomicU64,
    oversell_detected: AtomicU64,
}

impl TraderCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            total_buy_requests: AtomicU64::new(0),
            oversell_detected: AtomicU64::new(0),
        }
    }

    /// Full refresh from a warehouse inventory fetch.
    pub fn replace_all(&self, inventory: HashMap<Product, Qty>) {
        *self.entries.lock().unwrap() = inventory;
    }

    pub fn get(&self, product: &str) -> Qty {
        self.entries
            .lock()
            .unwrap()
            .get(product)
            .copied()
            .unwrap_or(0)
    }

    /// Buy admission check. Counts the request; `false` means the cache
    /// cannot cover it and the buy should be rejected without touching
    /// the warehouse.
    pub fn admit_buy(&self, product: &str, quantity: Qty) -> bool {
        self.total_buy_requests.fetch_add(1, Ordering::SeqCst);
        self.get(product) >= quantity
    }

    /// Warehouse confirmed a buy: mirror the decrement.
    pub fn commit_buy(&self, product: &str, quantity: Qty) {
        let mut entries = self.entries.lock().unwrap();
        let stock = entries.entry(product.to_string()).or_insert(0);
        *stock = stock.saturating_sub(quantity);
    }

    /// Warehouse rejected a buy the cache admitted.
    pub fn record_oversell(&self) {
        self.oversell_detected.fetch_add(1, Ordering::SeqCst);
    }

    /// Optimistic sell-side increment, applied before the warehouse
    /// answers.
    pub fn apply_sell(&self, product: &str, quantity: Qty) {
        *self
            .entries
            .lock()
            .unwrap()
            .entry(product.to_string())
            .or_insert(0) += quantity;
    }

    /// Revert [`Self::apply_sell`] after a warehouse error.
    pub fn revert_sell(&self, product: &str, quantity: Qty) {
        let mut entries = self.entries.lock().unwrap();
        let stock = entries.entry(product.to_string()).or_insert(0);
        *stock = stock.saturating_sub(quantity);
    }

    pub fn total_buy_requests(&self) -> u64 {
        self.total_buy_requests.load(Ordering::SeqCst)
    }

    pub fn oversell_detected(&self) -> u64 {
        self.oversell_detected.load(Ordering::SeqCst)
    }

    /// Fraction of buy requests that hit the over-sell path.
    pub fn oversell_rate(&self) -> f64 {
        let total = self.total_buy_requests();
        if total == 0 {
            0.0
        } else {
            self.oversell_detected() as f64 / total as f64
        }
    }
}

impl Default for TraderCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(product: &str, quantity: Qty) -> TraderCache {
        let cache = TraderCache::new();
        cache.replace_all(HashMap::from([(product.to_string(), quantity)]));
        cache
    }

    #[test]
    fn test_admit_and_commit() {
        let cache = cache_with("apple", 100);
        assert!(cache.admit_buy("apple", 10));
        cache.commit_buy("apple", 10);
        assert_eq!(cache.get("apple"), 90);
    }

    #[test]
    fn test_undersell_fails_fast() {
        let cache = cache_with("apple", 5);
        assert!(!cache.admit_buy("apple", 50));
        // Rejection leaves the cache untouched.
        assert_eq!(cache.get("apple"), 5);
        assert_eq!(cache.total_buy_requests(), 1);
        assert_eq!(cache.oversell_detected(), 0);
    }

    #[test]
    fn test_oversell_counting_and_refresh() {
        // Warehouse externally drained to 5 while the cache believes 90.
        let cache = cache_with("apple", 90);
        assert!(cache.admit_buy("apple", 50));
        // Warehouse says no: count it and refresh.
        cache.record_oversell();
        cache.replace_all(HashMap::from([("apple".to_string(), 5)]));

        // Next buy of 5 goes through; the one after is rejected straight
        // from the cache.
        assert_eq!(cache.get("apple"), 5);
        assert!(cache.admit_buy("apple", 5));
        cache.commit_buy("apple", 5);
        assert!(!cache.admit_buy("apple", 1));

        assert_eq!(cache.oversell_detected(), 1);
        assert!((cache.oversell_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_optimistic_sell_and_revert() {
        let cache = cache_with("banana", 10);
        cache.apply_sell("banana", 4);
        assert_eq!(cache.get("banana"), 14);
        cache.revert_sell("banana", 4);
        assert_eq!(cache.get("banana"), 10);
    }

    #[test]
    fn test_unknown_product_reads_zero() {
        let cache = TraderCache::new();
        assert_eq!(cache.get("kiwi"), 0);
        assert!(!cache.admit_buy("kiwi", 1));
    }
}
