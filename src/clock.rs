//! Vector clocks - causal ordering for the trading plane
//!
//! Every peer carries an N-long clock (N = number of peers) and stamps a
//! snapshot into each trading-plane message. The receive path merges the
//! enclosed clock (pointwise max) and then ticks its own component.
//!
//! # Ordering
//!
//! | relation | meaning |
//! |----------|---------|
//! | `Before` | every component `<=`, at least one strict |
//! | `After`  | the symmetric case |
//! | `Concurrent` | neither dominates |
//!
//! Concurrent events are given a stable total order by breaking ties on
//! the numeric peer id; the trader uses this both to drain its pending-buy
//! queue and to pick among concurrent seller entries.

use crate::core_types::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Outcome of comparing two clocks under happens-before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    After,
    Concurrent,
}

/// N-long non-negative event counter, one slot per peer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VectorClock(Vec<u64>);

impl VectorClock {
    /// A zeroed clock for a network of `n` peers.
    pub fn new(n: usize) -> Self {
        Self(vec![0; n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record a local event: increment this peer's own component.
    pub fn tick(&mut self, own_index: PeerId) {
        let idx = own_index as usize;
        if idx < self.0.len() {
            self.0[idx] += 1;
        }
    }

    /// Pointwise max with a received clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (slot, incoming) in self.0.iter_mut().zip(other.0.iter()) {
            *slot = (*slot).max(*incoming);
        }
    }

    /// Receive-path update: merge the enclosed clock, then tick own slot.
    pub fn observe(&mut self, other: &VectorClock, own_index: PeerId) {
        self.merge(other);
        self.tick(own_index);
    }

    /// Happens-before comparison.
    pub fn causal_cmp(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            _ => CausalOrder::Concurrent,
        }
    }

    pub fn get(&self, index: PeerId) -> u64 {
        self.0.get(index as usize).copied().unwrap_or(0)
    }
}

/// Total order used by the trader: happens-before first, concurrent
/// entries stable-ordered by numeric id.
pub fn total_cmp(a: &VectorClock, a_id: PeerId, b: &VectorClock, b_id: PeerId) -> Ordering {
    match a.causal_cmp(b) {
        CausalOrder::Before => Ordering::Less,
        CausalOrder::After => Ordering::Greater,
        CausalOrder::Concurrent => a_id.cmp(&b_id),
    }
}

/// A peer's live clock, shared between its receive loop and every task
/// that sends on its behalf.
///
/// Send path: [`PeerClock::stamp`] ticks the own slot and returns the
/// snapshot to embed - so any two messages from one peer are strictly
/// ordered componentwise. Receive path: [`PeerClock::observe`] merges the
/// enclosed clock and ticks.
#[derive(Clone)]
pub struct PeerClock {
    inner: std::sync::Arc<std::sync::Mutex<VectorClock>>,
    own_index: PeerId,
}

impl PeerClock {
    pub fn new(n: usize, own_index: PeerId) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(VectorClock::new(n))),
            own_index,
        }
    }

    /// Tick the own slot and snapshot, for stamping an outbound message.
    pub fn stamp(&self) -> VectorClock {
        let mut clock = self.inner.lock().unwrap();
        clock.tick(self.own_index);
        clock.clone()
    }

    /// Merge a received clock, then tick the own slot.
    pub fn observe(&self, other: &VectorClock) {
        self.inner.lock().unwrap().observe(other, self.own_index);
    }

    pub fn snapshot(&self) -> VectorClock {
        self.inner.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(slots: &[u64]) -> VectorClock {
        VectorClock(slots.to_vec())
    }

    #[test]
    fn test_tick_and_merge() {
        let mut a = VectorClock::new(3);
        a.tick(1);
        a.tick(1);
        assert_eq!(a.get(1), 2);

        let mut b = VectorClock::new(3);
        b.tick(0);
        b.merge(&a);
        assert_eq!(b.get(0), 1);
        assert_eq!(b.get(1), 2);
    }

    #[test]
    fn test_observe_merges_then_ticks_own() {
        let mut local = clock(&[1, 0, 4]);
        local.observe(&clock(&[0, 3, 5]), 0);
        assert_eq!(local, clock(&[2, 3, 5]));
    }

    #[test]
    fn test_causal_before_and_after() {
        let a = clock(&[1, 2, 0]);
        let b = clock(&[1, 3, 0]);
        assert_eq!(a.causal_cmp(&b), CausalOrder::Before);
        assert_eq!(b.causal_cmp(&a), CausalOrder::After);
    }

    #[test]
    fn test_causal_concurrent() {
        let a = clock(&[1, 0, 0]);
        let b = clock(&[0, 1, 0]);
        assert_eq!(a.causal_cmp(&b), CausalOrder::Concurrent);
        // Equal clocks are also "concurrent" (neither strictly dominates)
        assert_eq!(a.causal_cmp(&a), CausalOrder::Concurrent);
    }

    #[test]
    fn test_total_order_breaks_ties_by_id() {
        // Concurrent buys [2,0] from peer 5 and [0,2] from peer 3:
        // peer 3 drains first.
        let a = clock(&[2, 0]);
        let b = clock(&[0, 2]);
        assert_eq!(total_cmp(&a, 5, &b, 3), Ordering::Greater);
        assert_eq!(total_cmp(&b, 3, &a, 5), Ordering::Less);
    }

    #[test]
    fn test_total_order_respects_causality_over_id() {
        let earlier = clock(&[1, 0]);
        let later = clock(&[2, 1]);
        // Higher id still drains first when it causally precedes.
        assert_eq!(total_cmp(&later, 1, &earlier, 9), Ordering::Greater);
    }

    #[test]
    fn test_peer_clock_stamps_strictly_increase() {
        let peer = PeerClock::new(3, 1);
        let first = peer.stamp();
        let second = peer.stamp();
        assert_eq!(first.causal_cmp(&second), CausalOrder::Before);
    }

    #[test]
    fn test_peer_clock_observe_dominates_sender() {
        let peer = PeerClock::new(3, 0);
        let incoming = clock(&[0, 4, 2]);
        peer.observe(&incoming);
        let local = peer.snapshot();
        assert_eq!(incoming.causal_cmp(&local), CausalOrder::Before);
        assert_eq!(local.get(0), 1);
    }
}
