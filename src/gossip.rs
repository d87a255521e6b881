//! Gossip lookup engine - bounded-hop flooded item queries (gen-1)
//!
//! A buyer floods a `Lookup` to its neighbors; matching sellers answer
//! with a `Reply` that walks the recorded forward path in reverse. Each
//! peer suppresses duplicate request ids with a bounded FIFO cache.
//!
//! The engine *decides* what to do with a message and returns the action;
//! the peer performs the sends afterwards. No lock is ever held across a
//! network send.

use crate::core_types::{PeerId, Product, Qty, RequestId};
use crate::messages::{PathHop, PeerMessage};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::debug;

// ============================================================
// DUPLICATE SUPPRESSION
// ============================================================

/// Bounded request-id cache with FIFO eviction.
#[derive(Debug)]
pub struct DuplicateCache {
    capacity: usize,
    seen: FxHashSet<RequestId>,
    order: VecDeque<RequestId>,
}

impl DuplicateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: FxHashSet::default(),
            order: VecDeque::new(),
        }
    }

    /// Record a request id. Returns `false` if it was already present
    /// (i.e. the message is a duplicate).
    pub fn insert(&mut self, request_id: &str) -> bool {
        if self.seen.contains(request_id) {
            return false;
        }
        if self.seen.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(request_id.to_string());
        self.order.push_back(request_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ============================================================
// ENGINE
// ============================================================

/// What the peer should do with an incoming `Lookup`.
#[derive(Debug, PartialEq)]
pub enum LookupAction {
    /// This peer sells the item: send the reply one hop back.
    Reply { to: SocketAddr, message: PeerMessage },
    /// Re-flood to neighbors not already on the path.
    Forward {
        targets: Vec<SocketAddr>,
        message: PeerMessage,
    },
    /// Duplicate, hop budget exhausted, or malformed: drop silently.
    Drop,
}

/// What the peer should do with an incoming `Reply`.
#[derive(Debug, PartialEq)]
pub enum ReplyAction {
    /// Consume the path tail and pass the reply along.
    Forward { to: SocketAddr, message: PeerMessage },
    /// Path is empty: this peer is the originator; evaluate the offer.
    Offer {
        request_id: RequestId,
        seller_id: PeerId,
        seller_addr: SocketAddr,
        product: Product,
    },
}

/// The seller side of a peer, as seen by the lookup handler.
#[derive(Debug, Clone, Copy)]
pub struct SellerView<'a> {
    pub product: &'a str,
    pub stock: Qty,
}

pub struct GossipEngine {
    seen: Mutex<DuplicateCache>,
}

impl GossipEngine {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            seen: Mutex::new(DuplicateCache::new(cache_capacity)),
        }
    }

    /// Build the initial lookup a buyer floods to its neighbors.
    pub fn initial_lookup(
        request_id: RequestId,
        buyer_id: PeerId,
        buyer_addr: SocketAddr,
        product: Product,
        hop_budget: u8,
        clock: crate::clock::VectorClock,
    ) -> PeerMessage {
        PeerMessage::Lookup {
            request_id,
            buyer_id,
            product,
            hop_count: hop_budget,
            search_path: vec![PathHop {
                peer_id: buyer_id,
                addr: buyer_addr,
            }],
            clock,
        }
    }

    /// Mark a request id as seen, so a peer's own flooded lookup is
    /// suppressed if the graph routes it back.
    pub fn note_request(&self, request_id: &str) {
        self.seen.lock().unwrap().insert(request_id);
    }

    /// Decide how to handle a lookup arriving at `(self_id, self_addr)`.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_lookup(
        &self,
        self_id: PeerId,
        self_addr: SocketAddr,
        seller: Option<SellerView<'_>>,
        neighbors: &[(PeerId, SocketAddr)],
        request_id: RequestId,
        buyer_id: PeerId,
        product: Product,
        hop_count: u8,
        search_path: Vec<PathHop>,
        clock: crate::clock::VectorClock,
    ) -> LookupAction {
        if !self.seen.lock().unwrap().insert(&request_id) {
            debug!(peer = self_id, %request_id, "duplicate lookup suppressed");
            return LookupAction::Drop;
        }

        // A matching seller with stock answers instead of forwarding.
        if let Some(view) = seller
            && view.product == product
            && view.stock > 0
        {
            let Some(last_hop) = search_path.last().cloned() else {
                debug!(peer = self_id, %request_id, "lookup with empty path");
                return LookupAction::Drop;
            };
            let reply_path = search_path[..search_path.len() - 1].to_vec();
            return LookupAction::Reply {
                to: last_hop.addr,
                message: PeerMessage::Reply {
                    request_id,
                    seller_id: self_id,
                    seller_addr: self_addr,
                    product,
                    reply_path,
                    clock,
                },
            };
        }

        if hop_count == 0 {
            debug!(peer = self_id, %request_id, "hop budget exhausted, dropping lookup");
            return LookupAction::Drop;
        }

        let mut forward_path = search_path;
        let on_path: FxHashSet<PeerId> = forward_path.iter().map(|h| h.peer_id).collect();
        forward_path.push(PathHop {
            peer_id: self_id,
            addr: self_addr,
        });

        let targets: Vec<SocketAddr> = neighbors
            .iter()
            .filter(|(id, _)| *id != self_id && !on_path.contains(id))
            .map(|(_, addr)| *addr)
            .collect();

        if targets.is_empty() {
            return LookupAction::Drop;
        }

        LookupAction::Forward {
            targets,
            message: PeerMessage::Lookup {
                request_id,
                buyer_id,
                product,
                hop_count: hop_count - 1,
                search_path: forward_path,
                clock,
            },
        }
    }

    /// Decide how to handle a reply: consume the path tail or surface the
    /// offer to the originating buyer.
    pub fn handle_reply(
        request_id: RequestId,
        seller_id: PeerId,
        seller_addr: SocketAddr,
        product: Product,
        mut reply_path: Vec<PathHop>,
        clock: crate::clock::VectorClock,
    ) -> ReplyAction {
        match reply_path.pop() {
            Some(next_hop) => ReplyAction::Forward {
                to: next_hop.addr,
                message: PeerMessage::Reply {
                    request_id,
                    seller_id,
                    seller_addr,
                    product,
                    reply_path,
                    clock,
                },
            },
            None => ReplyAction::Offer {
                request_id,
                seller_id,
                seller_addr,
                product,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn hop(id: PeerId) -> PathHop {
        PathHop {
            peer_id: id,
            addr: addr(5000 + id as u16),
        }
    }

    #[test]
    fn test_duplicate_cache_fifo_eviction() {
        let mut cache = DuplicateCache::new(2);
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(!cache.insert("a"));
        // "c" evicts "a" (oldest)
        assert!(cache.insert("c"));
        assert!(cache.insert("a"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_matching_seller_replies_one_hop_back() {
        let engine = GossipEngine::new(64);
        let action = engine.handle_lookup(
            2,
            addr(5002),
            Some(SellerView {
                product: "salt",
                stock: 3,
            }),
            &[(0, addr(5000))],
            "rid".into(),
            0,
            "salt".into(),
            1,
            vec![hop(0)],
            VectorClock::new(3),
        );

        match action {
            LookupAction::Reply { to, message } => {
                assert_eq!(to, addr(5000));
                match message {
                    PeerMessage::Reply {
                        seller_id,
                        seller_addr,
                        reply_path,
                        ..
                    } => {
                        assert_eq!(seller_id, 2);
                        assert_eq!(seller_addr, addr(5002));
                        // Buyer was the only hop, so the path is consumed.
                        assert!(reply_path.is_empty());
                    }
                    other => panic!("expected Reply, got {:?}", other),
                }
            }
            other => panic!("expected Reply action, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_excludes_peers_on_path() {
        let engine = GossipEngine::new(64);
        let action = engine.handle_lookup(
            1,
            addr(5001),
            None,
            &[(0, addr(5000)), (2, addr(5002)), (3, addr(5003))],
            "rid".into(),
            0,
            "fish".into(),
            2,
            vec![hop(0)],
            VectorClock::new(4),
        );

        match action {
            LookupAction::Forward { targets, message } => {
                // Peer 0 originated; only 2 and 3 are fresh.
                assert_eq!(targets, vec![addr(5002), addr(5003)]);
                match message {
                    PeerMessage::Lookup {
                        hop_count,
                        search_path,
                        ..
                    } => {
                        assert_eq!(hop_count, 1);
                        assert_eq!(
                            search_path.iter().map(|h| h.peer_id).collect::<Vec<_>>(),
                            vec![0, 1]
                        );
                    }
                    other => panic!("expected Lookup, got {:?}", other),
                }
            }
            other => panic!("expected Forward action, got {:?}", other),
        }
    }

    #[test]
    fn test_hop_budget_exhausted_drops() {
        let engine = GossipEngine::new(64);
        let action = engine.handle_lookup(
            1,
            addr(5001),
            None,
            &[(2, addr(5002))],
            "rid".into(),
            0,
            "fish".into(),
            0,
            vec![hop(0)],
            VectorClock::new(3),
        );
        assert_eq!(action, LookupAction::Drop);
    }

    #[test]
    fn test_second_arrival_suppressed() {
        let engine = GossipEngine::new(64);
        let first = engine.handle_lookup(
            1,
            addr(5001),
            None,
            &[(2, addr(5002))],
            "rid".into(),
            0,
            "fish".into(),
            2,
            vec![hop(0)],
            VectorClock::new(3),
        );
        assert!(matches!(first, LookupAction::Forward { .. }));

        let second = engine.handle_lookup(
            1,
            addr(5001),
            None,
            &[(2, addr(5002))],
            "rid".into(),
            0,
            "fish".into(),
            2,
            vec![hop(0)],
            VectorClock::new(3),
        );
        assert_eq!(second, LookupAction::Drop);
    }

    #[test]
    fn test_seller_without_stock_forwards() {
        let engine = GossipEngine::new(64);
        let action = engine.handle_lookup(
            1,
            addr(5001),
            Some(SellerView {
                product: "fish",
                stock: 0,
            }),
            &[(2, addr(5002))],
            "rid".into(),
            0,
            "fish".into(),
            1,
            vec![hop(0)],
            VectorClock::new(3),
        );
        assert!(matches!(action, LookupAction::Forward { .. }));
    }

    #[test]
    fn test_reply_walks_path_tail_first() {
        let action = GossipEngine::handle_reply(
            "rid".into(),
            3,
            addr(5003),
            "salt".into(),
            vec![hop(0), hop(1)],
            VectorClock::new(4),
        );
        match action {
            ReplyAction::Forward { to, message } => {
                assert_eq!(to, addr(5001));
                match message {
                    PeerMessage::Reply { reply_path, .. } => {
                        assert_eq!(reply_path, vec![hop(0)]);
                    }
                    other => panic!("expected Reply, got {:?}", other),
                }
            }
            other => panic!("expected Forward, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_reply_path_surfaces_offer() {
        let action = GossipEngine::handle_reply(
            "rid".into(),
            3,
            addr(5003),
            "salt".into(),
            vec![],
            VectorClock::new(4),
        );
        assert!(matches!(action, ReplyAction::Offer { seller_id: 3, .. }));
    }
}
