//! Peer registry - the shared coordination plane
//!
//! Replaces object-to-object peer links with an id→address table plus
//! per-peer neighbor id sets, so peers can be restarted or replaced
//! without dangling references. One registry is shared (`Arc`) by every
//! peer in a market and owns:
//!
//! - the id → (address, alive) table
//! - the undirected neighbor graph
//! - the accumulated previous-leaders set (barred from re-election)
//! - a watch channel publishing the current leader ("leader changed"
//!   subscription; `wait_for_leader` is the no-leader blocking point)

use crate::core_types::PeerId;
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::watch;

/// Lookup hop budget used until the graph is bootstrapped.
const DEFAULT_HOP_BUDGET: u8 = 3;

/// Identity of the currently mediating trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
struct PeerInfo {
    addr: SocketAddr,
    alive: bool,
}

pub struct PeerRegistry {
    peers: RwLock<FxHashMap<PeerId, PeerInfo>>,
    neighbors: RwLock<FxHashMap<PeerId, BTreeSet<PeerId>>>,
    previous_leaders: Mutex<HashSet<PeerId>>,
    leader_tx: watch::Sender<Option<LeaderInfo>>,
    hop_budget: AtomicU8,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            peers: RwLock::new(FxHashMap::default()),
            neighbors: RwLock::new(FxHashMap::default()),
            previous_leaders: Mutex::new(HashSet::new()),
            leader_tx,
            hop_budget: AtomicU8::new(DEFAULT_HOP_BUDGET),
        }
    }

    // ========================================================
    // PEER TABLE
    // ========================================================

    pub fn register(&self, id: PeerId, addr: SocketAddr) {
        self.peers
            .write()
            .unwrap()
            .insert(id, PeerInfo { addr, alive: true });
        self.neighbors.write().unwrap().entry(id).or_default();
    }

    pub fn addr_of(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.read().unwrap().get(&id).map(|p| p.addr)
    }

    pub fn set_alive(&self, id: PeerId, alive: bool) {
        if let Some(info) = self.peers.write().unwrap().get_mut(&id) {
            info.alive = alive;
        }
    }

    pub fn is_alive(&self, id: PeerId) -> bool {
        self.peers
            .read()
            .unwrap()
            .get(&id)
            .map(|p| p.alive)
            .unwrap_or(false)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    /// All peers currently known to be running.
    pub fn running_peers(&self) -> Vec<(PeerId, SocketAddr)> {
        let mut out: Vec<_> = self
            .peers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(id, p)| (*id, p.addr))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Running peers with a strictly higher id (bully election targets).
    pub fn running_peers_above(&self, id: PeerId) -> Vec<(PeerId, SocketAddr)> {
        self.running_peers()
            .into_iter()
            .filter(|(other, _)| *other > id)
            .collect()
    }

    // ========================================================
    // NEIGHBOR GRAPH
    // ========================================================

    /// Add an undirected edge.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let mut graph = self.neighbors.write().unwrap();
        graph.entry(a).or_default().insert(b);
        graph.entry(b).or_default().insert(a);
    }

    /// Connect every registered pair (gen-2 topology).
    pub fn connect_all(&self) {
        let ids: Vec<PeerId> = self.peers.read().unwrap().keys().copied().collect();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                self.connect(a, b);
            }
        }
    }

    pub fn neighbors_of(&self, id: PeerId) -> Vec<(PeerId, SocketAddr)> {
        let graph = self.neighbors.read().unwrap();
        let peers = self.peers.read().unwrap();
        graph
            .get(&id)
            .map(|set| {
                set.iter()
                    .filter_map(|n| peers.get(n).map(|p| (*n, p.addr)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set the effective lookup hop budget: the configured value capped
    /// by the bootstrapped graph's diameter (hops beyond the diameter
    /// cannot reach anyone new).
    pub fn bootstrap_hop_budget(&self, requested: u8) {
        let effective = requested.min(self.diameter()).max(1);
        self.hop_budget.store(effective, Ordering::SeqCst);
    }

    pub fn hop_budget(&self) -> u8 {
        self.hop_budget.load(Ordering::SeqCst)
    }

    /// Longest shortest path over the neighbor graph. Computed once at
    /// bootstrap to cap the gen-1 lookup hop budget. Unreachable pairs
    /// are ignored.
    pub fn diameter(&self) -> u8 {
        let graph = self.neighbors.read().unwrap();
        let ids: Vec<PeerId> = graph.keys().copied().collect();
        let mut diameter = 0u32;

        for &start in &ids {
            let mut dist: FxHashMap<PeerId, u32> = FxHashMap::default();
            dist.insert(start, 0);
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                let d = dist[&node];
                if let Some(adj) = graph.get(&node) {
                    for &next in adj {
                        if !dist.contains_key(&next) {
                            dist.insert(next, d + 1);
                            diameter = diameter.max(d + 1);
                            queue.push_back(next);
                        }
                    }
                }
            }
        }
        diameter.min(u8::MAX as u32) as u8
    }

    // ========================================================
    // LEADER
    // ========================================================

    /// Publish a new leader (or clear it with `None`). Subscribers parked
    /// in [`Self::wait_for_leader`] wake on every change.
    pub fn set_leader(&self, leader: Option<LeaderInfo>) {
        self.leader_tx.send_replace(leader);
    }

    pub fn leader(&self) -> Option<LeaderInfo> {
        *self.leader_tx.borrow()
    }

    /// Block until a leader is active. Never an error to callers: the only
    /// `None` case is the registry itself going away.
    pub async fn wait_for_leader(&self) -> Option<LeaderInfo> {
        let mut rx = self.leader_tx.subscribe();
        loop {
            if let Some(leader) = *rx.borrow_and_update() {
                return Some(leader);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    // ========================================================
    // PREVIOUS LEADERS
    // ========================================================

    /// Bar a failed leader from re-election. Accumulates for the lifetime
    /// of the run.
    pub fn bar_from_election(&self, id: PeerId) {
        self.previous_leaders.lock().unwrap().insert(id);
    }

    pub fn is_barred(&self, id: PeerId) -> bool {
        self.previous_leaders.lock().unwrap().contains(&id)
    }

    pub fn barred(&self) -> HashSet<PeerId> {
        self.previous_leaders.lock().unwrap().clone()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
