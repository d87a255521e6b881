//! peermarket - a distributed peer-to-peer marketplace
//!
//! Three generations of the same market, built step by step:
//!
//! ```text
//! gen-1 ┌───────┐ lookup  ┌────────┐  gen-2 ┌───────┐  buy   ┌────────┐
//!       │ Buyer │────────▶│ Seller │        │ Buyer │───────▶│ Trader │
//!       └───────┘ ◀─reply─└────────┘        └───────┘        └───┬────┘
//!        flooded gossip, reverse paths       bully-elected       │ clock-
//!                                            leader              │ ordered
//! gen-3 ┌────────┐    ┌────────┐             ┌────────┐◀────────┘ fills
//!       │ Trader │◀──▶│ Trader │──heartbeat  │ Seller │
//!       └───┬────┘    └───┬────┘             └────────┘
//!           └──── cache ──┴──▶ Warehouse (authoritative)
//! ```
//!
//! # Modules
//!
//! - [`core_types`] - id/quantity aliases, request-id hashing
//! - [`clock`] - vector clocks and causal ordering
//! - [`messages`] - peer-to-peer wire types
//! - [`transport`] - length-prefixed bincode datagrams
//! - [`registry`] - id→address table, neighbor graph, leader watch
//! - [`gossip`] - gen-1 flooded lookup engine
//! - [`inventory`] - the trader's multi-seller stock records
//! - [`snapshot`] - durable {inventory, earnings} with CRC64
//! - [`election`] - bully election and the leader monitor
//! - [`market`] - gen-1/2 peer runtime (buyer/seller/trader behaviors)
//! - [`warehouse`] - gen-3 tier: database server, cached traders, clients

pub mod clock;
pub mod config;
pub mod core_types;
pub mod election;
pub mod gossip;
pub mod inventory;
pub mod logging;
pub mod messages;
pub mod registry;
pub mod snapshot;
pub mod transport;

pub mod market;
pub mod warehouse;

// Convenient re-exports at crate root
pub use clock::{CausalOrder, PeerClock, VectorClock};
pub use config::{Config, Generation, MarketConfig};
pub use core_types::{PeerId, Product, Qty, RequestId};
pub use inventory::TraderInventory;
pub use market::{MarketPeer, RoleSpec, TraderState};
pub use messages::{PeerMessage, TradeStatus};
pub use registry::{LeaderInfo, PeerRegistry};
pub use snapshot::{SnapshotStore, TraderSnapshot};
pub use transport::Datagram;
pub use warehouse::{Gen3Buyer, Gen3Seller, TradingPost, WarehouseServer};
