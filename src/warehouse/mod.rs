//! Warehouse tier - the gen-3 marketplace
//!
//! A central warehouse holds the authoritative inventory; two traders
//! front it with read-through caches and watch each other with mutual
//! heartbeats. Buyers and sellers are plain TCP clients that fail over to
//! the surviving trader after a `SOLOTRADER` broadcast.
//!
//! Everything on this plane speaks newline-terminated text frames; the
//! datagram plane's bincode messages never appear here.

pub mod cache;
pub mod client;
pub mod protocol;
pub mod server;
pub mod trader;

pub use cache::TraderCache;
pub use client::{Gen3Buyer, Gen3Seller};
pub use protocol::{WarehouseRequest, WarehouseResponse};
pub use server::WarehouseServer;
pub use trader::TradingPost;
