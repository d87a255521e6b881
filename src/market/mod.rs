//! Market peers - the gen-1/2 runtime
//!
//! A [`MarketPeer`] is one node on the datagram plane. Its capabilities
//! are a small set of flags (buyer, seller, trader candidate); role state
//! lives in tagged payloads (`BuyerState`, `SellerState`, `TraderState`)
//! rather than subclasses, so one peer can carry any combination.

pub mod buyer;
pub mod peer;
pub mod seller;
pub mod trader;

pub use buyer::BuyerState;
pub use peer::{MarketPeer, RoleSpec};
pub use seller::SellerState;
pub use trader::{BuyOutcome, PendingBuy, TraderState};
