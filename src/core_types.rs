//! Core types used throughout the system
//!
//! Fundamental aliases shared by every module. They provide semantic
//! meaning and keep the wire/persistence layers in one place when a type
//! needs to evolve.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Peer ID - globally unique identifier for a peer.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Sequential**: Assigned contiguously (0, 1, 2, ...)
///
/// Doubles as the peer's index into every vector clock, so ids must stay
/// dense in `0..N`.
pub type PeerId = u32;

/// Product name traded on the market (e.g. "fish", "salt", "boar").
pub type Product = String;

/// Stock quantity. Invariant: never negative; a zero entry is removed.
pub type Qty = u32;

/// Request ID - hex-encoded 256-bit hash, unique per buyer request.
pub type RequestId = String;

/// Derive a fresh request id from `(peer_id ‖ product ‖ timestamp)`.
///
/// The nanosecond timestamp makes ids from the same peer/product pair
/// distinct across retries.
pub fn new_request_id(peer_id: PeerId, product: &str) -> RequestId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(peer_id.to_be_bytes());
    hasher.update(product.as_bytes());
    hasher.update(nanos.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let rid = new_request_id(3, "salt");
        // 256 bits, hex encoded
        assert_eq!(rid.len(), 64);
        assert!(rid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_id_unique_across_retries() {
        let a = new_request_id(3, "salt");
        let b = new_request_id(3, "salt");
        assert_ne!(a, b);
    }
}
