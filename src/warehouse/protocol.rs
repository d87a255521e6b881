//! Warehouse wire protocol - `action|product|quantity|request_id` lines
//!
//! Requests:
//!
//! ```text
//! buy|apple|10|<rid>
//! sell|apple|5|<rid>
//! fetch|inventory|0|<rid>
//! ```
//!
//! Responses are `OK|<payload>|<rid>` or `ERROR|<reason>|<rid>`; an
//! inventory fetch carries the full product→quantity map as JSON in the
//! payload slot.

use crate::core_types::{Product, Qty};
use thiserror::Error;

/// Heartbeat probe exchanged between the two traders.
pub const HEARTBEAT_MESSAGE: &str = "ARE YOU THERE?";
/// Expected answer to [`HEARTBEAT_MESSAGE`].
pub const HEARTBEAT_RESPONSE: &str = "YES, I'm Alive";
/// Prefix of the survivor broadcast: `SOLOTRADER|<port>`.
pub const SOLOTRADER_PREFIX: &str = "SOLOTRADER|";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid command format: {0}")]
    InvalidFormat(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseRequest {
    Buy {
        product: Product,
        quantity: Qty,
        request_id: String,
    },
    Sell {
        product: Product,
        quantity: Qty,
        request_id: String,
    },
    FetchInventory {
        request_id: String,
    },
}

impl WarehouseRequest {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = line.trim_end().split('|').collect();
        if parts.len() != 4 {
            return Err(ProtocolError::InvalidFormat(line.to_string()));
        }
        let (action, product, quantity, request_id) = (parts[0], parts[1], parts[2], parts[3]);

        match action {
            "fetch" if product == "inventory" => Ok(Self::FetchInventory {
                request_id: request_id.to_string(),
            }),
            "buy" | "sell" => {
                let quantity: Qty = quantity
                    .parse()
                    .map_err(|_| ProtocolError::InvalidQuantity(quantity.to_string()))?;
                let product = product.to_string();
                let request_id = request_id.to_string();
                Ok(if action == "buy" {
                    Self::Buy {
                        product,
                        quantity,
                        request_id,
                    }
                } else {
                    Self::Sell {
                        product,
                        quantity,
                        request_id,
                    }
                })
            }
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Buy {
                product,
                quantity,
                request_id,
            } => format!("buy|{}|{}|{}", product, quantity, request_id),
            Self::Sell {
                product,
                quantity,
                request_id,
            } => format!("sell|{}|{}|{}", product, quantity, request_id),
            Self::FetchInventory { request_id } => format!("fetch|inventory|0|{}", request_id),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Buy { request_id, .. }
            | Self::Sell { request_id, .. }
            | Self::FetchInventory { request_id } => request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseResponse {
    Ok { payload: String, request_id: String },
    Error { reason: String, request_id: String },
}

impl WarehouseResponse {
    pub fn ok(payload: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::Ok {
            payload: payload.into(),
            request_id: request_id.into(),
        }
    }

    pub fn error(reason: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
            request_id: request_id.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end();
        // The payload may itself contain '|' only in theory; JSON maps
        // don't, so a 3-way split suffices.
        let mut parts = line.splitn(3, '|');
        let status = parts.next().unwrap_or_default();
        let body = parts.next();
        let request_id = parts.next();
        match (status, body, request_id) {
            ("OK", Some(payload), Some(rid)) => Ok(Self::ok(payload, rid)),
            ("ERROR", Some(reason), Some(rid)) => Ok(Self::error(reason, rid)),
            _ => Err(ProtocolError::InvalidFormat(line.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Ok {
                payload,
                request_id,
            } => format!("OK|{}|{}", payload, request_id),
            Self::Error { reason, request_id } => format!("ERROR|{}|{}", reason, request_id),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}
