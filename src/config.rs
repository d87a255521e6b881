//! Market configuration types and loaders
//!
//! All tunables recognized by the three marketplace generations live here,
//! loaded from a single YAML file. Every field has a default so a partial
//! (or absent) config file still yields a runnable market.

use crate::core_types::Qty;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which marketplace generation a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    /// Flooded lookup-and-reply on an arbitrary graph.
    Gossip,
    /// Bully-elected trader mediating all transactions.
    #[default]
    Mediated,
    /// Dual traders backed by the warehouse database.
    Warehouse,
}

/// Market behavior tunables (shared by all generations).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Probability a buyer continues after a successful purchase.
    pub buy_probability: f64,
    /// Stock a seller holds after every restock.
    pub seller_stock: Qty,
    /// Transactions a buyer completes before shutting down.
    pub max_transactions: u32,
    /// Seconds before a pending buyer request is abandoned.
    pub timeout_secs: f64,
    /// Per-unit price.
    pub price: f64,
    /// Fractional commission retained by the trader.
    pub commission: f64,
    /// Leader-monitor tick interval, seconds.
    pub time_quantum_secs: f64,
    /// Simulated leader failure rate per quantum.
    pub leader_failure_probability: f64,
    /// Bully-election OK wait, seconds.
    pub ok_timeout_secs: f64,
    /// Mean pause between a buyer's consecutive purchases, seconds.
    pub inter_buy_delay_secs: f64,
    /// Bound on concurrent message handlers per peer.
    pub max_workers: usize,
    /// Products traded on this market.
    pub products: Vec<String>,
    /// Gen-3 mutual heartbeat interval, seconds.
    pub heartbeat_interval_secs: f64,
    /// Gen-3 trader cache full-refresh interval, seconds.
    pub cache_refresh_secs: f64,
    /// Gen-3 seller: goods accrued per accrual tick.
    pub seller_accrual_goods: Qty,
    /// Gen-3 seller: accrual tick interval, seconds.
    pub seller_accrual_secs: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            buy_probability: 0.5,
            seller_stock: 10,
            max_transactions: 5,
            timeout_secs: 5.0,
            price: 10.0,
            commission: 0.1,
            time_quantum_secs: 10.0,
            leader_failure_probability: 0.8,
            ok_timeout_secs: 1.0,
            inter_buy_delay_secs: 5.0,
            max_workers: 10,
            products: vec!["fish".into(), "salt".into(), "boar".into()],
            heartbeat_interval_secs: 2.0,
            cache_refresh_secs: 5.0,
            seller_accrual_goods: 5,
            seller_accrual_secs: 5.0,
        }
    }
}

impl MarketConfig {
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    #[inline]
    pub fn ok_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ok_timeout_secs)
    }

    #[inline]
    pub fn time_quantum(&self) -> Duration {
        Duration::from_secs_f64(self.time_quantum_secs)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    #[inline]
    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cache_refresh_secs)
    }

    /// Seller payout for a fill: `price·qty − commission·price·qty`.
    #[inline]
    pub fn seller_payment(&self, qty: Qty) -> f64 {
        let gross = self.price * qty as f64;
        gross - self.commission * gross
    }

    /// Trader commission on a fill.
    #[inline]
    pub fn trader_commission(&self, qty: Qty) -> f64 {
        self.commission * self.price * qty as f64
    }
}

/// Process-level config: logging destination and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    /// "hourly", "daily", or anything else for a single file.
    pub rotation: String,
    pub use_json: bool,
    pub enable_tracing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".into(),
            log_file: "peermarket.log".into(),
            log_level: "info".into(),
            rotation: "never".into(),
            use_json: false,
            enable_tracing: true,
        }
    }
}

/// Simulation topology: which generation, how many of each role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub generation: Generation,
    pub num_buyers: usize,
    pub num_sellers: usize,
    /// Gen-1 hop budget; capped by the computed graph diameter at bootstrap.
    pub hop_budget: u8,
    /// Gen-3: warehouse listen port (0 = ephemeral).
    pub warehouse_port: u16,
    /// Gen-3: trader listen ports (exactly two traders).
    pub trader_ports: Vec<u16>,
    /// Gen-3: durable warehouse inventory file.
    pub warehouse_file: String,
    /// Gen-2: trader snapshot file.
    pub snapshot_file: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            generation: Generation::Mediated,
            num_buyers: 3,
            num_sellers: 3,
            hop_budget: 3,
            warehouse_port: 0,
            trader_ports: vec![0, 0],
            warehouse_file: "warehouse_inventory.json".into(),
            snapshot_file: "trader_snapshot.bin".into(),
        }
    }
}

/// Everything the binary needs, in one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub market: MarketConfig,
    pub app: AppConfig,
    pub sim: SimConfig,
}

impl Config {
    /// Load from a YAML file; a missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}
