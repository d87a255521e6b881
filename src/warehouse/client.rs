//! Gen-3 clients - buyers and sellers of the warehouse tier
//!
//! Clients talk to their assigned trader over plain TCP text lines and
//! keep a small listener open for `SOLOTRADER` broadcasts. A failed
//! transaction is retried twice at the current trader and once at the
//! survivor before the client gives up on it.

use crate::config::MarketConfig;
use crate::core_types::{Product, Qty};
use rand::Rng;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::protocol::{SOLOTRADER_PREFIX, WarehouseRequest};

/// Per-attempt network deadline for a client exchange.
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(3);

/// Shared client plumbing: assigned traders, survivor port, broadcast
/// listener.
struct TraderLink {
    traders: Vec<SocketAddr>,
    backup_port: Mutex<Option<u16>>,
    listener_addr: SocketAddr,
}

impl TraderLink {
    /// Bind the broadcast listener and start watching for SOLOTRADER.
    async fn bind(
        traders: Vec<SocketAddr>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listener_addr = listener.local_addr()?;
        let link = Arc::new(Self {
            traders,
            backup_port: Mutex::new(None),
            listener_addr,
        });
        tokio::spawn(Arc::clone(&link).watch_broadcasts(listener, shutdown));
        Ok(link)
    }

    async fn watch_broadcasts(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(_) => continue,
                },
            };
            let mut lines = BufReader::new(stream).lines();
            if let Ok(Some(line)) = lines.next_line().await
                && let Some(port) = line.strip_prefix(SOLOTRADER_PREFIX)
                && let Ok(port) = port.trim().parse::<u16>()
            {
                info!(backup_port = port, "survivor trader announced");
                *self.backup_port.lock().unwrap() = Some(port);
            }
        }
    }

    /// Two tries at the assigned trader, a third at the survivor.
    async fn transact(&self, command: &str) -> Option<String> {
        for attempt in 0..3u8 {
            let target = if attempt < 2 {
                *self.traders.choose(&mut rand::thread_rng())?
            } else {
                let Some(port) = *self.backup_port.lock().unwrap() else {
                    warn!("no backup trader available, aborting request");
                    return None;
                };
                let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().ok()?;
                info!(backup = %addr, "switching to backup trader");
                addr
            };

            debug!(%target, attempt = attempt + 1, "attempting exchange");
            if let Some(response) = exchange(target, command).await {
                return Some(response);
            }
        }
        None
    }
}

/// Connect, send one command line, await one response line.
async fn exchange(target: SocketAddr, command: &str) -> Option<String> {
    let attempt = async {
        let stream = TcpStream::connect(target).await.ok()?;
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .ok()?;
        BufReader::new(read_half).lines().next_line().await.ok()?
    };
    match tokio::time::timeout(EXCHANGE_DEADLINE, attempt).await {
        Ok(Some(response)) => Some(response),
        _ => None,
    }
}

// ============================================================
// BUYER
// ============================================================

pub struct Gen3Buyer {
    buyer_id: u32,
    goods: Vec<Product>,
    link: Arc<TraderLink>,
    completed: AtomicU32,
    config: Arc<MarketConfig>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gen3Buyer {
    pub async fn bind(
        buyer_id: u32,
        traders: Vec<SocketAddr>,
        goods: Vec<Product>,
        config: Arc<MarketConfig>,
    ) -> std::io::Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = TraderLink::bind(traders, shutdown_rx).await?;
        Ok(Arc::new(Self {
            buyer_id,
            goods,
            link,
            completed: AtomicU32::new(0),
            config,
            shutdown_tx,
        }))
    }

    /// Where traders should send SOLOTRADER broadcasts.
    pub fn listener_addr(&self) -> SocketAddr {
        self.link.listener_addr
    }

    /// The survivor port learned from a SOLOTRADER broadcast, if any.
    pub fn backup_port(&self) -> Option<u16> {
        *self.link.backup_port.lock().unwrap()
    }

    pub fn completed_transactions(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One buy attempt through the retry ladder. Returns the response
    /// line when any trader answered.
    pub async fn buy_once(&self, product: &str, quantity: Qty) -> Option<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let command = WarehouseRequest::Buy {
            product: product.to_string(),
            quantity,
            request_id: request_id.clone(),
        }
        .encode();

        let response = self.link.transact(&command).await?;
        if response.starts_with("OK") {
            let total = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
            info!(buyer = self.buyer_id, %request_id, total, "buy complete: {}", response);
        } else {
            warn!(buyer = self.buyer_id, %request_id, "buy failure: {}", response);
        }
        Some(response)
    }

    /// The buyer's main loop: buy, maybe continue, pause, repeat.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if self.completed_transactions() >= self.config.max_transactions {
                info!(buyer = self.buyer_id, "transaction cap reached");
                break;
            }

            let (product, quantity) = {
                let mut rng = rand::thread_rng();
                let product = self
                    .goods
                    .choose(&mut rng)
                    .cloned()
                    .unwrap_or_else(|| "apple".to_string());
                (product, rng.gen_range(1..=5))
            };
            self.buy_once(&product, quantity).await;

            if self.completed_transactions() >= self.config.max_transactions {
                info!(buyer = self.buyer_id, "transaction cap reached");
                break;
            }
            let roll: f64 = rand::random();
            if roll >= self.config.buy_probability {
                info!(buyer = self.buyer_id, "buyer satisfied, stopping");
                break;
            }

            let pause = Duration::from_secs_f64(self.config.inter_buy_delay_secs);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        self.stop();
    }
}

// ============================================================
// SELLER
// ============================================================

pub struct Gen3Seller {
    seller_id: u32,
    goods: Vec<Product>,
    link: Arc<TraderLink>,
    config: Arc<MarketConfig>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gen3Seller {
    pub async fn bind(
        seller_id: u32,
        traders: Vec<SocketAddr>,
        goods: Vec<Product>,
        config: Arc<MarketConfig>,
    ) -> std::io::Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = TraderLink::bind(traders, shutdown_rx).await?;
        Ok(Arc::new(Self {
            seller_id,
            goods,
            link,
            config,
            shutdown_tx,
        }))
    }

    pub fn listener_addr(&self) -> SocketAddr {
        self.link.listener_addr
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Sell a batch through the retry ladder.
    pub async fn sell_once(&self, product: &str, quantity: Qty) -> Option<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let command = WarehouseRequest::Sell {
            product: product.to_string(),
            quantity,
            request_id: request_id.clone(),
        }
        .encode();

        let response = self.link.transact(&command).await?;
        if response.starts_with("OK") {
            info!(seller = self.seller_id, %request_id, "sell complete: {}", response);
        } else {
            warn!(seller = self.seller_id, %request_id, "sell failure: {}", response);
        }
        Some(response)
    }

    /// Accrue `seller_accrual_goods` units every accrual tick and sell
    /// them to the assigned trader.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tick =
            tokio::time::interval(Duration::from_secs_f64(self.config.seller_accrual_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            let product = self
                .goods
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_else(|| "apple".to_string());
            self.sell_once(&product, self.config.seller_accrual_goods)
                .await;
        }
    }
}
