//! Trading post - a gen-3 trader fronting the warehouse
//!
//! Each trader keeps one persistent connection to the warehouse and
//! mediates client buy/sell commands through its read-through cache. Two
//! traders run side by side, probing each other with heartbeats; when one
//! stops answering, the survivor broadcasts `SOLOTRADER|<port>` to every
//! known client address and keeps serving with its own cache.

use crate::config::MarketConfig;
use crate::core_types::Qty;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use super::cache::TraderCache;
use super::protocol::{
    HEARTBEAT_MESSAGE, HEARTBEAT_RESPONSE, SOLOTRADER_PREFIX, WarehouseRequest, WarehouseResponse,
};

/// Probe/response deadline on the heartbeat path.
const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(2);

struct DbConn {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl DbConn {
    async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    /// One request/response exchange on the persistent connection.
    async fn round_trip(&mut self, line: &str) -> std::io::Result<String> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await?;
        match self.lines.next_line().await? {
            Some(response) => Ok(response),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "warehouse closed the connection",
            )),
        }
    }
}

pub struct TradingPost {
    trader_id: u32,
    listener: Mutex<Option<TcpListener>>,
    port: u16,
    warehouse_addr: SocketAddr,
    peer_trader: Mutex<Option<SocketAddr>>,
    clients: RwLock<Vec<SocketAddr>>,
    cache: Option<Arc<TraderCache>>,
    db: tokio::sync::Mutex<Option<DbConn>>,
    other_trader_alive: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    config: Arc<MarketConfig>,
}

impl TradingPost {
    /// Bind the client listener. `port` 0 picks an ephemeral port.
    pub async fn bind(
        trader_id: u32,
        port: u16,
        warehouse_addr: SocketAddr,
        use_cache: bool,
        config: Arc<MarketConfig>,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let (shutdown_tx, _) = watch::channel(false);
        info!(trader = trader_id, port, "trader listening");

        Ok(Arc::new(Self {
            trader_id,
            listener: Mutex::new(Some(listener)),
            port,
            warehouse_addr,
            peer_trader: Mutex::new(None),
            clients: RwLock::new(Vec::new()),
            cache: use_cache.then(|| Arc::new(TraderCache::new())),
            db: tokio::sync::Mutex::new(None),
            other_trader_alive: AtomicBool::new(true),
            shutdown_tx,
            config,
        }))
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    pub fn cache(&self) -> Option<&Arc<TraderCache>> {
        self.cache.as_ref()
    }

    /// The other trader's address, for the mutual heartbeat.
    pub fn set_peer_trader(&self, addr: SocketAddr) {
        *self.peer_trader.lock().unwrap() = Some(addr);
    }

    /// Client listener addresses that should hear a SOLOTRADER broadcast.
    pub fn register_clients(&self, addrs: Vec<SocketAddr>) {
        self.clients.write().unwrap().extend(addrs);
    }

    pub fn shutdown(&self) {
        info!(trader = self.trader_id, "trader shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    /// Connect to the warehouse and start serving. Returns once the
    /// listener task is running.
    pub async fn run(self: &Arc<Self>) {
        {
            let mut db = self.db.lock().await;
            match DbConn::connect(self.warehouse_addr).await {
                Ok(conn) => *db = Some(conn),
                Err(e) => {
                    warn!(trader = self.trader_id, error = %e, "cannot reach warehouse");
                }
            }
        }

        if self.cache.is_some() {
            self.refresh_cache().await;
            tokio::spawn(Arc::clone(self).run_cache_refresher());
            tokio::spawn(Arc::clone(self).run_oversell_reporter());
        }

        if self.peer_trader.lock().unwrap().is_some() {
            tokio::spawn(Arc::clone(self).run_heartbeat());
        }

        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .expect("trader started twice");
        tokio::spawn(Arc::clone(self).accept_loop(listener));
    }

    // ========================================================
    // CLIENT SIDE
    // ========================================================

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let workers = Arc::new(Semaphore::new(self.config.max_workers));
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(trader = self.trader_id, error = %e, "accept failed");
                        continue;
                    }
                },
            };
            debug!(trader = self.trader_id, %peer, "client connected");

            let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                break;
            };
            let trader = Arc::clone(&self);
            tokio::spawn(async move {
                trader.handle_client(stream).await;
                drop(permit);
            });
        }
        debug!(trader = self.trader_id, "accept loop exited");
    }

    async fn handle_client(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let line = tokio::select! {
                _ = shutdown.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    _ => break,
                },
            };
            if line.is_empty() {
                continue;
            }

            // The other trader probing us for liveness.
            if line == HEARTBEAT_MESSAGE {
                debug!(trader = self.trader_id, "answering heartbeat");
                if write_half
                    .write_all(format!("{}\n", HEARTBEAT_RESPONSE).as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }

            info!(trader = self.trader_id, client = ?peer, %line, "command received");
            let response = self.process_command(&line).await;
            if write_half
                .write_all(format!("{}\n", response).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Decide a client command: cached buy/sell logic when the cache is
    /// on, plain forwarding otherwise.
    pub async fn process_command(&self, line: &str) -> String {
        let request = match WarehouseRequest::parse(line) {
            Ok(request) => request,
            Err(e) => return WarehouseResponse::error(e.to_string(), "-").encode(),
        };

        match (&self.cache, &request) {
            (Some(cache), WarehouseRequest::Buy {
                product,
                quantity,
                request_id,
            }) => {
                self.cached_buy(Arc::clone(cache), product, *quantity, request_id)
                    .await
            }
            (Some(cache), WarehouseRequest::Sell {
                product,
                quantity,
                request_id,
            }) => {
                self.cached_sell(Arc::clone(cache), product, *quantity, request_id)
                    .await
            }
            _ => self.forward(line, request.request_id()).await,
        }
    }

    async fn cached_buy(
        &self,
        cache: Arc<TraderCache>,
        product: &str,
        quantity: Qty,
        request_id: &str,
    ) -> String {
        if !cache.admit_buy(product, quantity) {
            // Under-sell: trust the cache and reject without warehouse load.
            warn!(
                trader = self.trader_id,
                product, quantity, "under-sell: cache rejects buy"
            );
            return WarehouseResponse::error(
                format!("Insufficient inventory for {}", product),
                request_id,
            )
            .encode();
        }

        let line = WarehouseRequest::Buy {
            product: product.to_string(),
            quantity,
            request_id: request_id.to_string(),
        }
        .encode();
        let response = self.forward(&line, request_id).await;

        match WarehouseResponse::parse(&response) {
            Ok(parsed) if parsed.is_ok() => {
                cache.commit_buy(product, quantity);
            }
            _ => {
                cache.record_oversell();
                warn!(
                    trader = self.trader_id,
                    product, quantity, "over-sell detected: warehouse rejected buy, refreshing cache"
                );
                self.refresh_cache().await;
            }
        }
        response
    }

    async fn cached_sell(
        &self,
        cache: Arc<TraderCache>,
        product: &str,
        quantity: Qty,
        request_id: &str,
    ) -> String {
        // Optimistic: count the stock in before the warehouse confirms.
        cache.apply_sell(product, quantity);

        let line = WarehouseRequest::Sell {
            product: product.to_string(),
            quantity,
            request_id: request_id.to_string(),
        }
        .encode();
        let response = self.forward(&line, request_id).await;

        match WarehouseResponse::parse(&response) {
            Ok(parsed) if parsed.is_ok() => {}
            _ => cache.revert_sell(product, quantity),
        }
        response
    }

    /// Forward a raw command over the persistent warehouse connection.
    async fn forward(&self, line: &str, request_id: &str) -> String {
        let mut db = self.db.lock().await;
        let Some(conn) = db.as_mut() else {
            return WarehouseResponse::error("No database connection", request_id).encode();
        };
        match conn.round_trip(line).await {
            Ok(response) => response,
            Err(e) => {
                warn!(trader = self.trader_id, error = %e, "warehouse exchange failed");
                *db = None;
                WarehouseResponse::error(
                    "Failed to communicate with database server",
                    request_id,
                )
                .encode()
            }
        }
    }

    // ========================================================
    // CACHE MAINTENANCE
    // ========================================================

    /// Pull the full inventory and replace the cache.
    pub async fn refresh_cache(&self) {
        let Some(cache) = &self.cache else { return };
        let request_id = uuid::Uuid::new_v4().to_string();
        let line = WarehouseRequest::FetchInventory {
            request_id: request_id.clone(),
        }
        .encode();

        let response = self.forward(&line, &request_id).await;
        match WarehouseResponse::parse(&response) {
            Ok(WarehouseResponse::Ok { payload, .. }) => {
                match serde_json::from_str::<HashMap<String, Qty>>(&payload) {
                    Ok(inventory) => {
                        cache.replace_all(inventory);
                        info!(trader = self.trader_id, "cache fully synced with warehouse");
                    }
                    Err(e) => warn!(trader = self.trader_id, error = %e, "bad inventory payload"),
                }
            }
            _ => warn!(trader = self.trader_id, %response, "inventory fetch failed"),
        }
    }

    async fn run_cache_refresher(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.cache_refresh_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => self.refresh_cache().await,
            }
        }
    }

    /// Periodic structured report of the over-sell rate.
    async fn run_oversell_reporter(self: Arc<Self>) {
        let Some(cache) = self.cache.clone() else { return };
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    info!(
                        trader = self.trader_id,
                        oversells = cache.oversell_detected(),
                        buys = cache.total_buy_requests(),
                        rate = cache.oversell_rate(),
                        "over-sell rate"
                    );
                }
            }
        }
    }

    // ========================================================
    // HEARTBEAT / FAILOVER
    // ========================================================

    async fn run_heartbeat(self: Arc<Self>) {
        let Some(peer) = *self.peer_trader.lock().unwrap() else {
            return;
        };
        // Give both traders a moment to come up.
        tokio::time::sleep(self.config.heartbeat_interval()).await;

        let mut tick = tokio::time::interval(self.config.heartbeat_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_tx.subscribe();

        while self.other_trader_alive.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }

            if self.probe_peer(peer).await {
                debug!(trader = self.trader_id, "peer trader alive");
                continue;
            }

            warn!(
                trader = self.trader_id,
                peer = %peer,
                "no heartbeat response, assuming peer trader down"
            );
            self.other_trader_alive.store(false, Ordering::SeqCst);
            self.broadcast_solo_trader().await;
        }
    }

    /// One probe: connect, ask, await the answer - all within the
    /// heartbeat deadline.
    async fn probe_peer(&self, peer: SocketAddr) -> bool {
        let exchange = async {
            let stream = TcpStream::connect(peer).await.ok()?;
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(format!("{}\n", HEARTBEAT_MESSAGE).as_bytes())
                .await
                .ok()?;
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.ok().flatten()
        };
        match tokio::time::timeout(HEARTBEAT_DEADLINE, exchange).await {
            Ok(Some(_response)) => true,
            _ => false,
        }
    }

    /// Tell every known client this trader is the survivor.
    async fn broadcast_solo_trader(&self) {
        let message = format!("{}{}\n", SOLOTRADER_PREFIX, self.port);
        let clients = self.clients.read().unwrap().clone();
        info!(
            trader = self.trader_id,
            clients = clients.len(),
            "broadcasting solo trader"
        );
        for addr in clients {
            match tokio::time::timeout(HEARTBEAT_DEADLINE, TcpStream::connect(addr)).await {
                Ok(Ok(mut stream)) => {
                    if let Err(e) = stream.write_all(message.as_bytes()).await {
                        warn!(trader = self.trader_id, %addr, error = %e, "broadcast write failed");
                    }
                }
                _ => warn!(trader = self.trader_id, %addr, "broadcast connect failed"),
            }
        }
    }
}
