//! Broker: routes client requests to the owning replicator shard, maintains
//! the live price feed from the simulator, and rebuilds the leaderboard.
//!
//! Each shard gets one dedicated worker task that owns the single
//! persistent connection to its replicator, so at most one request is ever
//! in flight to a shard at a time — mirroring the original's `name_to_conn`
//! single-outstanding-request invariant. The worker's inbound channel is
//! bounded at `MAX_PENDING_PER_SHARD`; once full, the router answers `busy`
//! immediately rather than queuing without limit (see REDESIGN FLAGS).
//!
//! Client connections are each served by their own task, so fairness across
//! clients comes from the Tokio scheduler rather than a `random.choice` over
//! a `select()` readable set — the same externally observable guarantee
//! (no client is starved while others make progress), produced idiomatically
//! instead of by re-deriving a single-threaded event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn, Instrument};

use crate::config::{
    CATALOG_REGISTER_INTERVAL, CLIENT_REQUEST_TIMEOUT, LEADERBOARD_REBUILD_INTERVAL,
    MAX_PENDING_PER_SHARD, REPLICATOR_CONNECT_TIMEOUT,
};
use crate::discovery::{discover, spawn_registration_task, CatalogConfig};
use crate::domain::{zero_stock_info, StockInfo};
use crate::framing::{self, Frame};

/// `(sum of ASCII codepoints mod 41) mod num_chains`. The `mod 41` has no
/// significance beyond matching the original deployment's shard
/// assignment; changing it would silently remap every existing account to
/// a different shard.
pub fn shard_for(username: &str, num_chains: usize) -> usize {
    let sum: u32 = username.chars().map(|c| c as u32).sum();
    (sum % 41) as usize % num_chains
}

struct ShardJob {
    request: Value,
    reply: oneshot::Sender<Value>,
}

#[derive(Clone)]
struct ShardWorkerHandle {
    tx: mpsc::Sender<ShardJob>,
}

fn resp(success: bool, value: Value) -> Value {
    json!({ "Success": success, "Value": value })
}

/// Owns the reconnect loop and the single live connection to one
/// replicator shard. Runs forever, processing at most one job at a time.
async fn shard_worker_loop(
    shard: usize,
    catalog: CatalogConfig,
    project: String,
    mut rx: mpsc::Receiver<ShardJob>,
) {
    let mut conn: Option<TcpStream> = None;
    while let Some(job) = rx.recv().await {
        if conn.is_none() {
            conn = Some(connect_to_shard(&catalog, &project, shard).await);
        }
        let stream = conn.as_mut().unwrap();
        let outcome = async {
            framing::write_frame(stream, &job.request).await?;
            framing::read_frame(stream).await
        }
        .await;

        let reply = match outcome {
            Ok(Frame::Ok(v)) => v,
            Ok(Frame::Eof) | Ok(Frame::FramingError(_)) | Err(_) => {
                warn!(shard, "replicator connection broke, will reconnect on next job");
                conn = None;
                resp(false, json!("The database server has crashed"))
            }
        };
        let _ = job.reply.send(reply);
    }
}

async fn connect_to_shard(catalog: &CatalogConfig, project: &str, shard: usize) -> TcpStream {
    loop {
        let entries = discover(catalog, project, &format!("chain-{shard}")).await;
        for entry in &entries {
            let addr = format!("{}:{}", entry.host, entry.port);
            match tokio::time::timeout(REPLICATOR_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(mut stream)) => {
                    if framing::write_frame(&mut stream, &json!({"type": "broker"})).await.is_ok() {
                        info!(shard, %addr, "connected to replicator shard");
                        return stream;
                    }
                }
                Ok(Err(e)) => warn!(shard, %addr, error = %e, "failed to connect to replicator shard"),
                Err(_) => warn!(shard, %addr, "connect to replicator shard timed out"),
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn spawn_shard_worker(shard: usize, catalog: CatalogConfig, project: String) -> ShardWorkerHandle {
    let (tx, rx) = mpsc::channel(MAX_PENDING_PER_SHARD);
    tokio::spawn(shard_worker_loop(shard, catalog, project, rx));
    ShardWorkerHandle { tx }
}

/// Shared broker state reachable from every client connection task.
pub struct Broker {
    shards: Vec<ShardWorkerHandle>,
    latest_stock_info: RwLock<StockInfo>,
    leaderboard: RwLock<Vec<(String, f64)>>,
}

impl Broker {
    pub fn new(num_chains: usize, catalog: CatalogConfig, project: String) -> Arc<Self> {
        let shards = (0..num_chains)
            .map(|i| spawn_shard_worker(i, catalog.clone(), project.clone()))
            .collect();
        Arc::new(Self {
            shards,
            latest_stock_info: RwLock::new(zero_stock_info()),
            leaderboard: RwLock::new(Vec::new()),
        })
    }

    pub fn num_chains(&self) -> usize {
        self.shards.len()
    }

    pub fn update_stock_info(&self, info: StockInfo) {
        *self.latest_stock_info.write() = info;
    }

    fn leaderboard_text(&self) -> String {
        let board = self.leaderboard.read();
        let mut s = String::from("TOP 10\n---------------\n");
        for (name, worth) in board.iter().take(10) {
            s.push_str(&format!("{name} | {:.2}\n", worth));
        }
        s
    }

    /// Poll every shard for its accounts' net worth and merge into one
    /// ranked leaderboard. Shards whose worker channel is saturated (i.e.
    /// mid-flight on a client request) are skipped for this round, same as
    /// the source's `if i in self.name_to_conn.keys(): continue`.
    async fn rebuild_leaderboard(&self) {
        let info = self.latest_stock_info.read().clone();
        let mut merged: HashMap<String, f64> = HashMap::new();
        for (i, shard) in self.shards.iter().enumerate() {
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = ShardJob {
                request: json!({
                    "action": "broker_leaderboard",
                    "username": "broker",
                    "password": "broker",
                    "latest_stock_info": info,
                }),
                reply: reply_tx,
            };
            if shard.tx.try_send(job).is_err() {
                continue;
            }
            match tokio::time::timeout(CLIENT_REQUEST_TIMEOUT, reply_rx).await {
                Ok(Ok(v)) => {
                    if let Some(map) = v.get("Value").and_then(Value::as_object) {
                        for (user, worth) in map {
                            if let Some(w) = worth.as_f64() {
                                merged.insert(user.clone(), w);
                            }
                        }
                    }
                }
                _ => warn!(shard = i, "leaderboard poll failed or timed out"),
            }
        }
        let mut ranked: Vec<(String, f64)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        *self.leaderboard.write() = ranked;
    }

    /// Dispatch one client request to the owning shard and await its reply,
    /// or answer immediately from local state for `leaderboard`.
    pub async fn route(&self, mut request: Value) -> Value {
        let Some(username) = request.get("username").and_then(Value::as_str).map(str::to_string) else {
            return resp(false, json!("Username required to perform an action"));
        };
        if request.get("action").and_then(Value::as_str) == Some("leaderboard") {
            return resp(true, json!(self.leaderboard_text()));
        }

        request["latest_stock_info"] = json!(self.latest_stock_info.read().clone());
        let shard = shard_for(&username, self.shards.len());
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = ShardJob { request, reply: reply_tx };

        if self.shards[shard].tx.try_send(job).is_err() {
            return resp(false, json!("Server busy, please retry"));
        }
        match tokio::time::timeout(CLIENT_REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(v)) => v,
            Ok(Err(_)) => resp(false, json!("The database server has crashed")),
            Err(_) => resp(false, json!("Request timed out")),
        }
    }
}

async fn handle_client(broker: Arc<Broker>, conn: TcpStream) {
    // A stable handle for this client connection, for tracing correlation
    // only (per §9's "addressed by a stable handle, never by direct
    // cross-owner reference" — the owning task itself is the handle; this
    // id just lets log lines for one client be grep'd together).
    let conn_id = uuid::Uuid::new_v4();
    serve_client(broker, conn)
        .instrument(tracing::info_span!("client_connection", %conn_id))
        .await
}

async fn serve_client(broker: Arc<Broker>, mut conn: TcpStream) {
    loop {
        match framing::read_frame(&mut conn).await {
            Ok(Frame::Ok(request)) => {
                let reply = broker.route(request).await;
                if framing::write_frame(&mut conn, &reply).await.is_err() {
                    return;
                }
            }
            Ok(Frame::Eof) => return,
            Ok(Frame::FramingError(reason)) => {
                let reply = resp(false, json!(format!("Unintelligible request: {reason}")));
                if framing::write_frame(&mut conn, &reply).await.is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

/// Maintains the broker's subscription to the simulator's live price feed,
/// reconnecting with backoff whenever the connection drops.
async fn simulator_feed_loop(broker: Arc<Broker>, catalog: CatalogConfig, project: String) {
    let mut backoff = crate::config::INITIAL_BACKOFF;
    loop {
        let entries = discover(&catalog, &project, "stockmarketsim").await;
        let mut connected = false;
        for entry in &entries {
            let addr = format!("{}:{}", entry.host, entry.port);
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    if framing::write_frame(&mut stream, &json!({"type": "broker"})).await.is_err() {
                        continue;
                    }
                    info!(%addr, "connected to simulator live feed");
                    connected = true;
                    backoff = crate::config::INITIAL_BACKOFF;
                    loop {
                        match framing::read_frame(&mut stream).await {
                            Ok(Frame::Ok(update)) => {
                                if let Some(info) = crate::domain::parse_stock_update(&update) {
                                    broker.update_stock_info(info);
                                }
                            }
                            _ => break,
                        }
                    }
                }
                Err(e) => warn!(%addr, error = %e, "failed to connect to simulator"),
            }
            if connected {
                break;
            }
        }
        warn!("simulator feed disconnected, retrying in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(crate::config::MAX_BACKOFF);
    }
}

/// Runs the broker forever: accepts client connections, keeps the
/// simulator feed and leaderboard fresh, and re-registers with the catalog.
pub async fn run(
    listen_addr: std::net::SocketAddr,
    num_chains: usize,
    catalog: CatalogConfig,
    project: String,
) -> crate::error::Result<()> {
    let broker = Broker::new(num_chains, catalog.clone(), project.clone());
    let listener = TcpListener::bind(listen_addr).await.map_err(crate::error::SimError::Io)?;
    let port = listener.local_addr().map_err(crate::error::SimError::Io)?.port();
    info!(port, num_chains, "broker listening");

    spawn_registration_task(catalog.clone(), "stockmarketbroker".to_string(), project.clone(), port, CATALOG_REGISTER_INTERVAL);
    tokio::spawn(simulator_feed_loop(broker.clone(), catalog, project));

    {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEADERBOARD_REBUILD_INTERVAL);
            loop {
                ticker.tick().await;
                broker.rebuild_leaderboard().await;
                info!("leaderboard rebuilt");
            }
        });
    }

    loop {
        let (conn, addr) = listener.accept().await.map_err(crate::error::SimError::Io)?;
        info!(%addr, "client connected");
        let broker = broker.clone();
        tokio::spawn(handle_client(broker, conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eve_pins_to_shard_zero_of_three() {
        // Sigma ord('e')+ord('v')+ord('e') = 101+118+101 = 320;
        // 320 mod 41 = 33; 33 mod 3 = 0. Pinned per the end-to-end
        // sharding-stability scenario: this value must never drift.
        assert_eq!(shard_for("eve", 3), 0);
    }

    #[test]
    fn shard_hash_matches_mod_41_then_mod_n() {
        let sum: u32 = "amy".chars().map(|c| c as u32).sum();
        assert_eq!(shard_for("amy", 4), (sum % 41) as usize % 4);
    }

    #[test]
    fn shard_hash_is_stable_for_same_username() {
        assert_eq!(shard_for("dave", 8), shard_for("dave", 8));
    }

    #[test]
    fn shard_hash_distributes_across_chains() {
        let n = 4;
        let shards: Vec<usize> = ["amy", "bob", "carol", "dave", "erin", "frank"]
            .iter()
            .map(|u| shard_for(u, n))
            .collect();
        assert!(shards.iter().all(|s| *s < n));
    }
}
