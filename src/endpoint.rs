//! Client library: discovers a broker and the simulator through the
//! catalog, maintains a live price subscription in the background, and
//! exposes `register`/`buy`/`sell`/`balance`/`get_leaderboard` as simple
//! request/response calls.

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::SUBSCRIBE_TIMEOUT;
use crate::discovery::{discover, CatalogConfig};
use crate::domain::{zero_stock_info, StockInfo};
use crate::error::{Result, SimError};
use crate::framing::{self, Frame};

/// A connected session against one project's broker + simulator.
pub struct Endpoint {
    project: String,
    username: String,
    password: String,
    catalog: CatalogConfig,
    broker_conn: AsyncMutex<TcpStream>,
    recent_price: RwLock<StockInfo>,
}

impl Endpoint {
    /// Connects to the broker, subscribes to the simulator's price feed,
    /// and spawns the background task that keeps the subscription alive.
    pub async fn connect(
        catalog: CatalogConfig,
        project: &str,
        username: &str,
        password: &str,
    ) -> Result<std::sync::Arc<Self>> {
        let broker_conn = connect_to_broker(&catalog, project).await;
        let endpoint = std::sync::Arc::new(Self {
            project: project.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            catalog,
            broker_conn: AsyncMutex::new(broker_conn),
            recent_price: RwLock::new(zero_stock_info()),
        });

        let sub_socket = subscribe_to_simulator(&endpoint.catalog, &endpoint.project).await?;
        let bg = endpoint.clone();
        tokio::spawn(async move { bg.price_feed_loop(sub_socket).await });

        Ok(endpoint)
    }

    pub fn get_stock_update(&self) -> StockInfo {
        self.recent_price.read().clone()
    }

    pub async fn register(&self) -> Result<Value> {
        self.send(json!({
            "action": "register", "username": self.username, "password": self.password,
        }))
        .await
    }

    pub async fn buy(&self, ticker: &str, amount: i64) -> Result<Value> {
        self.send(json!({
            "action": "buy", "ticker": ticker, "amount": amount,
            "username": self.username, "password": self.password,
        }))
        .await
    }

    pub async fn sell(&self, ticker: &str, amount: i64) -> Result<Value> {
        self.send(json!({
            "action": "sell", "ticker": ticker, "amount": amount,
            "username": self.username, "password": self.password,
        }))
        .await
    }

    pub async fn balance(&self) -> Result<Value> {
        self.send(json!({
            "action": "balance", "username": self.username, "password": self.password,
        }))
        .await
    }

    pub async fn get_leaderboard(&self) -> Result<String> {
        let reply = self
            .send(json!({
                "action": "leaderboard", "username": self.username, "password": self.password,
            }))
            .await?;
        reply
            .get("Value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SimError::domain("leaderboard response missing Value"))
    }

    /// Sends one RPC to the broker, reconnecting with backoff on a dead
    /// connection and retrying exactly once after a fresh connection.
    async fn send(&self, request: Value) -> Result<Value> {
        let mut conn = self.broker_conn.lock().await;
        match self.try_send(&mut conn, &request).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_connection_fatal() => {
                warn!(error = %e, "broker connection dead, reconnecting");
                *conn = connect_to_broker(&self.catalog, &self.project).await;
                self.try_send(&mut conn, &request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_send(&self, conn: &mut TcpStream, request: &Value) -> Result<Value> {
        framing::write_frame(conn, request).await.map_err(SimError::Io)?;
        match tokio::time::timeout(crate::config::CLIENT_REQUEST_TIMEOUT, framing::read_frame(conn))
            .await
            .map_err(|_| SimError::framing("broker did not reply in time"))?
            .map_err(SimError::Io)?
        {
            Frame::Ok(v) => Ok(v),
            Frame::Eof => Err(SimError::framing("broker closed connection")),
            Frame::FramingError(reason) => Err(SimError::framing(reason)),
        }
    }

    /// Receives UDP price updates forever, re-subscribing a little before
    /// the simulator's subscription actually expires so a slow tick never
    /// lets the subscription lapse, and jittering the re-subscribe time so
    /// many clients don't all re-subscribe in lockstep.
    async fn price_feed_loop(self: std::sync::Arc<Self>, mut sock: UdpSocket) {
        let mut buf = vec![0u8; 4096];
        let mut resub_at = next_resubscribe_deadline();
        loop {
            let recv = tokio::time::timeout(Duration::from_millis(500), sock.recv(&mut buf)).await;
            match recv {
                Ok(Ok(n)) => {
                    if let Ok(update) = serde_json::from_slice::<Value>(&buf[..n]) {
                        if let Some(info) = crate::domain::parse_stock_update(&update) {
                            *self.recent_price.write() = info;
                        }
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "price feed socket error"),
                Err(_) => {}
            }
            if std::time::Instant::now() >= resub_at {
                match subscribe_to_simulator(&self.catalog, &self.project).await {
                    Ok(new_sock) => {
                        sock = new_sock;
                        resub_at = next_resubscribe_deadline();
                    }
                    Err(e) => warn!(error = %e, "re-subscribe failed, will retry"),
                }
            }
        }
    }
}

fn next_resubscribe_deadline() -> std::time::Instant {
    let jitter = rand::thread_rng().gen_range(0.8..0.9);
    std::time::Instant::now() + SUBSCRIBE_TIMEOUT.mul_f64(jitter)
}

async fn connect_to_broker(catalog: &CatalogConfig, project: &str) -> TcpStream {
    loop {
        let entries = discover(catalog, project, "stockmarketbroker").await;
        for entry in &entries {
            let addr = format!("{}:{}", entry.host, entry.port);
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!(%addr, "connected to broker");
                    return stream;
                }
                Err(e) => warn!(%addr, error = %e, "failed to connect to broker"),
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Binds a fresh ephemeral UDP socket, sends one subscribe hello to a
/// discovered simulator, and returns the bound socket ready to receive.
///
/// The hello must advertise an address the simulator can actually route a
/// datagram back to, not the unspecified `0.0.0.0` the UDP socket binds to.
/// The TCP connection used to say hello already tells us that address: its
/// local half is whichever of this host's interfaces the kernel picked to
/// reach the simulator, mirroring the original's bind to the resolved local
/// hostname (`original_source/src/StockMarketEndpoint.py`).
async fn subscribe_to_simulator(catalog: &CatalogConfig, project: &str) -> Result<UdpSocket> {
    let sock = UdpSocket::bind("0.0.0.0:0").await.map_err(SimError::Io)?;
    let local_port = sock.local_addr().map_err(SimError::Io)?.port();

    let entries = discover(catalog, project, "stockmarketsim").await;
    for entry in &entries {
        let addr = format!("{}:{}", entry.host, entry.port);
        let Ok(mut stream) = TcpStream::connect(&addr).await else { continue };
        let Ok(reachable_ip) = stream.local_addr().map(|a| a.ip()) else { continue };
        let hello = hello_payload(reachable_ip, local_port);
        if framing::write_frame(&mut stream, &hello).await.is_ok() {
            info!(%addr, %reachable_ip, "subscribed to simulator feed");
            return Ok(sock);
        }
    }
    Err(SimError::domain("unable to subscribe to any discovered simulator"))
}

fn hello_payload(ip: std::net::IpAddr, port: u16) -> Value {
    json!({ "hostname": ip.to_string(), "port": port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resubscribe_deadline_is_within_jitter_window() {
        let before = std::time::Instant::now();
        let deadline = next_resubscribe_deadline();
        let elapsed_lower = SUBSCRIBE_TIMEOUT.mul_f64(0.8);
        let elapsed_upper = SUBSCRIBE_TIMEOUT.mul_f64(0.9);
        let delta = deadline - before;
        assert!(delta >= elapsed_lower && delta <= elapsed_upper);
    }

    #[test]
    fn hello_payload_round_trips_host_and_port() {
        let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let payload = hello_payload(addr.ip(), addr.port());
        assert_eq!(payload["port"], 5555);
        assert_eq!(payload["hostname"], "127.0.0.1");
    }
}
