//! Replicator: one shard of sharded, durable account storage.
//!
//! Owns a disjoint slice of the username space (the broker decides which
//! slice by hashing), replays its own WAL on startup, and answers RPCs the
//! broker forwards to it one at a time over a single persistent connection.
//! A second connection attempt from a broker displaces the first, mirroring
//! how the broker itself always holds at most one live socket per shard.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::discovery::{spawn_registration_task, CatalogConfig};
use crate::domain::{is_valid_ticker, zero_stock_info, StockInfo, UserAccount};
use crate::error::SimError;
use crate::framing::{self, Frame};
use crate::wal::{now_ns, WalEngine, WalOp};

/// Replicator's in-memory state behind one lock. Requests are handled
/// strictly one-at-a-time per shard (the broker guarantees that), so a
/// single mutex is sufficient rather than finer-grained sharding.
pub struct ReplicatorState {
    shard: usize,
    accounts: HashMap<String, UserAccount>,
    wal: WalEngine,
    latest_stock_info: StockInfo,
}

impl ReplicatorState {
    pub fn load(data_dir: &std::path::Path, shard: usize) -> crate::error::Result<Self> {
        let (wal, accounts) = WalEngine::open(data_dir, shard)?;
        Ok(Self { shard, accounts, wal, latest_stock_info: zero_stock_info() })
    }

    fn checkpoint_if_due(&mut self) {
        if self.wal.should_checkpoint() {
            if let Err(e) = self.wal.checkpoint(&self.accounts) {
                warn!(shard = self.shard, error = %e, "checkpoint failed");
            }
        }
    }

    fn register(&mut self, username: &str, password: &str) -> Value {
        if self.accounts.contains_key(username) {
            return resp(false, json!(format!("Username {username} is already in use.")));
        }
        if let Err(e) = self.wal.append(now_ns(), &WalOp::Register {
            username: username.to_string(),
            password: password.to_string(),
        }) {
            warn!(shard = self.shard, error = %e, "WAL append failed for register");
            return resp(false, json!("Durability failure, try again"));
        }
        self.accounts.insert(username.to_string(), UserAccount::new(username, password));
        self.checkpoint_if_due();
        resp(true, Value::Null)
    }

    fn authenticate<'a>(&'a self, username: &str, password: &str) -> Result<&'a UserAccount, SimError> {
        match self.accounts.get(username) {
            None => Err(SimError::auth("User associated with Username does not exist.")),
            Some(user) if !user.authenticate(password) => {
                Err(SimError::auth(format!("Password for {username} is incorrect")))
            }
            Some(user) => Ok(user),
        }
    }

    fn buy(&mut self, username: &str, request: &Value) -> Value {
        let (ticker, amount) = match parse_trade_args(request) {
            Ok(v) => v,
            Err(e) => return resp(false, json!(e.to_string())),
        };
        if amount == 0 {
            return resp(true, json!(format!("Purchased 0 shares of {ticker}.")));
        }
        let price = self.latest_stock_info.get(ticker).copied().unwrap_or(0.0);
        let user = self.accounts.get(username).expect("authenticated above");
        if !user.can_purchase(amount, price) {
            return resp(false, json!(format!(
                "Insufficient funds to purchase {amount} shares of {ticker} at {price}"
            )));
        }
        if let Err(e) = self.wal.append(now_ns(), &WalOp::Buy {
            username: username.to_string(),
            ticker: ticker.to_string(),
            amount,
            price,
        }) {
            warn!(shard = self.shard, error = %e, "WAL append failed for buy");
            return resp(false, json!("Durability failure, try again"));
        }
        self.accounts.get_mut(username).unwrap().purchase(ticker, amount, price);
        self.checkpoint_if_due();
        resp(true, json!(format!("Purchased {amount} shares of {ticker} at {price}")))
    }

    fn sell(&mut self, username: &str, request: &Value) -> Value {
        let (ticker, amount) = match parse_trade_args(request) {
            Ok(v) => v,
            Err(e) => return resp(false, json!(e.to_string())),
        };
        if amount == 0 {
            return resp(true, json!(format!("Sold 0 shares of {ticker}.")));
        }
        let price = self.latest_stock_info.get(ticker).copied().unwrap_or(0.0);
        let user = self.accounts.get(username).expect("authenticated above");
        if !user.can_sell(ticker, amount) {
            return resp(false, json!(format!(
                "Insufficient owned shares to sell {amount} shares of {ticker} at {price}"
            )));
        }
        if let Err(e) = self.wal.append(now_ns(), &WalOp::Sell {
            username: username.to_string(),
            ticker: ticker.to_string(),
            amount,
            price,
        }) {
            warn!(shard = self.shard, error = %e, "WAL append failed for sell");
            return resp(false, json!("Durability failure, try again"));
        }
        self.accounts.get_mut(username).unwrap().sell(ticker, amount, price);
        self.checkpoint_if_due();
        resp(true, json!(format!("Sold {amount} shares of {ticker} at {price}")))
    }

    fn balance(&self, username: &str) -> Value {
        let user = &self.accounts[username];
        let net_worth = user.net_worth(&self.latest_stock_info);
        let summary = format!(
            "{username}: Cash {:.2}, Net Worth {:.2}",
            user.cash, net_worth
        );
        resp(true, json!({
            "Str": summary,
            "Net Worth": net_worth,
            "Cash": user.cash,
            "Stocks": user.shares,
        }))
    }

    fn leaderboard_entries(&self) -> Value {
        let net_worths: HashMap<String, f64> = self
            .accounts
            .values()
            .map(|u| (u.username.clone(), u.net_worth(&self.latest_stock_info)))
            .collect();
        resp(true, json!(net_worths))
    }

    /// Dispatch one decoded RPC request, mirroring the broker/replicator
    /// wire contract: every non-leaderboard-poll request carries username,
    /// password, and the action, plus the broker's last known stock prices.
    ///
    /// The broker injects `latest_stock_info` into every request it
    /// forwards (register included), so every request is an opportunity to
    /// refresh this shard's view of prices before acting on it — buy/sell
    /// price at the broker's current view, not at whatever the last
    /// leaderboard poll happened to see.
    pub fn perform_request(&mut self, request: &Value) -> Value {
        if let Some(info) = request
            .get("latest_stock_info")
            .and_then(|v| serde_json::from_value::<StockInfo>(v.clone()).ok())
        {
            self.latest_stock_info = info;
        }

        let Some(action) = request.get("action").and_then(Value::as_str) else {
            return resp(false, json!("Action was not provided"));
        };
        let Some(username) = request.get("username").and_then(Value::as_str) else {
            return resp(false, json!("Username not provided."));
        };
        let Some(password) = request.get("password").and_then(Value::as_str) else {
            return resp(false, json!("Password not provided"));
        };

        if action == "broker_leaderboard" {
            return self.leaderboard_entries();
        }
        if action == "register" {
            return self.register(username, password);
        }

        if let Err(e) = self.authenticate(username, password) {
            return resp(false, json!(e.to_string()));
        }
        match action {
            "buy" => self.buy(username, request),
            "sell" => self.sell(username, request),
            "balance" => self.balance(username),
            other => resp(false, json!(format!("{other} is an invalid action."))),
        }
    }
}

fn parse_trade_args(request: &Value) -> Result<(&str, i64), SimError> {
    let ticker = request.get("ticker").and_then(Value::as_str);
    let Some(ticker) = ticker.filter(|t| is_valid_ticker(t)) else {
        let bad = request.get("ticker").cloned().unwrap_or(Value::Null);
        return Err(SimError::validation(format!("Ticker {bad} is not valid.")));
    };
    let Some(amount_val) = request.get("amount") else {
        return Err(SimError::validation("Amount was not specified"));
    };
    let Some(amount) = amount_val.as_i64() else {
        return Err(SimError::validation("Amount must be an integer value"));
    };
    if amount < 0 {
        return Err(SimError::validation("Amount must be a positive value >0."));
    }
    Ok((ticker, amount))
}

fn resp(success: bool, value: Value) -> Value {
    json!({ "Success": success, "Value": value })
}

/// Binds the shard's listen socket, probing a bounded range of ports the
/// way the source did (to play nicely with firewalled ranges on shared
/// hosts), and returns the listener plus the port actually bound.
pub async fn bind_shard_listener(base_port: u16, attempts: u16) -> std::io::Result<(TcpListener, u16)> {
    let mut last_err = None;
    for i in 0..attempts {
        let addr: SocketAddr = format!("0.0.0.0:{}", base_port + i).parse().unwrap();
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                return Ok((listener, port));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrInUse, "no open ports")))
}

/// Runs one replicator shard forever: accepts (and swaps in) broker
/// connections, answers forwarded RPCs, checkpoints on schedule, and
/// re-registers with the catalog.
pub async fn run(
    data_dir: PathBuf,
    shard: usize,
    base_port: u16,
    catalog: CatalogConfig,
    project: String,
) -> crate::error::Result<()> {
    let state = Mutex::new(ReplicatorState::load(&data_dir, shard)?);

    let (listener, port) = bind_shard_listener(base_port, 100)
        .await
        .map_err(crate::error::SimError::Io)?;
    info!(shard, port, "replicator shard listening");

    spawn_registration_task(
        catalog,
        format!("chain-{shard}"),
        project,
        port,
        crate::config::CATALOG_REGISTER_INTERVAL,
    );

    let mut broker_conn: Option<TcpStream> = None;

    loop {
        let accept_fut = listener.accept();
        let serve_fut = async {
            if let Some(conn) = broker_conn.as_mut() {
                framing::read_frame(conn).await
            } else {
                std::future::pending().await
            }
        };

        tokio::select! {
            accepted = accept_fut => {
                let (mut conn, addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => { warn!(shard, error = %e, "accept failed"); continue; }
                };
                match framing::read_frame(&mut conn).await {
                    Ok(Frame::Ok(hello)) if hello.get("type").and_then(Value::as_str) == Some("broker") => {
                        info!(shard, %addr, "broker (re)connected");
                        broker_conn = Some(conn);
                    }
                    _ => {
                        warn!(shard, %addr, "ignoring connection that did not identify as a broker");
                    }
                }
            }
            frame = serve_fut => {
                let Some(conn) = broker_conn.as_mut() else { continue };
                let reply = match frame {
                    Ok(Frame::Ok(request)) => state.lock().perform_request(&request),
                    Ok(Frame::Eof) => { broker_conn = None; continue; }
                    Ok(Frame::FramingError(reason)) => resp(false, json!(format!("Unintelligible request: {reason}"))),
                    Err(e) => { warn!(shard, error = %e, "broker connection broke"); broker_conn = None; continue; }
                };
                if let Err(e) = framing::write_frame(conn, &reply).await {
                    warn!(shard, error = %e, "failed to reply to broker, dropping connection");
                    broker_conn = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(dir: &std::path::Path) -> ReplicatorState {
        ReplicatorState::load(dir, 0).unwrap()
    }

    #[test]
    fn register_then_duplicate_register_fails() {
        let dir = tempdir().unwrap();
        let mut s = state(dir.path());
        let r1 = s.perform_request(&json!({"action":"register","username":"amy","password":"pw"}));
        assert_eq!(r1["Success"], true);
        let r2 = s.perform_request(&json!({"action":"register","username":"amy","password":"pw"}));
        assert_eq!(r2["Success"], false);
    }

    #[test]
    fn buy_then_sell_round_trips_cash() {
        let dir = tempdir().unwrap();
        let mut s = state(dir.path());
        s.perform_request(&json!({"action":"register","username":"amy","password":"pw"}));
        s.latest_stock_info.insert("TSLA".to_string(), 100.0);

        let buy = s.perform_request(&json!({
            "action":"buy","username":"amy","password":"pw","ticker":"TSLA","amount":10,
            "latest_stock_info": s.latest_stock_info.clone(),
        }));
        assert_eq!(buy["Success"], true);

        let bal = s.perform_request(&json!({"action":"balance","username":"amy","password":"pw"}));
        assert_eq!(bal["Value"]["Cash"], 99_000.0);

        let sell = s.perform_request(&json!({
            "action":"sell","username":"amy","password":"pw","ticker":"TSLA","amount":10,
        }));
        assert_eq!(sell["Success"], true);
        let bal2 = s.perform_request(&json!({"action":"balance","username":"amy","password":"pw"}));
        assert_eq!(bal2["Value"]["Cash"], 100_000.0);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let dir = tempdir().unwrap();
        let mut s = state(dir.path());
        s.perform_request(&json!({"action":"register","username":"amy","password":"pw"}));
        let r = s.perform_request(&json!({"action":"balance","username":"amy","password":"wrong"}));
        assert_eq!(r["Success"], false);
    }

    #[test]
    fn selling_zero_shares_at_zero_price_is_permitted() {
        let dir = tempdir().unwrap();
        let mut s = state(dir.path());
        s.perform_request(&json!({"action":"register","username":"amy","password":"pw"}));
        let r = s.perform_request(&json!({"action":"sell","username":"amy","password":"pw","ticker":"TSLA","amount":0}));
        assert_eq!(r["Success"], true);
    }
}
