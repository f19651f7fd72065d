//! Core data model: the ticker universe, user accounts, and price ticks.
//!
//! Shared by the replicator (owns accounts), the broker (prices orders and
//! ranks the leaderboard), and the simulator (produces ticks).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Fixed, ordered ticker universe. Index order matters for nothing in the
/// wire protocol (tickers are always keyed by name in JSON), but every
/// component iterates this same slice so bar files and balances line up.
pub const TICKERS: [&str; 5] = ["TSLA", "MSFT", "AAPL", "NVDA", "AMZN"];

/// Cash every new account starts with.
pub const INITIAL_CASH: f64 = 100_000.0;

pub fn is_valid_ticker(ticker: &str) -> bool {
    TICKERS.contains(&ticker)
}

/// A live or delayed snapshot of every ticker's price at one instant.
pub type StockInfo = HashMap<String, f64>;

pub fn zero_stock_info() -> StockInfo {
    TICKERS.iter().map(|t| (t.to_string(), 0.0)).collect()
}

/// Decode a `stockmarketsimupdate` wire payload (`{type, time, <ticker>:
/// price, ...}`) into a plain price snapshot, stripping the envelope
/// fields that aren't ticker prices.
pub fn parse_stock_update(payload: &serde_json::Value) -> Option<StockInfo> {
    let obj = payload.as_object()?;
    let mut info = StockInfo::new();
    for t in TICKERS.iter() {
        if let Some(price) = obj.get(*t).and_then(serde_json::Value::as_f64) {
            info.insert(t.to_string(), price);
        }
    }
    if info.is_empty() {
        None
    } else {
        Some(info)
    }
}

/// One user account, owned by exactly one replicator shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub username: String,
    pub password: String,
    pub cash: f64,
    pub shares: HashMap<String, i64>,
}

impl UserAccount {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            cash: INITIAL_CASH,
            shares: TICKERS.iter().map(|t| (t.to_string(), 0)).collect(),
        }
    }

    pub fn authenticate(&self, password: &str) -> bool {
        self.password == password
    }

    pub fn can_purchase(&self, amount: i64, price: f64) -> bool {
        self.cash >= amount as f64 * price
    }

    pub fn purchase(&mut self, ticker: &str, amount: i64, price: f64) {
        self.cash -= amount as f64 * price;
        *self.shares.entry(ticker.to_string()).or_insert(0) += amount;
    }

    pub fn can_sell(&self, ticker: &str, amount: i64) -> bool {
        self.shares.get(ticker).copied().unwrap_or(0) >= amount
    }

    pub fn sell(&mut self, ticker: &str, amount: i64, price: f64) {
        self.cash += amount as f64 * price;
        *self.shares.entry(ticker.to_string()).or_insert(0) -= amount;
    }

    /// Net worth at the given stock prices: cash plus the mark-to-market
    /// value of every held position.
    pub fn net_worth(&self, stock_info: &StockInfo) -> f64 {
        let mut worth = self.cash;
        for t in TICKERS.iter() {
            let shares = self.shares.get(*t).copied().unwrap_or(0) as f64;
            let price = stock_info.get(*t).copied().unwrap_or(0.0);
            worth += shares * price;
        }
        worth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_has_initial_cash_and_zeroed_shares() {
        let u = UserAccount::new("alice", "pw");
        assert_eq!(u.cash, INITIAL_CASH);
        for t in TICKERS.iter() {
            assert_eq!(u.shares[*t], 0);
        }
    }

    #[test]
    fn net_worth_matches_basic_trade_scenario() {
        let mut u = UserAccount::new("alice", "pw");
        let mut prices = zero_stock_info();
        prices.insert("TSLA".to_string(), 100.0);
        assert!(u.can_purchase(10, 100.0));
        u.purchase("TSLA", 10, 100.0);
        assert_eq!(u.cash, 99_000.0);
        assert_eq!(u.net_worth(&prices), 100_000.0);
    }

    #[test]
    fn cannot_sell_more_than_owned() {
        let u = UserAccount::new("carol", "pw");
        assert!(!u.can_sell("NVDA", 1));
    }

    #[test]
    fn buying_exact_affordable_amount_succeeds_one_more_fails() {
        let u = UserAccount::new("x", "pw");
        let price = 3.0;
        let max_shares = (u.cash / price) as i64;
        assert!(u.can_purchase(max_shares, price));
        assert!(!u.can_purchase(max_shares + 1, price));
    }
}
