//! End-to-end scenarios exercised against the library directly (no sockets):
//! a request enters `ReplicatorState::perform_request` exactly the way it
//! would arrive at a replicator shard after the broker has hashed the
//! username and injected `latest_stock_info`, which is the same contract
//! used in production — only the transport is skipped.

use serde_json::json;
use tempfile::tempdir;

use stockmarketsim::broker::shard_for;
use stockmarketsim::replicator::ReplicatorState;

fn with_price(action: &str, username: &str, password: &str, extra: serde_json::Value, ticker: &str, price: f64) -> serde_json::Value {
    let mut req = json!({
        "action": action,
        "username": username,
        "password": password,
        "latest_stock_info": { ticker: price },
    });
    if let Some(obj) = extra.as_object() {
        for (k, v) in obj {
            req[k] = v.clone();
        }
    }
    req
}

#[test]
fn scenario_basic_trade() {
    let dir = tempdir().unwrap();
    let mut state = ReplicatorState::load(dir.path(), 0).unwrap();

    let reg = state.perform_request(&json!({"action": "register", "username": "alice", "password": "pw"}));
    assert_eq!(reg["Success"], true);

    let buy = state.perform_request(&with_price("buy", "alice", "pw", json!({"ticker": "TSLA", "amount": 10}), "TSLA", 100.0));
    assert_eq!(buy["Success"], true);

    let bal = state.perform_request(&json!({"action": "balance", "username": "alice", "password": "pw"}));
    assert_eq!(bal["Success"], true);
    assert_eq!(bal["Value"]["Cash"], 99_000.0);
    assert_eq!(bal["Value"]["Stocks"]["TSLA"], 10);
    assert_eq!(bal["Value"]["Net Worth"], 100_000.0);
}

#[test]
fn scenario_insufficient_funds() {
    let dir = tempdir().unwrap();
    let mut state = ReplicatorState::load(dir.path(), 0).unwrap();
    state.perform_request(&json!({"action": "register", "username": "bob", "password": "pw"}));

    let buy = state.perform_request(&with_price("buy", "bob", "pw", json!({"ticker": "AAPL", "amount": 1000}), "AAPL", 200.0));
    assert_eq!(buy["Success"], false);
    assert!(buy["Value"].as_str().unwrap().contains("Insufficient"));

    let bal = state.perform_request(&json!({"action": "balance", "username": "bob", "password": "pw"}));
    assert_eq!(bal["Value"]["Cash"], 100_000.0);
}

#[test]
fn scenario_sell_more_than_owned_leaves_no_wal_record() {
    let dir = tempdir().unwrap();
    let mut state = ReplicatorState::load(dir.path(), 0).unwrap();
    state.perform_request(&json!({"action": "register", "username": "carol", "password": "pw"}));

    let sell = state.perform_request(&with_price("sell", "carol", "pw", json!({"ticker": "NVDA", "amount": 1}), "NVDA", 50.0));
    assert_eq!(sell["Success"], false);

    let log_path = dir.path().join("table0.txn");
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(contents.matches("SELL").count(), 0);
    assert_eq!(contents.matches("REGISTER").count(), 1);
}

#[test]
fn scenario_crash_recovery() {
    let dir = tempdir().unwrap();
    {
        let mut state = ReplicatorState::load(dir.path(), 0).unwrap();
        state.perform_request(&json!({"action": "register", "username": "dave", "password": "pw"}));
        let buy = state.perform_request(&with_price("buy", "dave", "pw", json!({"ticker": "MSFT", "amount": 5}), "MSFT", 300.0));
        assert_eq!(buy["Success"], true);
        // `state` drops here, simulating the process being killed right after
        // the reply was sent — WAL fsync already happened inside `perform_request`.
    }

    let mut restarted = ReplicatorState::load(dir.path(), 0).unwrap();
    let bal = restarted.perform_request(&json!({"action": "balance", "username": "dave", "password": "pw"}));
    assert_eq!(bal["Success"], true);
    assert_eq!(bal["Value"]["Cash"], 100_000.0 - 5.0 * 300.0);
    assert_eq!(bal["Value"]["Stocks"]["MSFT"], 5);
}

#[test]
fn scenario_sharding_pins_eve_to_shard_zero_of_three() {
    assert_eq!(shard_for("eve", 3), 0);
}

#[test]
fn scenario_leaderboard_merges_across_shards() {
    let dir0 = tempdir().unwrap();
    let dir1 = tempdir().unwrap();
    let mut shard0 = ReplicatorState::load(dir0.path(), 0).unwrap();
    let mut shard1 = ReplicatorState::load(dir1.path(), 1).unwrap();

    shard0.perform_request(&json!({"action": "register", "username": "amy", "password": "pw"}));
    shard1.perform_request(&json!({"action": "register", "username": "zara", "password": "pw"}));

    let info = json!({"TSLA": 100.0});
    let board0 = shard0.perform_request(&json!({"action": "broker_leaderboard", "username": "broker", "password": "broker", "latest_stock_info": info}));
    let board1 = shard1.perform_request(&json!({"action": "broker_leaderboard", "username": "broker", "password": "broker", "latest_stock_info": info}));

    // Each shard only reports the accounts it owns — merging is the
    // broker's job, but the per-shard contract under test here is that a
    // shard never reports another shard's users.
    assert!(board0["Value"].get("amy").is_some());
    assert!(board0["Value"].get("zara").is_none());
    assert!(board1["Value"].get("zara").is_some());
    assert!(board1["Value"].get("amy").is_none());
}
