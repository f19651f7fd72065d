//! Per-shard write-ahead log and checkpoint engine.
//!
//! Wire format of one WAL record (everything up to, not including, the
//! trailing `\n`):
//!
//! ```text
//! <byte_length> <timestamp_ns> REGISTER <username_len> <username> <password_len> <password>
//! <byte_length> <timestamp_ns> BUY|SELL <username_len> <username> <ticker> <amount> <price>
//! ```
//!
//! `byte_length` counts every byte of the record after itself, so a replay
//! reader can detect a torn tail write (the source of truth for whether a
//! commit actually landed).
//!
//! Checkpoint file: a header line `<timestamp_ns>`, then one line per
//! account: `<username_len> <username> <password_len> <password> <cash>
//! <stocks_as_json>`.
//!
//! fsync/rename failures are fatal: this module never retries them, it
//! surfaces `SimError::Durability` and leaves the caller to exit the
//! process, trusting a supervisor to restart it into a crash-consistent
//! replay.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::CHECKPOINT_INTERVAL;
use crate::domain::UserAccount;
use crate::error::{Result, SimError};

#[derive(Debug, Clone)]
pub enum WalOp {
    Register { username: String, password: String },
    Buy { username: String, ticker: String, amount: i64, price: f64 },
    Sell { username: String, ticker: String, amount: i64, price: f64 },
}

fn format_record_body(ts_ns: i64, op: &WalOp) -> String {
    match op {
        WalOp::Register { username, password } => format!(
            "{ts_ns} REGISTER {} {username} {} {password}",
            username.len(),
            password.len()
        ),
        WalOp::Buy { username, ticker, amount, price } => format!(
            "{ts_ns} BUY {} {username} {ticker} {amount} {price}",
            username.len()
        ),
        WalOp::Sell { username, ticker, amount, price } => format!(
            "{ts_ns} SELL {} {username} {ticker} {amount} {price}",
            username.len()
        ),
    }
}

/// Owns the on-disk log and checkpoint for one replicator shard.
pub struct WalEngine {
    data_dir: PathBuf,
    shard: usize,
    log_file: File,
    txn_count: u64,
}

impl WalEngine {
    fn ckpt_path(data_dir: &Path, shard: usize) -> PathBuf {
        data_dir.join(format!("table{shard}.ckpt"))
    }

    fn shadow_path(data_dir: &Path) -> PathBuf {
        // Unshared across shards by design: the source used this same
        // filename regardless of shard, which makes multi-shard single-host
        // runs racy. Preserved rather than silently fixed (see DESIGN.md).
        data_dir.join("table.ckpt.shadow")
    }

    fn log_path(data_dir: &Path, shard: usize) -> PathBuf {
        data_dir.join(format!("table{shard}.txn"))
    }

    /// Replay the checkpoint + log on disk (if any) into an in-memory
    /// account map, then synthesize a fresh checkpoint and truncate the log,
    /// per the engine's restart contract. Returns the engine plus the
    /// rebuilt account map.
    pub fn open(data_dir: &Path, shard: usize) -> Result<(Self, HashMap<String, UserAccount>)> {
        fs::create_dir_all(data_dir)?;

        let mut accounts = HashMap::new();
        let mut ckpt_ts: i64 = 0;

        let ckpt_path = Self::ckpt_path(data_dir, shard);
        if ckpt_path.exists() {
            let (ts, loaded) = load_checkpoint(&ckpt_path)?;
            ckpt_ts = ts;
            accounts = loaded;
            info!(shard, ckpt_ts, accounts = accounts.len(), "loaded checkpoint");
        }

        let log_path = Self::log_path(data_dir, shard);
        if log_path.exists() {
            let replayed = replay_log(&log_path, ckpt_ts, &mut accounts)?;
            info!(shard, replayed, "replayed WAL records newer than checkpoint");
        }

        let mut engine = Self {
            data_dir: data_dir.to_path_buf(),
            shard,
            log_file: open_fresh_log(&log_path)?,
            txn_count: 0,
        };

        // Synthesize a fresh checkpoint and truncate the log, per restart
        // contract, even if nothing was replayed (clean restart case too).
        engine.checkpoint(&accounts)?;

        Ok((engine, accounts))
    }

    /// Append one record: serialize, prefix with byte length, flush, fsync.
    /// Only once this returns `Ok` may the in-memory mutation be considered
    /// durable.
    pub fn append(&mut self, ts_ns: i64, op: &WalOp) -> Result<()> {
        let body = format_record_body(ts_ns, op);
        let line = format!("{} {body}\n", body.len());
        self.log_file
            .write_all(line.as_bytes())
            .map_err(|e| SimError::durability(format!("WAL append write failed: {e}")))?;
        self.log_file
            .flush()
            .map_err(|e| SimError::durability(format!("WAL append flush failed: {e}")))?;
        self.log_file
            .sync_all()
            .map_err(|e| SimError::durability(format!("WAL append fsync failed: {e}")))?;
        self.txn_count += 1;
        Ok(())
    }

    pub fn should_checkpoint(&self) -> bool {
        self.txn_count >= CHECKPOINT_INTERVAL
    }

    /// Write a shadow checkpoint, fsync it, atomically rename it over the
    /// live checkpoint, then truncate the log by reopening it empty.
    pub fn checkpoint(&mut self, accounts: &HashMap<String, UserAccount>) -> Result<()> {
        let shadow_path = Self::shadow_path(&self.data_dir);
        let ckpt_path = Self::ckpt_path(&self.data_dir, self.shard);

        let mut shadow = File::create(&shadow_path)
            .map_err(|e| SimError::durability(format!("open checkpoint shadow failed: {e}")))?;
        let ts_ns = now_ns();
        writeln!(shadow, "{ts_ns}")
            .map_err(|e| SimError::durability(format!("checkpoint header write failed: {e}")))?;
        for user in accounts.values() {
            let stocks_json = serde_json::to_string(&user.shares)
                .map_err(|e| SimError::durability(format!("checkpoint encode failed: {e}")))?;
            writeln!(
                shadow,
                "{} {} {} {} {} {}",
                user.username.len(),
                user.username,
                user.password.len(),
                user.password,
                user.cash,
                stocks_json
            )
            .map_err(|e| SimError::durability(format!("checkpoint row write failed: {e}")))?;
        }
        shadow
            .flush()
            .map_err(|e| SimError::durability(format!("checkpoint flush failed: {e}")))?;
        shadow
            .sync_all()
            .map_err(|e| SimError::durability(format!("checkpoint fsync failed: {e}")))?;
        drop(shadow);

        fs::rename(&shadow_path, &ckpt_path)
            .map_err(|e| SimError::durability(format!("checkpoint rename failed: {e}")))?;

        self.log_file = truncate_log(&Self::log_path(&self.data_dir, self.shard))
            .map_err(|e| SimError::durability(format!("log truncation failed: {e}")))?;
        self.txn_count = 0;
        info!(shard = self.shard, accounts = accounts.len(), "checkpoint created");
        Ok(())
    }
}

/// Opens the log for appending without disturbing any bytes already on
/// disk. Used at startup, after replay has already consumed the log
/// contents through its own `File::open` handle.
fn open_fresh_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Opens the log empty, discarding whatever was there. Only safe to call
/// once the records it held are durably subsumed by a checkpoint that has
/// already been renamed into place.
fn truncate_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).write(true).truncate(true).open(path)
}

pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as i64
}

fn load_checkpoint(path: &Path) -> Result<(i64, HashMap<String, UserAccount>)> {
    let file = File::open(path).map_err(SimError::Io)?;
    let mut lines = BufReader::new(file).lines();

    let header = lines
        .next()
        .ok_or_else(|| SimError::durability("checkpoint file is empty"))?
        .map_err(SimError::Io)?;
    let ts: i64 = header
        .trim()
        .parse()
        .map_err(|_| SimError::durability("checkpoint header is not a timestamp"))?;

    let mut accounts = HashMap::new();
    for line in lines {
        let line = line.map_err(SimError::Io)?;
        if line.is_empty() {
            continue;
        }
        if let Some(user) = parse_checkpoint_row(&line) {
            accounts.insert(user.username.clone(), user);
        } else {
            warn!("skipping malformed checkpoint row");
        }
    }
    Ok((ts, accounts))
}

fn parse_checkpoint_row(line: &str) -> Option<UserAccount> {
    let (ulen_str, rest) = line.split_once(' ')?;
    let ulen: usize = ulen_str.parse().ok()?;
    if rest.len() < ulen {
        return None;
    }
    let username = &rest[..ulen];
    let rest = rest.get(ulen + 1..)?;

    let (plen_str, rest) = rest.split_once(' ')?;
    let plen: usize = plen_str.parse().ok()?;
    if rest.len() < plen {
        return None;
    }
    let password = &rest[..plen];
    let rest = rest.get(plen + 1..)?;

    let (cash_str, stocks_str) = rest.split_once(' ')?;
    let cash: f64 = cash_str.parse().ok()?;
    let shares: HashMap<String, i64> = serde_json::from_str(stocks_str).ok()?;

    Some(UserAccount {
        username: username.to_string(),
        password: password.to_string(),
        cash,
        shares,
    })
}

/// Replay every record in the log newer than `ckpt_ts` into `accounts`.
/// Stops at the first torn (length-mismatched) record, since a torn record
/// can only be an in-progress write truncated by a crash and everything
/// after it is necessarily unwritten too. Returns the number of records
/// applied.
fn replay_log(path: &Path, ckpt_ts: i64, accounts: &mut HashMap<String, UserAccount>) -> Result<u64> {
    let file = File::open(path).map_err(SimError::Io)?;
    let mut applied = 0u64;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(SimError::Io)?;
        if line.is_empty() {
            continue;
        }
        let Some((blen_str, rest)) = line.split_once(' ') else {
            break;
        };
        let Ok(blen) = blen_str.parse::<usize>() else {
            break;
        };
        if rest.len() != blen {
            // torn tail record: stop replay here.
            break;
        }
        let Some((ts_str, rest)) = rest.split_once(' ') else {
            break;
        };
        let Ok(ts) = ts_str.parse::<i64>() else {
            break;
        };
        if ts <= ckpt_ts {
            continue;
        }
        if apply_record(rest, accounts).is_none() {
            break;
        }
        applied += 1;
    }
    Ok(applied)
}

fn apply_record(rest: &str, accounts: &mut HashMap<String, UserAccount>) -> Option<()> {
    let (op, rest) = rest.split_once(' ')?;
    match op {
        "REGISTER" => {
            let (ulen_str, rest) = rest.split_once(' ')?;
            let ulen: usize = ulen_str.parse().ok()?;
            let username = rest.get(..ulen)?;
            let rest = rest.get(ulen + 1..)?;
            let (plen_str, rest) = rest.split_once(' ')?;
            let plen: usize = plen_str.parse().ok()?;
            let password = rest.get(..plen)?;
            accounts
                .entry(username.to_string())
                .or_insert_with(|| UserAccount::new(username, password));
            Some(())
        }
        "BUY" | "SELL" => {
            let (ulen_str, rest) = rest.split_once(' ')?;
            let ulen: usize = ulen_str.parse().ok()?;
            let username = rest.get(..ulen)?;
            let rest = rest.get(ulen + 1..)?;
            let mut parts = rest.splitn(3, ' ');
            let ticker = parts.next()?;
            let amount: i64 = parts.next()?.parse().ok()?;
            let price: f64 = parts.next()?.parse().ok()?;
            let user = accounts.get_mut(username)?;
            // Historical price from the log is ground truth: invariant
            // checks were already enforced at commit time.
            if op == "BUY" {
                user.purchase(ticker, amount, price);
            } else {
                user.sell(ticker, amount, price);
            }
            Some(())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_reconstructs_state() {
        let dir = tempdir().unwrap();
        let (mut engine, mut accounts) = WalEngine::open(dir.path(), 0).unwrap();
        assert!(accounts.is_empty());

        accounts.insert("dave".to_string(), UserAccount::new("dave", "pw"));
        engine
            .append(
                now_ns(),
                &WalOp::Register { username: "dave".into(), password: "pw".into() },
            )
            .unwrap();
        let user = accounts.get_mut("dave").unwrap();
        user.purchase("MSFT", 5, 300.0);
        engine
            .append(
                now_ns(),
                &WalOp::Buy { username: "dave".into(), ticker: "MSFT".into(), amount: 5, price: 300.0 },
            )
            .unwrap();

        // simulate crash + restart: reopen from the same directory.
        let (_engine2, accounts2) = WalEngine::open(dir.path(), 0).unwrap();
        let dave = &accounts2["dave"];
        assert_eq!(dave.cash, 100_000.0 - 5.0 * 300.0);
        assert_eq!(dave.shares["MSFT"], 5);
    }

    #[test]
    fn checkpoint_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let (mut engine, mut accounts) = WalEngine::open(dir.path(), 2).unwrap();
        accounts.insert("eve".to_string(), UserAccount::new("eve", "hunter2"));
        accounts.get_mut("eve").unwrap().purchase("AAPL", 3, 50.0);
        engine.checkpoint(&accounts).unwrap();

        let (_engine2, accounts2) = WalEngine::open(dir.path(), 2).unwrap();
        assert_eq!(accounts2["eve"].shares["AAPL"], 3);
        assert_eq!(accounts2["eve"].password, "hunter2");
    }

    #[test]
    fn checkpoint_truncates_the_log_file_on_disk() {
        let dir = tempdir().unwrap();
        let (mut engine, mut accounts) = WalEngine::open(dir.path(), 1).unwrap();
        accounts.insert("frank".to_string(), UserAccount::new("frank", "pw"));
        engine
            .append(now_ns(), &WalOp::Register { username: "frank".into(), password: "pw".into() })
            .unwrap();
        assert!(!fs::read_to_string(WalEngine::log_path(dir.path(), 1)).unwrap().is_empty());

        engine.checkpoint(&accounts).unwrap();
        let contents = fs::read_to_string(WalEngine::log_path(dir.path(), 1)).unwrap();
        assert!(contents.is_empty(), "checkpoint must truncate the log, found: {contents:?}");
    }

    #[test]
    fn records_committed_after_a_checkpoint_replay_against_a_genuinely_empty_log() {
        let dir = tempdir().unwrap();
        let (mut engine, mut accounts) = WalEngine::open(dir.path(), 3).unwrap();
        accounts.insert("grace".to_string(), UserAccount::new("grace", "pw"));
        engine
            .append(now_ns(), &WalOp::Register { username: "grace".into(), password: "pw".into() })
            .unwrap();
        engine.checkpoint(&accounts).unwrap();

        accounts.get_mut("grace").unwrap().purchase("AAPL", 2, 10.0);
        engine
            .append(now_ns(), &WalOp::Buy { username: "grace".into(), ticker: "AAPL".into(), amount: 2, price: 10.0 })
            .unwrap();

        let (_engine2, accounts2) = WalEngine::open(dir.path(), 3).unwrap();
        assert_eq!(accounts2["grace"].shares["AAPL"], 2);
    }

    #[test]
    fn torn_tail_record_stops_replay_but_earlier_records_survive() {
        let dir = tempdir().unwrap();
        let log_path = WalEngine::log_path(dir.path(), 0);
        fs::create_dir_all(dir.path()).unwrap();

        let mut accounts = HashMap::new();
        accounts.insert("dave".to_string(), UserAccount::new("dave", "pw"));
        let good_body = format_record_body(1, &WalOp::Register { username: "dave".into(), password: "pw".into() });
        let good_line = format!("{} {good_body}\n", good_body.len());

        // a torn record: claims a length longer than what follows.
        let torn_line = "999 1 BUY 4 dave MSFT 5 300.0\n";

        let mut f = File::create(&log_path).unwrap();
        f.write_all(good_line.as_bytes()).unwrap();
        f.write_all(torn_line.as_bytes()).unwrap();
        drop(f);

        let applied = replay_log(&log_path, 0, &mut HashMap::new()).unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn amount_zero_never_reaches_the_wal() {
        // amount==0 is handled above this module (the replicator never
        // calls append for a zero-share trade); this test documents that
        // the WAL format has no special case for it.
        let body = format_record_body(1, &WalOp::Buy { username: "x".into(), ticker: "TSLA".into(), amount: 0, price: 1.0 });
        assert!(body.contains(" 0 "));
    }
}
