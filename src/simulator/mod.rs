//! Simulator: produces a continuous price stream for the ticker universe
//! from historical minute bars, publishing a live feed to the broker and a
//! deliberately delayed feed to subscribers.
//!
//! Two clocks drive this module: `MINUTE_RATE` advances to the next
//! historical bar and redraws the tick path across it; `UPDATE_RATE`
//! advances one simulated tick along that path. `PUBLISH_RATE` is
//! independent of both — it just samples whatever the current tick is.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use statrs::distribution::Normal;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{info, warn};

use crate::config::{DELAY_QUEUE_DEPTH, MINUTE_RATE, PUBLISH_RATE, SUBSCRIBE_TIMEOUT, UPDATE_RATE};
use crate::discovery::{spawn_registration_task, CatalogConfig};
use crate::domain::{zero_stock_info, StockInfo, TICKERS};
use crate::framing::{self, Frame};

/// One row of a ticker's minute-bar history.
#[derive(Debug, Clone, Copy)]
pub struct MinuteBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Load `data/<ticker>.csv` for every ticker in the universe. Expects a
/// header row followed by `open,high,low,close` columns.
pub fn load_bars(data_dir: &Path) -> crate::error::Result<HashMap<&'static str, Vec<MinuteBar>>> {
    let mut out = HashMap::new();
    for ticker in TICKERS.iter() {
        let path = data_dir.join(format!("{ticker}.csv"));
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(|e| crate::error::SimError::domain(format!("failed to open {path:?}: {e}")))?;
        let mut bars = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| crate::error::SimError::domain(format!("bad bar row in {path:?}: {e}")))?;
            let parse = |i: usize| -> crate::error::Result<f64> {
                record
                    .get(i)
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| crate::error::SimError::domain(format!("bad numeric field in {path:?}")))
            };
            bars.push(MinuteBar { open: parse(0)?, high: parse(1)?, low: parse(2)?, close: parse(3)? });
        }
        if bars.is_empty() {
            return Err(crate::error::SimError::domain(format!("{path:?} has no bar rows")));
        }
        info!(ticker, bars = bars.len(), "loaded minute bars");
        out.insert(*ticker, bars);
    }
    Ok(out)
}

/// A fully-sampled intra-minute tick path for one ticker, one bar: a
/// straight line from `open` to `close`, perturbed by Gaussian noise whose
/// width is drawn once per bar from the bar's own high/low range.
fn sample_minute_path(bar: &MinuteBar, samples: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
    let u: f64 = rng.gen_range(0.1..1.9);
    let std_dev = (u * (bar.high - bar.low).abs() + 0.01).max(1e-9);
    let normal = Normal::new(0.0, std_dev).expect("positive std dev");
    (0..samples)
        .map(|k| {
            let linear = bar.open + (bar.close - bar.open) * (k as f64) / (samples as f64);
            let eps: f64 = rng.sample(normal);
            (linear + eps).round_to_cents()
        })
        .collect()
}

trait RoundCents {
    fn round_to_cents(self) -> f64;
}
impl RoundCents for f64 {
    fn round_to_cents(self) -> f64 {
        (self * 100.0).round() / 100.0
    }
}

/// Depth-bounded delay line: publishes feed straight to the broker, but
/// only releases the oldest buffered sample to subscribers once the queue
/// is at capacity — the deliberate information asymmetry between a
/// broker's live view (used to price orders) and what subscribers see.
struct DelayQueue {
    buf: VecDeque<Value>,
    depth: usize,
}

impl DelayQueue {
    fn new(depth: usize) -> Self {
        Self { buf: VecDeque::with_capacity(depth + 1), depth }
    }

    /// Push the newest sample; returns the sample to release to
    /// subscribers, if the queue has filled past its depth.
    fn push(&mut self, sample: Value) -> Option<Value> {
        self.buf.push_back(sample);
        if self.buf.len() > self.depth {
            self.buf.pop_front()
        } else {
            None
        }
    }
}

struct Subscriber {
    addr: SocketAddr,
    last_seen: std::time::Instant,
}

pub struct SimulatorState {
    bars: HashMap<&'static str, Vec<MinuteBar>>,
    minute_index: usize,
    current_path: HashMap<&'static str, Vec<f64>>,
    tick: usize,
    samples_per_minute: usize,
    rng: ChaCha8Rng,
    delay: DelayQueue,
    subscribers: Vec<Subscriber>,
}

impl SimulatorState {
    fn new(bars: HashMap<&'static str, Vec<MinuteBar>>, seed: u64) -> Self {
        let samples_per_minute = (MINUTE_RATE.as_millis() / UPDATE_RATE.as_millis()).max(1) as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let current_path = resample_all(&bars, 0, samples_per_minute, &mut rng);
        Self {
            bars,
            minute_index: 0,
            current_path,
            tick: 0,
            samples_per_minute,
            rng,
            delay: DelayQueue::new(DELAY_QUEUE_DEPTH),
            subscribers: Vec::new(),
        }
    }

    /// Advance to the next historical minute, redrawing the tick path.
    fn advance_minute(&mut self) {
        self.minute_index = (self.minute_index + 1) % shortest_history(&self.bars);
        self.current_path = resample_all(&self.bars, self.minute_index, self.samples_per_minute, &mut self.rng);
        self.tick = 0;
    }

    fn advance_tick(&mut self) {
        self.tick = (self.tick + 1) % self.samples_per_minute;
    }

    fn current_prices(&self) -> StockInfo {
        let mut info = zero_stock_info();
        for ticker in TICKERS.iter() {
            if let Some(path) = self.current_path.get(ticker) {
                info.insert(ticker.to_string(), path[self.tick.min(path.len() - 1)]);
            }
        }
        info
    }

    fn sweep_expired_subscribers(&mut self) {
        let now = std::time::Instant::now();
        let before = self.subscribers.len();
        self.subscribers.retain(|s| now.duration_since(s.last_seen) <= SUBSCRIBE_TIMEOUT);
        let removed = before - self.subscribers.len();
        if removed > 0 {
            info!(removed, "swept expired subscribers");
        }
    }
}

fn shortest_history(bars: &HashMap<&'static str, Vec<MinuteBar>>) -> usize {
    bars.values().map(Vec::len).min().unwrap_or(1).max(1)
}

fn resample_all(
    bars: &HashMap<&'static str, Vec<MinuteBar>>,
    minute_index: usize,
    samples: usize,
    rng: &mut ChaCha8Rng,
) -> HashMap<&'static str, Vec<f64>> {
    bars.iter()
        .map(|(ticker, rows)| {
            let bar = rows[minute_index % rows.len()];
            (*ticker, sample_minute_path(&bar, samples, rng))
        })
        .collect()
}

/// Runs the minute/tick/publish loops and the accept loop for broker and
/// subscriber connections, forever.
pub async fn run(
    data_dir: std::path::PathBuf,
    seed: u64,
    listen_addr: SocketAddr,
    catalog: CatalogConfig,
    project: String,
) -> crate::error::Result<()> {
    let bars = load_bars(&data_dir)?;
    let state = Arc::new(Mutex::new(SimulatorState::new(bars, seed)));
    let broker_conn: Arc<tokio::sync::Mutex<Option<TcpStream>>> = Arc::new(tokio::sync::Mutex::new(None));
    let pub_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await.map_err(crate::error::SimError::Io)?);

    let listener = TcpListener::bind(listen_addr).await.map_err(crate::error::SimError::Io)?;
    let port = listener.local_addr().map_err(crate::error::SimError::Io)?.port();
    info!(port, "simulator listening");

    spawn_registration_task(catalog, "stockmarketsim".to_string(), project, port, crate::config::CATALOG_REGISTER_INTERVAL);

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UPDATE_RATE);
            loop {
                ticker.tick().await;
                state.lock().advance_tick();
            }
        });
    }
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MINUTE_RATE);
            loop {
                ticker.tick().await;
                state.lock().advance_minute();
            }
        });
    }
    {
        let state = state.clone();
        let broker_conn = broker_conn.clone();
        let pub_socket = pub_socket.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUBLISH_RATE);
            loop {
                ticker.tick().await;
                publish_tick(&state, &broker_conn, &pub_socket).await;
            }
        });
    }

    loop {
        let (mut conn, addr) = listener.accept().await.map_err(crate::error::SimError::Io)?;
        match framing::read_frame(&mut conn).await {
            Ok(Frame::Ok(hello)) if hello.get("type").and_then(Value::as_str) == Some("broker") => {
                info!(%addr, "broker connected to live feed");
                *broker_conn.lock().await = Some(conn);
            }
            Ok(Frame::Ok(hello)) => {
                if let (Some(host), Some(port)) = (
                    hello.get("hostname").and_then(Value::as_str),
                    hello.get("port").and_then(Value::as_u64),
                ) {
                    if let Ok(sub_addr) = format!("{host}:{port}").parse::<SocketAddr>() {
                        let mut s = state.lock();
                        if let Some(existing) = s.subscribers.iter_mut().find(|sub| sub.addr == sub_addr) {
                            existing.last_seen = std::time::Instant::now();
                        } else {
                            s.subscribers.push(Subscriber { addr: sub_addr, last_seen: std::time::Instant::now() });
                        }
                        info!(%sub_addr, "subscriber registered");
                    }
                }
            }
            _ => warn!(%addr, "ignoring malformed hello"),
        }
    }
}

async fn publish_tick(
    state: &Arc<Mutex<SimulatorState>>,
    broker_conn: &Arc<tokio::sync::Mutex<Option<TcpStream>>>,
    pub_socket: &Arc<UdpSocket>,
) {
    let (live, delayed, sub_addrs) = {
        let mut s = state.lock();
        let prices = s.current_prices();
        let mut live = json!({ "type": "stockmarketsimupdate", "time": crate::wal::now_ns() });
        for (k, v) in prices.iter() {
            live[k.as_str()] = json!(*v);
        }
        let delayed = s.delay.push(live.clone());
        s.sweep_expired_subscribers();
        let addrs: Vec<SocketAddr> = s.subscribers.iter().map(|sub| sub.addr).collect();
        (live, delayed, addrs)
    };

    {
        let mut guard = broker_conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            if framing::write_frame(conn, &live).await.is_err() {
                *guard = None;
            }
        }
    }

    let Some(payload) = delayed else { return };
    let Ok(bytes) = serde_json::to_vec(&payload) else { return };
    for addr in sub_addrs {
        if let Err(e) = pub_socket.send_to(&bytes, addr).await {
            warn!(%addr, error = %e, "failed to publish to subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bars() -> HashMap<&'static str, Vec<MinuteBar>> {
        TICKERS
            .iter()
            .map(|t| (*t, vec![
                MinuteBar { open: 100.0, high: 105.0, low: 95.0, close: 102.0 },
                MinuteBar { open: 102.0, high: 110.0, low: 100.0, close: 108.0 },
            ]))
            .collect()
    }

    #[test]
    fn same_seed_produces_identical_tick_paths() {
        let s1 = SimulatorState::new(sample_bars(), 42);
        let s2 = SimulatorState::new(sample_bars(), 42);
        assert_eq!(s1.current_path["TSLA"], s2.current_path["TSLA"]);
    }

    #[test]
    fn different_seeds_produce_different_tick_paths() {
        let s1 = SimulatorState::new(sample_bars(), 1);
        let s2 = SimulatorState::new(sample_bars(), 2);
        assert_ne!(s1.current_path["TSLA"], s2.current_path["TSLA"]);
    }

    #[test]
    fn tick_path_endpoints_track_the_bar_open_and_close() {
        let s = SimulatorState::new(sample_bars(), 7);
        let path = &s.current_path["TSLA"];
        assert!((path[0] - 100.0).abs() < 5.0);
    }

    #[test]
    fn delay_queue_releases_only_after_reaching_depth() {
        let mut q = DelayQueue::new(3);
        assert!(q.push(json!(1)).is_none());
        assert!(q.push(json!(2)).is_none());
        assert!(q.push(json!(3)).is_none());
        assert_eq!(q.push(json!(4)), Some(json!(1)));
        assert_eq!(q.push(json!(5)), Some(json!(2)));
    }

    #[test]
    fn advance_minute_wraps_around_shortest_history() {
        let mut s = SimulatorState::new(sample_bars(), 3);
        s.advance_minute();
        assert_eq!(s.minute_index, 1);
        s.advance_minute();
        assert_eq!(s.minute_index, 0);
    }
}
