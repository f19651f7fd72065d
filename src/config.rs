//! Tuning knobs shared across components. Each binary exposes these as
//! `clap` options with environment-variable fallbacks; the constants here
//! are the defaults used when nothing overrides them.

use std::time::Duration;

/// How long a subscription stays live without a re-subscribe.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall-clock duration of one simulated minute.
pub const MINUTE_RATE: Duration = Duration::from_millis(6_000);

/// Wall-clock duration of one intra-minute tick.
pub const UPDATE_RATE: Duration = Duration::from_millis(50);

/// Wall-clock duration between publishes.
pub const PUBLISH_RATE: Duration = Duration::from_millis(250);

/// Depth of the simulator's public delay queue, in publish periods.
pub const DELAY_QUEUE_DEPTH: usize = 5;

/// Number of committed WAL records between automatic checkpoints.
pub const CHECKPOINT_INTERVAL: u64 = 100;

/// Broker -> replicator connect timeout.
pub const REPLICATOR_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client -> broker request timeout.
pub const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on the broker's per-shard pending queue before it starts rejecting
/// with `busy` instead of queuing indefinitely (see REDESIGN FLAGS).
pub const MAX_PENDING_PER_SHARD: usize = 256;

/// Interval between catalog self-registration heartbeats.
pub const CATALOG_REGISTER_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between broker leaderboard rebuilds.
pub const LEADERBOARD_REBUILD_INTERVAL: Duration = Duration::from_secs(60);

/// Initial discovery/reconnect backoff, doubled (capped) on each failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
