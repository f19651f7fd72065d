//! Library backing three binaries — `simulator`, `broker`, and
//! `replicator` — that together make up a sharded, simulated stock
//! trading platform. See each module for its piece of the system.

pub mod broker;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod replicator;
pub mod simulator;
pub mod wal;
