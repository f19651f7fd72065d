//! `replicator` binary: one durable account-storage shard in the chain.

use std::path::PathBuf;

use clap::Parser;
use stockmarketsim::discovery::CatalogConfig;

/// Durable, sharded account storage for the stock market platform.
#[derive(Parser, Debug)]
#[command(name = "replicator", version, about)]
struct Args {
    /// Project name this instance advertises to the catalog.
    #[arg(long, env = "STOCKMARKETSIM_PROJECT")]
    project: String,

    /// This shard's index (0-based). The broker hashes usernames to shard
    /// indices, so every shard 0..num_chains must be running.
    #[arg(long, env = "STOCKMARKETSIM_SHARD")]
    shard: usize,

    /// Directory for this shard's WAL and checkpoint files.
    #[arg(long, env = "STOCKMARKETSIM_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// First port to probe when binding the listen socket; up to 100
    /// consecutive ports are tried, matching the original firewall-friendly
    /// port range.
    #[arg(long, env = "STOCKMARKETSIM_BASE_PORT", default_value_t = 9123)]
    base_port: u16,

    /// Catalog query endpoint (HTTP JSON).
    #[arg(long, env = "STOCKMARKETSIM_CATALOG_URL")]
    catalog_url: Option<String>,

    /// Catalog UDP registration address.
    #[arg(long, env = "STOCKMARKETSIM_CATALOG_REGISTER_ADDR")]
    catalog_register_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut catalog = CatalogConfig::default();
    if let Some(url) = args.catalog_url {
        catalog.query_url = url;
    }
    if let Some(addr) = args.catalog_register_addr {
        catalog.register_addr = addr;
    }

    stockmarketsim::replicator::run(args.data_dir, args.shard, args.base_port, catalog, args.project)
        .await
        .map_err(anyhow::Error::from)
}
