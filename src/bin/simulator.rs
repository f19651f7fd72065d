//! `simulator` binary: replays historical minute bars into a live tick
//! stream for the broker and a delayed stream for subscribers.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use stockmarketsim::discovery::CatalogConfig;

/// Simulated stock market price engine.
#[derive(Parser, Debug)]
#[command(name = "simulator", version, about)]
struct Args {
    /// Project name this instance advertises to the catalog.
    #[arg(long, env = "STOCKMARKETSIM_PROJECT")]
    project: String,

    /// Address to listen on for broker and subscriber connections.
    #[arg(long, env = "STOCKMARKETSIM_LISTEN", default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// Directory containing `<TICKER>.csv` minute-bar files.
    #[arg(long, env = "STOCKMARKETSIM_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Seed for the tick-path PRNG. Fixing this makes a run reproducible.
    #[arg(long, env = "STOCKMARKETSIM_SEED", default_value_t = 1)]
    seed: u64,

    /// Catalog query endpoint (HTTP JSON).
    #[arg(long, env = "STOCKMARKETSIM_CATALOG_URL")]
    catalog_url: Option<String>,

    /// Catalog UDP registration address.
    #[arg(long, env = "STOCKMARKETSIM_CATALOG_REGISTER_ADDR")]
    catalog_register_addr: Option<SocketAddr>,
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

    stockmarketsim::simulator::run(args.data_dir, args.seed, args.listen, catalog, args.project)
        .await
        .map_err(anyhow::Error::from)
}
