//! `broker` binary: routes client requests to replicator shards, tracks
//! live prices from the simulator, and serves the leaderboard.

use std::net::SocketAddr;

use clap::Parser;
use stockmarketsim::discovery::CatalogConfig;

/// Stock market broker: the client-facing front door.
#[derive(Parser, Debug)]
#[command(name = "broker", version, about)]
struct Args {
    /// Project name this instance advertises to the catalog, and uses to
    /// discover its simulator and replicator shards.
    #[arg(long, env = "STOCKMARKETSIM_PROJECT")]
    project: String,

    /// Address to listen on for client connections.
    #[arg(long, env = "STOCKMARKETSIM_LISTEN", default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// Number of replicator shards (chains) in this deployment.
    #[arg(long, env = "STOCKMARKETSIM_NUM_CHAINS")]
    num_chains: usize,

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
    if args.num_chains == 0 {
        anyhow::bail!("--num-chains must be at least 1");
    }

    let mut catalog = CatalogConfig::default();
    if let Some(url) = args.catalog_url {
        catalog.query_url = url;
    }
    if let Some(addr) = args.catalog_register_addr {
        catalog.register_addr = addr;
    }

    stockmarketsim::broker::run(args.listen, args.num_chains, catalog, args.project)
        .await
        .map_err(anyhow::Error::from)
}
