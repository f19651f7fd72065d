//! Catalog-mediated discovery: look peers up by `(project, type)`, and
//! periodically advertise this process's own `(type, project, port)` back to
//! the catalog.
//!
//! The catalog is an external collaborator (an HTTP JSON endpoint for
//! lookups, a UDP datagram sink for registration) and is treated as a black
//! box here: we only depend on its contract, never its implementation.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::{INITIAL_BACKOFF, MAX_BACKOFF};

/// One entry as returned by the catalog's `/query.json` endpoint. Extra
/// fields on the real catalog response are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "name")]
    pub host: String,
    pub port: u16,
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

/// Where to find the catalog. Overridable per-process since it's an
/// external collaborator, not a constant of this system.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub query_url: String,
    pub register_addr: SocketAddr,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            query_url: "http://catalog.example.org:9097/query.json".to_string(),
            register_addr: "127.0.0.1:9097".parse().unwrap(),
        }
    }
}

/// Fetch the catalog and return every entry matching `(project, service_type)`.
/// Never returns an empty list: on a failed fetch or an empty match, it
/// waits, doubles the wait (capped), and retries indefinitely.
pub async fn discover(
    catalog: &CatalogConfig,
    project: &str,
    service_type: &str,
) -> Vec<CatalogEntry> {
    let client = reqwest::Client::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match fetch_and_filter(&client, catalog, project, service_type).await {
            Ok(entries) if !entries.is_empty() => {
                debug!(count = entries.len(), project, service_type, "discovery found peers");
                return entries;
            }
            Ok(_) => {
                warn!(project, service_type, "catalog returned no matching entries, retrying");
            }
            Err(e) => {
                warn!(project, service_type, error = %e, "catalog fetch failed, retrying");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn fetch_and_filter(
    client: &reqwest::Client,
    catalog: &CatalogConfig,
    project: &str,
    service_type: &str,
) -> reqwest::Result<Vec<CatalogEntry>> {
    let entries: Vec<CatalogEntry> = client.get(&catalog.query_url).send().await?.json().await?;
    Ok(entries
        .into_iter()
        .filter(|e| {
            e.project.as_deref() == Some(project) && e.service_type.as_deref() == Some(service_type)
        })
        .collect())
}

#[derive(Debug, Serialize)]
struct Registration<'a> {
    #[serde(rename = "type")]
    service_type: &'a str,
    owner: &'a str,
    port: u16,
    project: &'a str,
}

/// Send one registration datagram to the catalog.
pub async fn register_once(
    catalog: &CatalogConfig,
    service_type: &str,
    project: &str,
    port: u16,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let msg = Registration {
        service_type,
        owner: "stockmarketsim",
        port,
        project,
    };
    let body = serde_json::to_vec(&msg)?;
    socket.send_to(&body, catalog.register_addr).await?;
    info!(service_type, project, port, "registered with catalog");
    Ok(())
}

/// Spawn a task that re-registers with the catalog on a fixed interval,
/// forever. Used by every long-running server (simulator, broker, each
/// replicator shard).
pub fn spawn_registration_task(
    catalog: CatalogConfig,
    service_type: String,
    project: String,
    port: u16,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = register_once(&catalog, &service_type, &project, port).await {
                warn!(error = %e, "catalog registration datagram failed");
            }
        }
    })
}
