//! Basic Fetch Example
//!
//! Fetches a few resources through the scheduler and prints what it did.
//! Configuration comes from `TOLLGATE_*` environment variables, for example:
//!
//! ```text
//! TOLLGATE_BASE_URL=https://api.wynncraft.com \
//! TOLLGATE_CREDENTIALS=my-key:120:60000 \
//! RUST_LOG=tollgate_client=debug \
//!     cargo run --example basic_fetch -- /v3/player/Salted /v3/guild/list/guild
//! ```

use anyhow::Context;
use futures::future::join_all;
use tollgate_client::{ApiClient, ClientConfig, FetchOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate_client=info")),
        )
        .init();

    let config = ClientConfig::from_env().context("reading configuration")?;
    config.validate().context("validating configuration")?;
    let client = ApiClient::new(config)?;

    let mut paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        paths.push("/v3/news/latest".to_string());
    }

    println!("=== Fetching {} resource(s) ===\n", paths.len());

    // Identical paths issued together share one request
    let pending: Vec<_> = paths
        .iter()
        .chain(paths.iter())
        .map(|p| client.fetch(p.as_str(), FetchOptions::new()))
        .collect();
    let snapshot = client.snapshot();
    println!(
        "In flight: {}  queued: {}\n",
        snapshot.total_ongoing, snapshot.total_queued
    );

    for (path, result) in paths.iter().chain(paths.iter()).zip(join_all(pending).await) {
        match result {
            Ok(raw) if raw.is_absent() => println!("{path}: not found"),
            Ok(raw) => println!(
                "{path}: {} bytes, data age {:?}",
                raw.body.len(),
                raw.data_age()
            ),
            Err(e) => println!("{path}: error: {e}"),
        }
    }

    println!("\n=== Channels ===");
    for channel in client.snapshot().channels {
        println!(
            "{:<12} {}/{} remaining, resets in {:?}, {} queued",
            channel.credential.as_deref().unwrap_or("<shared>"),
            channel.remaining,
            channel.limit,
            channel.reset_in,
            channel.queued_count
        );
    }

    let stats = client.cache_stats();
    println!(
        "\nCache: {} entries, {:.0}% hit rate",
        stats.entry_count,
        stats.hit_rate()
    );

    Ok(())
}
