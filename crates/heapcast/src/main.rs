//! # heapcast
//!
//! Heapcast server binary: loads settings, starts the push engine and serves
//! published heaps over WebSocket until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use heapcast_core::heap::{MemoryHeap, NodeKind, ROOT_NODE};
use heapcast_core::logging::init_subscriber;
use heapcast_server::websocket::server::{AppState, serve};
use heapcast_server::{ConnectedObjectManager, HeapCatalog, PushConfig};
use heapcast_settings::{HeapcastSettings, init_settings, load_settings_from_path, settings_path};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Uri of the built-in demo heap.
const DEMO_CLOCK_URI: &str = "heapcast://demo/clock";

/// Heapcast connected-object server.
#[derive(Parser, Debug)]
#[command(name = "heapcast", about = "Heapcast connected-object server")]
struct Cli {
    /// Settings file (defaults to `~/.heapcast/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Pusher worker count (overrides settings).
    #[arg(long)]
    workers: Option<usize>,

    /// Do not publish the demo clock heap.
    #[arg(long)]
    no_demo: bool,
}

impl Cli {
    fn apply(&self, settings: &mut HeapcastSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(workers) = self.workers {
            settings.push.worker_count = workers;
        }
        settings.validate();
    }
}

/// Publish a heap whose `tick` and `time` fields change once a second.
fn spawn_demo_clock(catalog: &HeapCatalog, stop: CancellationToken) -> Result<()> {
    let heap = Arc::new(MemoryHeap::new(DEMO_CLOCK_URI));
    let (tick, time) = heap
        .update(|txn| {
            let tick = txn.install_field(ROOT_NODE, "tick", NodeKind::Scalar)?;
            let time = txn.install_field(ROOT_NODE, "time", NodeKind::Scalar)?;
            txn.set(tick, json!(0))?;
            txn.set(time, json!(chrono::Utc::now().to_rfc3339()))?;
            Ok((tick, time))
        })
        .context("Failed to build demo heap")?;
    catalog.publish(heap.clone());

    let _task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut count: u64 = 0;
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = interval.tick() => {
                    count += 1;
                    let result = heap.update(|txn| {
                        txn.set(tick, json!(count))?;
                        txn.set(time, json!(chrono::Utc::now().to_rfc3339()))
                    });
                    if let Err(error) = result {
                        tracing::warn!(%error, "demo clock stopped");
                        break;
                    }
                }
            }
        }
        let _ = heap.terminate();
    });
    tracing::info!(uri = DEMO_CLOCK_URI, "demo heap published");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Settings first: the log level comes from them.
    let path = args.config.clone().unwrap_or_else(settings_path);
    let (mut settings, load_error) = match load_settings_from_path(&path) {
        Ok(settings) => (settings, None),
        Err(error) => (HeapcastSettings::default(), Some(error)),
    };
    args.apply(&mut settings);
    let settings = init_settings(settings);

    let _ = init_subscriber(&settings.logging.level, settings.logging.json);
    if let Some(error) = load_error {
        tracing::warn!(path = %path.display(), %error, "failed to load settings, using defaults");
    }

    let metrics = heapcast_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let manager = Arc::new(ConnectedObjectManager::start(&PushConfig::from(
        &settings.push,
    )));
    let catalog = Arc::new(HeapCatalog::new());
    let stop = CancellationToken::new();
    if !args.no_demo {
        spawn_demo_clock(&catalog, stop.child_token())?;
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let state = AppState::new(Arc::clone(&manager), catalog, Arc::clone(&settings))
        .with_metrics(metrics);
    let shutdown = stop.clone();
    let server = tokio::spawn(async move {
        serve(listener, state, async move { shutdown.cancelled().await }).await
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    stop.cancel();
    manager.shutdown().await;
    server
        .await
        .context("Server task panicked")?
        .context("Server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_settings() {
        let args = Cli::parse_from(["heapcast", "--port", "0", "--workers", "0", "--host", "0.0.0.0"]);
        let mut settings = HeapcastSettings::default();
        args.apply(&mut settings);
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.server.host, "0.0.0.0");
        // Zero workers is corrected by validation.
        assert_eq!(settings.push.worker_count, 1);
    }

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let args = Cli::parse_from(["heapcast"]);
        let mut settings = HeapcastSettings::default();
        args.apply(&mut settings);
        assert_eq!(settings, HeapcastSettings::default());
        assert!(!args.no_demo);
    }

    #[tokio::test]
    async fn demo_clock_is_published() {
        let catalog = HeapCatalog::new();
        let stop = CancellationToken::new();
        spawn_demo_clock(&catalog, stop.clone()).unwrap();
        assert!(catalog.uris().contains(&DEMO_CLOCK_URI.into()));
        stop.cancel();
    }
}
