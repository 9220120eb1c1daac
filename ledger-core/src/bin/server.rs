//! Ledger server binary
//!
//! Opens the ledger with the static reference data from the config file,
//! runs the timeout sweeper and serves Prometheus metrics on `/metrics`.
//!
//! Environment:
//! - `LEDGER_CONFIG` - path to a TOML config file (optional)
//! - `LEDGER_LOG_JSON=1` - JSON log lines
//! - `RUST_LOG` - log filter (default `info`)

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use ledger_core::{Config, Ledger};
use std::sync::Arc;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LEDGER_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::default(),
    };
    Ok(config.with_env_overrides()?)
}

async fn metrics_handler(State(ledger): State<Arc<Ledger>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        ledger.metrics().render(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    tracing::info!(
        data_dir = ?config.data_dir,
        participants = config.participants.len(),
        "Starting ledger server"
    );

    let metrics_addr = config.metrics_listen_addr.clone();
    let ledger = Arc::new(Ledger::open_with_config_participants(config).await?);

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(ledger.clone());
    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("binding metrics listener on {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "Serving metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down ledger server");
    ledger.shutdown().await?;
    Ok(())
}
