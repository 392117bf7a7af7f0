//! Metrics gateway: catalogs the series of every configured provider and
//! serves graph queries over HTTP.
//!
//! # Signals
//! `SIGINT`/`SIGTERM` stop the HTTP server, then the provider workers.
//! `SIGHUP` asks every worker to refresh its catalog.

mod config;
mod error;
mod handlers;
mod models;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use gateway_core::model::{Collection, Graph, MetricGroup, SourceGroup};
use gateway_core::query::QueryEngine;
use gateway_core::store::{MemoryStore, Store};
use gateway_core::{Library, Searcher};
use gateway_poller::Poller;
use gateway_store_pg::PgStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{GatewayConfig, StorageDriver};
use crate::handlers::{catalog, library, providers, series};

#[derive(Parser, Debug)]
#[command(author, version, about = "Time-series gateway")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

// ------------------------------------------------------------------ //
//  Shared application state                                           //
// ------------------------------------------------------------------ //

/// Shared state injected into every Axum handler via `State`.
pub struct AppState {
    pub searcher: Arc<Searcher>,
    pub library: Library,
    pub poller: Arc<Poller>,
    pub engine: QueryEngine,
}

/// Builds the HTTP surface over `state`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/version", get(handlers::version))
        // Catalog
        .route("/api/v1/catalog/", get(catalog::summary))
        .route("/api/v1/catalog/:kind/", get(catalog::list))
        .route("/api/v1/catalog/:kind/*name", get(catalog::show))
        // Series
        .route("/api/v1/expand", post(series::expand))
        .route("/api/v1/series/expand", post(series::expand))
        .route("/api/v1/series/points", post(series::points))
        // Providers
        .route(
            "/api/v1/providers/",
            get(providers::list).post(providers::create).delete(providers::delete_all),
        )
        .route("/api/v1/providers/refresh", post(providers::refresh_all))
        .route(
            "/api/v1/providers/:id",
            get(providers::show)
                .put(providers::update)
                .patch(providers::patch)
                .delete(providers::delete),
        )
        .route("/api/v1/providers/:id/refresh", post(providers::refresh))
        // Library
        .route("/api/v1/library/", get(library::summary))
        .route("/api/v1/library/collections/tree", get(library::collection_tree))
        .merge(library::routes::<Graph>())
        .merge(library::routes::<Collection>())
        .merge(library::routes::<SourceGroup>())
        .merge(library::routes::<MetricGroup>())
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ------------------------------------------------------------------ //
//  Entry point                                                        //
// ------------------------------------------------------------------ //

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log_filter.parse()?),
        )
        .json()
        .init();

    let store: Arc<dyn Store> = match config.storage.driver {
        StorageDriver::Memory => {
            warn!("using in-memory storage, library changes will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StorageDriver::Postgres => {
            let url = config
                .storage
                .url
                .as_deref()
                .context("storage.url is required by the postgres driver")?;
            let store = PgStore::connect(url, config.storage.max_connections).await?;
            store.migrate().await?;
            info!("postgres storage ready");
            Arc::new(store)
        }
    };

    let library = Library::new(store);
    let searcher = Arc::new(Searcher::new());
    let poller = Arc::new(Poller::new(
        searcher.clone(),
        library.clone(),
        Arc::new(gateway_connectors::registry()),
        config.worker_config(),
    ));
    poller.start().await.context("unable to start providers")?;

    let state = Arc::new(AppState {
        engine: QueryEngine::new(searcher.clone(), library.clone(), config.query_defaults()),
        searcher,
        library,
        poller: poller.clone(),
    });

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(poller.clone(), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("unable to listen on {}", config.listen))?;
    info!(addr = %config.listen, "gateway listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    poller.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

/// Cancels `shutdown` on SIGINT/SIGTERM and broadcasts a refresh on SIGHUP.
async fn watch_signals(poller: Arc<Poller>, shutdown: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                info!("SIGHUP received, refreshing providers");
                poller.refresh().await;
            }
        }
    }

    info!("shutdown signal received");
    shutdown.cancel();
    Ok(())
}
