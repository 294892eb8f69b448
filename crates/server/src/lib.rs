//! HTTP surface and background glue for the bank-feed service: upload,
//! review, match lifecycle, bulk actions, summary.

pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod notify;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use bancroft_engine::MatchEngine;
use bancroft_storage::DbPool;

use config::BancroftConfig;
use dispatch::Dispatcher;
use notify::BroadcastNotifier;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<BancroftConfig>,
    pub engine: Arc<MatchEngine>,
    pub dispatcher: Dispatcher,
    pub notifier: Arc<BroadcastNotifier>,
}

/// Wire everything together: engine from config, notifier, dispatcher with
/// its worker task, and the router on top. The returned handle is the
/// dispatcher worker.
pub fn build(config: BancroftConfig, db: DbPool) -> (Router, JoinHandle<()>) {
    let config = Arc::new(config);
    let engine = Arc::new(MatchEngine::new(config.matching.clone()));
    let notifier = Arc::new(BroadcastNotifier::new(256));
    let (dispatcher, worker) = Dispatcher::spawn(db.clone(), engine.clone(), notifier.clone());

    let max_upload = config.server.max_upload_bytes;
    let state = AppState {
        db,
        config,
        engine,
        dispatcher,
        notifier,
    };

    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/feed/upload", post(handlers::upload))
        .route("/api/feed/transactions", get(handlers::list_transactions))
        .route("/api/feed/transactions/{id}", get(handlers::transaction_detail))
        .route(
            "/api/feed/transactions/{id}/unmatch",
            post(handlers::unmatch_transaction),
        )
        .route("/api/feed/match", post(handlers::manual_match))
        .route("/api/feed/bulk", post(handlers::bulk))
        .route("/api/feed/rematch", post(handlers::rematch))
        .route("/api/feed/summary", get(handlers::summary))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    (router, worker)
}
