//! LLMule -- Brokered marketplace for LLM inference.
//!
//! Provider nodes running local models connect outbound over WebSocket,
//! register their model lists, and serve completion requests forwarded by
//! the broker. API clients speak the OpenAI chat-completions dialect; the
//! broker classifies the requested model into a capability tier, picks a
//! provider by load and throughput, correlates the round trip, and accounts
//! the reported token usage in MULE, the internal six-decimal unit.

pub mod api;
pub mod auth;
pub mod classifier;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tokenomics;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::auth::middleware::require_auth;
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::{Dispatcher, PendingRequests};
use crate::ledger::{Ledger, SettleJob};
use crate::registry::ProviderRegistry;
use crate::tokenomics::Tokenomics;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub ledger: Ledger,
    pub registry: Arc<ProviderRegistry>,
    pub pending: Arc<PendingRequests>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Wire up the core: ledger, registry, pending map, dispatcher.
    ///
    /// Returns the receiving half of the reconciliation channel; the caller
    /// hands it to [`ledger::spawn_reconciler`].
    pub fn new(config: Config, db: Database) -> (Self, mpsc::UnboundedReceiver<SettleJob>) {
        let tokenomics = Tokenomics::new(config.tokenomics.clone());
        let ledger = Ledger::new(db.clone(), tokenomics);
        let registry = Arc::new(ProviderRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            pending.clone(),
            ledger.clone(),
            config.dispatch.clone(),
            reconcile_tx,
        ));

        (
            Self {
                config: Arc::new(config),
                db,
                ledger,
                registry,
                pending,
                dispatcher,
            },
            reconcile_rx,
        )
    }
}

/// Build the combined application router with all middleware layers.
pub fn build_app(state: AppState) -> Router {
    // -- CORS layer -----------------------------------------------------------
    let cors = cors_layer(&state.config.server);

    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // -- Tracing layer --------------------------------------------------------
    let trace = TraceLayer::new_for_http();

    // -- Client API routes (require auth) -------------------------------------
    let api_routes = api::build_api_router()
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // -- Provider session route (credential checked in the handshake) ---------
    let session_routes =
        Router::new().route("/v1/providers/connect", get(session::provider_ws_handler));

    Router::new()
        .route("/health", get(api::health::health_check))
        .merge(session_routes)
        .merge(api_routes)
        .layer(propagate_id)
        .layer(request_id)
        .layer(trace)
        .layer(cors)
        .with_state(state)
}

/// CORS policy from the server config. With no configured origins the
/// policy stays wide open, which suits local development.
fn cors_layer(server: &config::ServerConfig) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.cors_origins.is_empty() {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    base.allow_origin(origins)
}
