pub mod account;
pub mod chat;
pub mod health;
pub mod models;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

/// Build the authenticated API router.
///
/// Route layout:
/// ```text
/// /v1/chat/completions    POST   chat completion, routed to a provider
/// /v1/models              GET    live model catalog
/// /v1/balance             GET    MULE balance of the calling account
/// /v1/transactions        GET    transaction history of the calling account
/// /v1/provider/stats      GET    earnings view of the calling account
/// /v1/consumer/stats      GET    spending view of the calling account
/// ```
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/balance", get(account::get_balance))
        .route("/v1/transactions", get(account::list_transactions))
        .route("/v1/provider/stats", get(account::provider_stats))
        .route("/v1/consumer/stats", get(account::consumer_stats))
}
