use axum::extract::{Query, State};
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::ledger::{ConsumerStats, ProviderStats, TransactionRecord};
use crate::AppState;

/// GET /v1/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state.ledger.get_balance(&user.user_id)?;
    Ok(Json(BalanceResponse {
        balance,
        currency: "MULE".to_string(),
    }))
}

/// GET /v1/transactions
///
/// Transactions where the calling account appears as consumer or provider,
/// newest first.
pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> Result<Json<TransactionsResponse>, AppError> {
    let limit = page.limit.unwrap_or(50).min(500);
    let offset = page.offset.unwrap_or(0);
    let data = state
        .ledger
        .list_transactions(&user.user_id, limit, offset)?;
    Ok(Json(TransactionsResponse {
        object: "list".to_string(),
        data,
    }))
}

/// GET /v1/provider/stats
pub async fn provider_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ProviderStats>, AppError> {
    Ok(Json(state.ledger.provider_stats(&user.user_id)?))
}

/// GET /v1/consumer/stats
pub async fn consumer_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ConsumerStats>, AppError> {
    Ok(Json(state.ledger.consumer_stats(&user.user_id)?))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: f64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub object: String,
    pub data: Vec<TransactionRecord>,
}
