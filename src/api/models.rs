use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::classifier::classify;
use crate::AppState;

/// GET /v1/models
///
/// Catalog of what the connected providers can serve right now: one entry
/// per (model, provider-handle) pair, with tier, context length, and the
/// provider's live performance. Sorted by tier (xl first), then by average
/// throughput.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let mut entries: Vec<(u8, f64, CatalogEntry)> = Vec::new();

    for snapshot in state.registry.snapshots() {
        for model in &snapshot.models {
            let cap = classify(model);
            entries.push((
                cap.tier.rank(),
                snapshot.avg_tps,
                CatalogEntry {
                    id: model.clone(),
                    object: "model".to_string(),
                    owned_by: snapshot.handle.clone(),
                    tier: cap.tier.as_str().to_string(),
                    context_length: cap.context,
                    performance: PerformanceView {
                        success_rate: snapshot.success_rate,
                        total_requests: snapshot.total_requests,
                        avg_tokens_per_second: snapshot.avg_tps,
                        max_tokens_per_second: snapshot.max_tps,
                        last_active_seconds_ago: snapshot.last_heartbeat_age.as_secs(),
                        status: snapshot.status.as_str().to_string(),
                    },
                },
            ));
        }
    }

    entries.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
    });

    Json(ModelsResponse {
        object: "list".to_string(),
        data: entries.into_iter().map(|(_, _, e)| e).collect(),
    })
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<CatalogEntry>,
}

#[derive(Debug, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub object: String,
    pub owned_by: String,
    pub tier: String,
    pub context_length: u32,
    pub performance: PerformanceView,
}

#[derive(Debug, Serialize)]
pub struct PerformanceView {
    pub success_rate: f64,
    pub total_requests: u64,
    pub avg_tokens_per_second: f64,
    pub max_tokens_per_second: f64,
    pub last_active_seconds_ago: u64,
    pub status: String,
}
