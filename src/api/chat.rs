use axum::extract::State;
use axum::Extension;
use axum::Json;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::protocol::{ChatCompletionReply, ChatRequest};
use crate::AppState;

/// POST /v1/chat/completions
///
/// OpenAI-compatible chat completion endpoint. The broker performs no
/// inference itself: the request is routed to a connected provider node and
/// the response comes back enriched with tier, provider handle, and MULE
/// accounting fields. Streaming is not supported.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatCompletionReply>, AppError> {
    tracing::info!(
        user_id = %user.user_id,
        model = %request.model,
        messages = request.messages.len(),
        "Chat completion request"
    );

    let reply = state.dispatcher.route(&user.user_id, request).await?;

    tracing::info!(
        user_id = %user.user_id,
        provider = %reply.provider_id,
        tier = %reply.model_tier,
        tokens = reply.usage.total_tokens,
        mule = reply.usage.mule_amount,
        "Chat completion served"
    );

    Ok(Json(reply))
}
