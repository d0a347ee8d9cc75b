//! End-to-end session test: a fake provider node connects over a real
//! WebSocket, registers, and serves one completion that an API client
//! requests over HTTP. Asserts the response enrichment and the settled
//! ledger state.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use llmule::auth::users::create_user;
use llmule::config::Config;
use llmule::db::Database;
use llmule::protocol::{BrokerFrame, ChatResponse, ProviderFrame};
use llmule::tokenomics::round6;
use llmule::{build_app, AppState};

async fn spawn_broker() -> (AppState, axum::Router, String) {
    let db = Database::open_in_memory().unwrap();
    let (state, _reconcile_rx) = AppState::new(Config::default(), db);
    let app = build_app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_app = app.clone();
    tokio::spawn(async move {
        axum::serve(listener, serve_app).await.unwrap();
    });

    (state, app, format!("{addr}"))
}

fn send_frame_payload(frame: &ProviderFrame) -> Message {
    Message::Text(serde_json::to_string(frame).unwrap().into())
}

fn parse_broker_frame(msg: &Message) -> BrokerFrame {
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn test_provider_session_serves_completion() {
    let (state, app, addr) = spawn_broker().await;

    let consumer = create_user(&state.db, "consumer", "member").unwrap();
    let provider = create_user(&state.db, "provider", "member").unwrap();

    // -- Provider connects and registers -------------------------------------
    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/providers/connect"))
        .await
        .unwrap();

    ws.send(send_frame_payload(&ProviderFrame::Register {
        api_key: Some(provider.plaintext_key.clone()),
        models: vec![llmule::protocol::ModelAdvert::Name("mistral:7b".to_string())],
    }))
    .await
    .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    assert!(matches!(parse_broker_frame(&ack), BrokerFrame::Registered));
    assert_eq!(state.registry.len(), 1);

    // -- Provider loop: answer pings and serve one completion -----------------
    let provider_loop = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            if !msg.is_text() {
                continue;
            }
            match parse_broker_frame(&msg) {
                BrokerFrame::Ping => {
                    ws.send(send_frame_payload(&ProviderFrame::Pong)).await.unwrap();
                }
                BrokerFrame::CompletionRequest { id, model, .. } => {
                    let response: ChatResponse = serde_json::from_value(serde_json::json!({
                        "id": "chatcmpl-e2e",
                        "object": "chat.completion",
                        "created": 1_700_000_000,
                        "model": model,
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": "Hello from the provider"},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 100, "completion_tokens": 200, "total_tokens": 300}
                    }))
                    .unwrap();
                    ws.send(send_frame_payload(&ProviderFrame::CompletionResponse {
                        id,
                        response,
                    }))
                    .await
                    .unwrap();
                }
                _ => {}
            }
        }
    });

    // -- Client requests a completion over HTTP -------------------------------
    let body = serde_json::json!({
        "model": "mistral:7b",
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 64
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", consumer.plaintext_key),
        )
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(reply["model_tier"], "medium");
    assert_eq!(
        reply["choices"][0]["message"]["content"],
        "Hello from the provider"
    );
    assert_eq!(reply["usage"]["total_tokens"], 300);
    assert_eq!(reply["usage"]["mule_amount"], 0.0006);
    assert_eq!(reply["usage"]["transaction_mule_cost"], 0.0006);
    assert!(reply["provider_id"].as_str().unwrap().starts_with("user_"));

    // -- Accounting: consumer debited, provider credited ----------------------
    assert_eq!(
        state.ledger.get_balance(&consumer.user.id).unwrap(),
        round6(1.0 - 0.0006)
    );
    assert_eq!(
        state.ledger.get_balance(&provider.user.id).unwrap(),
        round6(1.0 + 0.00054)
    );

    // In-flight back to zero, sample recorded.
    let snapshot = &state.registry.snapshots()[0];
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.successful_requests, 1);

    provider_loop.abort();
}

#[tokio::test]
async fn test_registration_with_invalid_key_rejected() {
    let (state, _app, addr) = spawn_broker().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/providers/connect"))
        .await
        .unwrap();

    ws.send(send_frame_payload(&ProviderFrame::Register {
        api_key: Some("sk-mule-notarealkey0000000000000000".to_string()),
        models: vec![llmule::protocol::ModelAdvert::Name("tinyllama".to_string())],
    }))
    .await
    .unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    assert!(matches!(
        parse_broker_frame(&reply),
        BrokerFrame::Error { .. }
    ));
    assert_eq!(state.registry.len(), 0);
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let (state, _app, addr) = spawn_broker().await;
    let provider = create_user(&state.db, "provider", "member").unwrap();

    let (mut ws, _) = connect_async(format!("ws://{addr}/v1/providers/connect"))
        .await
        .unwrap();
    ws.send(send_frame_payload(&ProviderFrame::Register {
        api_key: Some(provider.plaintext_key.clone()),
        models: vec![llmule::protocol::ModelAdvert::Name("tinyllama".to_string())],
    }))
    .await
    .unwrap();
    let ack = ws.next().await.unwrap().unwrap();
    assert!(matches!(parse_broker_frame(&ack), BrokerFrame::Registered));
    assert_eq!(state.registry.len(), 1);

    ws.close(None).await.unwrap();

    // The reader loop observes the close and purges the registry.
    for _ in 0..50 {
        if state.registry.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(state.registry.is_empty());
}
