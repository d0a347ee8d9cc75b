//! Dispatcher
//!
//! Turns an authenticated chat-completion request into a correlated forward
//! to one selected provider session: classify, pre-check balance, filter and
//! score candidates, reserve, forward, await, settle. Every terminal path
//! releases the reservation (in-flight decrement plus performance sample),
//! including cancellation and panics, via a drop guard.

mod compat;
mod pending;

pub use pending::{CompletionResult, PendingRequests, ProviderLost};

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::classifier::{classify, ModelSelector};
use crate::config::DispatchConfig;
use crate::error::AppError;
use crate::ledger::{Ledger, SettleJob, UsageReport};
use crate::protocol::{BrokerFrame, ChatCompletionReply, ChatRequest, ExtendedUsage};
use crate::registry::{PerfSample, ProviderRegistry, ProviderSnapshot};

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    pending: Arc<PendingRequests>,
    ledger: Ledger,
    config: DispatchConfig,
    reconcile_tx: mpsc::UnboundedSender<SettleJob>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pending: Arc<PendingRequests>,
        ledger: Ledger,
        config: DispatchConfig,
        reconcile_tx: mpsc::UnboundedSender<SettleJob>,
    ) -> Self {
        Self {
            registry,
            pending,
            ledger,
            config,
            reconcile_tx,
        }
    }

    /// Route one completion request to a provider and account the result.
    pub async fn route(
        &self,
        consumer_id: &str,
        request: ChatRequest,
    ) -> Result<ChatCompletionReply, AppError> {
        let started = Instant::now();

        if request.stream {
            return Err(AppError::BadRequest(
                "streaming responses are not supported".to_string(),
            ));
        }

        // 1. Classify. Only a malformed combined selector is invalid.
        let selector = ModelSelector::parse(&request.model)
            .map_err(|e| AppError::InvalidModel(e.to_string()))?;
        let cap = classify(&request.model);

        // 2. Balance pre-check against the estimated worst-case cost.
        let balance = self.ledger.get_balance(consumer_id)?;
        let est_tokens = request
            .max_tokens
            .filter(|t| *t > 0)
            .map(u64::from)
            .unwrap_or(cap.context as u64);
        let estimate = self
            .ledger
            .tokenomics()
            .tokens_to_mules(est_tokens as f64, cap.tier);
        if balance < estimate {
            return Err(AppError::InsufficientBalance {
                required: estimate,
                available: balance,
            });
        }

        // 3-5. Filter the live snapshot and pick the best-scored candidate.
        let threshold = self.config.load_threshold;
        let mut candidates: Vec<(ProviderSnapshot, String)> = self
            .registry
            .list_active()
            .into_iter()
            .filter(|s| s.in_flight < threshold)
            .filter_map(|s| compat::resolve(&selector, &s).map(|model| (s, model)))
            .collect();

        if candidates.is_empty() {
            return Err(AppError::NoProviderAvailable(request.model.clone()));
        }

        candidates.sort_by(|a, b| {
            score(&b.0, threshold)
                .partial_cmp(&score(&a.0, threshold))
                .unwrap_or(Ordering::Equal)
                .then(a.0.registered_seq.cmp(&b.0.registered_seq))
        });
        let (chosen, resolved_model) = candidates.remove(0);

        tracing::debug!(
            consumer = %consumer_id,
            provider = %chosen.handle,
            model = %resolved_model,
            tier = %cap.tier,
            in_flight = chosen.in_flight,
            "Provider selected"
        );

        // 6. Reserve: correlation id, pending slot, in-flight increment.
        let correlation_id = Uuid::new_v4();
        let rx = self.pending.register(correlation_id, chosen.session_id);
        let writer = match self
            .registry
            .reserve(chosen.session_id, correlation_id, threshold)
        {
            Ok(writer) => writer,
            Err(e) => {
                // The session vanished or filled up between snapshot and
                // reservation.
                self.pending.abandon(correlation_id);
                return Err(AppError::NoProviderAvailable(format!(
                    "{}: {e}",
                    request.model
                )));
            }
        };
        let mut reservation = Reservation::new(
            self.registry.clone(),
            self.pending.clone(),
            chosen.session_id,
            correlation_id,
        );

        // 7. Forward.
        let frame = BrokerFrame::CompletionRequest {
            id: correlation_id,
            model: resolved_model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        if writer.send(frame).await.is_err() {
            reservation.release(PerfSample::failure(started.elapsed().as_secs_f64()));
            return Err(AppError::ProviderTransport(
                "provider write handle closed".to_string(),
            ));
        }

        // 8. Await the correlated response, bounded by the deadline.
        let timeout_secs = request
            .timeout
            .unwrap_or(self.config.request_timeout_secs)
            .min(self.config.request_timeout_cap_secs);
        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await;
        let duration = started.elapsed().as_secs_f64();

        let response = match outcome {
            Err(_) => {
                self.pending.abandon(correlation_id);
                reservation.release(PerfSample::failure(duration));
                return Err(AppError::ProviderTimeout { timeout_secs });
            }
            Ok(Err(_)) => {
                reservation.release(PerfSample::failure(duration));
                return Err(AppError::ProviderTransport(
                    "pending request dropped".to_string(),
                ));
            }
            Ok(Ok(Err(lost))) => {
                reservation.release(PerfSample::failure(duration));
                return Err(AppError::ProviderTransport(lost.to_string()));
            }
            Ok(Ok(Ok(response))) => response,
        };

        let has_content = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .map(|c| !c.is_empty())
            .unwrap_or(false);
        if !has_content {
            reservation.release(PerfSample::failure(duration));
            return Err(AppError::ProviderBadResponse(
                "response contains no choice with content".to_string(),
            ));
        }

        // 9. Account: sample, then settlement. Providers sometimes omit the
        // total, so it is recomputed from the parts.
        let mut usage = response.usage;
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        let tokens_per_second = if duration > 0.0 {
            usage.total_tokens as f64 / duration
        } else {
            0.0
        };
        reservation.release(PerfSample {
            tokens_per_second,
            duration_seconds: duration,
            success: true,
        });

        let job = SettleJob {
            consumer: consumer_id.to_string(),
            provider: chosen.account_id.clone(),
            model: resolved_model.clone(),
            tier: cap.tier,
            usage: UsageReport {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            duration_seconds: duration,
            tokens_per_second,
        };
        if let Err(e) = self.ledger.settle(&job) {
            // The client already has its answer; queue for reconciliation
            // instead of failing the request.
            tracing::error!(
                consumer = %consumer_id,
                provider = %chosen.handle,
                error = %e,
                "Settlement failed, queueing for reconciliation"
            );
            let _ = self.reconcile_tx.send(job);
        }

        // 10. Return the response enriched with accounting data.
        let mule_amount = self
            .ledger
            .tokenomics()
            .tokens_to_mules(usage.total_tokens as f64, cap.tier);
        let self_service = chosen.account_id.as_deref() == Some(consumer_id);

        Ok(ChatCompletionReply {
            id: if response.id.is_empty() {
                format!("chatcmpl-{}", correlation_id.simple())
            } else {
                response.id
            },
            object: response.object,
            created: if response.created > 0 {
                response.created
            } else {
                chrono::Utc::now().timestamp()
            },
            model: resolved_model,
            choices: response.choices,
            usage: ExtendedUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
                mule_amount,
                duration_seconds: duration,
                tokens_per_second,
                // Preserved quirk: self-service answers report a zero cost
                // even though the logged transaction carries the amount.
                transaction_mule_cost: if self_service { 0.0 } else { mule_amount },
            },
            model_tier: cap.tier.to_string(),
            provider_id: chosen.handle,
        })
    }
}

/// Load/throughput score from the selection algorithm; higher wins.
fn score(provider: &ProviderSnapshot, load_threshold: u32) -> f64 {
    let load = 1.0 - provider.in_flight as f64 / load_threshold as f64;
    let throughput = (provider.avg_tps / 100.0).min(1.0);
    0.6 * load + 0.4 * throughput
}

// ---------------------------------------------------------------------------
// Reservation guard
// ---------------------------------------------------------------------------

/// Holds one in-flight reservation. Dropping it without an explicit release
/// (cancellation, panic) records a failure sample and abandons the pending
/// slot, so the provider's counter is always restored.
struct Reservation {
    registry: Arc<ProviderRegistry>,
    pending: Arc<PendingRequests>,
    session_id: Uuid,
    correlation_id: Uuid,
    released: bool,
}

impl Reservation {
    fn new(
        registry: Arc<ProviderRegistry>,
        pending: Arc<PendingRequests>,
        session_id: Uuid,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            registry,
            pending,
            session_id,
            correlation_id,
            released: false,
        }
    }

    fn release(&mut self, sample: PerfSample) {
        if !self.released {
            self.released = true;
            self.registry
                .finish(self.session_id, self.correlation_id, Some(sample));
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.pending.abandon(self.correlation_id);
            self.registry
                .finish(self.session_id, self.correlation_id, Some(PerfSample::failure(0.0)));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenomicsConfig;
    use crate::db::Database;
    use crate::protocol::{
        ChatMessage, ChatResponse, Choice, MessageContent, MessageRole, ResponseMessage, Usage,
    };
    use crate::tokenomics::{round6, Tokenomics};
    use rusqlite::params;

    struct TestBroker {
        registry: Arc<ProviderRegistry>,
        pending: Arc<PendingRequests>,
        ledger: Ledger,
        dispatcher: Dispatcher,
        _reconcile_rx: mpsc::UnboundedReceiver<SettleJob>,
    }

    fn broker() -> TestBroker {
        let db = Database::open_in_memory().unwrap();
        for name in ["alice", "bob", "carol"] {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO users (id, name, api_key_hash, key_prefix) VALUES (?1, ?1, ?2, '')",
                    params![name, format!("hash-{name}")],
                )?;
                Ok(())
            })
            .unwrap();
        }
        let ledger = Ledger::new(db, Tokenomics::new(TokenomicsConfig::default()));
        let registry = Arc::new(ProviderRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            pending.clone(),
            ledger.clone(),
            DispatchConfig::default(),
            tx,
        );
        TestBroker {
            registry,
            pending,
            ledger,
            dispatcher,
            _reconcile_rx: rx,
        }
    }

    /// Register a provider session answered by an in-process task that
    /// serves each completion request with the given usage.
    fn fake_provider(
        broker: &TestBroker,
        account: Option<&str>,
        models: &[&str],
        usage: Usage,
        content: Option<&str>,
    ) -> Uuid {
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel::<BrokerFrame>(16);
        broker.registry.register(
            session,
            account.map(String::from),
            models.iter().map(|m| m.to_string()).collect(),
            tx,
        );

        let pending = broker.pending.clone();
        let content = content.map(String::from);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let BrokerFrame::CompletionRequest { id, model, .. } = frame {
                    let response = ChatResponse {
                        id: format!("chatcmpl-{id}"),
                        object: "chat.completion".to_string(),
                        created: 1_700_000_000,
                        model,
                        choices: vec![Choice {
                            index: 0,
                            message: ResponseMessage {
                                role: "assistant".to_string(),
                                content: content.clone(),
                            },
                            finish_reason: Some("stop".to_string()),
                        }],
                        usage,
                    };
                    pending.complete(id, response);
                }
            }
        });
        session
    }

    fn chat_request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: Some(MessageContent::Text("hello".to_string())),
                name: None,
            }],
            temperature: Some(0.7),
            max_tokens: Some(256),
            stream: false,
            timeout: None,
        }
    }

    fn usage(prompt: u64, completion: u64, total: u64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }
    }

    #[tokio::test]
    async fn test_route_success_settles_and_enriches() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["mistral:7b"], usage(100, 200, 300), Some("hi"));

        let reply = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap();

        assert_eq!(reply.model_tier, "medium");
        assert!(reply.provider_id.starts_with("user_"));
        assert_eq!(reply.usage.total_tokens, 300);
        assert_eq!(reply.usage.mule_amount, 0.0006);
        assert_eq!(reply.usage.transaction_mule_cost, 0.0006);
        assert!(reply.usage.duration_seconds >= 0.0);

        // Welcome 1.0 minus 0.000600, provider credited 0.000540.
        assert_eq!(b.ledger.get_balance("alice").unwrap(), round6(1.0 - 0.0006));
        assert_eq!(b.ledger.get_balance("bob").unwrap(), round6(1.0 + 0.00054));

        // Bookkeeping: in-flight restored, pending drained.
        let snap = &b.registry.snapshots()[0];
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.successful_requests, 1);
        assert!(b.pending.is_empty());
    }

    #[tokio::test]
    async fn test_route_recomputes_zero_total() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["mistral:7b"], usage(100, 200, 0), Some("hi"));

        let reply = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap();
        assert_eq!(reply.usage.total_tokens, 300);
        assert_eq!(reply.usage.mule_amount, 0.0006);
        assert_eq!(b.ledger.get_balance("bob").unwrap(), round6(1.0 + 0.00054));
    }

    #[tokio::test]
    async fn test_insufficient_balance_precheck() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["tinyllama"], usage(10, 10, 20), Some("hi"));

        // Welcome consumed down to 0.5 MULE.
        b.ledger.ensure_balance("alice").unwrap();
        b.ledger.debit("alice", 0.5).unwrap();

        // 1_000_000 small-tier tokens price at exactly 1.0 MULE.
        let mut request = chat_request("tinyllama");
        request.max_tokens = Some(1_000_000);

        let err = b.dispatcher.route("alice", request).await.unwrap_err();
        match err {
            AppError::InsufficientBalance {
                required,
                available,
            } => {
                assert_eq!(required, 1.0);
                assert_eq!(available, 0.5);
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_max_tokens_estimates_from_context() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["tinyllama"], usage(10, 10, 20), Some("hi"));

        // max_tokens == 0 must not price as zero; the 4096-token context
        // estimate (0.004096 MULE) still clears the welcome balance.
        let mut request = chat_request("tinyllama");
        request.max_tokens = Some(0);
        let reply = b.dispatcher.route("alice", request).await.unwrap();
        assert_eq!(reply.model_tier, "small");
    }

    #[tokio::test]
    async fn test_no_provider_available() {
        let b = broker();
        let err = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap_err();
        assert!(matches!(err, AppError::NoProviderAvailable(_)));
    }

    #[tokio::test]
    async fn test_combined_selector_without_match_is_no_provider() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["mistral:7b"], usage(1, 1, 2), Some("hi"));

        let err = b
            .dispatcher
            .route("alice", chat_request("medium|nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoProviderAvailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_combined_selector_is_invalid_model() {
        let b = broker();
        let err = b
            .dispatcher
            .route("alice", chat_request("huge|mistral"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidModel(_)));
    }

    #[tokio::test]
    async fn test_scoring_prefers_idle_provider() {
        let b = broker();
        // P1: in_flight 3, avg tps 40 -> 0.6*(2/5) + 0.4*0.4 = 0.40.
        let p1 = fake_provider(&b, Some("bob"), &["mistral:7b"], usage(1, 1, 2), Some("hi"));
        for _ in 0..3 {
            b.registry.reserve(p1, Uuid::new_v4(), 5).unwrap();
        }
        b.registry.record_sample(
            p1,
            PerfSample {
                tokens_per_second: 40.0,
                duration_seconds: 1.0,
                success: true,
            },
        );
        // P2: in_flight 0, avg tps 10 -> 0.6 + 0.04 = 0.64.
        let _p2 = fake_provider(&b, Some("carol"), &["mistral:7b"], usage(1, 1, 2), Some("hi"));
        let p2_session = b
            .registry
            .snapshots()
            .into_iter()
            .find(|s| s.account_id.as_deref() == Some("carol"))
            .unwrap()
            .session_id;
        b.registry.record_sample(
            p2_session,
            PerfSample {
                tokens_per_second: 10.0,
                duration_seconds: 1.0,
                success: true,
            },
        );

        let reply = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap();
        assert_eq!(
            reply.provider_id,
            crate::registry::provider_handle("carol")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_reservation() {
        let b = broker();
        // A session whose task never answers.
        let session = Uuid::new_v4();
        let (tx, _rx_keepalive) = mpsc::channel::<BrokerFrame>(16);
        b.registry
            .register(session, Some("bob".to_string()), vec!["mistral:7b".to_string()], tx);

        let mut request = chat_request("mistral:7b");
        request.timeout = Some(2);

        let err = b.dispatcher.route("alice", request).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderTimeout { timeout_secs: 2 }));

        let snap = &b.registry.snapshots()[0];
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.successful_requests, 0);
        assert_eq!(snap.total_requests, 1);
        assert!(b.pending.is_empty());
        // No settlement happened.
        assert_eq!(b.ledger.get_balance("alice").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_transport_error_when_writer_closed() {
        let b = broker();
        let session = Uuid::new_v4();
        let (tx, rx) = mpsc::channel::<BrokerFrame>(16);
        drop(rx);
        b.registry
            .register(session, Some("bob".to_string()), vec!["mistral:7b".to_string()], tx);

        let err = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderTransport(_)));
        assert_eq!(b.registry.snapshots()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_bad_response_is_rejected_without_settlement() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["mistral:7b"], usage(100, 200, 300), None);

        let err = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderBadResponse(_)));
        assert_eq!(b.ledger.get_balance("alice").unwrap(), 1.0);
        assert_eq!(b.ledger.get_balance("bob").unwrap(), 1.0);
        let snap = &b.registry.snapshots()[0];
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.successful_requests, 0);
    }

    #[tokio::test]
    async fn test_self_service_reports_zero_cost() {
        let b = broker();
        fake_provider(&b, Some("alice"), &["mistral:7b"], usage(100, 200, 300), Some("hi"));

        let reply = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap();
        assert_eq!(reply.usage.mule_amount, 0.0006);
        assert_eq!(reply.usage.transaction_mule_cost, 0.0);
        // No balance movement either way.
        assert_eq!(b.ledger.get_balance("alice").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_anonymous_provider_debits_consumer_only() {
        let b = broker();
        fake_provider(&b, None, &["mistral:7b"], usage(100, 200, 300), Some("hi"));

        let reply = b.dispatcher.route("alice", chat_request("mistral:7b")).await.unwrap();
        assert!(reply.provider_id.starts_with("anon_"));
        assert_eq!(b.ledger.get_balance("alice").unwrap(), round6(1.0 - 0.0006));
    }

    #[tokio::test]
    async fn test_addressed_selector_targets_one_provider() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["mistral:7b"], usage(1, 1, 2), Some("hi"));
        fake_provider(&b, Some("carol"), &["mistral:7b"], usage(1, 1, 2), Some("hi"));

        let handle = crate::registry::provider_handle("carol");
        let reply = b
            .dispatcher
            .route("alice", chat_request(&format!("mistral@{handle}")))
            .await
            .unwrap();
        assert_eq!(reply.provider_id, handle);
        // The forwarded identifier is the model part, not the full selector.
        assert_eq!(reply.model, "mistral");
    }

    #[tokio::test]
    async fn test_addressed_selector_unknown_handle() {
        let b = broker();
        fake_provider(&b, Some("bob"), &["mistral:7b"], usage(1, 1, 2), Some("hi"));

        let err = b
            .dispatcher
            .route("alice", chat_request("mistral@user_999999"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoProviderAvailable(_)));
    }

    #[tokio::test]
    async fn test_stream_requests_rejected() {
        let b = broker();
        let mut request = chat_request("mistral:7b");
        request.stream = true;
        let err = b.dispatcher.route("alice", request).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_score_formula() {
        let mut snap = ProviderSnapshot {
            session_id: Uuid::new_v4(),
            account_id: None,
            handle: "user_1".to_string(),
            models: vec![],
            status: crate::registry::SessionStatus::Active,
            ready_for_requests: true,
            in_flight: 3,
            avg_tps: 40.0,
            max_tps: 40.0,
            success_rate: 1.0,
            total_requests: 0,
            successful_requests: 0,
            last_heartbeat_age: Duration::ZERO,
            registered_seq: 0,
        };
        assert!((score(&snap, 5) - 0.40).abs() < 1e-9);

        snap.in_flight = 0;
        snap.avg_tps = 10.0;
        assert!((score(&snap, 5) - 0.64).abs() < 1e-9);

        // Throughput contribution is capped at 100 tokens/sec.
        snap.avg_tps = 10_000.0;
        assert!((score(&snap, 5) - 1.0).abs() < 1e-9);
    }
}
