//! Provider Registry
//!
//! Long-lived in-memory catalog of connected provider sessions: advertised
//! models, health, load counters, and a bounded rolling performance window
//! per session. Mutated by both the per-connection readers and the
//! dispatcher; a single `RwLock` over the table keeps every entry read
//! consistent (lookup, in-flight bump, and write-handle clone happen under
//! one guard, and critical sections never await).

mod monitor;

pub use monitor::spawn_heartbeat_monitor;

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
// tokio's Instant so that time-driven tests can run under a paused clock.
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::BrokerFrame;

/// Samples kept in each session's rolling performance window.
pub const PERF_WINDOW: usize = 10;

/// Live state of a registered provider session. Sessions still in their
/// registration handshake are not in the registry yet; removal is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// Silent past a third of the session timeout; recovers on heartbeat.
    Inactive,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// One measured request on a provider session.
#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    pub tokens_per_second: f64,
    pub duration_seconds: f64,
    pub success: bool,
}

impl PerfSample {
    /// The sample recorded for timeouts and transport failures.
    pub fn failure(duration_seconds: f64) -> Self {
        Self {
            tokens_per_second: 0.0,
            duration_seconds,
            success: false,
        }
    }
}

struct ProviderEntry {
    account_id: Option<String>,
    handle: String,
    models: Vec<String>,
    status: SessionStatus,
    ready_for_requests: bool,
    last_heartbeat: Instant,
    registered_seq: u64,
    writer: mpsc::Sender<BrokerFrame>,
    in_flight: u32,
    pending: HashSet<Uuid>,
    window: VecDeque<PerfSample>,
    total_requests: u64,
    successful_requests: u64,
}

impl ProviderEntry {
    /// Mean tokens/sec over the successful samples in the window.
    fn avg_tps(&self) -> f64 {
        let successes: Vec<f64> = self
            .window
            .iter()
            .filter(|s| s.success)
            .map(|s| s.tokens_per_second)
            .collect();
        if successes.is_empty() {
            0.0
        } else {
            successes.iter().sum::<f64>() / successes.len() as f64
        }
    }

    fn max_tps(&self) -> f64 {
        self.window
            .iter()
            .filter(|s| s.success)
            .map(|s| s.tokens_per_second)
            .fold(0.0, f64::max)
    }

    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Read-only view of a session used for selection and the model catalog.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub session_id: Uuid,
    pub account_id: Option<String>,
    pub handle: String,
    pub models: Vec<String>,
    pub status: SessionStatus,
    pub ready_for_requests: bool,
    pub in_flight: u32,
    pub avg_tps: f64,
    pub max_tps: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_heartbeat_age: Duration,
    pub registered_seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

/// What a removal tears down: the caller fails these pending requests.
#[derive(Debug)]
pub struct RemovedSession {
    pub session_id: Uuid,
    pub account_id: Option<String>,
    pub handle: String,
    pub pending: Vec<Uuid>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    #[error("session is gone")]
    Gone,
    #[error("session is not accepting requests")]
    NotReady,
    #[error("session is at its load threshold")]
    Busy,
}

/// The broker-wide table of live provider sessions.
pub struct ProviderRegistry {
    inner: RwLock<HashMap<Uuid, ProviderEntry>>,
    seq: AtomicU64,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Store a session after a successful registration handshake.
    /// Idempotent: re-registering an already-known session refreshes its
    /// heartbeat and returns [`RegisterOutcome::AlreadyRegistered`].
    pub fn register(
        &self,
        session_id: Uuid,
        account_id: Option<String>,
        models: Vec<String>,
        writer: mpsc::Sender<BrokerFrame>,
    ) -> RegisterOutcome {
        let mut table = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = table.get_mut(&session_id) {
            entry.last_heartbeat = Instant::now();
            entry.status = SessionStatus::Active;
            return RegisterOutcome::AlreadyRegistered;
        }

        let mut seen = HashSet::new();
        let models: Vec<String> = models
            .into_iter()
            .filter(|m| !m.is_empty() && seen.insert(m.clone()))
            .collect();

        let handle = match &account_id {
            Some(account) => provider_handle(account),
            None => anonymous_handle(session_id),
        };

        tracing::info!(
            session = %session_id,
            handle = %handle,
            models = models.len(),
            anonymous = account_id.is_none(),
            "Provider registered"
        );

        table.insert(
            session_id,
            ProviderEntry {
                account_id,
                handle,
                models,
                status: SessionStatus::Active,
                ready_for_requests: true,
                last_heartbeat: Instant::now(),
                registered_seq: self.seq.fetch_add(1, Ordering::Relaxed),
                writer,
                in_flight: 0,
                pending: HashSet::new(),
                window: VecDeque::with_capacity(PERF_WINDOW),
                total_requests: 0,
                successful_requests: 0,
            },
        );
        RegisterOutcome::Registered
    }

    /// Refresh a session's heartbeat, promoting it back to active.
    pub fn heartbeat(&self, session_id: Uuid) -> bool {
        let mut table = self.inner.write().expect("registry lock poisoned");
        match table.get_mut(&session_id) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                entry.status = SessionStatus::Active;
                true
            }
            None => false,
        }
    }

    /// Demote a silent session. It serves no new work until it pongs.
    pub fn mark_inactive(&self, session_id: Uuid) {
        let mut table = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = table.get_mut(&session_id) {
            if entry.status == SessionStatus::Active {
                tracing::debug!(session = %session_id, "Provider marked inactive");
                entry.status = SessionStatus::Inactive;
            }
        }
    }

    /// Remove a session and return its still-pending correlation ids so the
    /// caller can fail them. Terminal; repeated removal returns `None`.
    pub fn remove(&self, session_id: Uuid, reason: &str) -> Option<RemovedSession> {
        let mut table = self.inner.write().expect("registry lock poisoned");
        let entry = table.remove(&session_id)?;
        tracing::info!(
            session = %session_id,
            handle = %entry.handle,
            pending = entry.pending.len(),
            reason,
            "Provider removed"
        );
        Some(RemovedSession {
            session_id,
            account_id: entry.account_id,
            handle: entry.handle,
            pending: entry.pending.into_iter().collect(),
        })
    }

    /// Snapshot of the sessions eligible for selection.
    pub fn list_active(&self) -> Vec<ProviderSnapshot> {
        let table = self.inner.read().expect("registry lock poisoned");
        table
            .iter()
            .filter(|(_, e)| e.status == SessionStatus::Active && e.ready_for_requests)
            .map(|(id, e)| snapshot(*id, e))
            .collect()
    }

    /// Snapshot of every session, for the model catalog.
    pub fn snapshots(&self) -> Vec<ProviderSnapshot> {
        let table = self.inner.read().expect("registry lock poisoned");
        table.iter().map(|(id, e)| snapshot(*id, e)).collect()
    }

    /// Push a performance sample without touching request bookkeeping.
    pub fn record_sample(&self, session_id: Uuid, sample: PerfSample) {
        let mut table = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = table.get_mut(&session_id) {
            push_sample(entry, sample);
        }
    }

    /// Atomically verify eligibility, bump the in-flight counter, record the
    /// pending correlation id, and hand back the session's write handle.
    pub fn reserve(
        &self,
        session_id: Uuid,
        correlation_id: Uuid,
        load_threshold: u32,
    ) -> Result<mpsc::Sender<BrokerFrame>, ReserveError> {
        let mut table = self.inner.write().expect("registry lock poisoned");
        let entry = table.get_mut(&session_id).ok_or(ReserveError::Gone)?;
        if entry.status != SessionStatus::Active || !entry.ready_for_requests {
            return Err(ReserveError::NotReady);
        }
        if entry.in_flight >= load_threshold {
            return Err(ReserveError::Busy);
        }
        entry.in_flight += 1;
        entry.pending.insert(correlation_id);
        Ok(entry.writer.clone())
    }

    /// Release a reservation on any terminal path, optionally recording the
    /// request's performance sample. No-op if the session is already gone.
    pub fn finish(&self, session_id: Uuid, correlation_id: Uuid, sample: Option<PerfSample>) {
        let mut table = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = table.get_mut(&session_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.pending.remove(&correlation_id);
            if let Some(sample) = sample {
                push_sample(entry, sample);
            }
        }
    }

    /// Heartbeat ages and write handles for the monitor loop.
    pub(crate) fn monitor_view(&self) -> Vec<(Uuid, Duration, mpsc::Sender<BrokerFrame>)> {
        let table = self.inner.read().expect("registry lock poisoned");
        table
            .iter()
            .map(|(id, e)| (*id, e.last_heartbeat.elapsed(), e.writer.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn push_sample(entry: &mut ProviderEntry, sample: PerfSample) {
    entry.total_requests += 1;
    if sample.success {
        entry.successful_requests += 1;
    }
    entry.window.push_back(sample);
    while entry.window.len() > PERF_WINDOW {
        entry.window.pop_front();
    }
}

fn snapshot(session_id: Uuid, entry: &ProviderEntry) -> ProviderSnapshot {
    ProviderSnapshot {
        session_id,
        account_id: entry.account_id.clone(),
        handle: entry.handle.clone(),
        models: entry.models.clone(),
        status: entry.status,
        ready_for_requests: entry.ready_for_requests,
        in_flight: entry.in_flight,
        avg_tps: entry.avg_tps(),
        max_tps: entry.max_tps(),
        success_rate: entry.success_rate(),
        total_requests: entry.total_requests,
        successful_requests: entry.successful_requests,
        last_heartbeat_age: entry.last_heartbeat.elapsed(),
        registered_seq: entry.registered_seq,
    }
}

// ---------------------------------------------------------------------------
// Provider handles
// ---------------------------------------------------------------------------

/// Deterministic public handle for an account: the first four bytes of the
/// id's canonical byte form, reduced modulo 1_000_000, as `user_<N>`.
pub fn provider_handle(account_id: &str) -> String {
    let n = match Uuid::parse_str(account_id) {
        Ok(uuid) => u32::from_be_bytes(uuid.as_bytes()[..4].try_into().expect("uuid has 16 bytes")),
        Err(_) => {
            let digest = Sha256::digest(account_id.as_bytes());
            u32::from_be_bytes(digest[..4].try_into().expect("sha256 has 32 bytes"))
        }
    };
    format!("user_{}", n % 1_000_000)
}

fn anonymous_handle(session_id: Uuid) -> String {
    format!("anon_{}", &session_id.simple().to_string()[..8])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> mpsc::Sender<BrokerFrame> {
        mpsc::channel(8).0
    }

    fn register_one(registry: &ProviderRegistry, models: &[&str]) -> Uuid {
        let session = Uuid::new_v4();
        let outcome = registry.register(
            session,
            Some(Uuid::new_v4().to_string()),
            models.iter().map(|m| m.to_string()).collect(),
            writer(),
        );
        assert_eq!(outcome, RegisterOutcome::Registered);
        session
    }

    #[test]
    fn test_register_and_list_active() {
        let registry = ProviderRegistry::new();
        register_one(&registry, &["mistral:7b"]);
        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].models, vec!["mistral:7b"]);
        assert_eq!(active[0].status, SessionStatus::Active);
        assert_eq!(active[0].in_flight, 0);
    }

    #[test]
    fn test_register_dedupes_models() {
        let registry = ProviderRegistry::new();
        let session = Uuid::new_v4();
        registry.register(
            session,
            None,
            vec![
                "a".to_string(),
                "b".to_string(),
                "a".to_string(),
                String::new(),
            ],
            writer(),
        );
        let snap = &registry.snapshots()[0];
        assert_eq!(snap.models, vec!["a", "b"]);
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let registry = ProviderRegistry::new();
        let session = Uuid::new_v4();
        registry.register(session, None, vec!["a".to_string()], writer());
        let outcome = registry.register(session, None, vec!["b".to_string()], writer());
        assert_eq!(outcome, RegisterOutcome::AlreadyRegistered);
        assert_eq!(registry.len(), 1);
        // Advertised models are not duplicated or replaced.
        assert_eq!(registry.snapshots()[0].models, vec!["a"]);
    }

    #[test]
    fn test_heartbeat_promotes_inactive() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        registry.mark_inactive(session);
        assert!(registry.list_active().is_empty());
        assert!(registry.heartbeat(session));
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn test_heartbeat_unknown_session() {
        let registry = ProviderRegistry::new();
        assert!(!registry.heartbeat(Uuid::new_v4()));
    }

    #[test]
    fn test_remove_returns_pending_ids() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        let corr = Uuid::new_v4();
        registry.reserve(session, corr, 5).unwrap();

        let removed = registry.remove(session, "test").unwrap();
        assert_eq!(removed.pending, vec![corr]);
        assert!(registry.remove(session, "test").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserve_enforces_load_threshold() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        for _ in 0..5 {
            registry.reserve(session, Uuid::new_v4(), 5).unwrap();
        }
        assert_eq!(
            registry.reserve(session, Uuid::new_v4(), 5).unwrap_err(),
            ReserveError::Busy
        );
    }

    #[test]
    fn test_reserve_rejects_inactive() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        registry.mark_inactive(session);
        assert_eq!(
            registry.reserve(session, Uuid::new_v4(), 5).unwrap_err(),
            ReserveError::NotReady
        );
    }

    #[test]
    fn test_finish_restores_in_flight_and_records_sample() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        let corr = Uuid::new_v4();
        registry.reserve(session, corr, 5).unwrap();
        assert_eq!(registry.snapshots()[0].in_flight, 1);

        registry.finish(
            session,
            corr,
            Some(PerfSample {
                tokens_per_second: 42.0,
                duration_seconds: 1.0,
                success: true,
            }),
        );
        let snap = &registry.snapshots()[0];
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.avg_tps, 42.0);
    }

    #[test]
    fn test_window_trims_to_ten_samples() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        for i in 0..15 {
            registry.record_sample(
                session,
                PerfSample {
                    tokens_per_second: i as f64,
                    duration_seconds: 1.0,
                    success: true,
                },
            );
        }
        let snap = &registry.snapshots()[0];
        // Window holds samples 5..=14; counters keep the full history.
        assert_eq!(snap.avg_tps, (5..15).sum::<i32>() as f64 / 10.0);
        assert_eq!(snap.max_tps, 14.0);
        assert_eq!(snap.total_requests, 15);
    }

    #[test]
    fn test_avg_tps_ignores_failures() {
        let registry = ProviderRegistry::new();
        let session = register_one(&registry, &["m"]);
        registry.record_sample(
            session,
            PerfSample {
                tokens_per_second: 40.0,
                duration_seconds: 1.0,
                success: true,
            },
        );
        registry.record_sample(session, PerfSample::failure(180.0));
        let snap = &registry.snapshots()[0];
        assert_eq!(snap.avg_tps, 40.0);
        assert_eq!(snap.success_rate, 0.5);
    }

    #[test]
    fn test_provider_handle_is_deterministic() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(provider_handle(&id), provider_handle(&id));
        assert!(provider_handle(&id).starts_with("user_"));
    }

    #[test]
    fn test_provider_handle_known_values() {
        // First four bytes 00 00 00 2a = 42.
        let id = "0000002a-0000-0000-0000-000000000000";
        assert_eq!(provider_handle(id), "user_42");
        // 0x075bcd15 = 123456789; 123456789 % 1_000_000 = 456789.
        let id = "075bcd15-0000-0000-0000-000000000000";
        assert_eq!(provider_handle(id), "user_456789");
        // Non-UUID ids still derive a stable handle.
        assert_eq!(provider_handle("alice"), provider_handle("alice"));
    }

    #[test]
    fn test_anonymous_handle_from_session() {
        let registry = ProviderRegistry::new();
        let session = Uuid::new_v4();
        registry.register(session, None, vec!["m".to_string()], writer());
        let snap = &registry.snapshots()[0];
        assert!(snap.handle.starts_with("anon_"));
        assert_eq!(snap.handle.len(), "anon_".len() + 8);
    }
}
