//! Ledger Gateway
//!
//! Atomic balance and transaction-log mutations against the SQLite store.
//! All MULE movements flow through [`Ledger`]; the transaction log is
//! append-only. Settlement failures after a provider has already answered
//! are retried in the background by the reconciler rather than surfaced to
//! the client.

mod gateway;
mod reconcile;

pub use gateway::Ledger;
pub use reconcile::spawn_reconciler;

use serde::{Deserialize, Serialize};

use crate::classifier::Tier;

/// Kind of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Consumption,
    SelfService,
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumption => "consumption",
            Self::SelfService => "self_service",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "consumption" => Some(Self::Consumption),
            "self_service" => Some(Self::SelfService),
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            _ => None,
        }
    }
}

/// Token usage attributed to one completed request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Everything needed to settle one completed request. Owned so that failed
/// settlements can be re-queued to the reconciler verbatim.
#[derive(Debug, Clone)]
pub struct SettleJob {
    pub consumer: String,
    /// Provider account, if the serving node was account-bound. Anonymous
    /// providers serve traffic but never appear as a transaction's provider.
    pub provider: Option<String>,
    pub model: String,
    pub tier: Tier,
    pub usage: UsageReport,
    pub duration_seconds: f64,
    pub tokens_per_second: f64,
}

/// Outcome of a settlement: the computed amounts, for response enrichment.
#[derive(Debug, Clone, Copy)]
pub struct Settlement {
    pub mule_amount: f64,
    pub platform_fee: f64,
    pub provider_credit: f64,
    pub self_service: bool,
}

/// One row of the append-only transaction log.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: String,
    pub kind: TransactionKind,
    pub consumer_id: String,
    pub provider_id: Option<String>,
    pub model: String,
    pub tier: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub mule_amount: f64,
    pub platform_fee: f64,
    pub duration_seconds: f64,
    pub tokens_per_second: f64,
    pub metadata: Option<String>,
    pub created_at: String,
}

/// Aggregate accounting view for a consumer account.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_spent: f64,
}

/// Aggregate accounting view for a provider account.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_tokens: u64,
    pub max_tokens_per_second: f64,
    pub total_earned: f64,
    pub last_active: Option<String>,
}
