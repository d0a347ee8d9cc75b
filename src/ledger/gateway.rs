use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::Database;
use crate::error::AppError;
use crate::tokenomics::{round6, Tokenomics};

use super::{
    ConsumerStats, ProviderStats, SettleJob, Settlement, TransactionKind, TransactionRecord,
    UsageReport,
};

/// Gateway for all balance and transaction mutations.
///
/// Every multi-statement operation runs inside a single SQLite transaction,
/// so a settlement's debit, credit, and log insert commit or fail together.
#[derive(Clone)]
pub struct Ledger {
    db: Database,
    tokenomics: Tokenomics,
}

impl Ledger {
    pub fn new(db: Database, tokenomics: Tokenomics) -> Self {
        Self { db, tokenomics }
    }

    pub fn tokenomics(&self) -> &Tokenomics {
        &self.tokenomics
    }

    /// Idempotently create a balance row for the account, seeding it with
    /// the welcome amount on first sight. Concurrent callers converge on
    /// exactly one creation (and one welcome-bonus deposit).
    pub fn ensure_balance(&self, account: &str) -> Result<(), AppError> {
        let welcome = self.tokenomics.welcome_amount();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            ensure_balance_tx(&tx, account, welcome)?;
            tx.commit()
        })?;
        Ok(())
    }

    /// Current balance, creating the row (with welcome bonus) on miss.
    pub fn get_balance(&self, account: &str) -> Result<f64, AppError> {
        let welcome = self.tokenomics.welcome_amount();
        let balance = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            ensure_balance_tx(&tx, account, welcome)?;
            let balance: f64 = tx.query_row(
                "SELECT mule FROM balances WHERE user_id = ?1",
                params![account],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(balance)
        })?;
        Ok(round6(balance))
    }

    /// Atomically add to an account's balance.
    pub fn credit(&self, account: &str, amount: f64) -> Result<(), AppError> {
        let welcome = self.tokenomics.welcome_amount();
        let amount = round6(amount);
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            ensure_balance_tx(&tx, account, welcome)?;
            apply_delta(&tx, account, amount)?;
            tx.commit()
        })?;
        Ok(())
    }

    /// Atomically subtract from an account's balance.
    pub fn debit(&self, account: &str, amount: f64) -> Result<(), AppError> {
        self.credit(account, -round6(amount))
    }

    /// Append a transaction to the log. Never updates, never deletes.
    pub fn record_transaction(&self, record: &TransactionRecord) -> Result<(), AppError> {
        self.db.with_conn(|conn| insert_transaction(conn, record))?;
        Ok(())
    }

    /// Settle a completed request: price the usage, split the fee, move the
    /// balances, and append the transaction, all in one store transaction.
    pub fn settle(&self, job: &SettleJob) -> Result<Settlement, AppError> {
        let mule_amount = self
            .tokenomics
            .tokens_to_mules(job.usage.total_tokens as f64, job.tier);
        let self_service = job.provider.as_deref() == Some(job.consumer.as_str());

        let (kind, platform_fee, provider_credit) = if self_service {
            (TransactionKind::SelfService, 0.0, 0.0)
        } else {
            let fee = self.tokenomics.platform_fee(mule_amount);
            (
                TransactionKind::Consumption,
                fee,
                self.tokenomics.provider_earnings(mule_amount),
            )
        };

        let record = TransactionRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            consumer_id: job.consumer.clone(),
            provider_id: if self_service {
                None
            } else {
                job.provider.clone()
            },
            model: job.model.clone(),
            tier: job.tier.as_str().to_string(),
            prompt_tokens: job.usage.prompt_tokens,
            completion_tokens: job.usage.completion_tokens,
            total_tokens: job.usage.total_tokens,
            mule_amount,
            platform_fee,
            duration_seconds: job.duration_seconds,
            tokens_per_second: job.tokens_per_second,
            metadata: None,
            created_at: String::new(),
        };

        let welcome = self.tokenomics.welcome_amount();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            // Degenerate usage and self-service settle without moving MULE.
            if !self_service && mule_amount > 0.0 {
                ensure_balance_tx(&tx, &job.consumer, welcome)?;
                apply_delta(&tx, &job.consumer, -mule_amount)?;
                if let Some(provider) = &job.provider {
                    ensure_balance_tx(&tx, provider, welcome)?;
                    apply_delta(&tx, provider, provider_credit)?;
                }
            }

            insert_transaction(&tx, &record)?;

            if let Some(provider) = &job.provider {
                bump_provider_counters(&tx, provider, &job.usage, job.tokens_per_second)?;
            }

            tx.commit()
        })?;

        Ok(Settlement {
            mule_amount,
            platform_fee,
            provider_credit,
            self_service,
        })
    }

    // -- read views ----------------------------------------------------------

    /// Transactions where the account appears as consumer or provider,
    /// newest first.
    pub fn list_transactions(
        &self,
        account: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, consumer_id, provider_id, model, tier, prompt_tokens, \
                 completion_tokens, total_tokens, mule_amount, platform_fee, duration_seconds, \
                 tokens_per_second, metadata, created_at \
                 FROM transactions \
                 WHERE consumer_id = ?1 OR provider_id = ?1 \
                 ORDER BY created_at DESC, id DESC \
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mapped = stmt.query_map(params![account, limit, offset], row_to_record)?;
            mapped.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(rows)
    }

    /// Aggregate spending view for a consumer account.
    pub fn consumer_stats(&self, account: &str) -> Result<ConsumerStats, AppError> {
        let stats = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(total_tokens), 0), \
                 COALESCE(SUM(CASE WHEN kind = 'consumption' THEN mule_amount ELSE 0 END), 0) \
                 FROM transactions \
                 WHERE consumer_id = ?1 AND kind IN ('consumption', 'self_service')",
                params![account],
                |row| {
                    Ok(ConsumerStats {
                        total_requests: row.get::<_, i64>(0)? as u64,
                        total_tokens: row.get::<_, i64>(1)? as u64,
                        total_spent: round6(row.get::<_, f64>(2)?),
                    })
                },
            )
        })?;
        Ok(stats)
    }

    /// Aggregate earnings view for a provider account.
    pub fn provider_stats(&self, account: &str) -> Result<ProviderStats, AppError> {
        let stats = self.db.with_conn(|conn| {
            let counters = conn
                .query_row(
                    "SELECT total_requests, successful_requests, total_tokens, \
                     max_tokens_per_second, last_active FROM providers WHERE user_id = ?1",
                    params![account],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)? as u64,
                            row.get::<_, i64>(1)? as u64,
                            row.get::<_, i64>(2)? as u64,
                            row.get::<_, f64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;

            let total_earned: f64 = conn.query_row(
                "SELECT COALESCE(SUM(mule_amount - platform_fee), 0) FROM transactions \
                 WHERE provider_id = ?1 AND kind = 'consumption'",
                params![account],
                |row| row.get(0),
            )?;

            let (total_requests, successful_requests, total_tokens, max_tps, last_active) =
                counters.unwrap_or((0, 0, 0, 0.0, None));

            Ok(ProviderStats {
                total_requests,
                successful_requests,
                total_tokens,
                max_tokens_per_second: max_tps,
                total_earned: round6(total_earned),
                last_active,
            })
        })?;
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared by the transactional paths)
// ---------------------------------------------------------------------------

/// Create the balance row if absent; the first creation also appends the
/// welcome-bonus deposit. Returns whether a row was created.
fn ensure_balance_tx(conn: &Connection, account: &str, welcome: f64) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO balances (user_id, mule) VALUES (?1, ?2)",
        params![account, welcome],
    )?;
    if inserted == 1 && welcome > 0.0 {
        let record = TransactionRecord {
            id: Uuid::new_v4().to_string(),
            kind: TransactionKind::Deposit,
            consumer_id: account.to_string(),
            provider_id: None,
            model: String::new(),
            tier: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            mule_amount: welcome,
            platform_fee: 0.0,
            duration_seconds: 0.0,
            tokens_per_second: 0.0,
            metadata: Some(r#"{"reason":"welcome_bonus"}"#.to_string()),
            created_at: String::new(),
        };
        insert_transaction(conn, &record)?;
    }
    Ok(inserted == 1)
}

fn apply_delta(conn: &Connection, account: &str, delta: f64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE balances SET mule = mule + ?1, updated_at = datetime('now') WHERE user_id = ?2",
        params![delta, account],
    )?;
    Ok(())
}

fn insert_transaction(conn: &Connection, record: &TransactionRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO transactions (id, kind, consumer_id, provider_id, model, tier, \
         prompt_tokens, completion_tokens, total_tokens, mule_amount, platform_fee, \
         duration_seconds, tokens_per_second, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            record.id,
            record.kind.as_str(),
            record.consumer_id,
            record.provider_id,
            record.model,
            record.tier,
            record.prompt_tokens as i64,
            record.completion_tokens as i64,
            record.total_tokens as i64,
            record.mule_amount,
            record.platform_fee,
            record.duration_seconds,
            record.tokens_per_second,
            record.metadata,
        ],
    )?;
    Ok(())
}

fn bump_provider_counters(
    conn: &Connection,
    provider: &str,
    usage: &UsageReport,
    tokens_per_second: f64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO providers (user_id, total_requests, successful_requests, total_tokens, \
         max_tokens_per_second, last_active) \
         VALUES (?1, 1, 1, ?2, ?3, datetime('now')) \
         ON CONFLICT(user_id) DO UPDATE SET \
           total_requests = total_requests + 1, \
           successful_requests = successful_requests + 1, \
           total_tokens = total_tokens + ?2, \
           max_tokens_per_second = MAX(max_tokens_per_second, ?3), \
           last_active = datetime('now')",
        params![provider, usage.total_tokens as i64, tokens_per_second],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let kind: String = row.get(1)?;
    Ok(TransactionRecord {
        id: row.get(0)?,
        kind: TransactionKind::parse(&kind).unwrap_or(TransactionKind::Consumption),
        consumer_id: row.get(2)?,
        provider_id: row.get(3)?,
        model: row.get(4)?,
        tier: row.get(5)?,
        prompt_tokens: row.get::<_, i64>(6)? as u64,
        completion_tokens: row.get::<_, i64>(7)? as u64,
        total_tokens: row.get::<_, i64>(8)? as u64,
        mule_amount: row.get(9)?,
        platform_fee: row.get(10)?,
        duration_seconds: row.get(11)?,
        tokens_per_second: row.get(12)?,
        metadata: row.get(13)?,
        created_at: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
