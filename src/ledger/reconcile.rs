use std::time::Duration;

use tokio::sync::mpsc;

use super::{Ledger, SettleJob};

/// How often buffered settlements are retried against the store.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Spawn a background task that retries failed settlements.
///
/// The dispatcher settles in-path; when that write fails after the provider
/// has already answered, the job lands here instead of failing the client
/// request. The task drains remaining jobs and exits when the sender half
/// is dropped.
pub fn spawn_reconciler(
    ledger: Ledger,
    mut rx: mpsc::UnboundedReceiver<SettleJob>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<SettleJob> = Vec::new();
        let mut interval = tokio::time::interval(RETRY_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                job = rx.recv() => {
                    match job {
                        Some(job) => {
                            tracing::warn!(
                                consumer = %job.consumer,
                                model = %job.model,
                                "Settlement queued for reconciliation"
                            );
                            buffer.push(job);
                            retry_buffer(&ledger, &mut buffer);
                        }
                        None => {
                            // Channel closed -- final drain, then exit.
                            retry_buffer(&ledger, &mut buffer);
                            if !buffer.is_empty() {
                                tracing::error!(
                                    remaining = buffer.len(),
                                    "Reconciler shutting down with unsettled jobs"
                                );
                            }
                            tracing::info!("Reconciler shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    retry_buffer(&ledger, &mut buffer);
                }
            }
        }
    })
}

/// Attempt every buffered job once, keeping the ones that still fail.
fn retry_buffer(ledger: &Ledger, buffer: &mut Vec<SettleJob>) {
    if buffer.is_empty() {
        return;
    }
    let jobs = std::mem::take(buffer);
    for job in jobs {
        match ledger.settle(&job) {
            Ok(settlement) => {
                tracing::info!(
                    consumer = %job.consumer,
                    amount = settlement.mule_amount,
                    "Reconciled settlement"
                );
            }
            Err(e) => {
                tracing::error!(
                    consumer = %job.consumer,
                    error = %e,
                    "Settlement retry failed, keeping in reconcile buffer"
                );
                buffer.push(job);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
