use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;

use crate::config::DispatchConfig;
use crate::dispatch::PendingRequests;
use crate::protocol::BrokerFrame;

use super::ProviderRegistry;

/// Spawn the per-broker heartbeat monitor.
///
/// Every ping interval it walks the session table: sessions silent past the
/// session timeout are removed (failing their pending requests), sessions
/// silent past a third of it are demoted to inactive, and everything else
/// receives a keep-alive probe. A session whose write handle is closed is
/// removed immediately.
pub fn spawn_heartbeat_monitor(
    registry: Arc<ProviderRegistry>,
    pending: Arc<PendingRequests>,
    config: DispatchConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let session_timeout = Duration::from_secs(config.session_timeout_secs);
        let inactive_after = session_timeout / 3;
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.ping_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            for (session_id, age, writer) in registry.monitor_view() {
                if age > session_timeout {
                    if let Some(removed) = registry.remove(session_id, "heartbeat timeout") {
                        pending.fail_many(&removed.pending, "provider heartbeat timeout");
                    }
                    continue;
                }

                if age > inactive_after {
                    registry.mark_inactive(session_id);
                }

                match writer.try_send(BrokerFrame::Ping) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // Outbound buffer congested; the next tick retries.
                        tracing::debug!(session = %session_id, "Ping skipped, write buffer full");
                    }
                    Err(TrySendError::Closed(_)) => {
                        if let Some(removed) = registry.remove(session_id, "write handle closed") {
                            pending.fail_many(&removed.pending, "provider connection lost");
                        }
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
