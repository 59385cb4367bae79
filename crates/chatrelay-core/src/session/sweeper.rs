//! Periodic sweep of stale sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;

/// Run [`SessionRegistry::sweep`] every `interval` until `shutdown` fires.
/// Each pass also purges expired entries from the durable cache.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = registry.sweep(Utc::now());
            if report.cancelled > 0 || report.evicted > 0 {
                tracing::info!(
                    cancelled = report.cancelled,
                    evicted = report.evicted,
                    remaining = registry.len(),
                    "swept stale sessions"
                );
            }

            if let Some(persistence) = registry.persistence() {
                match persistence.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "purged expired snapshots"),
                    Err(e) => tracing::warn!(error = %e, "failed to purge expired snapshots"),
                }
            }
        }
        tracing::debug!("session sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_types::config::SessionConfig;
    use chatrelay_types::session::SessionStatus;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::detached(SessionConfig::default()));
        let record = registry.create_session(1, 1, "m", vec![]).unwrap();
        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(registry.clone(), Duration::from_secs(600), shutdown.clone());

        // Fresh sessions survive a pass.
        tokio::time::advance(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        assert_eq!(record.status(), SessionStatus::Pending);
        assert_eq!(registry.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
