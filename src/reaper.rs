use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::observability::HOLDS_EXPIRED_TOTAL;

/// Background task that periodically cancels pending holds past their TTL.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.expire_stale_holds(now_ms()).await {
            Ok(0) => {}
            Ok(n) => {
                metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(n as u64);
                info!("reaped {n} expired holds");
            }
            // Retried on the next tick.
            Err(e) => warn!("reaper pass failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        debug!("compacting WAL after {appends} appends");
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted ({appends} appends folded)"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::directory::InMemoryDirectory;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use rust_decimal::Decimal;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_cancels_expired_holds() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .upsert(ResourceListing {
                id: 1,
                owner_id: 2,
                name: "Court".into(),
                category: "tennis".into(),
                rate_per_hour: Decimal::new(40, 0),
                approved: true,
            })
            .unwrap();
        let config = EngineConfig {
            hold_ttl_ms: 20,
            ..EngineConfig::default()
        };
        let engine = Arc::new(
            Engine::new(
                test_wal_path("reaper.wal"),
                directory,
                Arc::new(NotifyHub::new()),
                config,
            )
            .unwrap(),
        );

        let start = now_ms() + 24 * HOUR_MS;
        let hold = engine
            .request_booking(3, 1, Span::new(start, start + HOUR_MS))
            .await
            .unwrap();

        let task = tokio::spawn(run_reaper(engine.clone(), Duration::from_millis(10)));
        let mut status = ReservationStatus::Pending;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.get_by_id(hold.id).await.unwrap().status;
            if status != ReservationStatus::Pending {
                break;
            }
        }
        task.abort();
        assert_eq!(status, ReservationStatus::Cancelled);
    }
}
