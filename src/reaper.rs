use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::format_date;
use crate::observability::ORPHANED_CLAIMS_RELEASED_TOTAL;

/// Release claims that were never finalized once their expiry passes.
/// Returns how many were released.
pub async fn sweep_expired(engine: &Engine, now: i64) -> usize {
    let mut released = 0;
    for (reservation_id, service_id) in engine.collect_expired_claims(now) {
        let details = engine.get_reservation(reservation_id).await;
        match engine.release_if_expired(reservation_id, now).await {
            Ok(true) => {
                released += 1;
                metrics::counter!(ORPHANED_CLAIMS_RELEASED_TOTAL).increment(1);
                match details {
                    Some(r) => warn!(
                        target: "slotbook::orphan",
                        reservation_id = %reservation_id,
                        service_id = %service_id,
                        date = %format_date(r.date),
                        span = %r.span,
                        "released claim that was never finalized"
                    ),
                    None => warn!(
                        target: "slotbook::orphan",
                        reservation_id = %reservation_id,
                        service_id = %service_id,
                        "released claim that was never finalized"
                    ),
                }
            }
            // Finalized or released since the scan.
            Ok(false) => debug!("reaper skip {reservation_id}: no longer expired"),
            Err(e) => debug!("reaper skip {reservation_id}: {e}"),
        }
    }
    released
}

/// Background task that periodically releases expired claims.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                sweep_expired(&engine, now_ms()).await;
            }
        }
    }
    debug!("reaper stopped");
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!("compacted WAL after {appends} appends"),
                    Err(e) => warn!("WAL compaction failed: {e}"),
                }
            }
        }
    }
    debug!("compactor stopped");
}
