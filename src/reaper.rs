use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::store::BookingLedger;

/// Background task that expires stale slot locks. Each expiry reaches
/// watchers as an ordinary unlock.
pub async fn run_lock_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let expired = engine.locks.sweep(chrono::Utc::now().timestamp_millis());
        for lock in &expired {
            debug!("lock {} of {} expired", lock.key, lock.owner_id);
        }
        if !expired.is_empty() {
            info!("swept {} expired locks", expired.len());
        }
    }
}

/// Background task that rewrites the booking journal once enough appends pile up.
pub async fn run_compactor(ledger: Arc<BookingLedger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = ledger.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match ledger.compact().await {
            Ok(()) => info!("compacted booking journal after {appends} appends"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}
