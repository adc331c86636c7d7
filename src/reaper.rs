use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::limits::IDEMPOTENCY_TTL_MS;
use crate::model::{Ms, now_ms};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One maintenance pass: forget stale idempotency keys, drop notification
/// channels nobody listens on, and hand any seat that is free while someone
/// waits to the head of that waitlist.
pub async fn maintenance_pass(engine: &Engine, now: Ms) {
    let expired = engine.expire_idempotency_keys(now.saturating_sub(IDEMPOTENCY_TTL_MS));
    if expired > 0 {
        debug!("expired {expired} idempotency keys");
    }
    let idle = engine.notify.prune_idle();
    if idle > 0 {
        debug!("dropped {idle} idle notification channels");
    }
    let promoted = engine.reconcile_waitlists(now).await;
    if !promoted.is_empty() {
        info!("reconcile promoted {} waitlisted users", promoted.len());
    }
}

/// Background task that periodically runs `maintenance_pass`.
pub async fn run_maintenance(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        maintenance_pass(&engine, now_ms()).await;
    }
}

/// Background task that compacts the WAL once enough commits pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal(now_ms()).await {
            Ok(()) => info!("compacted WAL after {appends} commits"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
