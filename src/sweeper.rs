use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Scheduler;
use crate::limits::{PROVISION_DAYS, PROVISION_INTERVAL_SECS, SWEEP_INTERVAL_SECS};
use crate::model::now_ms;
use crate::observability as obs;

/// Background task that reclaims expired holds and promotes finished
/// appointments. Both sub-tasks are idempotent and safe against live
/// traffic, so another process instance running the same sweep is harmless.
pub async fn run_sweeper(scheduler: Arc<Scheduler>) {
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        sweep_once(&scheduler).await;
    }
}

/// One sweep cycle. Split out so tests can drive it directly.
pub async fn sweep_once(scheduler: &Scheduler) {
    let now = now_ms();
    metrics::counter!(obs::SWEEPS_TOTAL).increment(1);

    let reclaimed_providers = scheduler.reclaim_expired_holds_at(now).await;
    if !reclaimed_providers.is_empty() {
        info!("sweeper reclaimed holds for {} providers", reclaimed_providers.len());
    }
    for provider_id in &reclaimed_providers {
        scheduler.invalidate_caches(*provider_id, None);
    }

    let completed = scheduler.complete_past_appointments_at(now).await;
    if !completed.is_empty() {
        info!("sweeper completed {} appointments", completed.len());
    }
    for (provider_id, requester_id) in &completed {
        scheduler.invalidate_caches(*provider_id, Some(*requester_id));
    }

    scheduler.limiter.evict_stale(now);
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(scheduler: Arc<Scheduler>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = scheduler.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match scheduler.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

/// Background task that keeps every provider's slot grid extended and drops
/// past unbooked slots. One provider's failure never blocks the rest.
pub async fn run_provisioner(scheduler: Arc<Scheduler>) {
    let mut interval = tokio::time::interval(Duration::from_secs(PROVISION_INTERVAL_SECS));
    loop {
        interval.tick().await;
        provision_once(&scheduler).await;
    }
}

pub async fn provision_once(scheduler: &Scheduler) {
    let now = now_ms();
    let today = now - now.rem_euclid(crate::limits::DAY_MS);

    match scheduler.prune_past_slots_at(now).await {
        Ok(providers) => {
            for provider_id in &providers {
                scheduler.invalidate_caches(*provider_id, None);
            }
        }
        Err(e) => warn!("slot pruning failed: {e}"),
    }

    for provider in scheduler.providers() {
        if let Err(e) = scheduler
            .provision_day_grid(provider.id, today, PROVISION_DAYS)
            .await
        {
            warn!("provisioning failed for {}: {e}", provider.id);
        }
    }
}
