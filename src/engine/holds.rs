use dashmap::DashMap;
use tracing::debug;
use ulid::Ulid;

use crate::limits::{HOLD_LIMIT, HOLD_TTL_MS, HOLD_WINDOW_MS};
use crate::model::*;
use crate::observability as obs;

use super::{SchedError, Scheduler};

/// CAS attempts for hold acquisition/release. A loser re-snapshots and
/// re-validates, so two is normally enough; three leaves headroom.
const CAS_ATTEMPTS: u32 = 3;

/// Sliding-window rate limiter for hold grants, one counter per requester.
/// Counters are ephemeral — a restart forgives the window, which is fine for
/// an abuse bound.
pub struct HoldLimiter {
    counters: DashMap<Ulid, HoldCounter>,
    limit: u32,
    window_ms: Ms,
}

impl HoldLimiter {
    pub fn new() -> Self {
        Self::with_limits(HOLD_LIMIT, HOLD_WINDOW_MS)
    }

    pub fn with_limits(limit: u32, window_ms: Ms) -> Self {
        Self {
            counters: DashMap::new(),
            limit,
            window_ms,
        }
    }

    /// Atomically take one grant of window budget, under the counter's map
    /// entry guard so a concurrent burst from one requester cannot pass the
    /// check before any of its grants are counted. Returns false when the
    /// budget is spent. Re-holds of a slot the requester already owns never
    /// consume budget, so callers must check ownership first. A reservation
    /// that does not end in a granted hold must be handed back with
    /// `release`.
    pub fn try_reserve(&self, requester_id: &Ulid, now: Ms) -> bool {
        let mut entry = self
            .counters
            .entry(*requester_id)
            .or_insert(HoldCounter { count: 0, window_start: now });
        if now - entry.window_start > self.window_ms {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Hand back a reservation whose hold was not granted.
    pub fn release(&self, requester_id: &Ulid) {
        if let Some(mut entry) = self.counters.get_mut(requester_id) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    /// Drop counters whose window has fully lapsed. Sweeper housekeeping;
    /// a live window is never touched.
    pub fn evict_stale(&self, now: Ms) {
        self.counters
            .retain(|_, counter| now - counter.window_start <= self.window_ms);
    }
}

impl Default for HoldLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Acquire a time-bounded exclusive hold on a slot for a requester.
    ///
    /// The conditional write succeeds only if the slot is free or already
    /// held by this requester (idempotent re-hold, extends the lease without
    /// consuming rate budget). Two concurrent calls on the same free slot
    /// resolve to exactly one winner via commit-time version validation.
    pub async fn acquire_hold(
        &self,
        slot_id: Ulid,
        requester_id: Ulid,
    ) -> Result<HoldOutcome, SchedError> {
        self.acquire_hold_at(slot_id, requester_id, now_ms()).await
    }

    pub(crate) async fn acquire_hold_at(
        &self,
        slot_id: Ulid,
        requester_id: Ulid,
        now: Ms,
    ) -> Result<HoldOutcome, SchedError> {
        for _ in 0..CAS_ATTEMPTS {
            let mut txn = self.txn();
            let Some(slot) = txn.read_slot(&slot_id) else {
                return Err(SchedError::NotFound(slot_id));
            };

            if slot.blocked || slot.appointment_id.is_some() {
                metrics::counter!(obs::HOLDS_DENIED_TOTAL).increment(1);
                return Ok(HoldOutcome::Denied { slot_id });
            }
            let rehold = slot.held_by_requester(requester_id, now);
            if slot.held(now) && !rehold {
                metrics::counter!(obs::HOLDS_DENIED_TOTAL).increment(1);
                return Ok(HoldOutcome::Denied { slot_id });
            }

            // Budget is reserved before the conditional write and handed
            // back on any path that does not end in a granted hold.
            if !rehold && !self.limiter.try_reserve(&requester_id, now) {
                metrics::counter!(obs::HOLD_LIMIT_HITS_TOTAL).increment(1);
                return Ok(HoldOutcome::LimitReached {
                    current_holds: self.slots_held_by(requester_id, now),
                });
            }

            let expires_at = now + HOLD_TTL_MS;
            let provider_id = slot.provider_id;
            let mut updated = slot;
            updated.held_by = Some(requester_id);
            updated.hold_expires_at = Some(expires_at);
            txn.put_slot(updated);
            txn.push_event(Event::HoldAcquired {
                slot_id,
                provider_id,
                requester_id,
                expires_at,
            });

            match self.commit(txn).await {
                Ok(()) => {
                    self.invalidate_caches(provider_id, None);
                    metrics::counter!(obs::HOLDS_GRANTED_TOTAL).increment(1);
                    return Ok(HoldOutcome::Granted { slot_id, expires_at });
                }
                Err(e) if e.is_conflict() => {
                    if !rehold {
                        self.limiter.release(&requester_id);
                    }
                    debug!("hold race on slot {slot_id}, re-validating");
                    continue;
                }
                Err(e) => {
                    if !rehold {
                        self.limiter.release(&requester_id);
                    }
                    return Err(e);
                }
            }
        }
        // Lost the race every attempt — someone else owns the slot now.
        metrics::counter!(obs::HOLDS_DENIED_TOTAL).increment(1);
        Ok(HoldOutcome::Denied { slot_id })
    }

    /// Unconditionally clear a slot's hold. A no-op on an unheld slot.
    pub async fn release_hold(&self, slot_id: Ulid) -> Result<(), SchedError> {
        for _ in 0..CAS_ATTEMPTS {
            let mut txn = self.txn();
            let Some(slot) = txn.read_slot(&slot_id) else {
                return Err(SchedError::NotFound(slot_id));
            };
            if slot.held_by.is_none() {
                return Ok(());
            }
            let provider_id = slot.provider_id;
            let mut updated = slot;
            updated.clear_hold();
            txn.put_slot(updated);
            txn.push_event(Event::HoldReleased { slot_id, provider_id });

            match self.commit(txn).await {
                Ok(()) => {
                    self.invalidate_caches(provider_id, None);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SchedError::WriteConflict)
    }

    /// Slots currently held by a requester with a live lease.
    pub fn slots_held_by(&self, requester_id: Ulid, now: Ms) -> Vec<Slot> {
        let mut slots = self
            .store
            .slots_where(|s| s.held_by_requester(requester_id, now));
        slots.sort_by_key(|s| s.start);
        slots
    }

    /// Slots whose hold lease has lapsed. Sweeper input.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Slot> {
        self.store
            .slots_where(|s| s.held_by.is_some() && s.hold_expires_at.is_some_and(|exp| exp <= now))
    }

    /// Clear every lapsed hold, slot by slot. Each clear re-validates inside
    /// its own transaction, so a hold legitimately re-acquired since the scan
    /// is left alone; a stale clear can only ever remove an expired hold.
    /// Returns the providers whose availability changed.
    pub(crate) async fn reclaim_expired_holds_at(&self, now: Ms) -> Vec<Ulid> {
        let mut providers = Vec::new();
        for stale in self.collect_expired_holds(now) {
            let mut txn = self.txn();
            let Some(slot) = txn.read_slot(&stale.id) else {
                continue;
            };
            if !(slot.held_by.is_some() && slot.hold_expires_at.is_some_and(|exp| exp <= now)) {
                continue; // re-held in the meantime
            }
            let provider_id = slot.provider_id;
            let slot_id = slot.id;
            let mut updated = slot;
            updated.clear_hold();
            txn.put_slot(updated);
            txn.push_event(Event::HoldReleased { slot_id, provider_id });

            match self.commit(txn).await {
                Ok(()) => {
                    metrics::counter!(obs::HOLDS_RECLAIMED_TOTAL).increment(1);
                    debug!("reclaimed expired hold on slot {slot_id}");
                    if !providers.contains(&provider_id) {
                        providers.push(provider_id);
                    }
                }
                Err(e) if e.is_conflict() => {
                    // A fresh hold or booking won the race — nothing to reclaim.
                    debug!("reclaim skip {slot_id}: {e}");
                }
                Err(e) => {
                    tracing::warn!("reclaim failed for slot {slot_id}: {e}");
                }
            }
        }
        providers
    }
}
