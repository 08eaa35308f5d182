use std::time::Duration;

use rand::Rng;
use tracing::debug;
use ulid::Ulid;

use crate::limits::{
    BOOKING_BACKOFF_BASE_MS, BOOKING_BACKOFF_JITTER_MS, BOOKING_MAX_ATTEMPTS, CANCEL_NOTICE_MS,
};
use crate::model::*;
use crate::notify::{Contact, Notification, NotificationKind};
use crate::observability as obs;

use super::{SchedError, Scheduler};

/// Exponential backoff with jitter between conflict retries. `attempt` is
/// 1-based: the first retry waits ~base, doubling from there.
async fn conflict_backoff(attempt: u32) {
    let base = BOOKING_BACKOFF_BASE_MS << (attempt - 1);
    let jitter = rand::thread_rng().gen_range(0..BOOKING_BACKOFF_JITTER_MS);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

impl Scheduler {
    /// Convert a valid hold into a confirmed appointment.
    ///
    /// Each attempt re-validates the hold inside its own transaction, so a
    /// booking can only ever consume a slot that is still held by this
    /// requester and unexpired at commit time. Write conflicts are retried
    /// with backoff up to the attempt budget; business rejections
    /// (`SlotUnavailable`) are terminal on the first attempt they appear.
    pub async fn create_appointment(
        &self,
        requester_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
    ) -> Result<Ulid, SchedError> {
        self.create_appointment_at(requester_id, provider_id, service_id, slot_id, now_ms())
            .await
    }

    pub(crate) async fn create_appointment_at(
        &self,
        requester_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<Ulid, SchedError> {
        for attempt in 0..BOOKING_MAX_ATTEMPTS {
            if attempt > 0 {
                metrics::counter!(obs::BOOKING_RETRIES_TOTAL).increment(1);
                conflict_backoff(attempt).await;
            }
            match self
                .try_book(requester_id, provider_id, service_id, slot_id, now)
                .await
            {
                Ok(appointment_id) => {
                    // Post-commit, best effort: a failure here never rolls
                    // back the booking.
                    self.invalidate_caches(provider_id, Some(requester_id));
                    self.dispatch_notification(
                        NotificationKind::BookingConfirmed,
                        appointment_id,
                        requester_id,
                        provider_id,
                    );
                    metrics::counter!(obs::BOOKINGS_TOTAL).increment(1);
                    return Ok(appointment_id);
                }
                Err(e) if e.is_conflict() => {
                    debug!("booking conflict on slot {slot_id}, attempt {}", attempt + 1);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        metrics::counter!(obs::BOOKING_FAILURES_TOTAL).increment(1);
        Err(SchedError::RetriesExhausted)
    }

    async fn try_book(
        &self,
        requester_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<Ulid, SchedError> {
        let mut txn = self.txn();
        let Some(slot) = txn.read_slot(&slot_id) else {
            return Err(SchedError::NotFound(slot_id));
        };

        // The hold must be live: expiry exactly equal to now counts as
        // expired (held_by_requester is strict). Any violation is a business
        // rejection, never retried.
        if slot.blocked
            || slot.appointment_id.is_some()
            || slot.provider_id != provider_id
            || !slot.held_by_requester(requester_id, now)
        {
            return Err(SchedError::SlotUnavailable(slot_id));
        }

        let appointment_id = Ulid::new();
        txn.put_appointment(Appointment {
            id: appointment_id,
            requester_id,
            provider_id,
            service_id,
            slot_id,
            status: AppointmentStatus::Booked,
        });

        let mut updated = slot;
        updated.appointment_id = Some(appointment_id);
        updated.clear_hold();
        txn.put_slot(updated);

        txn.push_event(Event::AppointmentBooked {
            id: appointment_id,
            requester_id,
            provider_id,
            service_id,
            slot_id,
        });

        self.commit(txn).await?;
        Ok(appointment_id)
    }

    /// Cancel an appointment. Inside the 12-hour notice window the status
    /// flips to Cancelled and the slot stays consumed; with more notice the
    /// appointment is deleted and the slot returns to the free pool.
    /// Only the owning requester or the assigned provider may cancel.
    pub async fn cancel(&self, appointment_id: Ulid, actor_id: Ulid) -> Result<(), SchedError> {
        self.cancel_at(appointment_id, actor_id, now_ms()).await
    }

    pub(crate) async fn cancel_at(
        &self,
        appointment_id: Ulid,
        actor_id: Ulid,
        now: Ms,
    ) -> Result<(), SchedError> {
        for attempt in 0..BOOKING_MAX_ATTEMPTS {
            if attempt > 0 {
                conflict_backoff(attempt).await;
            }
            match self.try_cancel(appointment_id, actor_id, now).await {
                Ok((requester_id, provider_id)) => {
                    self.invalidate_caches(provider_id, Some(requester_id));
                    self.dispatch_notification(
                        NotificationKind::AppointmentCancelled,
                        appointment_id,
                        requester_id,
                        provider_id,
                    );
                    metrics::counter!(obs::CANCELLATIONS_TOTAL).increment(1);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SchedError::RetriesExhausted)
    }

    async fn try_cancel(
        &self,
        appointment_id: Ulid,
        actor_id: Ulid,
        now: Ms,
    ) -> Result<(Ulid, Ulid), SchedError> {
        let mut txn = self.txn();
        let Some(appointment) = txn.read_appointment(&appointment_id) else {
            return Err(SchedError::NotFound(appointment_id));
        };
        if actor_id != appointment.requester_id && actor_id != appointment.provider_id {
            return Err(SchedError::NotAuthorized(actor_id));
        }
        if appointment.status != AppointmentStatus::Booked {
            return Err(SchedError::InvalidState(appointment_id));
        }

        let requester_id = appointment.requester_id;
        let provider_id = appointment.provider_id;
        let slot = txn.read_slot(&appointment.slot_id);

        let inside_notice = match &slot {
            Some(s) => s.start - now < CANCEL_NOTICE_MS,
            // Slot already pruned — nothing to re-offer, keep the record.
            None => true,
        };

        if inside_notice {
            let mut updated = appointment;
            updated.status = AppointmentStatus::Cancelled;
            txn.put_appointment(updated);
            txn.push_event(Event::AppointmentCancelled {
                id: appointment_id,
                provider_id,
                requester_id,
            });
        } else if let Some(slot) = slot {
            // Enough notice: free the slot for rebooking and drop the record.
            let slot_id = slot.id;
            let mut updated = slot;
            updated.appointment_id = None;
            updated.clear_hold();
            txn.put_slot(updated);
            txn.delete_appointment(appointment_id);
            txn.push_event(Event::AppointmentReleased {
                id: appointment_id,
                slot_id,
                provider_id,
                requester_id,
            });
        }

        self.commit(txn).await?;
        Ok((requester_id, provider_id))
    }

    /// Mark a booked appointment completed. Provider action only.
    pub async fn complete(
        &self,
        appointment_id: Ulid,
        acting_provider_id: Ulid,
    ) -> Result<(), SchedError> {
        for attempt in 0..BOOKING_MAX_ATTEMPTS {
            if attempt > 0 {
                conflict_backoff(attempt).await;
            }
            match self.try_complete(appointment_id, acting_provider_id).await {
                Ok((requester_id, provider_id)) => {
                    self.invalidate_caches(provider_id, Some(requester_id));
                    self.dispatch_notification(
                        NotificationKind::AppointmentCompleted,
                        appointment_id,
                        requester_id,
                        provider_id,
                    );
                    metrics::counter!(obs::COMPLETIONS_TOTAL).increment(1);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SchedError::RetriesExhausted)
    }

    async fn try_complete(
        &self,
        appointment_id: Ulid,
        acting_provider_id: Ulid,
    ) -> Result<(Ulid, Ulid), SchedError> {
        let mut txn = self.txn();
        let Some(appointment) = txn.read_appointment(&appointment_id) else {
            return Err(SchedError::NotFound(appointment_id));
        };
        if acting_provider_id != appointment.provider_id {
            return Err(SchedError::NotAuthorized(acting_provider_id));
        }
        if appointment.status != AppointmentStatus::Booked {
            return Err(SchedError::InvalidState(appointment_id));
        }

        let requester_id = appointment.requester_id;
        let provider_id = appointment.provider_id;
        let mut updated = appointment;
        updated.status = AppointmentStatus::Completed;
        txn.put_appointment(updated);
        txn.push_event(Event::AppointmentCompleted {
            id: appointment_id,
            provider_id,
            requester_id,
        });

        self.commit(txn).await?;
        Ok((requester_id, provider_id))
    }

    /// Promote Booked appointments whose slot has ended to Completed.
    /// Sweeper sub-task: each promotion is its own transaction, and one
    /// failure never blocks the rest of the batch. Returns the affected
    /// (provider, requester) pairs for batched cache invalidation.
    pub(crate) async fn complete_past_appointments_at(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let ended = self
            .store
            .slots_where(|s| s.end <= now && s.appointment_id.is_some());

        let mut affected = Vec::new();
        for slot in ended {
            let Some(appointment_id) = slot.appointment_id else {
                continue;
            };
            let mut txn = self.txn();
            let Some(appointment) = txn.read_appointment(&appointment_id) else {
                continue;
            };
            if appointment.status != AppointmentStatus::Booked {
                continue;
            }
            let requester_id = appointment.requester_id;
            let provider_id = appointment.provider_id;
            let mut updated = appointment;
            updated.status = AppointmentStatus::Completed;
            txn.put_appointment(updated);
            txn.push_event(Event::AppointmentCompleted {
                id: appointment_id,
                provider_id,
                requester_id,
            });

            match self.commit(txn).await {
                Ok(()) => {
                    metrics::counter!(obs::SWEEP_COMPLETIONS_TOTAL).increment(1);
                    self.dispatch_notification(
                        NotificationKind::AppointmentCompleted,
                        appointment_id,
                        requester_id,
                        provider_id,
                    );
                    if !affected.contains(&(provider_id, requester_id)) {
                        affected.push((provider_id, requester_id));
                    }
                }
                Err(e) if e.is_conflict() => {
                    debug!("completion sweep race on appointment {appointment_id}");
                }
                Err(e) => {
                    tracing::warn!("completion sweep failed for {appointment_id}: {e}");
                }
            }
        }
        affected
    }

    /// Queue a notification for the dispatcher, fire-and-forget. Contact
    /// details resolve at emit time; a missing account just thins the
    /// recipient list.
    pub(crate) fn dispatch_notification(
        &self,
        kind: NotificationKind,
        appointment_id: Ulid,
        requester_id: Ulid,
        provider_id: Ulid,
    ) {
        let mut recipients = Vec::new();
        for id in [requester_id, provider_id] {
            if let Some(account) = self.store.account(&id) {
                recipients.push(Contact {
                    email: account.email,
                    phone: account.phone,
                });
            }
        }
        self.dispatcher.enqueue(Notification {
            kind,
            appointment_id,
            recipients,
        });
    }
}
