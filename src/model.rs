use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// One bookable interval for one provider.
///
/// Hold state lives directly on the slot: `held_by` + `hold_expires_at` are
/// set together by the lock manager and cleared together by booking, release,
/// or the sweeper. A consumed slot (`appointment_id` set) is never held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub provider_id: Ulid,
    /// Midnight (UTC) of the day this slot belongs to.
    pub day: Ms,
    pub start: Ms,
    pub end: Ms,
    pub appointment_id: Option<Ulid>,
    pub held_by: Option<Ulid>,
    pub hold_expires_at: Option<Ms>,
    /// Administratively disabled: never held or booked while set.
    pub blocked: bool,
}

impl Slot {
    pub fn new(id: Ulid, provider_id: Ulid, day: Ms, start: Ms, end: Ms) -> Self {
        Self {
            id,
            provider_id,
            day,
            start,
            end,
            appointment_id: None,
            held_by: None,
            hold_expires_at: None,
            blocked: false,
        }
    }

    /// True if a live, unexpired hold is on the slot.
    pub fn held(&self, now: Ms) -> bool {
        self.held_by.is_some() && self.hold_expires_at.is_some_and(|exp| exp > now)
    }

    /// True if `requester` owns a live hold on the slot.
    pub fn held_by_requester(&self, requester: Ulid, now: Ms) -> bool {
        self.held_by == Some(requester) && self.hold_expires_at.is_some_and(|exp| exp > now)
    }

    /// Free for a new hold: not blocked, not consumed, no live hold.
    pub fn free(&self, now: Ms) -> bool {
        !self.blocked && self.appointment_id.is_none() && !self.held(now)
    }

    pub fn clear_hold(&mut self) {
        self.held_by = None;
        self.hold_expires_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Booked,
    Completed,
    Cancelled,
}

/// A confirmed or terminal booking. Created only by the booking workflow,
/// only with status `Booked`, only from a live hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub slot_id: Ulid,
    pub status: AppointmentStatus,
}

/// Single account type with a role tag — clients and providers live in one
/// collection, no double lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
}

/// Per-requester sliding-window counter for hold grants. Ephemeral: lives
/// only in the limiter, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldCounter {
    pub count: u32,
    pub window_start: Ms,
}

/// The event types — flat, no nesting. WAL record format and the payload
/// broadcast to real-time watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountCreated {
        id: Ulid,
        full_name: String,
        email: String,
        phone: String,
        role: Role,
    },
    SlotCreated {
        id: Ulid,
        provider_id: Ulid,
        day: Ms,
        start: Ms,
        end: Ms,
    },
    SlotRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    SlotBlockSet {
        id: Ulid,
        provider_id: Ulid,
        blocked: bool,
    },
    HoldAcquired {
        slot_id: Ulid,
        provider_id: Ulid,
        requester_id: Ulid,
        expires_at: Ms,
    },
    HoldReleased {
        slot_id: Ulid,
        provider_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        requester_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
    },
    /// Late cancellation: status flips, the slot stays consumed.
    AppointmentCancelled {
        id: Ulid,
        provider_id: Ulid,
        requester_id: Ulid,
    },
    /// Early cancellation: the appointment is deleted and the slot freed.
    AppointmentReleased {
        id: Ulid,
        slot_id: Ulid,
        provider_id: Ulid,
        requester_id: Ulid,
    },
    AppointmentCompleted {
        id: Ulid,
        provider_id: Ulid,
        requester_id: Ulid,
    },
}

impl Event {
    /// Provider whose availability/appointments the event touches, if any.
    pub fn provider_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotCreated { provider_id, .. }
            | Event::SlotRemoved { provider_id, .. }
            | Event::SlotBlockSet { provider_id, .. }
            | Event::HoldAcquired { provider_id, .. }
            | Event::HoldReleased { provider_id, .. }
            | Event::AppointmentBooked { provider_id, .. }
            | Event::AppointmentCancelled { provider_id, .. }
            | Event::AppointmentReleased { provider_id, .. }
            | Event::AppointmentCompleted { provider_id, .. } => Some(*provider_id),
            Event::AccountCreated { .. } => None,
        }
    }
}

/// Outcome of an `acquire_hold` call. Limit hits carry the requester's
/// current holds so a multi-tab caller can see the target is already theirs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HoldOutcome {
    Granted { slot_id: Ulid, expires_at: Ms },
    Denied { slot_id: Ulid },
    LimitReached { current_holds: Vec<Slot> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: Ms) -> Slot {
        Slot::new(Ulid::new(), Ulid::new(), 0, start, start + 3_600_000)
    }

    #[test]
    fn fresh_slot_is_free() {
        let s = slot(1000);
        assert!(s.free(500));
        assert!(!s.held(500));
    }

    #[test]
    fn expired_hold_is_not_held() {
        let mut s = slot(1000);
        s.held_by = Some(Ulid::new());
        s.hold_expires_at = Some(2000);
        assert!(s.held(1999));
        assert!(!s.held(2000)); // expiry boundary counts as expired
        assert!(s.free(2000));
    }

    #[test]
    fn blocked_slot_never_free() {
        let mut s = slot(1000);
        s.blocked = true;
        assert!(!s.free(0));
    }

    #[test]
    fn consumed_slot_not_free() {
        let mut s = slot(1000);
        s.appointment_id = Some(Ulid::new());
        assert!(!s.free(0));
    }

    #[test]
    fn hold_ownership() {
        let r = Ulid::new();
        let mut s = slot(1000);
        s.held_by = Some(r);
        s.hold_expires_at = Some(5000);
        assert!(s.held_by_requester(r, 4999));
        assert!(!s.held_by_requester(r, 5000));
        assert!(!s.held_by_requester(Ulid::new(), 4999));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HoldAcquired {
            slot_id: Ulid::new(),
            provider_id: Ulid::new(),
            requester_id: Ulid::new(),
            expires_at: 123_456,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
