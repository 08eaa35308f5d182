use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

pub type Version = u64;

/// A document plus its optimistic-concurrency version. Every committed write
/// bumps the version; transactions re-check recorded versions at commit.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub doc: T,
    pub version: Version,
}

/// In-memory document store: Slot and Appointment collections (versioned)
/// plus the Account collection. Rebuilt from the WAL on startup.
pub struct Store {
    slots: DashMap<Ulid, Versioned<Slot>>,
    appointments: DashMap<Ulid, Versioned<Appointment>>,
    accounts: DashMap<Ulid, Account>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            appointments: DashMap::new(),
            accounts: DashMap::new(),
        }
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot(&self, id: &Ulid) -> Option<(Slot, Version)> {
        self.slots.get(id).map(|e| (e.doc.clone(), e.version))
    }

    pub fn slot_version(&self, id: &Ulid) -> Option<Version> {
        self.slots.get(id).map(|e| e.version)
    }

    /// Insert or replace a slot, bumping its version.
    pub fn put_slot(&self, slot: Slot) {
        match self.slots.get_mut(&slot.id) {
            Some(mut entry) => {
                entry.doc = slot;
                entry.version += 1;
            }
            None => {
                self.slots.insert(slot.id, Versioned { doc: slot, version: 0 });
            }
        }
    }

    pub fn remove_slot(&self, id: &Ulid) -> Option<Slot> {
        self.slots.remove(id).map(|(_, v)| v.doc)
    }

    pub fn provider_slot_count(&self, provider_id: &Ulid) -> usize {
        self.slots
            .iter()
            .filter(|e| e.doc.provider_id == *provider_id)
            .count()
    }

    /// Snapshot of all slots for one provider, sorted by start.
    pub fn slots_for_provider(&self, provider_id: &Ulid) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .slots
            .iter()
            .filter(|e| e.doc.provider_id == *provider_id)
            .map(|e| e.doc.clone())
            .collect();
        slots.sort_by_key(|s| s.start);
        slots
    }

    /// Snapshot of all slots matching `pred`. Used by the sweeper and the
    /// hold limiter; scans are fine at the slot counts we cap per provider.
    pub fn slots_where(&self, pred: impl Fn(&Slot) -> bool) -> Vec<Slot> {
        self.slots
            .iter()
            .filter(|e| pred(&e.doc))
            .map(|e| e.doc.clone())
            .collect()
    }

    // ── Appointments ─────────────────────────────────────────

    pub fn appointment(&self, id: &Ulid) -> Option<(Appointment, Version)> {
        self.appointments.get(id).map(|e| (e.doc.clone(), e.version))
    }

    pub fn appointment_version(&self, id: &Ulid) -> Option<Version> {
        self.appointments.get(id).map(|e| e.version)
    }

    pub fn put_appointment(&self, appointment: Appointment) {
        match self.appointments.get_mut(&appointment.id) {
            Some(mut entry) => {
                entry.doc = appointment;
                entry.version += 1;
            }
            None => {
                self.appointments
                    .insert(appointment.id, Versioned { doc: appointment, version: 0 });
            }
        }
    }

    pub fn remove_appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.remove(id).map(|(_, v)| v.doc)
    }

    /// Appointments owned by `owner_id` in the given role, newest id first.
    pub fn appointments_for(&self, owner_id: &Ulid, role: Role) -> Vec<Appointment> {
        let mut appts: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| match role {
                Role::Client => e.doc.requester_id == *owner_id,
                Role::Provider => e.doc.provider_id == *owner_id,
            })
            .map(|e| e.doc.clone())
            .collect();
        appts.sort_by_key(|a| std::cmp::Reverse(a.id));
        appts
    }

    /// Snapshot of every appointment. Used for compaction and listing scans.
    pub fn all_appointments(&self) -> Vec<Appointment> {
        self.appointments.iter().map(|e| e.doc.clone()).collect()
    }

    // ── Accounts ─────────────────────────────────────────────

    pub fn account(&self, id: &Ulid) -> Option<Account> {
        self.accounts.get(id).map(|e| e.clone())
    }

    pub fn put_account(&self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    pub fn all_accounts(&self) -> Vec<Account> {
        self.accounts.iter().map(|e| e.clone()).collect()
    }

    pub fn accounts_with_role(&self, role: Role) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|e| e.role == role)
            .map(|e| e.clone())
            .collect()
    }

    // ── Event application (WAL replay and commit apply) ──────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::AccountCreated { id, full_name, email, phone, role } => {
                self.put_account(Account {
                    id: *id,
                    full_name: full_name.clone(),
                    email: email.clone(),
                    phone: phone.clone(),
                    role: *role,
                });
            }
            Event::SlotCreated { id, provider_id, day, start, end } => {
                self.put_slot(Slot::new(*id, *provider_id, *day, *start, *end));
            }
            Event::SlotRemoved { id, .. } => {
                self.remove_slot(id);
            }
            Event::SlotBlockSet { id, blocked, .. } => {
                if let Some(mut entry) = self.slots.get_mut(id) {
                    entry.doc.blocked = *blocked;
                    if *blocked {
                        entry.doc.clear_hold();
                    }
                    entry.version += 1;
                }
            }
            Event::HoldAcquired { slot_id, requester_id, expires_at, .. } => {
                if let Some(mut entry) = self.slots.get_mut(slot_id) {
                    entry.doc.held_by = Some(*requester_id);
                    entry.doc.hold_expires_at = Some(*expires_at);
                    entry.version += 1;
                }
            }
            Event::HoldReleased { slot_id, .. } => {
                if let Some(mut entry) = self.slots.get_mut(slot_id) {
                    entry.doc.clear_hold();
                    entry.version += 1;
                }
            }
            Event::AppointmentBooked { id, requester_id, provider_id, service_id, slot_id } => {
                self.put_appointment(Appointment {
                    id: *id,
                    requester_id: *requester_id,
                    provider_id: *provider_id,
                    service_id: *service_id,
                    slot_id: *slot_id,
                    status: AppointmentStatus::Booked,
                });
                if let Some(mut entry) = self.slots.get_mut(slot_id) {
                    entry.doc.appointment_id = Some(*id);
                    entry.doc.clear_hold();
                    entry.version += 1;
                }
            }
            Event::AppointmentCancelled { id, .. } => {
                if let Some(mut entry) = self.appointments.get_mut(id) {
                    entry.doc.status = AppointmentStatus::Cancelled;
                    entry.version += 1;
                }
            }
            Event::AppointmentReleased { id, slot_id, .. } => {
                self.remove_appointment(id);
                if let Some(mut entry) = self.slots.get_mut(slot_id) {
                    entry.doc.appointment_id = None;
                    entry.doc.clear_hold();
                    entry.version += 1;
                }
            }
            Event::AppointmentCompleted { id, .. } => {
                if let Some(mut entry) = self.appointments.get_mut(id) {
                    entry.doc.status = AppointmentStatus::Completed;
                    entry.version += 1;
                }
            }
        }
    }
}
