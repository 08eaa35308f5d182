use ulid::Ulid;

use crate::cache::{self, CachedListing};
use crate::model::*;

use super::Scheduler;

impl Scheduler {
    /// Slots a requester can act on for one provider/day: free slots plus
    /// any the requester already holds. Read-through cached per provider;
    /// the per-requester filter is applied after the cache, so one cached
    /// listing serves every caller.
    pub fn availability(&self, provider_id: Ulid, day: Ms, requester_id: Ulid) -> Vec<Slot> {
        self.availability_at(provider_id, day, requester_id, now_ms())
    }

    pub(crate) fn availability_at(
        &self,
        provider_id: Ulid,
        day: Ms,
        requester_id: Ulid,
        now: Ms,
    ) -> Vec<Slot> {
        let key = cache::provider_availability_key(&provider_id);
        let slots = match self.cache.get(&key) {
            Some(CachedListing::Slots(slots)) => slots,
            _ => {
                let slots = self.store.slots_for_provider(&provider_id);
                self.cache.put(key, CachedListing::Slots(slots.clone()));
                slots
            }
        };
        slots
            .into_iter()
            .filter(|s| {
                s.day == day && (s.free(now) || s.held_by_requester(requester_id, now))
            })
            .collect()
    }

    /// Appointment listing for a requester or provider, read-through cached.
    pub fn list_appointments(&self, owner_id: Ulid, role: Role) -> Vec<Appointment> {
        let key = match role {
            Role::Client => cache::requester_appointments_key(&owner_id),
            Role::Provider => cache::provider_appointments_key(&owner_id),
        };
        match self.cache.get(&key) {
            Some(CachedListing::Appointments(appointments)) => appointments,
            _ => {
                let appointments = self.store.appointments_for(&owner_id, role);
                self.cache
                    .put(key, CachedListing::Appointments(appointments.clone()));
                appointments
            }
        }
    }

    /// Uncached point read, straight from the store.
    pub fn get_slot(&self, id: &Ulid) -> Option<Slot> {
        self.store.slot(id).map(|(slot, _)| slot)
    }

    /// Uncached point read, straight from the store.
    pub fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.store.appointment(id).map(|(appointment, _)| appointment)
    }
}
