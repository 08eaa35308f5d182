use ulid::Ulid;

use crate::model::*;

use super::store::{Store, Version};

/// Optimistic unit of work over the document store.
///
/// Reads record the version of every document they touch; writes and deletes
/// are staged, not applied. `Scheduler::commit` re-validates every recorded
/// version under the commit lock, appends the staged events to the WAL, then
/// applies the staged writes. A version mismatch means a concurrent commit
/// got there first and surfaces as `WriteConflict` — the only error kind the
/// booking workflow's retry loop is allowed to retry.
pub(super) struct Txn<'a> {
    store: &'a Store,
    slot_reads: Vec<(Ulid, Option<Version>)>,
    appointment_reads: Vec<(Ulid, Option<Version>)>,
    pub(super) slot_writes: Vec<Slot>,
    pub(super) slot_deletes: Vec<Ulid>,
    pub(super) appointment_writes: Vec<Appointment>,
    pub(super) appointment_deletes: Vec<Ulid>,
    pub(super) account_writes: Vec<Account>,
    pub(super) events: Vec<Event>,
}

impl<'a> Txn<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self {
            store,
            slot_reads: Vec::new(),
            appointment_reads: Vec::new(),
            slot_writes: Vec::new(),
            slot_deletes: Vec::new(),
            appointment_writes: Vec::new(),
            appointment_deletes: Vec::new(),
            account_writes: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Snapshot-read a slot, recording its version for commit validation.
    pub(super) fn read_slot(&mut self, id: &Ulid) -> Option<Slot> {
        match self.store.slot(id) {
            Some((slot, version)) => {
                self.slot_reads.push((*id, Some(version)));
                Some(slot)
            }
            None => {
                self.slot_reads.push((*id, None));
                None
            }
        }
    }

    /// Snapshot-read an appointment, recording its version.
    pub(super) fn read_appointment(&mut self, id: &Ulid) -> Option<Appointment> {
        match self.store.appointment(id) {
            Some((appointment, version)) => {
                self.appointment_reads.push((*id, Some(version)));
                Some(appointment)
            }
            None => {
                self.appointment_reads.push((*id, None));
                None
            }
        }
    }

    pub(super) fn put_slot(&mut self, slot: Slot) {
        self.slot_writes.push(slot);
    }

    pub(super) fn delete_slot(&mut self, id: Ulid) {
        self.slot_deletes.push(id);
    }

    pub(super) fn put_account(&mut self, account: Account) {
        self.account_writes.push(account);
    }

    pub(super) fn put_appointment(&mut self, appointment: Appointment) {
        self.appointment_writes.push(appointment);
    }

    pub(super) fn delete_appointment(&mut self, id: Ulid) {
        self.appointment_deletes.push(id);
    }

    pub(super) fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// True if every read still matches the store. Called under the commit lock.
    pub(super) fn reads_valid(&self) -> bool {
        self.slot_reads
            .iter()
            .all(|(id, v)| self.store.slot_version(id) == *v)
            && self
                .appointment_reads
                .iter()
                .all(|(id, v)| self.store.appointment_version(id) == *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_valid_until_concurrent_write() {
        let store = Store::new();
        let slot = Slot::new(Ulid::new(), Ulid::new(), 0, 1000, 2000);
        let id = slot.id;
        store.put_slot(slot);

        let mut txn = Txn::new(&store);
        let read = txn.read_slot(&id).unwrap();
        assert!(txn.reads_valid());

        // A concurrent commit bumps the version — the snapshot is stale.
        store.put_slot(read);
        assert!(!txn.reads_valid());
    }

    #[test]
    fn missing_read_conflicts_with_later_insert() {
        let store = Store::new();
        let id = Ulid::new();

        let mut txn = Txn::new(&store);
        assert!(txn.read_slot(&id).is_none());
        assert!(txn.reads_valid());

        store.put_slot(Slot::new(id, Ulid::new(), 0, 1000, 2000));
        assert!(!txn.reads_valid());
    }

    #[test]
    fn deleted_appointment_invalidates_read() {
        let store = Store::new();
        let appt = Appointment {
            id: Ulid::new(),
            requester_id: Ulid::new(),
            provider_id: Ulid::new(),
            service_id: Ulid::new(),
            slot_id: Ulid::new(),
            status: AppointmentStatus::Booked,
        };
        let id = appt.id;
        store.put_appointment(appt);

        let mut txn = Txn::new(&store);
        txn.read_appointment(&id).unwrap();
        assert!(txn.reads_valid());

        store.remove_appointment(&id);
        assert!(!txn.reads_valid());
    }
}
