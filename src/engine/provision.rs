use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{SchedError, Scheduler};

impl Scheduler {
    pub async fn create_account(
        &self,
        full_name: String,
        email: String,
        phone: String,
        role: Role,
    ) -> Result<Ulid, SchedError> {
        if full_name.len() > MAX_NAME_LEN {
            return Err(SchedError::LimitExceeded("account name too long"));
        }
        if email.len() > MAX_CONTACT_LEN || phone.len() > MAX_CONTACT_LEN {
            return Err(SchedError::LimitExceeded("contact field too long"));
        }
        let id = Ulid::new();
        let mut txn = self.txn();
        txn.put_account(Account {
            id,
            full_name: full_name.clone(),
            email: email.clone(),
            phone: phone.clone(),
            role,
        });
        txn.push_event(Event::AccountCreated {
            id,
            full_name,
            email,
            phone,
            role,
        });
        self.commit(txn).await?;
        Ok(id)
    }

    pub fn account(&self, id: &Ulid) -> Option<Account> {
        self.store.account(id)
    }

    pub fn providers(&self) -> Vec<Account> {
        self.store.accounts_with_role(Role::Provider)
    }

    /// Bulk-create the fixed hourly grid for a provider: `days` days starting
    /// at the `from_day` midnight, one slot per grid hour. Slots whose start
    /// already exists are skipped, so re-running the provisioner is
    /// idempotent. Returns the ids of the slots actually created.
    pub async fn provision_day_grid(
        &self,
        provider_id: Ulid,
        from_day: Ms,
        days: i64,
    ) -> Result<Vec<Ulid>, SchedError> {
        let provider = self
            .store
            .account(&provider_id)
            .ok_or(SchedError::NotFound(provider_id))?;
        if provider.role != Role::Provider {
            return Err(SchedError::InvalidState(provider_id));
        }

        let existing: std::collections::HashSet<Ms> = self
            .store
            .slots_for_provider(&provider_id)
            .into_iter()
            .map(|s| s.start)
            .collect();

        let mut txn = self.txn();
        let mut created = Vec::new();
        for d in 0..days {
            let day = from_day + d * DAY_MS;
            for hour in GRID_START_HOUR..GRID_END_HOUR {
                let start = day + hour * HOUR_MS;
                if existing.contains(&start) {
                    continue;
                }
                let id = Ulid::new();
                let end = start + HOUR_MS;
                txn.put_slot(Slot::new(id, provider_id, day, start, end));
                txn.push_event(Event::SlotCreated {
                    id,
                    provider_id,
                    day,
                    start,
                    end,
                });
                created.push(id);
            }
        }

        if self.store.provider_slot_count(&provider_id) + created.len() > MAX_SLOTS_PER_PROVIDER {
            return Err(SchedError::LimitExceeded("too many slots for provider"));
        }
        if created.is_empty() {
            return Ok(created);
        }

        self.commit(txn).await?;
        self.invalidate_caches(provider_id, None);
        info!("provisioned {} slots for provider {provider_id}", created.len());
        Ok(created)
    }

    /// Drop past slots that never got booked. Consumed slots stay until their
    /// appointment reaches a terminal state elsewhere; this only trims the
    /// free pool. Each removal re-reads the slot inside a transaction, so a
    /// concurrent hold or booking either loses the version check here and
    /// retries, or consumes the slot first and exempts it from removal.
    /// Returns the providers whose listings changed.
    pub async fn prune_past_slots_at(&self, now: Ms) -> Result<Vec<Ulid>, SchedError> {
        let stale = self
            .store
            .slots_where(|s| s.end <= now && s.appointment_id.is_none());

        let mut providers = Vec::new();
        let mut pruned = 0usize;
        for candidate in stale {
            for _ in 0..3 {
                let mut txn = self.txn();
                let Some(slot) = txn.read_slot(&candidate.id) else {
                    break;
                };
                if slot.end > now || slot.appointment_id.is_some() {
                    break;
                }
                let provider_id = slot.provider_id;
                txn.delete_slot(slot.id);
                txn.push_event(Event::SlotRemoved {
                    id: slot.id,
                    provider_id,
                });
                match self.commit(txn).await {
                    Ok(()) => {
                        pruned += 1;
                        if !providers.contains(&provider_id) {
                            providers.push(provider_id);
                        }
                        break;
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        if pruned > 0 {
            info!("pruned {pruned} past slots");
        }
        Ok(providers)
    }

    /// Administratively block or unblock a slot. Blocking clears any live
    /// hold; a consumed slot cannot be blocked.
    pub async fn set_slot_blocked(&self, slot_id: Ulid, blocked: bool) -> Result<(), SchedError> {
        for _ in 0..3 {
            let mut txn = self.txn();
            let Some(slot) = txn.read_slot(&slot_id) else {
                return Err(SchedError::NotFound(slot_id));
            };
            if slot.blocked == blocked {
                return Ok(());
            }
            if blocked && slot.appointment_id.is_some() {
                return Err(SchedError::InvalidState(slot_id));
            }
            let provider_id = slot.provider_id;
            let mut updated = slot;
            updated.blocked = blocked;
            if blocked {
                updated.clear_hold();
            }
            txn.put_slot(updated);
            txn.push_event(Event::SlotBlockSet {
                id: slot_id,
                provider_id,
                blocked,
            });

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
}
