mod booking;
mod error;
mod holds;
mod provision;
mod queries;
mod store;
#[cfg(test)]
mod tests;
mod txn;

pub use error::SchedError;
pub use holds::HoldLimiter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use ulid::Ulid;

use crate::cache::{self, TtlCache};
use crate::model::*;
use crate::notify::{Dispatcher, NotifyHub};
use crate::wal::Wal;

use store::Store;
use txn::Txn;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    /// One transaction's events, appended and fsynced atomically with
    /// whatever else is in the batch window.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking core: slot store, lock manager, hold limiter, and the
/// transactional workflows, all backed by one WAL.
pub struct Scheduler {
    pub(crate) store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub cache: Arc<TtlCache>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) limiter: HoldLimiter,
    /// Serializes commit validation + apply. Reads stay lock-free; conflicts
    /// are detected by version comparison, not by holding this across reads.
    commit_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        wal_path: PathBuf,
        cache: Arc<TtlCache>,
        notify: Arc<NotifyHub>,
        dispatcher: Arc<Dispatcher>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        for event in &events {
            store.apply_event(event);
        }

        Ok(Self {
            store,
            wal_tx,
            notify,
            cache,
            dispatcher,
            limiter: HoldLimiter::new(),
            commit_lock: Mutex::new(()),
        })
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), SchedError> {
        if events.is_empty() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| SchedError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| SchedError::WalError(e.to_string()))
    }

    pub(super) fn txn(&self) -> Txn<'_> {
        Txn::new(&self.store)
    }

    /// Validate, persist, apply. Version re-validation and apply happen under
    /// the commit lock, so a transaction whose reads went stale between its
    /// snapshot and this point fails with `WriteConflict` instead of
    /// clobbering the concurrent winner.
    pub(super) async fn commit(&self, txn: Txn<'_>) -> Result<(), SchedError> {
        let _guard = self.commit_lock.lock().await;

        if !txn.reads_valid() {
            metrics::counter!(crate::observability::WRITE_CONFLICTS_TOTAL).increment(1);
            return Err(SchedError::WriteConflict);
        }

        // Durable first, then visible.
        self.wal_append(&txn.events).await?;

        for account in txn.account_writes {
            self.store.put_account(account);
        }
        for slot in txn.slot_writes {
            self.store.put_slot(slot);
        }
        for id in &txn.slot_deletes {
            self.store.remove_slot(id);
        }
        for appointment in txn.appointment_writes {
            self.store.put_appointment(appointment);
        }
        for id in &txn.appointment_deletes {
            self.store.remove_appointment(id);
        }
        for event in &txn.events {
            if let Some(provider_id) = event.provider_id() {
                self.notify.send(provider_id, event);
            }
        }
        Ok(())
    }

    /// Delete (never update) the cache keys a mutation invalidates. Failure
    /// here can only leave a stale read until the TTL expires, so callers
    /// run this post-commit and ignore it for the operation's outcome.
    pub(crate) fn invalidate_caches(&self, provider_id: Ulid, requester_id: Option<Ulid>) {
        self.cache.delete(&cache::provider_availability_key(&provider_id));
        self.cache.delete(&cache::provider_appointments_key(&provider_id));
        if let Some(requester_id) = requester_id {
            self.cache.delete(&cache::requester_appointments_key(&requester_id));
        }
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. The snapshot and the enqueue of the
    /// rewrite both happen under the commit lock: nothing can commit
    /// between them, and any commit after the lock drops lands behind the
    /// Compact command in the writer queue, so it appends to the swapped
    /// file rather than vanishing into the replaced one.
    pub async fn compact_wal(&self) -> Result<(), SchedError> {
        let guard = self.commit_lock.lock().await;
        let mut events = Vec::new();

        for account in self.store.all_accounts() {
            events.push(Event::AccountCreated {
                id: account.id,
                full_name: account.full_name,
                email: account.email,
                phone: account.phone,
                role: account.role,
            });
        }

        for slot in self.store.slots_where(|_| true) {
            events.push(Event::SlotCreated {
                id: slot.id,
                provider_id: slot.provider_id,
                day: slot.day,
                start: slot.start,
                end: slot.end,
            });
            if slot.blocked {
                events.push(Event::SlotBlockSet {
                    id: slot.id,
                    provider_id: slot.provider_id,
                    blocked: true,
                });
            }
            if let (Some(requester_id), Some(expires_at)) = (slot.held_by, slot.hold_expires_at) {
                events.push(Event::HoldAcquired {
                    slot_id: slot.id,
                    provider_id: slot.provider_id,
                    requester_id,
                    expires_at,
                });
            }
        }

        for appointment in self.store.all_appointments() {
            events.push(Event::AppointmentBooked {
                id: appointment.id,
                requester_id: appointment.requester_id,
                provider_id: appointment.provider_id,
                service_id: appointment.service_id,
                slot_id: appointment.slot_id,
            });
            match appointment.status {
                AppointmentStatus::Booked => {}
                AppointmentStatus::Cancelled => events.push(Event::AppointmentCancelled {
                    id: appointment.id,
                    provider_id: appointment.provider_id,
                    requester_id: appointment.requester_id,
                }),
                AppointmentStatus::Completed => events.push(Event::AppointmentCompleted {
                    id: appointment.id,
                    provider_id: appointment.provider_id,
                    requester_id: appointment.requester_id,
                }),
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedError::WalError("WAL writer shut down".into()))?;
        drop(guard);
        rx.await
            .map_err(|_| SchedError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| SchedError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
