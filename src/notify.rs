use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const QUEUE_CAPACITY: usize = 1024;
const DELIVERY_ATTEMPTS: u32 = 3;

/// Broadcast hub for real-time watchers, one channel per provider. Every
/// committed event lands here; callers that opened a watch stream receive it.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a provider. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is watching.
    pub fn send(&self, provider_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(event.clone());
        }
    }

}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── External notification collaborator ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    BookingConfirmed,
    AppointmentCancelled,
    AppointmentCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    pub phone: String,
}

/// What the notification collaborator consumes. Message content and delivery
/// channel (email/SMS/calendar) are its problem, not ours.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub appointment_id: Ulid,
    pub recipients: Vec<Contact>,
}

/// Delivery seam for the external notification collaborator.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

/// Default sink: log the notification. Stands in for the real email/SMS
/// gateway in development and tests.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        tracing::info!(
            "notify {:?} appointment={} recipients={}",
            notification.kind,
            notification.appointment_id,
            notification.recipients.len()
        );
        Ok(())
    }
}

/// Fire-and-forget queue in front of the sink. Enqueue never blocks and
/// never fails the caller; delivery is retried independently of the
/// workflow that emitted the notification.
pub struct Dispatcher {
    tx: mpsc::Sender<Notification>,
}

impl Dispatcher {
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(delivery_loop(sink, rx));
        Arc::new(Self { tx })
    }

    pub fn enqueue(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            // Queue full or dispatcher gone — the booking already committed,
            // so this is loggable loss, not an error for the caller.
            warn!("notification dropped: {e}");
        }
    }
}

async fn delivery_loop(sink: Arc<dyn NotificationSink>, mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let mut delivered = false;
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match sink.deliver(&notification).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    debug!(
                        "delivery attempt {attempt} failed for appointment {}: {e}",
                        notification.appointment_id
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
            }
        }
        if !delivered {
            warn!(
                "giving up on notification for appointment {}",
                notification.appointment_id
            );
        }
    }
}
