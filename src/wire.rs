use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::auth::TokenAuth;
use crate::engine::Scheduler;
use crate::limits::MAX_WIRE_LINE_LEN;
use crate::model::*;
use crate::observability as obs;

/// One JSON object per line. The first line must be `hello` with the shared
/// token; everything after that is a request/response pair, except `watch`
/// streams server-pushed `event` frames interleaved with replies.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        token: String,
    },
    CreateAccount {
        full_name: String,
        email: String,
        phone: String,
        role: Role,
    },
    ProvisionSlots {
        provider_id: Ulid,
        from_day: Ms,
        days: i64,
    },
    BlockSlot {
        slot_id: Ulid,
        blocked: bool,
    },
    Availability {
        provider_id: Ulid,
        day: Ms,
        requester_id: Ulid,
    },
    AcquireHold {
        slot_id: Ulid,
        requester_id: Ulid,
    },
    ReleaseHold {
        slot_id: Ulid,
    },
    Book {
        requester_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
    },
    Cancel {
        appointment_id: Ulid,
        actor_id: Ulid,
    },
    Complete {
        appointment_id: Ulid,
        provider_id: Ulid,
    },
    ListAppointments {
        owner_id: Ulid,
        role: Role,
    },
    Watch {
        provider_id: Ulid,
    },
    Unwatch {
        provider_id: Ulid,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error { message: String },
    Account { id: Ulid },
    Slots { slots: Vec<Slot> },
    Provisioned { created: Vec<Ulid> },
    HoldGranted { slot_id: Ulid, expires_at: Ms },
    HoldDenied { slot_id: Ulid },
    HoldLimitReached { current_holds: Vec<Slot> },
    Booked { appointment_id: Ulid },
    Appointments { appointments: Vec<Appointment> },
    Event { provider_id: Ulid, event: Event },
}

fn op_label(request: &Request) -> &'static str {
    match request {
        Request::Hello { .. } => "hello",
        Request::CreateAccount { .. } => "create_account",
        Request::ProvisionSlots { .. } => "provision_slots",
        Request::BlockSlot { .. } => "block_slot",
        Request::Availability { .. } => "availability",
        Request::AcquireHold { .. } => "acquire_hold",
        Request::ReleaseHold { .. } => "release_hold",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::Complete { .. } => "complete",
        Request::ListAppointments { .. } => "list_appointments",
        Request::Watch { .. } => "watch",
        Request::Unwatch { .. } => "unwatch",
    }
}

type WireError = Box<dyn std::error::Error + Send + Sync>;

pub async fn process_connection(
    socket: TcpStream,
    scheduler: Arc<Scheduler>,
    auth: Arc<TokenAuth>,
) -> Result<(), WireError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN));

    // Authentication handshake before anything else.
    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let first = first?;
    match serde_json::from_str::<Request>(&first) {
        Ok(Request::Hello { token }) if auth.verify(&token) => {
            send(&mut framed, &Response::Ok).await?;
        }
        Ok(Request::Hello { .. }) => {
            send(&mut framed, &Response::Error { message: "invalid token".into() }).await?;
            return Ok(());
        }
        _ => {
            send(&mut framed, &Response::Error { message: "expected hello".into() }).await?;
            return Ok(());
        }
    }

    // Watch streams forward per-provider broadcast events into one mpsc so
    // the select below stays a two-way race.
    let (event_tx, mut event_rx) = mpsc::channel::<(Ulid, Event)>(256);
    let mut watches: HashMap<Ulid, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            maybe_line = framed.next() => {
                let line = match maybe_line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        for handle in watches.values() {
                            handle.abort();
                        }
                        return Err(e.into());
                    }
                    None => break,
                };
                let request = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        send(&mut framed, &Response::Error { message: format!("bad request: {e}") }).await?;
                        continue;
                    }
                };

                let op = op_label(&request);
                let start = std::time::Instant::now();
                let response = match request {
                    Request::Watch { provider_id } => {
                        start_watch(&scheduler, &event_tx, &mut watches, provider_id);
                        Response::Ok
                    }
                    Request::Unwatch { provider_id } => {
                        if let Some(handle) = watches.remove(&provider_id) {
                            handle.abort();
                        }
                        Response::Ok
                    }
                    other => handle_request(&scheduler, other).await,
                };
                let status = if matches!(response, Response::Error { .. }) { "error" } else { "ok" };
                metrics::counter!(obs::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
                metrics::histogram!(obs::REQUEST_DURATION_SECONDS, "op" => op)
                    .record(start.elapsed().as_secs_f64());
                send(&mut framed, &response).await?;
            }
            Some((provider_id, event)) = event_rx.recv() => {
                send(&mut framed, &Response::Event { provider_id, event }).await?;
            }
        }
    }

    for handle in watches.values() {
        handle.abort();
    }
    Ok(())
}

fn start_watch(
    scheduler: &Scheduler,
    event_tx: &mpsc::Sender<(Ulid, Event)>,
    watches: &mut HashMap<Ulid, JoinHandle<()>>,
    provider_id: Ulid,
) {
    if watches.contains_key(&provider_id) {
        return;
    }
    let mut rx = scheduler.notify.subscribe(provider_id);
    let tx = event_tx.clone();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send((provider_id, event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("watch on {provider_id} lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    watches.insert(provider_id, handle);
}

async fn handle_request(scheduler: &Scheduler, request: Request) -> Response {
    match request {
        Request::Hello { .. } => Response::Error {
            message: "already authenticated".into(),
        },
        Request::CreateAccount { full_name, email, phone, role } => {
            match scheduler.create_account(full_name, email, phone, role).await {
                Ok(id) => Response::Account { id },
                Err(e) => error_response(&e),
            }
        }
        Request::ProvisionSlots { provider_id, from_day, days } => {
            match scheduler.provision_day_grid(provider_id, from_day, days).await {
                Ok(created) => Response::Provisioned { created },
                Err(e) => error_response(&e),
            }
        }
        Request::BlockSlot { slot_id, blocked } => {
            match scheduler.set_slot_blocked(slot_id, blocked).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::Availability { provider_id, day, requester_id } => Response::Slots {
            slots: scheduler.availability(provider_id, day, requester_id),
        },
        Request::AcquireHold { slot_id, requester_id } => {
            match scheduler.acquire_hold(slot_id, requester_id).await {
                Ok(HoldOutcome::Granted { slot_id, expires_at }) => {
                    Response::HoldGranted { slot_id, expires_at }
                }
                Ok(HoldOutcome::Denied { slot_id }) => Response::HoldDenied { slot_id },
                Ok(HoldOutcome::LimitReached { current_holds }) => {
                    Response::HoldLimitReached { current_holds }
                }
                Err(e) => error_response(&e),
            }
        }
        Request::ReleaseHold { slot_id } => match scheduler.release_hold(slot_id).await {
            Ok(()) => Response::Ok,
            Err(e) => error_response(&e),
        },
        Request::Book { requester_id, provider_id, service_id, slot_id } => {
            match scheduler
                .create_appointment(requester_id, provider_id, service_id, slot_id)
                .await
            {
                Ok(appointment_id) => Response::Booked { appointment_id },
                Err(e) => error_response(&e),
            }
        }
        Request::Cancel { appointment_id, actor_id } => {
            match scheduler.cancel(appointment_id, actor_id).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::Complete { appointment_id, provider_id } => {
            match scheduler.complete(appointment_id, provider_id).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::ListAppointments { owner_id, role } => Response::Appointments {
            appointments: scheduler.list_appointments(owner_id, role),
        },
        // Handled in the connection loop; unreachable here.
        Request::Watch { .. } | Request::Unwatch { .. } => Response::Ok,
    }
}

fn error_response(e: &crate::engine::SchedError) -> Response {
    Response::Error {
        message: e.to_string(),
    }
}

async fn send(
    framed: &mut Framed<TcpStream, LinesCodec>,
    response: &Response,
) -> Result<(), WireError> {
    let line = serde_json::to_string(response)?;
    framed.send(line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_from_json() {
        let slot_id = Ulid::new();
        let requester_id = Ulid::new();
        let line = format!(
            r#"{{"op":"acquire_hold","slot_id":"{slot_id}","requester_id":"{requester_id}"}}"#
        );
        let request: Request = serde_json::from_str(&line).unwrap();
        match request {
            Request::AcquireHold { slot_id: s, requester_id: r } => {
                assert_eq!(s, slot_id);
                assert_eq!(r, requester_id);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn response_serializes_with_tag() {
        let response = Response::HoldDenied { slot_id: Ulid::new() };
        let line = serde_json::to_string(&response).unwrap();
        assert!(line.contains(r#""reply":"hold_denied""#));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let result = serde_json::from_str::<Request>(r#"{"op":"drop_tables"}"#);
        assert!(result.is_err());
    }
}
