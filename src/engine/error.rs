use ulid::Ulid;

#[derive(Debug)]
pub enum SchedError {
    /// Business rejection: slot taken, blocked, or the hold expired. Never retried.
    SlotUnavailable(Ulid),
    /// Optimistic-concurrency failure: a concurrent commit touched a document
    /// this transaction read. Retried internally, never surfaced.
    WriteConflict,
    /// A booking gave up after exhausting its conflict-retry budget.
    RetriesExhausted,
    /// Actor is neither the owning requester nor the assigned provider.
    NotAuthorized(Ulid),
    /// Appointment is not in the status the operation requires.
    InvalidState(Ulid),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl SchedError {
    /// True only for genuine optimistic-concurrency failures — the retry
    /// loop in the booking workflow must not retry business rejections.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedError::WriteConflict)
    }
}

impl std::fmt::Display for SchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedError::SlotUnavailable(id) => {
                write!(f, "slot {id} is no longer available")
            }
            SchedError::WriteConflict => write!(f, "write conflict"),
            SchedError::RetriesExhausted => {
                write!(f, "booking failed: retries exhausted")
            }
            SchedError::NotAuthorized(id) => write!(f, "not authorized: {id}"),
            SchedError::InvalidState(id) => {
                write!(f, "appointment {id} is not in a valid state for this operation")
            }
            SchedError::NotFound(id) => write!(f, "not found: {id}"),
            SchedError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SchedError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for SchedError {}
