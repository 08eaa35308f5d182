//! Operational limits and tunables. Durations are milliseconds unless the
//! name says otherwise.

use crate::model::Ms;

pub const HOUR_MS: Ms = 60 * 60 * 1000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// A granted hold lives this long before the sweeper may reclaim it.
pub const HOLD_TTL_MS: Ms = 5 * 60 * 1000;

/// At most this many hold grants per requester per rolling window.
pub const HOLD_LIMIT: u32 = 10;
pub const HOLD_WINDOW_MS: Ms = 5 * 60 * 1000;

/// Booking commit retries before giving up on a contended slot.
pub const BOOKING_MAX_ATTEMPTS: u32 = 5;
pub const BOOKING_BACKOFF_BASE_MS: u64 = 10;
pub const BOOKING_BACKOFF_JITTER_MS: u64 = 10;

/// Cancellations closer to the slot start than this keep the slot consumed.
pub const CANCEL_NOTICE_MS: Ms = 12 * HOUR_MS;

pub const SWEEP_INTERVAL_SECS: u64 = 300;
pub const PROVISION_INTERVAL_SECS: u64 = 86_400;

pub const CACHE_TTL_SECS: u64 = 600;

/// Working-day grid used by the provisioner: hourly slots, this many days out.
pub const PROVISION_DAYS: i64 = 7;
pub const GRID_START_HOUR: i64 = 9;
pub const GRID_END_HOUR: i64 = 17;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 128;
pub const MAX_SLOTS_PER_PROVIDER: usize = 4096;

pub const MAX_WIRE_LINE_LEN: usize = 16 * 1024;
