use crate::model::Ms;

const MINUTE_MS: Ms = 60_000;
const HOUR_MS: Ms = 60 * MINUTE_MS;
const DAY_MS: Ms = 24 * HOUR_MS;

/// Earliest instant the engine accepts (Unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Latest instant the engine accepts (end of year 9999).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single availability occurrence may not span more than 31 days.
pub const MAX_ENTRY_DURATION_MS: Ms = 31 * DAY_MS;
/// Appointments are capped at 8 hours.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = 8 * HOUR_MS;
/// Listing queries may cover at most one leap year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_RECURRENCE_COUNT: u32 = 366;
pub const MAX_PROVIDERS: usize = 100_000;
pub const MAX_LEDGER_INTERVALS_PER_PROVIDER: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 100_000;

pub const MAX_VISIT_TYPE_LEN: usize = 100;
pub const MAX_REASON_LEN: usize = 1_000;
pub const MAX_ENTRY_REASON_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 2_000;
