use crate::model::Ms;

pub const MAX_CLASSES: usize = 100_000;
pub const MAX_CAPACITY: u32 = 10_000;
pub const MAX_WAITLIST_PER_CLASS: usize = 1_000;
pub const MAX_BOOKINGS_PER_CLASS: usize = 50_000;
pub const MAX_SESSION_DURATION_MS: Ms = 86_400_000;
/// Session times must fall between the epoch and the end of year 9999 UTC.
pub const MIN_TIMESTAMP_MS: Ms = 0;
pub const MAX_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_IDEMPOTENCY_KEYS: usize = 100_000;
pub const MAX_IDEMPOTENCY_KEYS_PER_SCOPE: usize = 1_000;
/// How long a completed request stays replayable under its key.
pub const IDEMPOTENCY_TTL_MS: Ms = 86_400_000;

/// Attempts to re-resolve a class that was replaced between lookup and lock.
pub const MAX_STALE_RETRIES: usize = 3;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
