use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not run longer than a week.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_LISTINGS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

/// Hourly rates above this are refused at directory sync.
pub const MAX_RATE_PER_HOUR: i64 = 1_000_000_000;

/// Decimal places prices are rounded to.
pub const PRICE_SCALE: u32 = 2;
