use crate::model::Ms;

pub const HOUR_MS: Ms = 3_600_000;
pub const MINUTE_MS: Ms = 60_000;

// ── Time bounds ──────────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Longest single reservation or availability window: 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * HOUR_MS;
/// Widest range accepted by listing queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * HOUR_MS;

// ── Cardinality ──────────────────────────────────────────────────

pub const MAX_VEHICLES: usize = 1_000_000;
pub const MAX_WINDOWS_PER_VEHICLE: usize = 10_000;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 100_000;
pub const MAX_HANDOVER_IMAGES: usize = 32;

// ── Field lengths ────────────────────────────────────────────────

pub const MAX_LOCATION_LEN: usize = 512;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REPORT_LEN: usize = 8192;
pub const MAX_IMAGE_REF_LEN: usize = 1024;

// ── Money ────────────────────────────────────────────────────────

/// Upper bound for any single per-unit price, in whole currency units.
pub const MAX_UNIT_PRICE: i64 = 1_000_000_000;
pub const MAX_DISTANCE_KM: f64 = 1_000_000.0;
pub const MAX_FUEL_LITERS: f64 = 10_000.0;

// ── Handover codes ───────────────────────────────────────────────

pub const DEFAULT_OTP_TTL_MS: Ms = 10 * MINUTE_MS;
pub const DEFAULT_OTP_CAPACITY: usize = 100_000;
/// Failed guesses allowed against one live challenge before it is purged.
pub const MAX_OTP_ATTEMPTS: u8 = 5;
pub const OTP_DIGITS: usize = 6;
