use crate::model::Ms;

/// Default sitting length when a search or booking does not name one.
pub const DEFAULT_DURATION_MINUTES: u32 = 120;

pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_GUESTS: u32 = 1_000;
pub const MAX_TABLE_CAPACITY: u32 = 1_000;

pub const MAX_TABLES_PER_VENUE: usize = 1_000;
pub const MAX_RESERVATIONS_PER_TABLE: usize = 100_000;

pub const MAX_FIELD_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;

pub const MAX_VENUES: usize = 1_024;
pub const MAX_VENUE_NAME_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
