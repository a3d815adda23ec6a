//! Hard input limits. Anything above these is rejected with `LimitExceeded`.

pub const MAX_TEAMS_PER_TOURNAMENT: usize = 256;
pub const MAX_TEAM_ID_LEN: usize = 128;
pub const MAX_OWNER_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;

/// Widest date range a single schedule run may walk.
pub const MAX_SCHEDULE_DAYS: i64 = 366;
pub const MAX_COURTS_PER_REQUEST: usize = 64;

/// Max entries in one manual schedule edit.
pub const MAX_BATCH_SIZE: usize = 1000;

pub const MAX_BOOKINGS_PER_DAY: usize = 1440;

/// Minutes in a day; spans never end past midnight.
pub const MINUTES_PER_DAY: u32 = 24 * 60;
