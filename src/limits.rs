pub const MAX_SERVICES: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DURATIONS_PER_SERVICE: usize = 8;
pub const MAX_BREAKS_PER_DAY: usize = 16;
pub const MAX_UNITS_PER_DAY: usize = 1440;
pub const MAX_UNITS_PER_BATCH: usize = 10_000;
pub const MAX_REFERENCE_LEN: usize = 64;
/// Widest date range a horizon or count query may cover.
pub const MAX_QUERY_DAYS: i64 = 400;
/// Upper bound on the configured booking horizon.
pub const MAX_DAYS_AHEAD: u32 = 366;
