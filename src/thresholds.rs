//! Tuning constants shared by the scheduler, matcher and store.
//!
//! Confidence weights sum to 1.0: time proximity + runtime agreement + level baseline.

/// Matching: weight of timestamp proximity (linear decay across the window)
pub const TIME_WEIGHT: f64 = 0.4;

/// Matching: weight of elapsed-time agreement
pub const RUNTIME_WEIGHT: f64 = 0.4;

/// Matching: flat credit for passing the exact-level filter
pub const LEVEL_BASELINE: f64 = 0.2;

/// Matching: elapsed times further apart than this contribute nothing
pub const RUNTIME_TOLERANCE_MS: i64 = 5_000;

/// Matching: default window around a completion timestamp
pub const MATCH_WINDOW_SECS: i64 = 24 * 3600;

/// Batch fallback: slack before a report's start
pub const REPORT_PRE_BUFFER_SECS: i64 = 15 * 60;

/// Batch fallback: slack after a report's end
pub const REPORT_POST_BUFFER_SECS: i64 = 30 * 60;

/// Runs requested per character from the log source
pub const CHARACTER_RUN_LIMIT: usize = 10;

/// Scheduler: default poll interval
pub const POLL_INTERVAL_SECS: u64 = 5 * 60;

/// Scheduler: default cap on simultaneous profile fetches
pub const MAX_CONCURRENT_FETCHES: usize = 4;

/// Scheduler: jitter is uniform in [0, interval / JITTER_DIVISOR)
pub const JITTER_DIVISOR: u32 = 10;

/// Store: quiet period before dirty state is copied to disk
pub const FLUSH_DEBOUNCE_MS: u64 = 5_000;

/// Store: upper bound for a single scheduled flush
pub const FLUSH_TIMEOUT_SECS: u64 = 30;

/// Log source: refresh the bearer token this long before it expires
pub const TOKEN_REFRESH_MARGIN_SECS: u64 = 30;

/// Log source: assumed token lifetime when the server omits one
pub const TOKEN_DEFAULT_TTL_SECS: u64 = 5 * 60;
