// Worker constants (no magic values)
use std::time::Duration;

/// Sleep duration after a worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Shortest blocking wait issued against the store marker (10ms)
pub const MIN_BLOCK_DURATION_MS: i64 = 10;

/// Batch size for event stream reads
pub const EVENT_READ_COUNT: usize = 128;

/// Block duration for event stream reads (5s)
pub const EVENT_BLOCK_MS: i64 = 5_000;
