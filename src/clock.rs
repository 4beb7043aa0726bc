use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the process epoch, monotonic.
pub fn monotonic() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Seconds since the unix epoch.
pub fn unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Milliseconds since the unix epoch, the unit of the JSON `ts` field.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
