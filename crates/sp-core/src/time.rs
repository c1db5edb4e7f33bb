//! Time utilities for sshproxy

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch for a given instant.
///
/// Instants before the epoch clamp to 0.
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Get the current Unix timestamp in seconds.
pub fn current_time_secs() -> u64 {
    unix_secs(SystemTime::now())
}

/// Elapsed time since a Unix timestamp in seconds.
///
/// Returns Duration::ZERO if the given time is in the future.
pub fn elapsed_since(since_secs: u64) -> Duration {
    Duration::from_secs(current_time_secs().saturating_sub(since_secs))
}

/// Clamp a Unix timestamp into the 32-bit field SFTP v3 carries.
pub fn wire_secs(secs: u64) -> u32 {
    u32::try_from(secs).unwrap_or(u32::MAX)
}
