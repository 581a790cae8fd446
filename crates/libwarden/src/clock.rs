//! Time sources for the scheduler.
//!
//! All scheduling decisions (restart delays, job gating) use the monotonic
//! clock; wall-clock time only appears in log timestamps.

use std::time::{Duration, Instant};

/// The event loop wakes up at least this often, which bounds the latency
/// of time-gated jobs.
pub const TICK: Duration = Duration::from_secs(1);

pub fn now() -> Instant {
    Instant::now()
}

/// Deadline for a supervised restart. Non-positive delays (including the
/// `none` sentinel −1) disable automatic restarting.
pub fn restart_deadline(now: Instant, delay_secs: i32) -> Option<Instant> {
    if delay_secs <= 0 {
        return None;
    }
    Some(now + Duration::from_secs(delay_secs as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonpositive_delay_disables_restart() {
        let t = now();
        assert_eq!(restart_deadline(t, 0), None);
        assert_eq!(restart_deadline(t, -1), None);
    }

    #[test]
    fn positive_delay_is_added() {
        let t = now();
        assert_eq!(restart_deadline(t, 3), Some(t + Duration::from_secs(3)));
    }
}
