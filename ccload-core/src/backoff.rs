//! Pure exponential-backoff policy for channel/key cooldowns (spec §4.A).
//!
//! `next_duration` is the single source of truth for cooldown progression; both the
//! channel-level and key-level cooldown engines (`db::cooldown`) call it with their
//! own prior state and must never reimplement the doubling/reset rule locally.

use std::time::Duration;

const INIT_AUTH: Duration = Duration::from_secs(5 * 60);
const INIT_SERVER: Duration = Duration::from_secs(2 * 60);
const INIT_OTHER: Duration = Duration::from_secs(10);
const MAX: Duration = Duration::from_secs(30 * 60);

/// Computes the next cooldown duration given the previous duration (milliseconds,
/// 0 if never cooled), the previous cooldown deadline (unix seconds, 0 if never set),
/// the current time (unix seconds), and the HTTP status code that triggered the bump.
pub fn next_duration(prev_ms: i64, prev_deadline: i64, now: i64, status: u16) -> Duration {
    let still_cooling = prev_deadline > now;
    let has_prior = prev_ms > 0;

    if still_cooling || has_prior {
        let doubled = prev_ms.max(0).saturating_mul(2);
        let doubled = Duration::from_millis(doubled as u64);
        return doubled.min(MAX);
    }

    initial_for(status)
}

fn initial_for(status: u16) -> Duration {
    match status {
        401 | 403 => INIT_AUTH,
        500..=599 => INIT_SERVER,
        _ => INIT_OTHER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_offense_by_status_class() {
        assert_eq!(next_duration(0, 0, 1000, 401), INIT_AUTH);
        assert_eq!(next_duration(0, 0, 1000, 403), INIT_AUTH);
        assert_eq!(next_duration(0, 0, 1000, 500), INIT_SERVER);
        assert_eq!(next_duration(0, 0, 1000, 502), INIT_SERVER);
        assert_eq!(next_duration(0, 0, 1000, 504), INIT_SERVER);
        assert_eq!(next_duration(0, 0, 1000, 429), INIT_OTHER);
        assert_eq!(next_duration(0, 0, 1000, 418), INIT_OTHER);
    }

    #[test]
    fn repeated_401_doubles_and_clamps() {
        let t0 = 1_000_000i64;
        let d1 = next_duration(0, 0, t0, 401);
        assert_eq!(d1, Duration::from_secs(300));

        // t0 + 6min, still within the 5min cooldown window only if called before it
        // elapses; the sequence in the spec calls again after the deadline passes,
        // driven by `prev_ms > 0` rather than `still_cooling`.
        let t1 = t0 + 6 * 60;
        let d2 = next_duration(d1.as_millis() as i64, t0 + 300, t1, 401);
        assert_eq!(d2, Duration::from_secs(600));

        let t2 = t1 + 17 * 60;
        let d3 = next_duration(d2.as_millis() as i64, t1 + 600, t2, 500);
        assert_eq!(d3, Duration::from_secs(1200));

        let t3 = t2 + 21 * 60;
        let d4 = next_duration(d3.as_millis() as i64, t2 + 1200, t3, 401);
        assert_eq!(d4, MAX);

        let t4 = t3 + 31 * 60;
        let d5 = next_duration(d4.as_millis() as i64, t3 + 1800, t4, 401);
        assert_eq!(d5, MAX);
    }

    #[test]
    fn mixed_status_does_not_reset() {
        // A prior 500 -> 2min, a later 401 doubles rather than reset to 5min.
        let t0 = 10_000i64;
        let d1 = next_duration(0, 0, t0, 500);
        assert_eq!(d1, INIT_SERVER);

        let t1 = t0 + INIT_SERVER.as_secs() as i64 + 60;
        let d2 = next_duration(
            d1.as_millis() as i64,
            t0 + INIT_SERVER.as_secs() as i64,
            t1,
            401,
        );
        assert_eq!(d2, Duration::from_secs(4 * 60));
    }

    #[test]
    fn channel_and_key_sequences_agree_from_zero() {
        let t0 = 42i64;
        for status in [401u16, 403, 429, 500, 502, 504] {
            let channel = next_duration(0, 0, t0, status);
            let key = next_duration(0, 0, t0, status);
            assert_eq!(channel, key);
        }
    }

    #[test]
    fn still_cooling_doubles_even_without_new_status_class_match() {
        // Still within a cooldown window: doubling applies regardless of prev_ms
        // being 0, as long as the deadline is in the future (can happen after a
        // Set<Level>Cooldown call that doesn't populate duration_ms directly for the
        // *next* bump's initial reasoning — the engine always stores duration_ms
        // alongside deadline, so this models defensive behavior for callers that
        // bump while still cooling).
        let now = 100i64;
        let got = next_duration(5000, now + 50, now, 429);
        assert_eq!(got, Duration::from_millis(10_000));
    }
}
