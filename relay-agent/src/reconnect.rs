//! Explicit reconnect state machine and backoff schedule.
//!
//! Grounded on the outer retry loop the original Tauri agent used
//! (connect, register, run until disconnect, sleep, repeat), made
//! explicit as a named state machine with a tiered backoff that climbs
//! with consecutive failures, modulated by how recently the agent last
//! held a healthy session.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentConnectionState {
    Idle,
    Dialing,
    Registered,
    Running,
    Failing,
    Backoff,
}

/// A recent success (within this long) clamps the next delay down,
/// since a session that was healthy a moment ago is likely to recover.
const RECENT_SUCCESS_WINDOW: Duration = Duration::from_secs(3600);
const RECENT_SUCCESS_CAP: Duration = Duration::from_secs(30);
/// A success this stale no longer earns the short-delay clamp; instead
/// the delay is doubled, up to this cap, since the relay or network may
/// be down for a while rather than mid-reconnect.
const STALE_SUCCESS_WINDOW: Duration = Duration::from_secs(6 * 3600);
const STALE_SUCCESS_CAP: Duration = Duration::from_secs(300);

/// Tracks consecutive connection failures and the delay before retrying.
pub struct Backoff {
    consecutive_failures: u32,
    last_success: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_success: None,
        }
    }

    /// Call when a session registers successfully and starts serving.
    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.last_success = Some(now);
    }

    /// Call when a dial, registration, or running session fails. Returns
    /// the delay to wait before the next attempt.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let tiered = Self::tiered_delay(self.consecutive_failures);
        Self::modulate(tiered, self.last_success, now)
    }

    /// Attempt 1-3 back off individually (5s/10s/15s), then the schedule
    /// flattens into widening plateaus out to a 120s ceiling.
    fn tiered_delay(attempt: u32) -> Duration {
        match attempt {
            1 => Duration::from_secs(5),
            2 => Duration::from_secs(10),
            3 => Duration::from_secs(15),
            4..=10 => Duration::from_secs(30),
            11..=30 => Duration::from_secs(60),
            _ => Duration::from_secs(120),
        }
    }

    fn modulate(delay: Duration, last_success: Option<Instant>, now: Instant) -> Duration {
        let Some(last) = last_success else {
            return delay;
        };
        let since = now.duration_since(last);
        if since < RECENT_SUCCESS_WINDOW {
            delay.min(RECENT_SUCCESS_CAP)
        } else if since > STALE_SUCCESS_WINDOW {
            (delay * 2).min(STALE_SUCCESS_CAP)
        } else {
            delay
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the tunnel id to register with on a given reconnect attempt
/// (1-indexed). The first attempt keeps the operator-configured id
/// verbatim; every attempt after that mints a fresh
/// `<subdomain-or-"tunnel">_<unix-seconds>` id.
pub fn tunnel_id_for_attempt(configured_id: &str, subdomain: Option<&str>, attempt: u32, unix_seconds: i64) -> String {
    if attempt <= 1 {
        return configured_id.to_string();
    }
    let label = subdomain.unwrap_or("tunnel");
    format!("{label}_{unix_seconds}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_first_three_attempts_back_off_individually() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        assert_eq!(backoff.record_failure(now), Duration::from_secs(5));
        assert_eq!(backoff.record_failure(now), Duration::from_secs(10));
        assert_eq!(backoff.record_failure(now), Duration::from_secs(15));
    }

    #[test]
    fn attempts_four_through_ten_plateau_at_thirty_seconds() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        for _ in 0..3 {
            backoff.record_failure(now);
        }
        for _ in 0..7 {
            assert_eq!(backoff.record_failure(now), Duration::from_secs(30));
        }
    }

    #[test]
    fn attempts_eleven_through_thirty_plateau_at_sixty_seconds() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        for _ in 0..10 {
            backoff.record_failure(now);
        }
        for _ in 0..20 {
            assert_eq!(backoff.record_failure(now), Duration::from_secs(60));
        }
    }

    #[test]
    fn attempts_past_thirty_cap_at_120_seconds() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        for _ in 0..30 {
            backoff.record_failure(now);
        }
        assert_eq!(backoff.record_failure(now), Duration::from_secs(120));
        assert_eq!(backoff.record_failure(now), Duration::from_secs(120));
    }

    #[test]
    fn a_recent_success_clamps_the_delay_to_thirty_seconds() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        for _ in 0..15 {
            backoff.record_failure(t0);
        }
        backoff.record_success(t0);

        let soon_after = t0 + Duration::from_secs(10);
        // Tier for attempt 1 (5s) stays under the 30s clamp untouched...
        assert_eq!(backoff.record_failure(soon_after), Duration::from_secs(5));
        // ...but a later attempt whose tier exceeds 30s gets clamped down.
        for _ in 0..10 {
            backoff.record_failure(soon_after);
        }
        assert_eq!(backoff.record_failure(soon_after), Duration::from_secs(30));
    }

    #[test]
    fn a_stale_success_doubles_the_delay_up_to_the_five_minute_cap() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        backoff.record_success(t0);

        let much_later = t0 + STALE_SUCCESS_WINDOW + Duration::from_secs(1);
        assert_eq!(backoff.record_failure(much_later), Duration::from_secs(10));

        for _ in 0..40 {
            backoff.record_failure(much_later);
        }
        assert_eq!(backoff.record_failure(much_later), STALE_SUCCESS_CAP);
    }

    #[test]
    fn no_prior_success_leaves_the_tiered_schedule_unmodulated() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        for _ in 0..30 {
            backoff.record_failure(now);
        }
        assert_eq!(backoff.record_failure(now), Duration::from_secs(120));
    }

    #[test]
    fn the_first_attempt_keeps_the_configured_tunnel_id() {
        assert_eq!(tunnel_id_for_attempt("alpha", Some("alpha"), 1, 1_700_000_000), "alpha");
    }

    #[test]
    fn a_reconnect_mints_a_fresh_id_from_the_subdomain_and_unix_seconds() {
        assert_eq!(
            tunnel_id_for_attempt("alpha", Some("alpha"), 2, 1_700_000_000),
            "alpha_1700000000"
        );
    }

    #[test]
    fn a_reconnect_with_no_subdomain_falls_back_to_the_tunnel_label() {
        assert_eq!(tunnel_id_for_attempt("alpha", None, 3, 42), "tunnel_42");
    }
}
