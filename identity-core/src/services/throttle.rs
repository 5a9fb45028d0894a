use governor::{
    clock::{Clock as _, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, time::Duration};

use crate::config::RateLimitSettings;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Per-key attempt limiter in front of credential and code verification.
///
/// Allows `login_attempts` in a burst, refilling evenly over the window.
pub struct LoginThrottle {
    limiter: KeyedLimiter,
    clock: DefaultClock,
}

impl LoginThrottle {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let attempts = settings.login_attempts.max(1);
        let burst = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_millis(
            (settings.login_window_seconds.saturating_mul(1000)) / attempts as u64,
        );

        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: RateLimiter::dashmap(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Keys are case-insensitive. On rejection returns seconds until the next
    /// attempt is allowed (at least 1).
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let key = key.to_lowercase();
        self.limiter.check_key(&key).map_err(|negative| {
            negative
                .wait_time_from(self.clock.now())
                .as_secs()
                .max(1)
        })
    }

    /// Forgets keys whose allowance has fully refilled. Returns how many
    /// keys are still tracked.
    pub fn prune(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(attempts: u32) -> LoginThrottle {
        throttle_over(attempts, 900)
    }

    fn throttle_over(attempts: u32, window_seconds: u64) -> LoginThrottle {
        LoginThrottle::new(&RateLimitSettings {
            login_attempts: attempts,
            login_window_seconds: window_seconds,
        })
    }

    #[test]
    fn allows_burst_then_rejects() {
        let t = throttle(3);
        for _ in 0..3 {
            assert!(t.check("admin").is_ok());
        }

        let retry = t.check("ADMIN").unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn keys_are_independent() {
        let t = throttle(1);
        assert!(t.check("admin").is_ok());
        assert!(t.check("admin").is_err());
        assert!(t.check("alice").is_ok());
    }

    #[test]
    fn prune_drops_keys_that_have_refilled() {
        let t = throttle_over(1, 1);
        for i in 0..50 {
            assert!(t.check(&format!("sprayed-{}", i)).is_ok());
        }
        assert_eq!(t.prune(), 50);

        std::thread::sleep(Duration::from_millis(1200));
        assert!(t.check("admin").is_ok());

        // Only the key touched inside the window survives.
        assert_eq!(t.prune(), 1);
        assert!(t.check("admin").is_err());
    }
}
