use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Debug)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff with ±50% jitter around the current base delay.
///
/// The first delay after a reset is `initial_delay`; each following one grows the base by
/// `multiplier`. No delay, jitter included, exceeds `max_delay`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_rng(settings: BackoffSettings, rng: StdRng) -> Self {
        Self {
            current_base: settings.initial_delay,
            settings,
            rng,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = self.settings.initial_delay;
    }

    /// The next retry waits the maximum delay; used after `ResourceExhausted`.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = self.rng.gen_range(-0.5..=0.5) * self.current_base.as_secs_f64();
        let delay = Duration::from_secs_f64((self.current_base.as_secs_f64() + jitter).max(0.0))
            .min(self.settings.max_delay);

        self.current_base = self
            .current_base
            .mul_f64(self.settings.multiplier)
            .min(self.settings.max_delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::with_rng(
            BackoffSettings {
                initial_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_delay: Duration::from_millis(500),
            },
            StdRng::seed_from_u64(7),
        )
    }

    fn within_jitter(delay: Duration, base_ms: f64) -> bool {
        let delay = delay.as_secs_f64() * 1000.0;
        delay >= base_ms * 0.5 - 1e-6 && delay <= (base_ms * 1.5).min(500.0) + 1e-6
    }

    #[test]
    fn grows_within_jitter_bounds_and_caps() {
        let mut backoff = backoff();
        let mut base = 100.0;
        for _ in 0..7 {
            let delay = backoff.next_delay();
            assert!(within_jitter(delay, base), "{delay:?} vs {base}");
            base = (base * 2.0f64).min(500.0);
        }
    }

    #[test]
    fn reset_restarts_at_initial_delay() {
        let mut backoff = backoff();
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(within_jitter(backoff.next_delay(), 100.0));
    }

    #[test]
    fn reset_to_max_never_exceeds_max() {
        for seed in 0..200 {
            let mut backoff = ExponentialBackoff::with_rng(
                BackoffSettings {
                    initial_delay: Duration::from_millis(100),
                    multiplier: 2.0,
                    max_delay: Duration::from_millis(500),
                },
                StdRng::seed_from_u64(seed),
            );
            for _ in 0..10 {
                assert!(backoff.next_delay() <= Duration::from_millis(500));
            }
            backoff.reset_to_max();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(250), "{delay:?}");
            assert!(delay <= Duration::from_millis(500), "{delay:?}");
        }
    }
}
