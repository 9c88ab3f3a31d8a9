use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a ceiling and multiplicative jitter.
///
/// `delay(n) = min(initial * multiplier^(n-1), ceiling) * U[1 - jitter, 1 + jitter]`,
/// clamped to the ceiling again after jitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    multiplier: f64,
    ceiling: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub const fn standard() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            ceiling: Duration::from_secs(10),
            jitter_ratio: 0.2,
        }
    }

    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial.max(Duration::from_millis(1));
        if self.ceiling < self.initial {
            self.ceiling = self.initial;
        }
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            1.0
        };
        self
    }

    pub fn ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling.max(self.initial);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub const fn configured_ceiling(&self) -> Duration {
        self.ceiling
    }

    pub const fn configured_jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Capped exponential value before jitter for retry `attempt` (1-based).
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let initial_nanos = self.initial.as_nanos() as f64;
        let ceiling_nanos = self.ceiling.as_nanos() as f64;
        let scaled = (initial_nanos * self.multiplier.powi(exponent)).round();
        if !scaled.is_finite() || scaled >= ceiling_nanos {
            return self.ceiling;
        }
        Duration::from_nanos(scaled.max(0.0) as u64)
    }

    /// Wait before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt);
        self.apply_jitter(base)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON || backoff.is_zero() {
            return backoff;
        }

        let low = 1.0 - self.jitter_ratio;
        let high = 1.0 + self.jitter_ratio;
        let factor = rand::rng().random_range(low..=high);
        backoff.mul_f64(factor).min(self.ceiling)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
