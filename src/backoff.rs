use crate::errors::ConfigError;
use rand::Rng;
use std::time::Duration;

/// Exponents above this are clamped, so the nominal delay stops growing
/// after this many failed attempts.
const MAX_EXPONENT: u32 = 20;

/// How long a failed job waits before it becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base × 2^(attempts - 1)`, perturbed uniformly within `±jitter` of
    /// that value. A zero `base` retries immediately.
    Exponential { base: Duration, jitter: f64 },
    /// The same interval after every failure, without jitter.
    Fixed(Duration),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn exponential(base: Duration, jitter: f64) -> Self {
        Backoff::Exponential { base, jitter }
    }

    pub fn fixed(interval: Duration) -> Self {
        Backoff::Fixed(interval)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Backoff::Exponential { jitter, .. } if !(0.0..=1.0).contains(&jitter) => {
                Err(ConfigError::InvalidJitter(jitter))
            }
            _ => Ok(()),
        }
    }

    /// The unperturbed delay after the `attempts`-th failed delivery.
    pub fn nominal_delay(&self, attempts: i32) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { base, .. } => {
                let exponent = u32::try_from(attempts.max(1) - 1).unwrap_or_default();
                base.saturating_mul(1 << exponent.min(MAX_EXPONENT))
            }
        }
    }

    /// The delay after the `attempts`-th failed delivery, jitter included.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        self.delay_with(attempts, &mut rand::rng())
    }

    pub(crate) fn delay_with(&self, attempts: i32, rng: &mut impl Rng) -> Duration {
        let nominal = self.nominal_delay(attempts);
        match *self {
            Backoff::Exponential { jitter, .. } if jitter > 0.0 && !nominal.is_zero() => {
                let factor = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
                nominal.mul_f64(factor)
            }
            _ => nominal,
        }
    }
}
