//! Retry backoff policy.
//!
//! The backoff controller is pure state: given an attempt count and a policy
//! it yields a delay and a retry-or-fatal decision. All delay computation is
//! deterministic for a given `(attempt, policy)` pair; jitter, when enabled,
//! derives from an explicit seed rather than ambient randomness, so tests can
//! pin exact delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Delay {
    /// The same delay for every attempt.
    Fixed {
        /// Delay applied to every attempt.
        #[serde(with = "crate::serde_duration")]
        delay: Duration,
    },
    /// `base * factor^attempt`, clamped to the policy cap.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "crate::serde_duration")]
        base: Duration,
        /// Growth factor per attempt.
        factor: f64,
    },
}

/// Backoff policy for reconnection and bootstrap retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Whether retrying is permitted at all. When false, the first failure
    /// is a fatal signal to the caller.
    #[serde(default = "default_retry")]
    pub retry: bool,
    /// Delay strategy.
    #[serde(default = "default_delay")]
    pub delay: Delay,
    /// Upper bound on any computed delay.
    #[serde(with = "crate::serde_duration", default = "default_cap")]
    pub cap: Duration,
    /// Maximum number of attempts (None = unbounded).
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Explicit jitter seed. When present, each delay is scaled by a
    /// deterministic factor in [0.5, 1.0] derived from `(seed, attempt)`.
    #[serde(default)]
    pub jitter_seed: Option<u64>,
}

fn default_retry() -> bool {
    true
}

fn default_delay() -> Delay {
    Delay::Exponential {
        base: Duration::from_secs(1),
        factor: 2.0,
    }
}

fn default_cap() -> Duration {
    Duration::from_secs(60)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retry: default_retry(),
            delay: default_delay(),
            cap: default_cap(),
            max_attempts: None,
            jitter_seed: None,
        }
    }
}

/// Outcome of consulting the backoff controller for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    /// Whether the caller should retry. False means the failure is fatal.
    pub should_retry: bool,
    /// Delay to wait before the retry. Zero when `should_retry` is false.
    pub delay: Duration,
}

impl BackoffDecision {
    const FATAL: Self = Self {
        should_retry: false,
        delay: Duration::ZERO,
    };
}

impl BackoffPolicy {
    /// Creates a policy that never retries.
    ///
    /// Under this policy the first failure is treated as fatal by callers.
    pub fn no_retry() -> Self {
        Self {
            retry: false,
            ..Default::default()
        }
    }

    /// Creates an exponential policy with the given base delay.
    pub fn exponential(base: Duration) -> Self {
        Self {
            delay: Delay::Exponential { base, factor: 2.0 },
            ..Default::default()
        }
    }

    /// Creates a fixed-delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay: Delay::Fixed { delay },
            ..Default::default()
        }
    }

    /// Limits the number of attempts.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Enables seeded jitter.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Decides whether attempt `attempt` (0-based) may be retried, and after
    /// what delay.
    pub fn next(&self, attempt: u32) -> BackoffDecision {
        if !self.retry {
            return BackoffDecision::FATAL;
        }
        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return BackoffDecision::FATAL;
        }

        let raw = match self.delay {
            Delay::Fixed { delay } => delay,
            Delay::Exponential { base, factor } => {
                let scaled = base.as_secs_f64() * factor.powi(attempt as i32);
                // Saturate rather than overflow for absurd attempt counts.
                if scaled >= self.cap.as_secs_f64() {
                    self.cap
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        };
        let mut delay = raw.min(self.cap);

        if let Some(seed) = self.jitter_seed {
            delay = delay.mul_f64(jitter_factor(seed, attempt));
        }

        BackoffDecision {
            should_retry: true,
            delay,
        }
    }
}

/// Deterministic jitter factor in [0.5, 1.0] for `(seed, attempt)`.
///
/// splitmix64 finalizer over the combined input. Not cryptographic; only has
/// to decorrelate retry storms while staying reproducible under a fixed seed.
fn jitter_factor(seed: u64, attempt: u32) -> f64 {
    let mut z = seed.wrapping_add(u64::from(attempt).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    0.5 + (z >> 11) as f64 / (1u64 << 53) as f64 * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_retry_is_fatal_on_first_attempt() {
        let policy = BackoffPolicy::no_retry();
        let decision = policy.next(0);
        assert!(!decision.should_retry);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn exponential_delays_are_monotonic_until_cap() {
        let policy = BackoffPolicy {
            delay: Delay::Exponential {
                base: Duration::from_millis(1000),
                factor: 2.0,
            },
            cap: Duration::from_secs(30),
            ..Default::default()
        };

        let mut previous = Duration::ZERO;
        let mut capped_at = None;
        for attempt in 0..16 {
            let decision = policy.next(attempt);
            assert!(decision.should_retry);
            assert!(decision.delay >= previous, "delay shrank at {attempt}");
            if decision.delay == policy.cap && capped_at.is_none() {
                capped_at = Some(attempt);
            }
            previous = decision.delay;
        }

        // Every attempt past the cap-reaching one stays exactly at the cap.
        let capped_at = capped_at.expect("cap never reached");
        for attempt in capped_at..capped_at + 8 {
            assert_eq!(policy.next(attempt).delay, policy.cap);
        }
    }

    #[test]
    fn exponential_sequence_matches_base_times_factor() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(1000));
        assert_eq!(policy.next(0).delay, Duration::from_millis(1000));
        assert_eq!(policy.next(1).delay, Duration::from_millis(2000));
        assert_eq!(policy.next(2).delay, Duration::from_millis(4000));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(5));
        for attempt in 0..8 {
            assert_eq!(policy.next(attempt).delay, Duration::from_secs(5));
        }
    }

    #[test]
    fn max_attempts_exhausts_budget() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100)).with_max_attempts(3);
        assert!(policy.next(0).should_retry);
        assert!(policy.next(2).should_retry);
        assert!(!policy.next(3).should_retry);
        assert!(!policy.next(7).should_retry);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(10)).with_jitter_seed(42);
        let first = policy.next(3);
        let second = policy.next(3);
        assert_eq!(first, second);
        assert!(first.delay >= Duration::from_secs(5));
        assert!(first.delay <= Duration::from_secs(10));
        // Different attempts draw different factors under the same seed.
        assert_ne!(policy.next(3).delay, policy.next(4).delay);
    }
}
