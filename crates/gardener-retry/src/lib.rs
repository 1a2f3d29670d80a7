//! Retry strategies and backoff policies for gardener's I/O boundaries.
//!
//! Every suspension point in the bot (backend I/O, forge calls, upstream
//! probes, subprocess waits) retries transient failures through this crate,
//! honoring a deadline and a cooperative cancellation flag so a wall-clock
//! budget can hard-stop the run at the next suspension point.
//!
//! # Example
//!
//! ```
//! use gardener_retry::{BackoffPolicy, RetryConfig, delay_for_attempt};
//!
//! let config = BackoffPolicy::StoreIo.to_config();
//! let delay = delay_for_attempt(&config, 2);
//! assert!(delay <= config.max_delay.mul_f64(1.0 + config.jitter));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Predefined policies for the bot's three retry-heavy boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Graph-store backend I/O: base 1 s, factor 2, cap 60 s, 6 attempts.
    #[default]
    StoreIo,
    /// Forge API and git plumbing: fewer, slower attempts.
    Forge,
    /// Upstream probes: quick attempts, failure is recorded, not fatal.
    Probe,
    /// Fully custom configuration.
    Custom,
}

impl BackoffPolicy {
    pub fn to_config(&self) -> RetryConfig {
        match self {
            BackoffPolicy::StoreIo => RetryConfig {
                kind: BackoffKind::Exponential,
                max_attempts: 6,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter: 0.5,
            },
            BackoffPolicy::Forge => RetryConfig {
                kind: BackoffKind::Exponential,
                max_attempts: 4,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            BackoffPolicy::Probe => RetryConfig {
                kind: BackoffKind::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(15),
                jitter: 0.3,
            },
            BackoffPolicy::Custom => RetryConfig::default(),
        }
    }
}

/// Configuration for one retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub kind: BackoffKind,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor: 0.5 means the delay lands in [0.5x, 1.5x].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryConfig {
    fn default() -> Self {
        BackoffPolicy::StoreIo.to_config()
    }
}

/// Whether a failure is worth another attempt.
///
/// `Permanent` errors return immediately; `Transient` and `Ambiguous` retry
/// until attempts run out. The distinction between the latter two matters to
/// callers (an ambiguous forge write must be re-checked, not re-sent), not to
/// the backoff loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    #[default]
    Transient,
    Ambiguous,
    Permanent,
}

/// Compute the (jittered) delay before the given attempt. Attempts are
/// 1-indexed; the delay is what to sleep after attempt `n` fails.
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = match config.kind {
        BackoffKind::Immediate => Duration::ZERO,
        BackoffKind::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffKind::Linear => config.base_delay.saturating_mul(attempt),
        BackoffKind::Constant => config.base_delay,
    };

    let capped = raw.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let mut rng = rand::rng();
    let random: f64 = rng.random();
    let factor = 1.0 - jitter + random * 2.0 * jitter;
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// Cooperative cancellation flag shared between the run loop and signal
/// handling. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a retry loop gave up before its operation succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUp<E> {
    /// The last error, after `max_attempts` failures or a permanent error.
    Exhausted(E),
    /// The cancel token fired or the deadline passed between attempts.
    Interrupted,
}

/// A retry loop bound to a deadline and a cancellation token.
///
/// The deadline and token are consulted before every attempt and before
/// every sleep, so cancellation takes effect at the next suspension point
/// rather than mid-I/O.
pub struct RetryLoop {
    config: RetryConfig,
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl RetryLoop {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            deadline: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn from_policy(policy: BackoffPolicy) -> Self {
        Self::new(policy.to_config())
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn interrupted(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Run a fallible operation. The closure receives the 1-indexed attempt
    /// number and returns the result plus a [`RetryClass`] on failure.
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, GiveUp<E>>
    where
        F: FnMut(u32) -> Result<T, (E, RetryClass)>,
    {
        let mut attempt = 0;

        loop {
            if self.interrupted() {
                return Err(GiveUp::Interrupted);
            }
            attempt += 1;

            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err((err, RetryClass::Permanent)) => return Err(GiveUp::Exhausted(err)),
                Err((err, _)) => {
                    if attempt >= self.config.max_attempts {
                        return Err(GiveUp::Exhausted(err));
                    }
                    let mut delay = delay_for_attempt(&self.config, attempt);
                    if let Some(deadline) = self.deadline {
                        let left = deadline.saturating_duration_since(Instant::now());
                        if left.is_zero() {
                            return Err(GiveUp::Interrupted);
                        }
                        delay = delay.min(left);
                    }
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_jitter(kind: BackoffKind, base: Duration, max: Duration) -> RetryConfig {
        RetryConfig {
            kind,
            max_attempts: 10,
            base_delay: base,
            max_delay: max,
            jitter: 0.0,
        }
    }

    #[test]
    fn store_io_policy_matches_the_store_contract() {
        let config = BackoffPolicy::StoreIo.to_config();
        assert_eq!(config.kind, BackoffKind::Exponential);
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn exponential_doubles_until_the_cap() {
        let config = no_jitter(
            BackoffKind::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&config, 7), Duration::from_secs(60));
    }

    #[test]
    fn linear_and_constant_behave() {
        let linear = no_jitter(
            BackoffKind::Linear,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        assert_eq!(delay_for_attempt(&linear, 3), Duration::from_secs(3));
        assert_eq!(delay_for_attempt(&linear, 9), Duration::from_secs(5));

        let constant = no_jitter(
            BackoffKind::Constant,
            Duration::from_secs(2),
            Duration::from_secs(5),
        );
        assert_eq!(delay_for_attempt(&constant, 1), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&constant, 8), Duration::from_secs(2));
    }

    #[test]
    fn immediate_never_sleeps() {
        let config = no_jitter(
            BackoffKind::Immediate,
            Duration::from_secs(9),
            Duration::from_secs(9),
        );
        assert_eq!(delay_for_attempt(&config, 4), Duration::ZERO);
    }

    #[test]
    fn retry_loop_succeeds_after_transient_failures() {
        let retry = RetryLoop::new(RetryConfig {
            kind: BackoffKind::Immediate,
            max_attempts: 5,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        });

        let mut seen = 0;
        let result = retry.run(|attempt| {
            seen = attempt;
            if attempt < 3 {
                Err(("flaky", RetryClass::Transient))
            } else {
                Ok("ok")
            }
        });

        assert_eq!(result, Ok("ok"));
        assert_eq!(seen, 3);
    }

    #[test]
    fn retry_loop_stops_on_permanent_error() {
        let retry = RetryLoop::new(RetryConfig {
            kind: BackoffKind::Immediate,
            max_attempts: 5,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        });

        let mut attempts = 0;
        let result: Result<(), _> = retry.run(|_| {
            attempts += 1;
            Err(("no auth", RetryClass::Permanent))
        });

        assert_eq!(result, Err(GiveUp::Exhausted("no auth")));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn retry_loop_exhausts_attempts() {
        let retry = RetryLoop::new(RetryConfig {
            kind: BackoffKind::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        });

        let mut attempts = 0;
        let result: Result<(), _> = retry.run(|_| {
            attempts += 1;
            Err(("down", RetryClass::Transient))
        });

        assert_eq!(result, Err(GiveUp::Exhausted("down")));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn cancelled_token_interrupts_before_the_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let retry = RetryLoop::from_policy(BackoffPolicy::StoreIo).with_cancel(cancel);

        let mut attempts = 0;
        let result: Result<(), GiveUp<&str>> = retry.run(|_| {
            attempts += 1;
            Ok(())
        });

        assert_eq!(result, Err(GiveUp::Interrupted));
        assert_eq!(attempts, 0);
    }

    #[test]
    fn expired_deadline_interrupts_between_attempts() {
        let retry = RetryLoop::new(RetryConfig {
            kind: BackoffKind::Immediate,
            max_attempts: 10,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        })
        .with_deadline(Instant::now() - Duration::from_secs(1));

        let result: Result<(), _> = retry.run(|_| Err(("late", RetryClass::Transient)));
        assert_eq!(result, Err(GiveUp::Interrupted));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_band(base_ms in 1u64..10_000, jitter in 0.0f64..1.0) {
            let config = RetryConfig {
                kind: BackoffKind::Constant,
                max_attempts: 3,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms),
                jitter,
            };
            let delay = delay_for_attempt(&config, 1);
            let base = Duration::from_millis(base_ms);
            // Rounding to whole milliseconds can land one step outside the band.
            let slack = Duration::from_millis(1);
            prop_assert!(delay + slack >= base.mul_f64(1.0 - jitter));
            prop_assert!(delay <= base.mul_f64(1.0 + jitter) + slack);
        }

        #[test]
        fn delay_never_exceeds_cap_without_jitter(attempt in 1u32..64) {
            let config = no_jitter(
                BackoffKind::Exponential,
                Duration::from_secs(1),
                Duration::from_secs(60),
            );
            prop_assert!(delay_for_attempt(&config, attempt) <= Duration::from_secs(60));
        }
    }
}
