//! Randomized exponential backoff shared by every retry tier.
//!
//! The delay before retry `n` is drawn uniformly from
//! `[0, min(max_delay, base_delay * 2^(n-1))]` (full jitter), so consumers that
//! restart together do not retry in lockstep.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given duration, then try again.
    Wait(Duration),
    /// The attempt cap was reached.
    GiveUp,
}

/// Full-jitter exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Ceiling of the first delay.
    pub base_delay: Duration,
    /// Cap on every delay ceiling.
    pub max_delay: Duration,
    /// Total attempts allowed (`None` = unbounded).
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Checkpoint reads/writes and dead-letter publishes: 1s base, 10s cap, unbounded.
    pub const fn checkpoint_io() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10), None)
    }

    /// Per-event job attempts: 1s base, 10s cap, 3 attempts.
    pub const fn job_local() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10), Some(3))
    }

    /// Whole-pipeline restarts: 1s base, 60s cap, unbounded.
    pub const fn pipeline_restart() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), None)
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Upper bound of the delay following attempt `attempt` (1-indexed).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    /// Decide after failed attempt `attempt`, drawing jitter from `rng`.
    pub fn decide_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> RetryDecision {
        if !self.should_retry(attempt) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Wait(full_jitter(self.ceiling(attempt), rng))
    }

    /// Decide after failed attempt `attempt` using the thread-local RNG.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        self.decide_with(attempt, &mut rand::rng())
    }
}

fn full_jitter<R: Rng + ?Sized>(ceiling: Duration, rng: &mut R) -> Duration {
    let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rng.random_range(0..=ceiling_ms))
}

/// Run `op` until it succeeds or `policy` gives up, sleeping between attempts.
///
/// With an unbounded policy this only returns once `op` succeeds.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match policy.decide(attempt) {
                RetryDecision::Wait(delay) => {
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = RetryPolicy::job_local();

        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(2), Duration::from_secs(2));
        assert_eq!(policy.ceiling(3), Duration::from_secs(4));
        assert_eq!(policy.ceiling(4), Duration::from_secs(8));
        assert_eq!(policy.ceiling(5), Duration::from_secs(10));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let policy = RetryPolicy::pipeline_restart();
        assert_eq!(policy.ceiling(0), policy.ceiling(1));
    }

    #[test]
    fn bounded_policy_gives_up_at_cap() {
        let policy = RetryPolicy::job_local();

        assert!(matches!(policy.decide(1), RetryDecision::Wait(_)));
        assert!(matches!(policy.decide(2), RetryDecision::Wait(_)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(4), RetryDecision::GiveUp);
    }

    #[test]
    fn unbounded_policies_never_give_up() {
        for policy in [RetryPolicy::checkpoint_io(), RetryPolicy::pipeline_restart()] {
            assert!(policy.should_retry(1));
            assert!(policy.should_retry(10_000));
            assert!(matches!(policy.decide(u32::MAX), RetryDecision::Wait(_)));
        }
    }

    #[test]
    fn tiers_have_expected_shapes() {
        assert_eq!(RetryPolicy::checkpoint_io().max_delay, Duration::from_secs(10));
        assert_eq!(RetryPolicy::job_local().max_attempts, Some(3));
        assert_eq!(RetryPolicy::pipeline_restart().max_delay, Duration::from_secs(60));
    }

    #[test]
    fn jitter_spreads_over_whole_window() {
        let policy = RetryPolicy::pipeline_restart();
        let mut rng = StdRng::seed_from_u64(7);
        let ceiling = policy.ceiling(4).as_millis() as f64;

        let samples: Vec<f64> = (0..20_000)
            .map(|_| match policy.decide_with(4, &mut rng) {
                RetryDecision::Wait(d) => d.as_millis() as f64,
                RetryDecision::GiveUp => unreachable!(),
            })
            .collect();

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let low = samples.iter().filter(|s| **s < ceiling * 0.1).count();
        let high = samples.iter().filter(|s| **s > ceiling * 0.9).count();

        assert!((mean - ceiling / 2.0).abs() < ceiling * 0.02, "mean {mean}");
        assert!(low > 1_000 && high > 1_000, "low {low} high {high}");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_stops_at_first_success() {
        let mut calls = 0;
        let result: Result<u32, String> =
            retry_with_backoff(&RetryPolicy::checkpoint_io(), "checkpoint.set", || {
                calls += 1;
                let current = calls;
                async move {
                    if current < 4 {
                        Err(format!("unavailable #{current}"))
                    } else {
                        Ok(current)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_returns_last_error_when_bounded() {
        let mut calls = 0;
        let result: Result<(), String> =
            retry_with_backoff(&RetryPolicy::job_local(), "bounded", || {
                calls += 1;
                let current = calls;
                async move { Err(format!("failure {current}")) }
            })
            .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: no computed delay ever exceeds min(cap, base * 2^(attempt-1)).
        #[test]
        fn delay_never_exceeds_ceiling_or_cap(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
            attempt in 1u32..200,
            seed in any::<u64>(),
        ) {
            let policy = RetryPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
                None,
            );
            let mut rng = StdRng::seed_from_u64(seed);

            let expected_ceiling = 2u128
                .checked_pow(attempt - 1)
                .and_then(|f| f.checked_mul(base_ms as u128))
                .map_or(cap_ms as u128, |ms| ms.min(cap_ms as u128));
            prop_assert_eq!(policy.ceiling(attempt).as_millis(), expected_ceiling);

            match policy.decide_with(attempt, &mut rng) {
                RetryDecision::Wait(delay) => {
                    prop_assert!(delay <= policy.ceiling(attempt));
                    prop_assert!(delay <= policy.max_delay);
                }
                RetryDecision::GiveUp => prop_assert!(false, "unbounded policy gave up"),
            }
        }
    }
}
