//! Bounded retry combinator.
//!
//! Used wherever the orchestrator waits on something outside its control:
//! DHCP leases, guest SSH readiness, a guest shutting down, the container
//! runtime coming up. Each attempt tells the combinator whether to stop
//! ([`Attempt::Done`] / [`Attempt::Fatal`]) or try again ([`Attempt::Retry`]).
//! [`poll_until`] is the retry-only form: an `Err` always means "again".

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

/// How often and for how long to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub interval: Duration,
    /// Upper bound on the delay between attempts.
    pub max_interval: Duration,
    /// Multiplier applied to the delay after each attempt (1.0 = fixed).
    pub backoff_multiplier: f64,
    /// Maximum number of attempts, if bounded by count.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from the first attempt, if bounded by time.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: Some(5),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Poll on a fixed interval until `deadline` elapses.
    #[must_use]
    pub fn fixed(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff_multiplier: 1.0,
            max_attempts: None,
            deadline: Some(deadline),
        }
    }

    /// Exponential backoff bounded by attempt count.
    #[must_use]
    pub fn exponential(initial: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval: initial,
            max_interval,
            backoff_multiplier: 2.0,
            max_attempts: Some(max_attempts),
            deadline: None,
        }
    }

    /// Upper bound on the number of attempts this policy allows.
    ///
    /// A fixed-interval policy with a deadline allows
    /// `deadline / interval` attempts (600s every 5s is 120 attempts).
    #[must_use]
    pub fn attempt_budget(&self) -> Option<u32> {
        let by_deadline = match self.deadline {
            Some(deadline) if self.backoff_multiplier <= 1.0 && !self.interval.is_zero() => {
                let polls = deadline.as_millis() / self.interval.as_millis().max(1);
                Some(u32::try_from(polls).unwrap_or(u32::MAX).max(1))
            }
            _ => None,
        };
        match (by_deadline, self.max_attempts) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return current;
        }
        std::cmp::min(
            self.max_interval,
            Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier),
        )
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Stop, successfully.
    Done(T),
    /// Not there yet; the error describes why.
    Retry(E),
    /// Stop, unsuccessfully, without further attempts.
    Fatal(E),
}

/// Why a retried operation ultimately failed.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// An attempt reported a non-retryable failure.
    #[error("{0}")]
    Fatal(E),

    /// The policy ran out of attempts or time.
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last: E,
    },
}

/// The policy ran out before [`poll_until`] saw a success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempts in {elapsed:?}: {last}")]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub elapsed: Duration,
    /// Why the final attempt did not succeed.
    pub last: E,
}

/// Run `f` under `policy` until it returns `Ok` or the policy is exhausted.
/// Every `Err` is retried. `f` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`Exhausted`] once the attempt or time budget is spent.
pub async fn poll_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> Result<T, Exhausted<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let budget = policy.attempt_budget();
    let mut delay = policy.interval;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let last = match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let elapsed = start.elapsed();
        let out_of_attempts = budget.is_some_and(|max| attempt >= max);
        let past_deadline = policy
            .deadline
            .is_some_and(|deadline| elapsed + delay > deadline);
        if out_of_attempts || past_deadline {
            info!("{operation_name} gave up after {attempt} attempts ({elapsed:?}): {last}");
            return Err(Exhausted {
                attempts: attempt,
                elapsed,
                last,
            });
        }

        debug!("{operation_name} not ready (attempt {attempt}): {last}. Retrying in {delay:?}...");
        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}

/// Run `f` under `policy` until it succeeds, fails fatally, or the policy
/// is exhausted. `f` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] for a fatal attempt and
/// [`RetryError::Exhausted`] once the attempt or time budget is spent.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let outcome = poll_until(policy, operation_name, |attempt| {
        let attempt = f(attempt);
        async move {
            match attempt.await {
                Attempt::Done(value) => Ok(Ok(value)),
                Attempt::Fatal(e) => Ok(Err(e)),
                Attempt::Retry(e) => Err(e),
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RetryError::Fatal(e)),
        Err(Exhausted {
            attempts,
            elapsed,
            last,
        }) => Err(RetryError::Exhausted {
            attempts,
            elapsed,
            last,
        }),
    }
}
