//! Retry utilities with exponential backoff and jitter.
//!
//! - [`RetryPolicy`]: backoff state, doubled per attempt and capped
//! - [`retry_async`]: async retry loop with per-attempt timeout and cancellation
//! - [`watchdog`]: a single attempt with timeout and cancellation
//! - [`RetryOutcome`]: failure result that keeps the caller's error type
//!
//! Used by the startup storage ping (`retry_async`), the first MQTT
//! connect (`watchdog`) and the MQTT reconnect loop (`RetryPolicy`).
//!
//! ```ignore
//! use common::retry::{retry_async, RetryPolicy};
//!
//! let pong = retry_async(
//!     |_attempt| storage.ping(),
//!     |e| e.is_transient(),
//!     Duration::from_secs(10),
//!     RetryPolicy::default(),
//!     &cancel,
//!     "storage_ping",
//! )
//! .await?;
//! ```

use std::borrow::Cow;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Retry Outcome
// =============================================================================

/// Why a retried (or watched) operation did not produce a value.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// The cancellation token fired.
    Cancelled,

    /// The last attempt exceeded its timeout.
    Timeout { action: Cow<'static, str> },

    /// `max_retries` reached; carries the error of the final attempt.
    Exhausted { attempts: u32, last_error: E },

    /// The predicate classified the error as permanent.
    Failed(E),
}

impl<E: Display> Display for RetryOutcome<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout { action } => write!(f, "timeout: {action}"),
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(f, "exhausted after {attempts} attempts: {last_error}"),
            Self::Failed(e) => write!(f, "non-retryable error: {e}"),
        }
    }
}

impl<E: Display + std::fmt::Debug> std::error::Error for RetryOutcome<E> {}

impl<E> RetryOutcome<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The underlying error for `Exhausted` and `Failed`.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff with symmetric jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// First backoff interval.
    pub initial: Duration,

    /// Cap for the exponential growth.
    pub max: Duration,

    /// Jitter factor in `[0, 1]`; 0.2 means 80%-120% of the backoff.
    pub jitter: f64,

    /// Stop after N attempts. `None` retries until cancelled.
    pub max_retries: Option<u32>,

    current_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.2, None)
    }
}

impl RetryPolicy {
    pub fn new(
        initial: Duration,
        max: Duration,
        jitter: f64,
        max_retries: Option<u32>,
    ) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            max_retries,
            current_backoff: initial,
        }
    }

    /// Return the current backoff (jittered) and double the next one.
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.current_backoff;
        self.current_backoff = current.saturating_mul(2).min(self.max);

        if self.jitter > 0.0 {
            let factor =
                1.0 + rand::rng().random_range(-self.jitter..self.jitter);
            current.mul_f64(factor).max(Duration::from_nanos(1))
        } else {
            current
        }
    }

    /// Start over from `initial`, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.current_backoff = self.initial;
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

// =============================================================================
// Retry loop
// =============================================================================

/// Run `op` until it succeeds, fails permanently, runs out of attempts or
/// is cancelled.
///
/// `op` receives the 1-based attempt number. Timeouts are always retried.
pub async fn retry_async<T, E, Fut, Op, IsRetryable>(
    mut op: Op,
    is_retryable: IsRetryable,
    attempt_timeout: Duration,
    mut policy: RetryPolicy,
    cancel: &CancellationToken,
    label: &'static str,
) -> Result<T, RetryOutcome<E>>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
    Op: FnMut(u32) -> Fut,
    IsRetryable: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut last_error: Option<E> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryOutcome::Cancelled);
        }

        attempt += 1;
        if !policy.should_retry(attempt) {
            return Err(match last_error {
                Some(e) => RetryOutcome::Exhausted {
                    attempts: attempt - 1,
                    last_error: e,
                },
                None => RetryOutcome::Timeout {
                    action: Cow::Borrowed(label),
                },
            });
        }

        debug!(label, attempt, "starting attempt");

        match timeout(attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                debug!(label, attempt, "operation succeeded");
                return Ok(value);
            }
            Ok(Err(e)) if is_retryable(&e) => {
                let backoff = policy.next_backoff();
                warn!(
                    label,
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis(),
                    "retryable error, backing off"
                );
                last_error = Some(e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }
            Ok(Err(e)) => {
                warn!(label, attempt, error = %e, "non-retryable error, giving up");
                return Err(RetryOutcome::Failed(e));
            }
            Err(_elapsed) => {
                let backoff = policy.next_backoff();
                warn!(
                    label,
                    attempt,
                    timeout_ms = attempt_timeout.as_millis(),
                    backoff_ms = backoff.as_millis(),
                    "attempt timed out, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }
        }
    }
}

/// One attempt of `op`, bounded by `timeout_duration` and `cancel`.
pub async fn watchdog<T, E, Fut>(
    op: Fut,
    timeout_duration: Duration,
    cancel: &CancellationToken,
    label: &'static str,
) -> Result<T, RetryOutcome<E>>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(RetryOutcome::Cancelled),
        result = timeout(timeout_duration, op) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RetryOutcome::Failed(e)),
            Err(_) => Err(RetryOutcome::Timeout {
                action: Cow::Borrowed(label),
            }),
        },
    }
}
