//! A single bounded-attempts retry executor with exponential backoff,
//! shared by every retry site in the workspace: the hosted-A merge
//! 405-then-retry path, the hosted-B list+filter eventual-consistency
//! path, and (indirectly, via [`CancelFlag`]) the status poll loop.
//!
//! No call site open-codes its own `sleep`/`continue` loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;

/// Exponential-backoff parameters for [`RetryExecutor`].
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Computes the delay to sleep before attempt number `attempt` (1-based;
/// the delay before the *second* attempt, since the first attempt never
/// waits). Exponential growth capped at `max_delay`, with up to 20%
/// multiplicative jitter when `jitter` is enabled.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let factor = 2u64.saturating_pow(exponent);
    let base = config.base_delay.saturating_mul(factor as u32).min(config.max_delay);
    if !config.jitter || base.is_zero() {
        return base;
    }
    let jitter_fraction = rand::rng().random_range(0.0..0.2);
    let jittered_nanos = (base.as_nanos() as f64 * (1.0 + jitter_fraction)) as u64;
    Duration::from_nanos(jittered_nanos).min(config.max_delay)
}

/// A flag flipped by a process-wide SIGINT/SIGTERM handler. Checked
/// between retry attempts and between status-poll rounds so every
/// suspension point in the crate honors the ambient cancellation signal
/// named in the concurrency model.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether a failed attempt is worth retrying. Implemented by error types
/// that distinguish transient from permanent failures.
pub trait Classify {
    fn is_retryable(&self) -> bool;
}

/// Runs `attempt` up to `config.max_attempts` times, sleeping
/// [`calculate_delay`] between attempts, stopping early on a
/// non-retryable error or on cancellation.
pub struct RetryExecutor {
    config: RetryConfig,
}

/// The reason a [`RetryExecutor::run`] call did not produce a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation exhausted its attempt budget; carries the last error.
    ExhaustedAttempts(E),
    /// A non-retryable error occurred and no further attempts were made.
    Permanent(E),
    /// The ambient cancellation signal fired between attempts.
    Cancelled,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        RetryExecutor { config }
    }

    pub fn default_bounded() -> Self {
        RetryExecutor::new(RetryConfig::default())
    }

    /// Runs `f` until it succeeds, its error is classified as
    /// non-retryable, the attempt budget is exhausted, or `cancel` fires.
    /// `f` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, cancel: &CancelFlag, mut f: F) -> Result<T, RetryError<E>>
    where
        E: Classify,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            match f(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(RetryError::Permanent(e)),
                Err(e) if attempt >= self.config.max_attempts => {
                    return Err(RetryError::ExhaustedAttempts(e));
                }
                Err(_) => {
                    std::thread::sleep(calculate_delay(&self.config, attempt));
                    attempt += 1;
                }
            }
        }
    }
}
