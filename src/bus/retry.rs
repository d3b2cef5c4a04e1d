//! Reconnect strategies for the bus connection.

use std::time::Duration;

use backoff::backoff::Backoff as InnerBackoff;

/// Defines what to do when the bus connection cannot be (re)established.
#[derive(Debug)]
pub enum ReconnectPolicy {
    Never,
    Retry(Box<dyn RetryStrategy>),
}

impl ReconnectPolicy {
    pub fn fixed(max_retries: Option<usize>, interval: Duration) -> Self {
        ReconnectPolicy::Retry(Box::new(FixedIntervalStrategy::new(max_retries, interval)))
    }

    pub fn exponential(max_retries: Option<usize>, initial: Duration, max: Duration) -> Self {
        ReconnectPolicy::Retry(Box::new(ExponentialBackoffStrategy::new(
            max_retries,
            initial,
            max,
        )))
    }
}

/// Trait to define a retry strategy.
pub trait RetryStrategy: std::fmt::Debug + Send + Sync {
    /// Maximum number of attempts after the first failure, `None` for unbounded.
    fn max_retries(&self) -> Option<usize>;
    /// Wait duration before the next attempt.
    fn next_backoff(&mut self) -> Option<Duration>;
    /// Called once a connection has been established again.
    fn reset(&mut self) {}
}

/// A retry strategy that immediately retries without waiting.
#[derive(Debug, Default)]
pub struct NoIntervalStrategy {
    max_retries: Option<usize>,
}

impl NoIntervalStrategy {
    pub fn new(max_retries: Option<usize>) -> Self {
        NoIntervalStrategy { max_retries }
    }
}

impl RetryStrategy for NoIntervalStrategy {
    fn max_retries(&self) -> Option<usize> {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }
}

/// A retry strategy with a fixed wait period.
#[derive(Debug, Default)]
pub struct FixedIntervalStrategy {
    max_retries: Option<usize>,
    duration: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(max_retries: Option<usize>, duration: Duration) -> Self {
        FixedIntervalStrategy {
            max_retries,
            duration,
        }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn max_retries(&self) -> Option<usize> {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.duration)
    }
}

/// A retry strategy with exponential backoff, capped at a maximum interval.
#[derive(Debug)]
pub struct ExponentialBackoffStrategy {
    max_retries: Option<usize>,
    inner: backoff::ExponentialBackoff,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_retries: Option<usize>, initial: Duration, max: Duration) -> Self {
        let inner = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(max)
            .with_max_elapsed_time(None)
            .build();
        ExponentialBackoffStrategy { max_retries, inner }
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn max_retries(&self) -> Option<usize> {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}
