//! Bounded polling of externally observed state.
//!
//! Every wait in the suite goes through [Poller::wait_for]: an `observe` closure performs exactly
//! one read of external state and a `check` closure decides whether that observation satisfies
//! the condition. Read failures are treated as "not yet" unless the poller is [Poller::strict],
//! and an explicit error returned by `check` (a protocol violation) ends the poll before its
//! limit.

use crate::Error;
use std::{fmt::Debug, future::Future, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// How long a [Poller] keeps trying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Limit {
    /// Give up once this much time has elapsed since the first observation.
    Elapsed(Duration),
    /// Give up after this many observations.
    Attempts(usize),
}

/// Repeatedly evaluates a condition at a fixed interval until it is satisfied or a limit is hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub limit: Limit,
    /// Whether a failed observation aborts the poll.
    pub strict: bool,
}

impl Poller {
    /// Poll every `interval` until `timeout` has elapsed.
    pub const fn timeout(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            limit: Limit::Elapsed(timeout),
            strict: false,
        }
    }

    /// Poll every `interval`, at most `attempts` times.
    pub const fn attempts(interval: Duration, attempts: usize) -> Self {
        Self {
            interval,
            limit: Limit::Attempts(attempts),
            strict: false,
        }
    }

    /// Returns a poller that fails on the first observation error instead of retrying.
    ///
    /// Used where a failed read means the observed node is gone rather than not yet ready.
    pub const fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Waits until `check` accepts an observation produced by `observe`.
    ///
    /// `observe` failures are logged and retried (or returned, if [Poller::strict]). `check` returns `Ok(Some(_))` once satisfied,
    /// `Ok(None)` to keep polling, or `Err(_)` to abort immediately. When the limit is exhausted,
    /// [Error::Timeout] carries `condition` and the last observed value.
    pub async fn wait_for<O, T, Obs, Fut, Chk>(
        &self,
        condition: &str,
        mut observe: Obs,
        mut check: Chk,
    ) -> Result<T, Error>
    where
        O: Debug,
        Obs: FnMut() -> Fut,
        Fut: Future<Output = Result<O, Error>>,
        Chk: FnMut(O) -> Result<Option<T>, Error>,
    {
        let start = Instant::now();
        let mut attempts = 0;
        let mut last;
        loop {
            attempts += 1;
            match observe().await {
                Ok(observation) => {
                    debug!(condition, attempt = attempts, ?observation, "observed");
                    last = format!("{observation:?}");
                    if let Some(value) = check(observation)? {
                        return Ok(value);
                    }
                }
                Err(err) if self.strict => {
                    debug!(condition, attempt = attempts, error = %err, "observation failed");
                    return Err(err);
                }
                Err(err) => {
                    debug!(condition, attempt = attempts, error = %err, "observation failed");
                    last = err.to_string();
                }
            }

            let exhausted = match self.limit {
                Limit::Elapsed(timeout) => start.elapsed() >= timeout,
                Limit::Attempts(max) => attempts >= max,
            };
            if exhausted {
                return Err(Error::Timeout {
                    condition: condition.to_string(),
                    last,
                });
            }
            sleep(self.interval).await;
        }
    }
}

/// Requires a condition to hold for a number of consecutive observations.
///
/// A single stale read can report a value that is no longer current, so callers that act on a
/// condition (such as tearing down a halted chain) wait for a streak instead.
#[derive(Clone, Debug)]
pub struct Debounce {
    required: usize,
    streak: usize,
}

impl Debounce {
    pub fn new(required: usize) -> Self {
        assert!(required > 0, "debounce requires at least one observation");
        Self {
            required,
            streak: 0,
        }
    }

    /// Records an observation and returns true once `required` consecutive observations held.
    pub fn observe(&mut self, holds: bool) -> bool {
        if holds {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        self.streak >= self.required
    }

    /// Current number of consecutive observations that held.
    pub fn streak(&self) -> usize {
        self.streak
    }
}
