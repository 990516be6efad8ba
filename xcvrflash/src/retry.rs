//! Bounded retry with backoff, over an injectable clock.
//!
//! Every wait in this crate goes through the [`Clock`] trait so tests can
//! simulate timeouts without real delay.

use crate::error::Result;
use log::warn;
use std::time::{Duration, Instant};

/// Source of time and sleep for polling loops and retry delays.
pub trait Clock {
    /// The current instant.
    fn now(&mut self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&mut self, duration: Duration);
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&mut self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Bounded retry policy: a fixed number of tries with a (possibly
/// backed-off) delay between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of tries, not retries.
    pub tries: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed try.
    pub backoff: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 3,
            delay: Duration::from_secs(2),
            backoff: 1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with `tries` attempts and a fixed `delay`.
    pub fn new(tries: u32, delay: Duration) -> Self {
        Self {
            tries,
            delay,
            backoff: 1,
        }
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn with_backoff(mut self, backoff: u32) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `op` under this policy.
    ///
    /// While more than one try remains, a failure logs a warning, waits
    /// the current delay, scales the delay by the backoff multiplier,
    /// and tries again. The final try is unguarded: its result, success
    /// or error, is returned as-is.
    pub fn run<T, C, F>(&self, clock: &mut C, mut op: F) -> Result<T>
    where
        C: Clock,
        F: FnMut() -> Result<T>,
    {
        let mut remaining = self.tries;
        let mut delay = self.delay;
        while remaining > 1 {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{e}, retrying in {} seconds...", delay.as_secs());
                    clock.sleep(delay);
                    delay *= self.backoff;
                    remaining -= 1;
                },
            }
        }
        op()
    }
}

/// A virtual clock for tests: `sleep` advances time instantly.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Clock whose time only moves when something sleeps.
    #[derive(Clone)]
    pub struct VirtualClock {
        base: Instant,
        state: Rc<RefCell<VirtualState>>,
    }

    struct VirtualState {
        offset: Duration,
        slept: Vec<Duration>,
    }

    impl VirtualClock {
        pub fn new() -> Self {
            Self {
                base: Instant::now(),
                state: Rc::new(RefCell::new(VirtualState {
                    offset: Duration::ZERO,
                    slept: Vec::new(),
                })),
            }
        }

        /// Total virtual time slept so far.
        pub fn total_slept(&self) -> Duration {
            self.state.borrow().slept.iter().sum()
        }

        /// Every sleep requested, in order.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.state.borrow().slept.clone()
        }
    }

    impl Clock for VirtualClock {
        fn now(&mut self) -> Instant {
            self.base + self.state.borrow().offset
        }

        fn sleep(&mut self, duration: Duration) {
            let mut state = self.state.borrow_mut();
            state.offset += duration;
            state.slept.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::VirtualClock;
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_first_try_success_sleeps_never() {
        let mut clock = VirtualClock::new();
        let policy = RetryPolicy::default();
        let result = policy.run(&mut clock, || Ok(42));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(clock.total_slept(), Duration::ZERO);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let mut clock = VirtualClock::new();
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result = policy.run(&mut clock, || {
            calls += 1;
            if calls < 3 {
                Err(Error::CommandNotCompleted)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2); 2]);
    }

    #[test]
    fn test_exhausted_returns_last_error() {
        let mut clock = VirtualClock::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let mut calls = 0;
        let result: Result<()> = policy.run(&mut clock, || {
            calls += 1;
            Err(Error::CommandNotCompleted)
        });
        assert!(matches!(result, Err(Error::CommandNotCompleted)));
        // 3 tries total, the last one unguarded.
        assert_eq!(calls, 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn test_backoff_scales_delay() {
        let mut clock = VirtualClock::new();
        let policy = RetryPolicy::new(4, Duration::from_secs(1)).with_backoff(2);
        let _: Result<()> = policy.run(&mut clock, || Err(Error::CommandNotCompleted));
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );
    }
}
