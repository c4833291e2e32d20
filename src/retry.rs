use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use rand::{Rng, SeedableRng};

use crate::time::{Clock, Millis};

/// A non-blocking timer that allows a fixed-delay or exponential-backoff
/// retry, living alongside some operation to retry.
///
/// It does not _contain_ the work to be done (e.g. `Box<fn()>`); the owner
/// polls [`RetryTimer::what_should_i_do`] after each failure and performs
/// the retry itself.
///
/// The fixed-delay flavor backs the LwM2M Server-Object communication-retry
/// tier (`retry_count` attempts spaced `retry_timer` apart); the exponential
/// flavor backs bootstrap back-off.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer<C: Clock> {
  next_at: Instant<C>,
  delay: Millis,
  strategy: Strategy,
  attempts: Attempts,
  max_attempts: Attempts,
}

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempts(pub u16);

/// Result of [`RetryTimer::what_should_i_do`].
///
/// This tells you if a retry should be attempted or not.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum YouShould {
  /// Attempts have been exhausted and the work that is
  /// being retried should be considered poisoned.
  Cry,
  /// A retry should be performed
  Retry,
}

impl<C: Clock> RetryTimer<C> {
  /// Create a new retrier.
  ///
  /// The work being retried is assumed to have been attempted once already,
  /// just before `start`.
  pub fn new(start: Instant<C>, strategy: Strategy, max_attempts: Attempts) -> Self {
    let delay = if strategy.has_jitter() {
      let seed = Millis::try_from(start.duration_since_epoch()).map(|Milliseconds(ms)| ms)
                                                               .unwrap_or(0);
      let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
      Millis(rand.gen_range(strategy.range()))
    } else {
      Millis(*strategy.range().start())
    };

    Self { next_at: start + delay,
           delay,
           strategy,
           max_attempts,
           attempts: Attempts(1) }
  }

  /// When the thing we keep trying fails, invoke this to
  /// tell the retrytimer "it failed again! what do I do??"
  ///
  /// Returns `nb::Error::WouldBlock` when we have not yet
  /// waited the appropriate amount of time to retry.
  pub fn what_should_i_do(&mut self,
                          now: Instant<C>)
                          -> nb::Result<YouShould, core::convert::Infallible> {
    if self.attempts >= self.max_attempts {
      Ok(YouShould::Cry)
    } else if now >= self.next_at {
      self.attempts.0 += 1;
      self.delay = match self.strategy {
        | Strategy::Delay { .. } => self.delay,
        | Strategy::Exponential { .. } => Millis(self.delay.0.saturating_mul(2)),
      };
      self.next_at = now + self.delay;
      Ok(YouShould::Retry)
    } else {
      Err(nb::Error::WouldBlock)
    }
  }

  /// When the next retry will be allowed, for hosts that want
  /// to sleep instead of busy-polling.
  ///
  /// `None` once attempts are exhausted.
  pub fn next_attempt_at(&self) -> Option<Instant<C>> {
    if self.attempts >= self.max_attempts {
      None
    } else {
      Some(self.next_at)
    }
  }

  /// How many attempts have been performed so far (including the implicit
  /// first one)
  pub fn attempts(&self) -> Attempts {
    self.attempts
  }
}

/// Strategy to employ when retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
  /// Start with a delay between `init_min` and `init_max`, and double
  /// the delay after each failed attempt before retrying again.
  Exponential {
    /// Minimum (inclusive) delay before the second attempt
    init_min: Millis,
    /// Maximum (inclusive) delay before the second attempt
    init_max: Millis,
  },
  /// Wait a delay between `min` and `max` between all attempts.
  Delay {
    /// Minimum (inclusive) delay for attempts
    min: Millis,
    /// Maximum (inclusive) delay for attempts
    max: Millis,
  },
}

impl Strategy {
  /// Are min & max delays the same? if so, we should skip the random number
  /// generation.
  pub fn has_jitter(&self) -> bool {
    let rng = self.range();
    rng.start() != rng.end()
  }

  /// Get the min & max durations as an inclusive range
  pub fn range(&self) -> RangeInclusive<u64> {
    match self {
      | &Self::Delay { min: Milliseconds(min),
                       max: Milliseconds(max), } => (min..=max),

      | &Self::Exponential { init_min: Milliseconds(min),
                             init_max: Milliseconds(max), } => (min..=max),
    }
  }

  /// Get the amount of time this strategy will take if all attempts fail.
  ///
  /// Saturates at `u64::MAX` milliseconds rather than overflowing for very
  /// large attempt budgets.
  pub fn max_time(&self, max_attempts: Attempts) -> Millis {
    Millis(match self {
             | Self::Exponential { init_max: Milliseconds(max),
                                   .. } => {
               (0..max_attempts.0).fold((0u64, *max), |(total, delay), _| {
                                    (total.saturating_add(delay),
                                     delay.saturating_mul(2))
                                  })
                                  .0
             },
             | Self::Delay { max: Milliseconds(max),
                             .. } => max.saturating_mul(max_attempts.0 as u64),
           })
  }
}

#[cfg(test)]
mod test {
  use embedded_time::Clock as _;

  use super::*;
  use crate::test::ClockMock;

  #[test]
  fn delay_retrier() {
    let clock = ClockMock::new();
    let now = |ms: u64| {
      clock.set(ms);
      clock.try_now().unwrap()
    };

    let mut retry = RetryTimer::new(now(0),
                                    Strategy::Delay { min: Millis(1000),
                                                      max: Millis(1000) },
                                    Attempts(5));

    // attempt 1 happens before asking what_should_i_do

    assert_eq!(retry.what_should_i_do(now(999)).unwrap_err(),
               nb::Error::WouldBlock);
    assert_eq!(retry.what_should_i_do(now(1000)).unwrap(), YouShould::Retry);
    // Fails again (attempt 2)

    assert_eq!(retry.what_should_i_do(now(1999)).unwrap_err(),
               nb::Error::WouldBlock);
    assert_eq!(retry.what_should_i_do(now(2000)).unwrap(), YouShould::Retry);
    // Fails again (attempt 3)

    assert_eq!(retry.what_should_i_do(now(10_000)).unwrap(), YouShould::Retry);
    // Fails again (attempt 4)

    // a retry long after the deadline re-arms relative to now,
    // not relative to the last deadline
    assert_eq!(retry.what_should_i_do(now(10_500)).unwrap_err(),
               nb::Error::WouldBlock);
    assert_eq!(retry.what_should_i_do(now(11_000)).unwrap(), YouShould::Retry);
    // Fails again (attempt 5)

    assert_eq!(retry.what_should_i_do(now(12_000)).unwrap(), YouShould::Cry);
    assert_eq!(retry.next_attempt_at(), None);
  }

  #[test]
  fn exponential_retrier() {
    let clock = ClockMock::new();
    let now = |ms: u64| {
      clock.set(ms);
      clock.try_now().unwrap()
    };

    let mut retry = RetryTimer::new(now(0),
                                    Strategy::Exponential { init_min: Millis(1000),
                                                            init_max: Millis(1000) },
                                    Attempts(4));

    // attempt 1 happens before asking what_should_i_do

    assert_eq!(retry.what_should_i_do(now(999)).unwrap_err(),
               nb::Error::WouldBlock);
    assert_eq!(retry.what_should_i_do(now(1000)).unwrap(), YouShould::Retry);

    // delay doubled to 2s
    assert_eq!(retry.what_should_i_do(now(2999)).unwrap_err(),
               nb::Error::WouldBlock);
    assert_eq!(retry.what_should_i_do(now(3000)).unwrap(), YouShould::Retry);

    // doubled again to 4s
    assert_eq!(retry.what_should_i_do(now(6999)).unwrap_err(),
               nb::Error::WouldBlock);
    assert_eq!(retry.what_should_i_do(now(7000)).unwrap(), YouShould::Retry);

    assert_eq!(retry.what_should_i_do(now(20_000)).unwrap(), YouShould::Cry);
  }

  #[test]
  fn max_time_calculation() {
    let exp = Strategy::Exponential { init_min: Millis(100),
                                      init_max: Millis(100) };
    // 100 + 200 + 400
    assert_eq!(exp.max_time(Attempts(3)), Millis(700));

    let lin = Strategy::Delay { min: Millis(100),
                                max: Millis(100) };
    assert_eq!(lin.max_time(Attempts(3)), Millis(300));
  }

  #[test]
  fn max_time_saturates_for_huge_attempt_budgets() {
    let exp = Strategy::Exponential { init_min: Millis(3_000),
                                      init_max: Millis(3_000) };
    assert_eq!(exp.max_time(Attempts(200)), Millis(u64::MAX));

    let lin = Strategy::Delay { min: Millis(u64::MAX / 2),
                                max: Millis(u64::MAX / 2) };
    assert_eq!(lin.max_time(Attempts(3)), Millis(u64::MAX));
  }
}
