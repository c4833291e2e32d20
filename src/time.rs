use embedded_time::Instant;

/// A duration, in milliseconds
pub type Millis = embedded_time::duration::Milliseconds<u64>;

/// Value-namespace constructor for [`Millis`]; a type alias of a tuple
/// struct is not callable, so `Millis(ms)` needs this shim.
#[allow(non_snake_case)]
pub const fn Millis(ms: u64) -> Millis {
  embedded_time::duration::Milliseconds(ms)
}

/// Supertrait of [`embedded_time::Clock`] pinning the
/// type of "ticks" to u64
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// Timeout configuration allowing for "never time out" as an option
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum Timeout {
  /// Timeout after some number of milliseconds has elapsed
  Millis(u64),
  /// Never time out
  Never,
}

/// Milliseconds elapsed between two instants, saturating to zero
/// when `b` is not later than `a`.
pub(crate) fn millis_between<C: Clock>(a: Instant<C>, b: Instant<C>) -> u64 {
  b.checked_duration_since(&a)
   .and_then(|dur| Millis::try_from(dur).ok())
   .map(|embedded_time::duration::Milliseconds(ms)| ms)
   .unwrap_or(0)
}

/// The earlier of two optional deadlines.
pub(crate) fn earliest<C: Clock>(a: Option<Instant<C>>,
                                 b: Option<Instant<C>>)
                                 -> Option<Instant<C>> {
  match (a, b) {
    | (Some(a), Some(b)) => Some(a.min(b)),
    | (Some(a), None) => Some(a),
    | (None, b) => b,
  }
}

#[cfg(test)]
mod test {
  use embedded_time::Clock as _;

  use super::*;
  use crate::test::ClockMock;

  #[test]
  fn millis_between_saturates() {
    let clock = ClockMock::new();
    clock.set(5_000);
    let a = clock.try_now().unwrap();
    clock.set(2_000);
    let b = clock.try_now().unwrap();

    assert_eq!(millis_between(a, b), 0);
    assert_eq!(millis_between(b, a), 3_000);
  }

  #[test]
  fn earliest_prefers_present_deadline() {
    let clock = ClockMock::new();
    clock.set(1_000_000);
    let a = clock.try_now().unwrap();
    clock.set(2_000_000);
    let b = clock.try_now().unwrap();

    assert_eq!(earliest::<ClockMock>(None, None), None);
    assert_eq!(earliest(Some(a), None), Some(a));
    assert_eq!(earliest(None, Some(b)), Some(b));
    assert_eq!(earliest(Some(a), Some(b)), Some(a));
  }
}
