//! The logical clock that orders every externally visible event.
//!
//! A single monotonic counter is incremented once per applicable event (a
//! source write, a recomputation producing a changed value, or certain
//! structural edits) and stamped onto the cells it affects. Readers never see
//! a value whose stamp is older than the most recent observed cause.

use std::cell::Cell;
use std::fmt;

/// A point in the kernel's logical time. Opaque to hosts beyond ordering
/// comparisons; never reset, never wraps in any practical run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogicalClock(u64);

impl LogicalClock {
    /// The clock value before anything has happened.
    pub const START: LogicalClock = LogicalClock(0);
}

impl fmt::Debug for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalClock({})", self.0)
    }
}

/// Internal monotonic tick source. The kernel is single-threaded, so a plain
/// `Cell` suffices; there is no need for the atomics the multi-threaded
/// ancestor of this design used for its revision counter.
#[derive(Default)]
pub(crate) struct Clock {
    now: Cell<u64>,
}

impl Clock {
    pub(crate) fn current(&self) -> LogicalClock {
        LogicalClock(self.now.get())
    }

    /// Advances the clock by one and returns the new value.
    pub(crate) fn tick(&self) -> LogicalClock {
        let next = self.now.get() + 1;
        self.now.set(next);
        LogicalClock(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = Clock::default();
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(clock.current(), b);
    }

    #[test]
    fn start_is_the_smallest_possible_value() {
        let clock = Clock::default();
        assert!(LogicalClock::START < clock.tick());
    }
}
