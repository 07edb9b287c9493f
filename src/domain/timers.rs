//! Logical-clock timer set.
//!
//! Components arm timers against a session-relative clock and the owner
//! drains whatever has come due. No wall-clock waits happen here, which keeps
//! debounce and timeout behavior deterministic under test.

use std::collections::BTreeMap;
use std::time::Duration;

/// Handle returned by [`Timers::arm`], used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// A set of armed timers carrying payloads of type `E`
#[derive(Debug)]
pub struct Timers<E> {
    // (deadline, arm sequence) keeps same-deadline timers in arm order
    armed: BTreeMap<(Duration, u64), E>,
    next_seq: u64,
}

impl<E> Default for Timers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Timers<E> {
    pub fn new() -> Self {
        Self {
            armed: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Arm a timer that comes due at `deadline`
    pub fn arm(&mut self, deadline: Duration, event: E) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert((deadline, seq), event);
        TimerHandle(seq)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let key = self.armed.keys().find(|(_, seq)| *seq == handle.0).copied();
        match key {
            Some(key) => self.armed.remove(&key).is_some(),
            None => false,
        }
    }

    /// Remove and return the earliest timer due at or before `now`
    pub fn pop_due(&mut self, now: Duration) -> Option<(Duration, E)> {
        let (&(deadline, seq), _) = self.armed.iter().next()?;
        if deadline > now {
            return None;
        }
        self.armed
            .remove(&(deadline, seq))
            .map(|event| (deadline, event))
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.armed.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn clear(&mut self) {
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

/// Earliest of two optional deadlines
pub fn earliest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
