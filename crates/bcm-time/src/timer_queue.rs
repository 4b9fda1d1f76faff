use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent<T> {
    pub id: TimerId,
    pub deadline_ns: u64,
    pub payload: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("timer {0:?} is not pending")]
    NotPending(TimerId),
}

/// Deadline-ordered queue of one-shot timers.
///
/// Timers with equal deadlines fire in scheduling order. Popped or cancelled ids are never
/// reused.
#[derive(Debug)]
pub struct TimerQueue<T> {
    next_seq: u64,
    by_deadline: BTreeMap<(u64, u64), T>,
    deadlines: HashMap<TimerId, u64>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn schedule(&mut self, deadline_ns: u64, payload: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = TimerId(seq);
        self.by_deadline.insert((deadline_ns, seq), payload);
        self.deadlines.insert(id, deadline_ns);
        id
    }

    /// Moves a pending timer to a new deadline, keeping its id.
    pub fn reschedule(&mut self, id: TimerId, deadline_ns: u64) -> Result<(), TimerError> {
        let old = self
            .deadlines
            .get_mut(&id)
            .ok_or(TimerError::NotPending(id))?;
        let payload = self
            .by_deadline
            .remove(&(*old, id.0))
            .ok_or(TimerError::NotPending(id))?;
        trace!(id = id.0, from_ns = *old, to_ns = deadline_ns, "timer rescheduled");
        *old = deadline_ns;
        self.by_deadline.insert((deadline_ns, id.0), payload);
        Ok(())
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        trace!(id = id.0, deadline_ns = deadline, "timer cancelled");
        self.by_deadline.remove(&(deadline, id.0))
    }

    pub fn deadline(&self, id: TimerId) -> Option<u64> {
        self.deadlines.get(&id).copied()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Removes and returns the earliest timer whose deadline is `<= now_ns`.
    ///
    /// Callers drain one event at a time so that a handler may re-arm (possibly for an already
    /// due deadline) before the next event is considered.
    pub fn pop_due(&mut self, now_ns: u64) -> Option<TimerEvent<T>> {
        let (&(deadline_ns, seq), _) = self.by_deadline.first_key_value()?;
        if deadline_ns > now_ns {
            return None;
        }
        let payload = self.by_deadline.remove(&(deadline_ns, seq))?;
        let id = TimerId(seq);
        self.deadlines.remove(&id);
        Some(TimerEvent {
            id,
            deadline_ns,
            payload,
        })
    }
}
