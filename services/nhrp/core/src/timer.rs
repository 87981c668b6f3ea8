//! Deadline queue with cancellable handles.
//!
//! Entities keep the [`TimerId`] of their armed timer and cancel it on
//! teardown. Firing hands the id back with the token so the handler can
//! check the entity still expects exactly this timer.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Timers ordered by deadline, then by scheduling order
#[derive(Debug)]
pub struct TimerQueue<T> {
    queue: BTreeMap<(Instant, TimerId), T>,
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 1,
        }
    }

    /// Arm a timer firing at `at`
    pub fn schedule(&mut self, at: Instant, token: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((at, id), token);
        self.deadlines.insert(id, at);
        id
    }

    /// Disarm a timer; unknown or fired ids are ignored
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let at = self.deadlines.remove(&id)?;
        self.queue.remove(&(at, id))
    }

    /// Whether `id` is still armed
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Deadline of an armed timer
    pub fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.deadlines.get(&id).copied()
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, T)> {
        let key = *self.queue.keys().next()?;
        if key.0 > now {
            return None;
        }
        let token = self.queue.remove(&key)?;
        self.deadlines.remove(&key.1);
        Some((key.1, token))
    }

    /// Armed timers
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is armed
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_in_deadline_order() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(t0 + Duration::from_secs(2), "late");
        q.schedule(t0 + Duration::from_secs(1), "early");
        q.schedule(t0 + Duration::from_secs(1), "early-second");

        assert!(q.pop_due(t0).is_none());
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(1)));
        let now = t0 + Duration::from_secs(5);
        assert_eq!(q.pop_due(now).map(|(_, t)| t), Some("early"));
        assert_eq!(q.pop_due(now).map(|(_, t)| t), Some("early-second"));
        assert_eq!(q.pop_due(now).map(|(_, t)| t), Some("late"));
        assert!(q.is_empty());
    }

    #[test]
    fn test_cancel() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        let id = q.schedule(t0, 1);
        assert!(q.is_armed(id));
        assert_eq!(q.cancel(id), Some(1));
        assert!(!q.is_armed(id));
        assert_eq!(q.cancel(id), None);
        assert!(q.pop_due(t0 + Duration::from_secs(1)).is_none());
    }
}
