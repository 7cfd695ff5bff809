use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timer {
    interval: Duration,
    next_fire: Instant,
}

/// Per-socket timers keyed by an application-chosen id
///
/// Timers are only advanced by the reactor when it sees the owning socket
/// writable, so an interval is a lower bound between fires, never a deadline.
#[derive(Debug, Default)]
pub struct TimerTable {
    timers: HashMap<u32, Timer>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace timer `id`, first due at `now + interval`
    pub fn set(&mut self, id: u32, interval: Duration, now: Instant) {
        self.timers.insert(
            id,
            Timer {
                interval,
                next_fire: now + interval,
            },
        );
    }

    /// Remove timer `id`. Returns false if it did not exist.
    pub fn kill(&mut self, id: u32) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn interval(&self, id: u32) -> Option<Duration> {
        self.timers.get(&id).map(|t| t.interval)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers = HashMap::new();
    }

    /// Collect every timer due at `now` and reschedule it to `now + interval`
    ///
    /// An overdue timer fires once no matter how many intervals were missed.
    /// Results are ordered by id.
    pub fn take_due(&mut self, now: Instant) -> Vec<(u32, Duration)> {
        let mut due: Vec<(u32, Duration)> = self
            .timers
            .iter_mut()
            .filter(|(_, timer)| timer.next_fire <= now)
            .map(|(&id, timer)| {
                timer.next_fire = now + timer.interval;
                (id, timer.interval)
            })
            .collect();
        due.sort_unstable_by_key(|&(id, _)| id);
        due
    }
}
