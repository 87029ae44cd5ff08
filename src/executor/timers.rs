use super::frame::ResumeToken;
use crate::heap::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum TimerAction {
    /// Re-enter a suspended fiber. `None` resumes without handing back a value
    /// (cooperative yield).
    Resume {
        token: ResumeToken,
        value: Option<Value>,
    },
    /// Push the idle event and re-arm.
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    pub id: u64,
    pub due_ms: u64,
    pub action: TimerAction,
}

/// Deferred-callback scheduler of the host, driven by an external clock.
///
/// While paused, timers are parked with their remaining delay and re-armed
/// relative to the resume time.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    armed: Vec<Timer>,
    parked: Vec<(Timer, u64)>,
    paused: bool,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: u64, delay_ms: u64, action: TimerAction) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let timer = Timer {
            id,
            due_ms: now.saturating_add(delay_ms),
            action,
        };
        if self.paused {
            self.parked.push((timer, delay_ms.max(1)));
        } else {
            self.armed.push(timer);
        }
        id
    }

    /// Remove and return the earliest timer due at `now`, if any.
    pub fn pop_due(&mut self, now: u64) -> Option<Timer> {
        if self.paused {
            return None;
        }
        let idx = self
            .armed
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due_ms <= now)
            .min_by_key(|(_, t)| (t.due_ms, t.id))
            .map(|(i, _)| i)?;
        Some(self.armed.swap_remove(idx))
    }

    pub fn next_due(&self) -> Option<u64> {
        if self.paused {
            return None;
        }
        self.armed.iter().map(|t| t.due_ms).min()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Park every armed timer with its remaining delay, clamped to at least 1ms.
    pub fn pause(&mut self, now: u64) {
        if self.paused {
            return;
        }
        self.paused = true;
        for timer in self.armed.drain(..) {
            let remaining = timer.due_ms.saturating_sub(now).max(1);
            self.parked.push((timer, remaining));
        }
    }

    pub fn resume(&mut self, now: u64) {
        if !self.paused {
            return;
        }
        self.paused = false;
        for (mut timer, remaining) in self.parked.drain(..) {
            timer.due_ms = now.saturating_add(remaining);
            self.armed.push(timer);
        }
    }

    pub fn len(&self) -> usize {
        self.armed.len() + self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.armed
            .iter()
            .chain(self.parked.iter().map(|(t, _)| t))
            .filter_map(|t| match &t.action {
                TimerAction::Resume { value, .. } => value.as_ref(),
                TimerAction::Idle => None,
            })
    }

    pub fn clear(&mut self) {
        self.armed.clear();
        self.parked.clear();
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_due_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(0, 30, TimerAction::Idle);
        let first = timers.schedule(0, 10, TimerAction::Idle);
        assert!(timers.pop_due(5).is_none());
        assert_eq!(timers.pop_due(40).unwrap().id, first);
        assert_eq!(timers.next_due(), Some(30));
    }

    #[test]
    fn pause_preserves_remaining_time() {
        let mut timers = TimerQueue::new();
        timers.schedule(0, 1000, TimerAction::Idle);
        timers.pause(400);
        assert!(timers.pop_due(10_000).is_none());
        timers.resume(5_000);
        assert_eq!(timers.next_due(), Some(5_600));
    }

    #[test]
    fn overdue_timers_keep_a_minimum_delay() {
        let mut timers = TimerQueue::new();
        timers.schedule(0, 10, TimerAction::Idle);
        timers.pause(50);
        timers.resume(100);
        assert_eq!(timers.next_due(), Some(101));
    }
}
