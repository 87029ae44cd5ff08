use std::collections::VecDeque;

use crate::executor::ResumeToken;
use crate::heap::{ObjectRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub source: u32,
    pub event: u32,
}

impl QueueKey {
    pub fn new(source: u32, event: u32) -> Self {
        Self { source, event }
    }
}

/// Foreground queues hold a single handler that replaces its predecessor;
/// background queues accumulate handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerMode {
    Foreground,
    Background,
}

/// Handler-set mutation, applied at once or deferred until the queue unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOp {
    Set(ObjectRef),
    Add(ObjectRef),
    Remove(ObjectRef),
}

/// One handler call the scheduler must run to completion before asking for the next.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub key: QueueKey,
    pub mode: HandlerMode,
    pub handler: ObjectRef,
    pub value: Value,
}

#[derive(Debug)]
pub struct EventQueue {
    key: QueueKey,
    mode: HandlerMode,
    handlers: Vec<ObjectRef>,
    buffered: VecDeque<Value>,
    draining: VecDeque<Value>,
    /// Event being delivered and the index of the next handler to call.
    current: Option<(Value, usize)>,
    locked: bool,
    deferred: Vec<HandlerOp>,
    waiters: Vec<ResumeToken>,
}

impl EventQueue {
    pub fn new(key: QueueKey, mode: HandlerMode) -> Self {
        Self {
            key,
            mode,
            handlers: Vec::new(),
            buffered: VecDeque::new(),
            draining: VecDeque::new(),
            current: None,
            locked: false,
            deferred: Vec::new(),
            waiters: Vec::new(),
        }
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    pub fn mode(&self) -> HandlerMode {
        self.mode
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn handlers(&self) -> &[ObjectRef] {
        &self.handlers
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Values still waiting for delivery, including the one in flight.
    pub fn pending_values(&self) -> impl Iterator<Item = &Value> {
        self.current
            .iter()
            .map(|(v, _)| v)
            .chain(self.draining.iter())
            .chain(self.buffered.iter())
    }

    pub fn apply(&mut self, op: HandlerOp) {
        if self.locked {
            tracing::debug!(key = ?self.key, ?op, "queue locked, deferring handler change");
            self.deferred.push(op);
        } else {
            self.apply_now(op);
        }
    }

    fn apply_now(&mut self, op: HandlerOp) {
        match op {
            HandlerOp::Set(h) => {
                self.handlers.clear();
                self.handlers.push(h);
            }
            HandlerOp::Add(h) => {
                if !self.handlers.contains(&h) {
                    self.handlers.push(h);
                }
            }
            HandlerOp::Remove(h) => self.handlers.retain(|x| *x != h),
        }
    }

    /// Events accepted but not yet in flight.
    pub fn waiting_len(&self) -> usize {
        self.draining.len() + self.buffered.len()
    }

    /// Buffer `value` unless there is nobody to deliver it to or the backlog is full.
    ///
    /// The backlog counts events behind the one in flight. While unlocked the
    /// next `poke` puts the oldest buffered event in flight, so it gets a slot
    /// of its own.
    pub fn push(&mut self, value: Value, max_backlog: usize) -> bool {
        let capacity = max_backlog + usize::from(!self.locked);
        if self.handlers.is_empty() || self.waiting_len() >= capacity {
            return false;
        }
        self.buffered.push_back(value);
        true
    }

    /// Start draining if the queue is idle and has work.
    pub fn poke(&mut self) -> Option<Invocation> {
        if self.locked || self.buffered.is_empty() {
            return None;
        }
        self.locked = true;
        self.draining = std::mem::take(&mut self.buffered);
        self.next_invocation()
    }

    /// The previous invocation completed; hand out the next one or unlock.
    pub fn handler_finished(&mut self) -> Option<Invocation> {
        if !self.locked {
            return None;
        }
        self.next_invocation()
    }

    fn next_invocation(&mut self) -> Option<Invocation> {
        loop {
            if let Some((value, next)) = &mut self.current {
                if let Some(&handler) = self.handlers.get(*next) {
                    *next += 1;
                    return Some(Invocation {
                        key: self.key,
                        mode: self.mode,
                        handler,
                        value: value.clone(),
                    });
                }
                self.current = None;
            }
            if let Some(value) = self.draining.pop_front() {
                self.current = Some((value, 0));
                continue;
            }
            if !self.buffered.is_empty() {
                self.draining = std::mem::take(&mut self.buffered);
                continue;
            }
            self.locked = false;
            for op in std::mem::take(&mut self.deferred) {
                self.apply_now(op);
            }
            return None;
        }
    }

    pub fn add_waiter(&mut self, token: ResumeToken) {
        self.waiters.push(token);
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn take_waiters(&mut self) -> Vec<ResumeToken> {
        std::mem::take(&mut self.waiters)
    }

    pub fn take_one_waiter(&mut self) -> Option<ResumeToken> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0))
        }
    }
}
