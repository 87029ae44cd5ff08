use std::collections::BTreeMap;

use super::queue::{EventQueue, HandlerMode, HandlerOp, Invocation, QueueKey};
use crate::config::EngineConfig;
use crate::executor::ResumeToken;
use crate::heap::{ObjectRef, Value};

/// What a `queue` call did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueOutcome {
    /// Queues that buffered the value.
    pub delivered: usize,
    /// Queues that shed it (backlog full or no handlers).
    pub dropped: usize,
    /// One-shot waiters to resume with the value.
    pub woken: Vec<ResumeToken>,
}

/// Routes `(source, event)` notifications to foreground and background queues.
#[derive(Debug)]
pub struct EventBus {
    queues: BTreeMap<(QueueKey, HandlerMode), EventQueue>,
    any_id: u32,
    notify_one_id: Option<u32>,
    max_backlog: usize,
    idle_key: QueueKey,
    idle_started: bool,
}

impl EventBus {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            queues: BTreeMap::new(),
            any_id: config.any_id,
            notify_one_id: config.notify_one_id,
            max_backlog: config.max_event_backlog,
            idle_key: QueueKey::new(config.scheduler_source_id, config.idle_event_id),
            idle_started: false,
        }
    }

    pub fn idle_key(&self) -> QueueKey {
        self.idle_key
    }

    fn queue_mut(&mut self, key: QueueKey, mode: HandlerMode) -> &mut EventQueue {
        self.queues
            .entry((key, mode))
            .or_insert_with(|| EventQueue::new(key, mode))
    }

    pub fn queue(&self, key: QueueKey, mode: HandlerMode) -> Option<&EventQueue> {
        self.queues.get(&(key, mode))
    }

    /// Register a handler. Returns `true` when this is the first listener on
    /// the idle pair, i.e. the caller should start the idle timer.
    pub fn listen(&mut self, key: QueueKey, handler: ObjectRef, mode: HandlerMode) -> bool {
        let op = match mode {
            HandlerMode::Foreground => HandlerOp::Set(handler),
            HandlerMode::Background => HandlerOp::Add(handler),
        };
        self.queue_mut(key, mode).apply(op);

        if key == self.idle_key && !self.idle_started {
            self.idle_started = true;
            return true;
        }
        false
    }

    pub fn unlisten(&mut self, key: QueueKey, handler: ObjectRef, mode: HandlerMode) {
        if let Some(queue) = self.queues.get_mut(&(key, mode)) {
            queue.apply(HandlerOp::Remove(handler));
        }
    }

    pub fn add_waiter(&mut self, key: QueueKey, token: ResumeToken) {
        self.queue_mut(key, HandlerMode::Foreground).add_waiter(token);
    }

    fn targets(&self, source: u32, event: u32) -> Vec<QueueKey> {
        let any = self.any_id;
        let mut keys = vec![
            QueueKey::new(any, any),
            QueueKey::new(any, event),
            QueueKey::new(source, any),
            QueueKey::new(source, event),
        ];
        keys.sort();
        keys.dedup();
        keys
    }

    /// Fan `value` out to every matching queue and collect waiters to wake.
    pub fn queue_event(&mut self, source: u32, event: u32, value: Value) -> QueueOutcome {
        let mut outcome = QueueOutcome::default();
        let notify_one = self.notify_one_id == Some(source);
        let max_backlog = self.max_backlog;

        for key in self.targets(source, event) {
            for mode in [HandlerMode::Foreground, HandlerMode::Background] {
                let Some(queue) = self.queues.get_mut(&(key, mode)) else {
                    continue;
                };

                if mode == HandlerMode::Foreground && queue.has_waiters() {
                    if notify_one {
                        if outcome.woken.is_empty() {
                            outcome.woken.extend(queue.take_one_waiter());
                        }
                    } else {
                        outcome.woken.extend(queue.take_waiters());
                    }
                }

                if queue.handlers().is_empty() {
                    continue;
                }
                if queue.push(value.clone(), max_backlog) {
                    outcome.delivered += 1;
                } else {
                    outcome.dropped += 1;
                    tracing::warn!(
                        source = key.source,
                        event = key.event,
                        backlog = queue.waiting_len(),
                        "event queue full, dropping event"
                    );
                }
            }
        }
        outcome
    }

    /// Start draining every idle queue that has buffered work.
    pub fn poke_all(&mut self) -> Vec<Invocation> {
        self.queues.values_mut().filter_map(|q| q.poke()).collect()
    }

    pub fn handler_finished(&mut self, key: QueueKey, mode: HandlerMode) -> Option<Invocation> {
        self.queues.get_mut(&(key, mode))?.handler_finished()
    }

    /// Every registered handler, for heap tracing.
    pub fn handlers(&self) -> impl Iterator<Item = (QueueKey, HandlerMode, ObjectRef)> + '_ {
        self.queues
            .values()
            .flat_map(|q| q.handlers().iter().map(move |h| (q.key(), q.mode(), *h)))
    }

    /// Event values not yet delivered.
    pub fn pending_values(&self) -> impl Iterator<Item = &Value> + '_ {
        self.queues.values().flat_map(|q| q.pending_values())
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.idle_started = false;
    }
}
