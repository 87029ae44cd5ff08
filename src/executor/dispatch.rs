use super::engine::Engine;
use super::frame::FiberKind;
use super::timers::TimerAction;
use crate::error::EngineResult;
use crate::events::{HandlerMode, Invocation, QueueKey, QueueOutcome};
use crate::heap::{ObjectKind, ObjectRef, Value};

impl Engine {
    /// Queue `value` on every queue matching `(source, event)` and wake waiters.
    ///
    /// Handlers run on the next `run_until_idle`.
    pub fn queue_event(&mut self, source: u32, event: u32, value: Value) -> QueueOutcome {
        let outcome = self.bus.queue_event(source, event, value.clone());
        for token in &outcome.woken {
            if let Err(err) = self.wake(*token, Some(value.clone())) {
                tracing::debug!(fiber = %token.fiber, error = %err, "waiter no longer suspended");
            }
        }
        tracing::debug!(
            source,
            event,
            delivered = outcome.delivered,
            dropped = outcome.dropped,
            woken = outcome.woken.len(),
            "event queued"
        );
        outcome
    }

    pub fn listen(&mut self, key: QueueKey, handler: ObjectRef, mode: HandlerMode) {
        if self.bus.listen(key, handler, mode) {
            let now = self.clock.now_ms();
            tracing::debug!(interval = self.config.idle_interval_ms, "starting idle timer");
            self.timers
                .schedule(now, self.config.idle_interval_ms, TimerAction::Idle);
        }
    }

    pub fn unlisten(&mut self, key: QueueKey, handler: ObjectRef, mode: HandlerMode) {
        self.bus.unlisten(key, handler, mode);
    }

    pub(crate) fn idle_tick(&mut self, now: u64) {
        let key = self.bus.idle_key();
        self.queue_event(key.source, key.event, Value::Null);
        self.timers
            .schedule(now, self.config.idle_interval_ms, TimerAction::Idle);
    }

    /// Start draining every unlocked queue with buffered events.
    pub(crate) fn poke_queues(&mut self) -> EngineResult<()> {
        for invocation in self.bus.poke_all() {
            self.dispatch(Some(invocation))?;
        }
        Ok(())
    }

    /// Spawn a handler fiber for `next`. Handlers that cannot run are skipped
    /// so the queue keeps advancing.
    pub(crate) fn dispatch(&mut self, mut next: Option<Invocation>) -> EngineResult<()> {
        while let Some(invocation) = next.take() {
            let function = self.heap.get(invocation.handler).and_then(|obj| match &obj.kind {
                ObjectKind::Action { function, .. } => Some(*function),
                _ => None,
            });
            match function {
                Some(function) => {
                    self.spawn_fiber(
                        FiberKind::Handler {
                            key: invocation.key,
                            mode: invocation.mode,
                        },
                        function,
                        vec![invocation.value],
                        Some(invocation.handler),
                    )?;
                }
                None => {
                    tracing::warn!(handler = %invocation.handler, "handler is not a closure, skipping");
                    next = self.bus.handler_finished(invocation.key, invocation.mode);
                }
            }
        }
        Ok(())
    }
}
