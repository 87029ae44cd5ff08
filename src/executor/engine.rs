use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use super::clock::Clock;
use super::frame::{Fiber, FiberId, FiberKind, Frame, FrameId};
use super::timers::{TimerAction, TimerQueue};
use crate::config::EngineConfig;
use crate::dap::{DebuggerMessage, RunState, SimMessage, VariablesMessage};
use crate::debugger::{BreakpointMap, DebugState, RunMode};
use crate::error::{EngineError, EngineResult, ProtocolError};
use crate::events::EventBus;
use crate::heap::{
    trace, Heap, HeapSnapshot, HeapTracer, LeakReport, ObjectKind, ObjectRef, Root, Value,
};
use crate::parser::Program;

pub type ErrorHandler = Box<dyn FnMut(&EngineError)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Killed,
}

/// One simulated run: everything the scheduler, event bus, debugger and
/// heap tracer share.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) program: Rc<Program>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) heap: Heap,
    pub(crate) globals: BTreeMap<String, Value>,
    pub(crate) frames: HashMap<FrameId, Frame>,
    pub(crate) fibers: BTreeMap<FiberId, Fiber>,
    pub(crate) ready: VecDeque<FiberId>,
    pub(crate) timers: TimerQueue,
    pub(crate) bus: EventBus,
    pub(crate) debug: DebugState,
    pub(crate) tracer: HeapTracer,
    pub(crate) outbox: Vec<SimMessage>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) state: EngineState,
    /// Fiber stopped at a breakpoint, if any.
    pub(crate) paused: Option<FiberId>,
    pub(crate) last_yield_ms: u64,
    pub(crate) next_frame: u64,
    pub(crate) next_fiber: u64,
    pub(crate) next_nonce: u64,
}

impl Engine {
    pub fn new(program: Program, config: EngineConfig, clock: Box<dyn Clock>) -> Self {
        let globals = program
            .globals
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        let debug = DebugState::new(
            BreakpointMap::new(&program.breakpoints),
            config.trace_interval_ms,
        );
        Self {
            bus: EventBus::new(&config),
            tracer: HeapTracer::new(config.snapshot_retention),
            program: Rc::new(program),
            clock,
            heap: Heap::new(),
            globals,
            frames: HashMap::new(),
            fibers: BTreeMap::new(),
            ready: VecDeque::new(),
            timers: TimerQueue::new(),
            debug,
            outbox: Vec::new(),
            error_handler: None,
            state: EngineState::Created,
            paused: None,
            last_yield_ms: 0,
            next_frame: 0,
            next_fiber: 0,
            next_nonce: 0,
            config,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn debugger(&self) -> &DebugState {
        &self.debug
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(&id)
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    pub fn live_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn paused_fiber(&self) -> Option<FiberId> {
        self.paused
    }

    /// Nothing can run any more: every fiber finished, no timers, no handlers.
    pub fn is_quiescent(&self) -> bool {
        self.ready.is_empty()
            && self.timers.is_empty()
            && self.bus.handlers().next().is_none()
            && self.fibers.values().all(|f| f.is_finished())
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Contents of array `r`, for host inspection.
    pub fn array_items(&self, r: ObjectRef) -> Option<&[Value]> {
        match &self.heap.get(r)?.kind {
            ObjectKind::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn set_error_handler(&mut self, handler: impl FnMut(&EngineError) + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    /// Allocate a closure over the named function, e.g. to register it as a
    /// handler from the host.
    pub fn closure(&mut self, function: &str, captures: Vec<Value>) -> EngineResult<ObjectRef> {
        let index = self
            .program
            .function_index(function)
            .ok_or_else(|| EngineError::Oops(format!("unknown function `{function}`")))?;
        Ok(self.heap.alloc(ObjectKind::Action {
            function: index,
            name: function.to_string(),
            captures,
        }))
    }

    pub(crate) fn emit(&mut self, msg: SimMessage) {
        tracing::trace!(?msg, "outbound message");
        self.outbox.push(msg);
    }

    pub fn drain_outbox(&mut self) -> Vec<SimMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Spawn the main fiber and run until the program goes idle.
    pub fn start(&mut self) -> EngineResult<FiberId> {
        if self.state != EngineState::Created {
            return Err(EngineError::Oops("engine already started".into()));
        }
        let main = self
            .program
            .function_index("main")
            .ok_or_else(|| EngineError::Oops("program has no `main` function".into()))?;

        self.state = EngineState::Running;
        self.last_yield_ms = self.clock.now_ms();
        tracing::info!(
            functions = self.program.functions.len(),
            breakpoints = self.program.breakpoints.len(),
            "starting program"
        );
        self.emit(SimMessage::Status {
            state: RunState::Running,
        });

        let fiber = self.spawn_fiber(FiberKind::Main, main, Vec::new(), None)?;
        self.run_until_idle()?;
        Ok(fiber)
    }

    /// Stop the run. Fibers, frames, timers and queued events are dropped.
    pub fn kill(&mut self) {
        if self.state == EngineState::Killed {
            return;
        }
        tracing::info!(fibers = self.fibers.len(), "killing program");
        self.state = EngineState::Killed;
        self.frames.clear();
        self.fibers.clear();
        self.ready.clear();
        self.timers.clear();
        self.bus.clear();
        self.paused = None;
        self.debug.leave_pause();
        self.emit(SimMessage::Status {
            state: RunState::Killed,
        });
    }

    /// Fire every due timer, then run until idle.
    pub fn tick(&mut self) -> EngineResult<()> {
        if self.state != EngineState::Running {
            return Ok(());
        }
        let now = self.clock.now_ms();
        while let Some(timer) = self.timers.pop_due(now) {
            match timer.action {
                TimerAction::Resume { token, value } => {
                    let finished = self
                        .fibers
                        .get(&token.fiber)
                        .map_or(true, |f| f.is_finished());
                    if finished {
                        tracing::debug!(fiber = %token.fiber, "timer for finished fiber ignored");
                        continue;
                    }
                    self.wake(token, value)?;
                }
                TimerAction::Idle => self.idle_tick(now),
            }
        }
        self.run_until_idle()
    }

    /// Earliest armed timer, for hosts that sleep between ticks.
    pub fn next_timer_due(&self) -> Option<u64> {
        self.timers.next_due()
    }

    /// Dispatch queued events and run ready fibers until nothing is runnable,
    /// a fiber yields its time slice, or a breakpoint pauses the program.
    pub fn run_until_idle(&mut self) -> EngineResult<()> {
        if self.state != EngineState::Running {
            return Ok(());
        }
        self.last_yield_ms = self.clock.now_ms();
        loop {
            if self.paused.is_some() || self.state != EngineState::Running {
                return Ok(());
            }
            self.poke_queues()?;
            let Some(fiber) = self.ready.pop_front() else {
                return Ok(());
            };
            if self.run_fiber(fiber)? {
                // Time slice used up; the continuation sits on the timer queue.
                return Ok(());
            }
        }
    }

    /// Inbound host/debugger message.
    pub fn handle_message(&mut self, msg: SimMessage) -> EngineResult<()> {
        tracing::debug!(?msg, "inbound message");
        match msg {
            SimMessage::Debugger(dbg) => match dbg {
                DebuggerMessage::Config { set_breakpoints } => {
                    self.debug.set_armed(&set_breakpoints);
                    Ok(())
                }
                DebuggerMessage::Resume => self.run_directive(RunMode::Continue),
                DebuggerMessage::StepOver => self.run_directive(RunMode::StepOver),
                DebuggerMessage::StepInto => self.run_directive(RunMode::StepInto),
                DebuggerMessage::StepOut => self.run_directive(RunMode::StepOut),
                DebuggerMessage::Pause => self.run_directive(RunMode::Pause),
                DebuggerMessage::Variables(req) => {
                    self.answer_variables(req);
                    Ok(())
                }
                DebuggerMessage::Breakpoint(_) | DebuggerMessage::Trace(_) => {
                    tracing::debug!("ignoring engine-bound pause notification");
                    Ok(())
                }
            },
            SimMessage::EventBus { id, eventid, value } => {
                self.queue_event(id, eventid, Value::from_json(&value));
                self.run_until_idle()
            }
            SimMessage::Status {
                state: RunState::Killed,
            } => {
                self.kill();
                Ok(())
            }
            SimMessage::Status {
                state: RunState::Running,
            }
            | SimMessage::TopLevelCodeFinished
            | SimMessage::Output { .. } => Ok(()),
        }
    }

    fn answer_variables(&mut self, req: VariablesMessage) {
        if req.variables.is_some() || req.error.is_some() {
            return;
        }
        let expanded = self.debug.variables.expand(
            &self.heap,
            req.variables_reference,
            req.fields.as_deref(),
        );
        let (variables, error) = match expanded {
            Some(variables) => (Some(variables), None),
            None => {
                let err = ProtocolError::InvalidReference(i64::from(req.variables_reference));
                tracing::warn!(reference = req.variables_reference, "unknown variables reference");
                (None, Some(err.to_string()))
            }
        };
        self.emit(SimMessage::Debugger(DebuggerMessage::Variables(
            VariablesMessage {
                req_seq: req.req_seq,
                variables_reference: req.variables_reference,
                fields: None,
                variables,
                error,
            },
        )));
    }

    /// Named roots of the live object graph.
    pub fn roots(&self) -> Vec<Root> {
        let mut roots = Vec::new();
        for (name, value) in &self.globals {
            roots.push(Root::new(name.clone(), value.clone()));
        }

        let mut frames: Vec<&Frame> = self.frames.values().collect();
        frames.sort_by_key(|f| f.id);
        for frame in frames {
            let function = self.program.functions.get(frame.function);
            let fname = function.map_or("?", |f| f.name.as_str());
            let base = format!("{fname}#{}", frame.id.0);
            for (slot, value) in frame.locals.iter().enumerate() {
                let local = function
                    .and_then(|f| f.locals.get(slot))
                    .map_or_else(|| format!("local{slot}"), Clone::clone);
                roots.push(Root::new(format!("{base}.{local}"), value.clone()));
            }
            for (i, value) in frame.stack.iter().enumerate() {
                roots.push(Root::new(format!("{base}.stack[{i}]"), value.clone()));
            }
            if let Some(captures) = frame.captures {
                roots.push(Root::new(format!("{base}.captures"), Value::Ref(captures)));
            }
            for value in frame.retval.iter().chain(frame.thrown.iter()) {
                roots.push(Root::new(format!("{base}.pending"), value.clone()));
            }
        }

        for fiber in self.fibers.values() {
            if let Some(result) = &fiber.result {
                roots.push(Root::new(format!("{}.result", fiber.id), result.clone()));
            }
        }
        for (_, _, handler) in self.bus.handlers() {
            roots.push(Root::new("eventbus", Value::Ref(handler)));
        }
        for value in self.bus.pending_values() {
            roots.push(Root::new("eventbus", value.clone()));
        }
        for value in self.timers.values() {
            roots.push(Root::new("timers", value.clone()));
        }
        roots
    }

    /// Take and retain a snapshot for leak diffing.
    pub fn heap_snapshot(&mut self) -> &HeapSnapshot {
        let roots = self.roots();
        self.tracer.snapshot(&self.heap, &roots)
    }

    pub fn leak_report(&self) -> Option<LeakReport> {
        let program = &self.program;
        self.tracer
            .leak_report(|key| program.record(key).map_or(0, |r| r.expected_instances))
    }

    /// Destroy every object unreachable from the roots. Returns how many were freed.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.roots();
        let live = trace(&self.heap, &roots, 0);
        let dead: Vec<ObjectRef> = self
            .heap
            .iter()
            .filter(|(_, obj)| !live.contains(obj.id))
            .map(|(r, _)| r)
            .collect();
        for r in &dead {
            self.heap.destroy(*r);
        }
        tracing::debug!(freed = dead.len(), live = live.total.count, "garbage collected");
        dead.len()
    }
}
