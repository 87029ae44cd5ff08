use std::rc::Rc;

use super::engine::Engine;
use super::frame::{Fiber, FiberId, FiberKind, FiberState, Frame, FrameId, ResumeToken, TryFrame};
use super::timers::TimerAction;
use crate::dap::{DebuggerMessage, SimMessage};
use crate::error::{EngineError, EngineResult};
use crate::events::{HandlerMode, QueueKey};
use crate::heap::{trace, ObjectKind, ObjectRef, Value};
use crate::parser::{BinaryOp, Instr};

/// What one step did to the current fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// Handed off to an asynchronous resume.
    Suspended,
    Paused,
    Finished,
}

/// Work the current instruction leaves for the scheduler once the frame
/// borrow is released.
enum Flow {
    Next,
    Throw(Value),
    Call {
        function: usize,
        args: Vec<Value>,
        captures: Option<ObjectRef>,
    },
    Return(Value),
    Breakpoint(u32),
    Sleep(u64),
    Wait(QueueKey),
    Listen {
        key: QueueKey,
        handler: ObjectRef,
        mode: HandlerMode,
        remove: bool,
    },
    Raise {
        source: u32,
        event: u32,
        value: Value,
    },
    Fork {
        function: usize,
        args: Vec<Value>,
        captures: ObjectRef,
    },
    Print(Value),
}

fn pop_args(frame: &mut Frame, argc: usize) -> Vec<Value> {
    let at = frame.stack.len().saturating_sub(argc);
    let mut args = frame.stack.split_off(at);
    while args.len() < argc {
        args.insert(0, Value::Null);
    }
    args
}

/// Element position for a numeric index: non-negative and integral.
fn element_index(n: f64) -> Option<usize> {
    if n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 {
        Some(n as usize)
    } else {
        None
    }
}

fn type_error(message: impl Into<String>) -> Flow {
    Flow::Throw(Value::Str(message.into()))
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(a == b)),
        BinaryOp::Add => match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::Str(format!("{a}{b}"))),
            _ => Err(format!("cannot add {} and {}", a.type_name(), b.type_name())),
        },
        _ => {
            let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                return Err(format!(
                    "{op:?} needs numbers, got {} and {}",
                    a.type_name(),
                    b.type_name()
                ));
            };
            Ok(match op {
                BinaryOp::Sub => Value::Number(x - y),
                BinaryOp::Mul => Value::Number(x * y),
                _ => Value::Bool(x < y),
            })
        }
    }
}

impl Engine {
    fn fiber_mut(&mut self, id: FiberId) -> EngineResult<&mut Fiber> {
        self.fibers
            .get_mut(&id)
            .ok_or_else(|| EngineError::Oops(format!("unknown {id}")))
    }

    fn alloc_frame(
        &mut self,
        fiber: FiberId,
        function: usize,
        args: Vec<Value>,
        captures: Option<ObjectRef>,
        parent: Option<(FrameId, usize)>,
    ) -> EngineResult<FrameId> {
        let depth = parent.map_or(1, |(_, d)| d + 1);
        if depth > self.config.max_call_depth {
            return Err(EngineError::StackOverflow { depth });
        }
        let def = self
            .program
            .functions
            .get(function)
            .ok_or_else(|| EngineError::Oops(format!("no function #{function}")))?;

        let mut locals = vec![Value::Null; def.locals.len().max(def.params)];
        for (slot, arg) in args.into_iter().take(def.params).enumerate() {
            locals[slot] = arg;
        }

        self.next_frame += 1;
        let id = FrameId(self.next_frame);
        self.frames.insert(
            id,
            Frame {
                id,
                fiber,
                function,
                pc: 0,
                parent: parent.map(|(p, _)| p),
                depth,
                locals,
                stack: Vec::new(),
                captures,
                try_frame: None,
                last_breakpoint: None,
                retval: None,
                thrown: None,
            },
        );
        Ok(id)
    }

    /// Create a fiber whose root frame runs `function`, and queue it.
    pub(crate) fn spawn_fiber(
        &mut self,
        kind: FiberKind,
        function: usize,
        args: Vec<Value>,
        captures: Option<ObjectRef>,
    ) -> EngineResult<FiberId> {
        self.next_fiber += 1;
        let id = FiberId(self.next_fiber);
        let frame = self.alloc_frame(id, function, args, captures, None)?;
        self.fibers.insert(
            id,
            Fiber {
                id,
                kind,
                state: FiberState::Ready,
                frame: Some(frame),
                pending_resume: None,
                result: None,
            },
        );
        self.ready.push_back(id);
        tracing::debug!(fiber = %id, ?kind, function, "spawned fiber");
        Ok(id)
    }

    /// Record that `fiber` waits for an asynchronous resume of its current frame.
    ///
    /// A fiber may have at most one outstanding token.
    pub fn build_resume(&mut self, fiber: FiberId) -> EngineResult<ResumeToken> {
        self.next_nonce += 1;
        let nonce = self.next_nonce;
        let f = self.fiber_mut(fiber)?;
        if f.pending_resume.is_some() {
            return Err(EngineError::DoubleResume { fiber });
        }
        let frame = f
            .frame
            .ok_or_else(|| EngineError::Oops(format!("{fiber} has no frame to resume")))?;
        let token = ResumeToken {
            fiber,
            frame,
            nonce,
        };
        f.pending_resume = Some(token);
        f.state = FiberState::Suspended;
        Ok(token)
    }

    /// Consume `token` and run. `Some(value)` is handed to the resumed frame.
    pub fn resume(&mut self, token: ResumeToken, value: Option<Value>) -> EngineResult<()> {
        self.wake(token, value)?;
        self.run_until_idle()
    }

    pub(crate) fn wake(&mut self, token: ResumeToken, value: Option<Value>) -> EngineResult<()> {
        let f = self
            .fibers
            .get_mut(&token.fiber)
            .ok_or(EngineError::StaleResume { fiber: token.fiber })?;
        if f.pending_resume != Some(token) {
            return Err(EngineError::StaleResume { fiber: token.fiber });
        }
        f.pending_resume = None;
        f.state = FiberState::Ready;
        if let Some(value) = value {
            if let Some(frame) = self.frames.get_mut(&token.frame) {
                frame.retval = Some(value);
            }
        }
        self.ready.push_back(token.fiber);
        Ok(())
    }

    /// Run `fiber` until it suspends, finishes, pauses or exhausts the time
    /// slice. Returns `true` in the last case.
    pub(crate) fn run_fiber(&mut self, fiber: FiberId) -> EngineResult<bool> {
        match self.fibers.get(&fiber) {
            Some(f) if f.state == FiberState::Ready => {}
            _ => return Ok(false),
        }
        loop {
            let step = match self.step(fiber) {
                Ok(step) => step,
                Err(err) => {
                    let internal = err.is_internal();
                    self.crash_fiber(fiber, &err);
                    if internal {
                        return Err(err);
                    }
                    return Ok(false);
                }
            };
            if step != Step::Continue {
                return Ok(false);
            }

            let now = self.clock.now_ms();
            if now.saturating_sub(self.last_yield_ms) >= self.config.yield_budget_ms {
                let token = self.build_resume(fiber)?;
                self.timers.schedule(
                    now,
                    self.config.yield_delay_ms,
                    TimerAction::Resume { token, value: None },
                );
                tracing::debug!(%fiber, elapsed = now - self.last_yield_ms, "yielding time slice");
                self.last_yield_ms = now;
                return Ok(true);
            }
        }
    }

    fn step(&mut self, fiber: FiberId) -> EngineResult<Step> {
        let frame_id = self
            .fibers
            .get(&fiber)
            .and_then(|f| f.frame)
            .ok_or_else(|| EngineError::Oops(format!("{fiber} has no frame")))?;
        let program = Rc::clone(&self.program);
        let frame = self
            .frames
            .get_mut(&frame_id)
            .ok_or_else(|| EngineError::Oops(format!("dangling frame {frame_id:?}")))?;
        if let Some(value) = frame.retval.take() {
            frame.stack.push(value);
        }
        let function = program
            .functions
            .get(frame.function)
            .ok_or_else(|| EngineError::Oops(format!("no function #{}", frame.function)))?;
        let Some(instr) = function.code.get(frame.pc) else {
            return self.finish_frame(fiber, frame_id, Value::Null);
        };
        frame.pc += 1;

        let flow = match instr {
            Instr::Push { value } => {
                frame.stack.push(Value::from(value));
                Flow::Next
            }
            Instr::Load { slot } => {
                let value = frame.locals.get(*slot).cloned().unwrap_or_default();
                frame.stack.push(value);
                Flow::Next
            }
            Instr::Store { slot } => {
                let value = frame.pop();
                if let Some(local) = frame.locals.get_mut(*slot) {
                    *local = value;
                }
                Flow::Next
            }
            Instr::LoadGlobal { name } => {
                frame
                    .stack
                    .push(self.globals.get(name).cloned().unwrap_or_default());
                Flow::Next
            }
            Instr::StoreGlobal { name } => {
                self.globals.insert(name.clone(), frame.pop());
                Flow::Next
            }
            Instr::LoadCapture { index } => {
                let captured = frame
                    .captures
                    .and_then(|c| self.heap.get(c))
                    .and_then(|obj| match &obj.kind {
                        ObjectKind::Action { captures, .. } => captures.get(*index).cloned(),
                        _ => None,
                    });
                match captured {
                    Some(value) => {
                        frame.stack.push(value);
                        Flow::Next
                    }
                    None => type_error(format!("no captured value #{index}")),
                }
            }
            Instr::MakeClosure {
                function: target,
                captures,
            } => {
                let captured = pop_args(frame, *captures);
                let name = program
                    .functions
                    .get(*target)
                    .map_or_else(String::new, |f| f.name.clone());
                let closure = self.heap.alloc(ObjectKind::Action {
                    function: *target,
                    name,
                    captures: captured,
                });
                frame.stack.push(Value::Ref(closure));
                Flow::Next
            }
            Instr::Call {
                function: target,
                argc,
            } => Flow::Call {
                function: *target,
                args: pop_args(frame, *argc),
                captures: None,
            },
            Instr::CallIndirect { argc } | Instr::Fork { argc } => {
                let args = pop_args(frame, *argc);
                let callee = frame.pop();
                let target = callee.as_object().and_then(|r| {
                    self.heap.get(r).and_then(|obj| match &obj.kind {
                        ObjectKind::Action { function, .. } => Some((*function, r)),
                        _ => None,
                    })
                });
                match (target, instr) {
                    (None, _) => type_error(format!("{} is not callable", callee.type_name())),
                    (Some((function, captures)), Instr::Fork { .. }) => Flow::Fork {
                        function,
                        args,
                        captures,
                    },
                    (Some((function, captures)), _) => Flow::Call {
                        function,
                        args,
                        captures: Some(captures),
                    },
                }
            }
            Instr::Return => Flow::Return(frame.pop()),
            Instr::Jump { target } => {
                frame.pc = *target;
                Flow::Next
            }
            Instr::JumpIfFalse { target } => {
                if !frame.pop().truthy() {
                    frame.pc = *target;
                }
                Flow::Next
            }
            Instr::Binary { op } => {
                let b = frame.pop();
                let a = frame.pop();
                match arithmetic(*op, &a, &b) {
                    Ok(value) => {
                        frame.stack.push(value);
                        Flow::Next
                    }
                    Err(message) => type_error(message),
                }
            }
            Instr::Not => {
                let value = frame.pop();
                frame.stack.push(Value::Bool(!value.truthy()));
                Flow::Next
            }
            Instr::Pop => {
                frame.pop();
                Flow::Next
            }
            Instr::Dup => {
                let top = frame.stack.last().cloned().unwrap_or_default();
                frame.stack.push(top);
                Flow::Next
            }
            Instr::BeginTry { handler } => {
                frame.try_frame = Some(Box::new(TryFrame {
                    parent: frame.try_frame.take(),
                    handler_pc: *handler,
                    frame: frame_id,
                    stack_height: frame.stack.len(),
                }));
                Flow::Next
            }
            Instr::EndTry => match frame.try_frame.take() {
                Some(done) => {
                    frame.try_frame = done.parent;
                    Flow::Next
                }
                None => {
                    return Err(EngineError::MismatchedTry {
                        function: function.name.clone(),
                    })
                }
            },
            Instr::Catch => {
                let thrown = frame.take_thrown().unwrap_or_default();
                frame.stack.push(thrown);
                Flow::Next
            }
            Instr::Throw => Flow::Throw(frame.pop()),
            Instr::EndFinally => match frame.take_thrown() {
                Some(pending) => Flow::Throw(pending),
                None => Flow::Next,
            },
            Instr::Breakpoint { id } => {
                frame.last_breakpoint = Some(*id);
                Flow::Breakpoint(*id)
            }
            Instr::NewRecord { type_name } => {
                let record = self.heap.alloc(ObjectKind::Record {
                    type_name: type_name.clone(),
                    fields: Default::default(),
                });
                frame.stack.push(Value::Ref(record));
                Flow::Next
            }
            Instr::SetField { name } => {
                let value = frame.pop();
                let target = frame.pop();
                let result = match target.as_object().and_then(|r| self.heap.get_mut(r)) {
                    Some(obj) => obj.set_field(name, value),
                    None => Err(format!("cannot set `{name}` on {}", target.type_name())),
                };
                match result {
                    Ok(()) => Flow::Next,
                    Err(message) => type_error(message),
                }
            }
            Instr::GetField { name } => {
                let target = frame.pop();
                let result = match target.as_object().and_then(|r| self.heap.get(r)) {
                    Some(obj) => obj.get_field(name),
                    None => Err(format!("cannot read `{name}` of {}", target.type_name())),
                };
                match result {
                    Ok(value) => {
                        frame.stack.push(value);
                        Flow::Next
                    }
                    Err(message) => type_error(message),
                }
            }
            Instr::NewArray => {
                let array = self.heap.alloc(ObjectKind::Array(Vec::new()));
                frame.stack.push(Value::Ref(array));
                Flow::Next
            }
            Instr::ArrayPush => {
                let value = frame.pop();
                let target = frame.pop();
                match target
                    .as_object()
                    .and_then(|r| self.heap.get_mut(r))
                    .map(|obj| &mut obj.kind)
                {
                    Some(ObjectKind::Array(items)) => {
                        items.push(value);
                        Flow::Next
                    }
                    _ => type_error(format!("cannot push onto {}", target.type_name())),
                }
            }
            Instr::Index => {
                let key = frame.pop();
                let target = frame.pop();
                let kind = target
                    .as_object()
                    .and_then(|r| self.heap.get(r))
                    .map(|obj| &obj.kind);
                let found = match (kind, &key) {
                    (Some(ObjectKind::Array(items)), Value::Number(n)) => element_index(*n)
                        .map(|i| items.get(i).cloned().unwrap_or_default())
                        .ok_or_else(|| format!("invalid array index {key}")),
                    (Some(ObjectKind::Buffer(bytes)), Value::Number(n)) => element_index(*n)
                        .map(|i| {
                            bytes
                                .get(i)
                                .map_or(Value::Null, |b| Value::Number(f64::from(*b)))
                        })
                        .ok_or_else(|| format!("invalid buffer index {key}")),
                    (Some(ObjectKind::Map(fields)), Value::Str(k)) => {
                        Ok(fields.get(k).cloned().unwrap_or_default())
                    }
                    _ => Err(format!(
                        "cannot index {} with {}",
                        target.type_name(),
                        key.type_name()
                    )),
                };
                match found {
                    Ok(value) => {
                        frame.stack.push(value);
                        Flow::Next
                    }
                    Err(message) => type_error(message),
                }
            }
            Instr::NewMap => {
                let map = self.heap.alloc(ObjectKind::Map(Default::default()));
                frame.stack.push(Value::Ref(map));
                Flow::Next
            }
            Instr::NewBuffer { size } => {
                let buffer = self.heap.alloc(ObjectKind::Buffer(vec![0; *size]));
                frame.stack.push(Value::Ref(buffer));
                Flow::Next
            }
            Instr::Sleep => match frame.pop().as_number() {
                Some(ms) if ms >= 0.0 => Flow::Sleep(ms as u64),
                _ => type_error("sleep needs a non-negative number"),
            },
            Instr::Listen {
                source,
                event,
                background,
            }
            | Instr::Unlisten {
                source,
                event,
                background,
            } => {
                let handler = frame.pop();
                match handler.as_object() {
                    Some(handler) => Flow::Listen {
                        key: QueueKey::new(*source, *event),
                        handler,
                        mode: if *background {
                            HandlerMode::Background
                        } else {
                            HandlerMode::Foreground
                        },
                        remove: matches!(instr, Instr::Unlisten { .. }),
                    },
                    None => type_error(format!("{} is not a handler", handler.type_name())),
                }
            }
            Instr::Raise { source, event } => Flow::Raise {
                source: *source,
                event: *event,
                value: frame.pop(),
            },
            Instr::WaitEvent { source, event } => Flow::Wait(QueueKey::new(*source, *event)),
            Instr::Print => Flow::Print(frame.pop()),
        };

        match flow {
            Flow::Next => Ok(Step::Continue),
            Flow::Throw(value) => self.throw_value(fiber, value),
            Flow::Call {
                function,
                args,
                captures,
            } => {
                let depth = self.frames.get(&frame_id).map_or(0, |f| f.depth);
                let callee =
                    self.alloc_frame(fiber, function, args, captures, Some((frame_id, depth)))?;
                self.fiber_mut(fiber)?.frame = Some(callee);
                Ok(Step::Continue)
            }
            Flow::Return(value) => self.finish_frame(fiber, frame_id, value),
            Flow::Breakpoint(id) => Ok(self.hit_breakpoint(fiber, frame_id, id)),
            Flow::Sleep(ms) => {
                let token = self.build_resume(fiber)?;
                let now = self.clock.now_ms();
                self.timers
                    .schedule(now, ms, TimerAction::Resume { token, value: None });
                Ok(Step::Suspended)
            }
            Flow::Wait(key) => {
                let token = self.build_resume(fiber)?;
                self.bus.add_waiter(key, token);
                Ok(Step::Suspended)
            }
            Flow::Listen {
                key,
                handler,
                mode,
                remove,
            } => {
                if remove {
                    self.unlisten(key, handler, mode);
                } else {
                    self.listen(key, handler, mode);
                }
                Ok(Step::Continue)
            }
            Flow::Raise {
                source,
                event,
                value,
            } => {
                self.queue_event(source, event, value);
                Ok(Step::Continue)
            }
            Flow::Fork {
                function,
                args,
                captures,
            } => {
                self.spawn_fiber(FiberKind::Forked, function, args, Some(captures))?;
                Ok(Step::Continue)
            }
            Flow::Print(value) => {
                let text = match value.as_object().and_then(|r| self.heap.get(r)) {
                    Some(obj) => obj.describe(),
                    None => value.to_string(),
                };
                tracing::debug!(%fiber, %text, "program output");
                self.emit(SimMessage::Output { text });
                Ok(Step::Continue)
            }
        }
    }

    /// Pop `frame_id` and hand `value` to its caller, or finish the fiber.
    fn finish_frame(
        &mut self,
        fiber: FiberId,
        frame_id: FrameId,
        value: Value,
    ) -> EngineResult<Step> {
        let frame = self
            .frames
            .remove(&frame_id)
            .ok_or_else(|| EngineError::Oops(format!("returning from dead frame {frame_id:?}")))?;
        match frame.parent {
            Some(parent) => {
                if let Some(caller) = self.frames.get_mut(&parent) {
                    caller.retval = Some(value);
                }
                self.fiber_mut(fiber)?.frame = Some(parent);
                Ok(Step::Continue)
            }
            None => {
                self.finish_fiber(fiber, FiberState::Done, Some(value))?;
                Ok(Step::Finished)
            }
        }
    }

    /// Transfer control to the nearest enclosing handler, unwinding every frame
    /// in between. Uncaught values are fatal to the fiber.
    pub(crate) fn throw_value(&mut self, fiber: FiberId, value: Value) -> EngineResult<Step> {
        let mut current = self.fibers.get(&fiber).and_then(|f| f.frame);
        let mut unwound = Vec::new();

        while let Some(id) = current {
            let Some(frame) = self.frames.get_mut(&id) else {
                break;
            };
            if let Some(handler) = frame.try_frame.take() {
                frame.try_frame = handler.parent;
                frame.pc = handler.handler_pc;
                frame.stack.truncate(handler.stack_height);
                frame.retval = None;
                frame.thrown = Some(value);
                for dead in &unwound {
                    self.frames.remove(dead);
                }
                tracing::debug!(%fiber, unwound = unwound.len(), pc = handler.handler_pc, "exception caught");
                self.fiber_mut(fiber)?.frame = Some(handler.frame);
                return Ok(Step::Continue);
            }
            unwound.push(id);
            current = frame.parent;
        }

        let message = match value.as_object().and_then(|r| self.heap.get(r)) {
            Some(obj) => obj.describe(),
            None => value.to_string(),
        };
        Err(EngineError::Uncaught { message })
    }

    pub(crate) fn finish_fiber(
        &mut self,
        fiber: FiberId,
        state: FiberState,
        result: Option<Value>,
    ) -> EngineResult<()> {
        let f = self.fiber_mut(fiber)?;
        f.state = state;
        f.result = result;
        f.pending_resume = None;
        let kind = f.kind;
        let mut frame = f.frame.take();
        while let Some(id) = frame {
            frame = self.frames.remove(&id).and_then(|dead| dead.parent);
        }
        tracing::debug!(%fiber, ?state, "fiber finished");

        match kind {
            FiberKind::Main => {
                if state == FiberState::Done {
                    tracing::info!("top-level code finished");
                    self.emit(SimMessage::TopLevelCodeFinished);
                }
            }
            FiberKind::Handler { key, mode } => {
                self.fibers.remove(&fiber);
                let next = self.bus.handler_finished(key, mode);
                self.dispatch(next)?;
            }
            FiberKind::Forked => {
                self.fibers.remove(&fiber);
            }
        }
        Ok(())
    }

    /// Report a fatal fiber error to the host handler, or emit a diagnostic.
    fn crash_fiber(&mut self, fiber: FiberId, err: &EngineError) {
        let handled = match self.error_handler.as_mut() {
            Some(handler) => {
                handler(err);
                true
            }
            None => false,
        };
        if !handled {
            let roots = self.roots();
            let snapshot = trace(&self.heap, &roots, 0);
            let mut info = self.pause_info(fiber, None);
            info.exception_message = Some(err.to_string());
            self.debug.variables.clear();
            tracing::error!(
                %fiber,
                error = %err,
                frames = info.stackframes.len(),
                objects = snapshot.total.count,
                heap_size = snapshot.total.size,
                "fiber crashed"
            );
            self.emit(SimMessage::Debugger(DebuggerMessage::Breakpoint(info)));
        }
        if let Err(finish_err) = self.finish_fiber(fiber, FiberState::Crashed, None) {
            tracing::error!(%fiber, error = %finish_err, "cleanup after crash failed");
        }
    }
}
