use std::fmt;

use crate::events::{HandlerMode, QueueKey};
use crate::heap::{ObjectRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// An active exception handler scope.
#[derive(Debug, Clone, PartialEq)]
pub struct TryFrame {
    pub parent: Option<Box<TryFrame>>,
    pub handler_pc: usize,
    pub frame: FrameId,
    /// Operand stack height to restore when the handler takes over.
    pub stack_height: usize,
}

/// One in-progress function activation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub fiber: FiberId,
    pub function: usize,
    pub pc: usize,
    pub parent: Option<FrameId>,
    pub depth: usize,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    /// Closure whose captures this activation can read.
    pub captures: Option<ObjectRef>,
    pub try_frame: Option<Box<TryFrame>>,
    pub last_breakpoint: Option<u32>,
    /// Value handed back by a callee return or an asynchronous resume.
    pub retval: Option<Value>,
    /// Exception delivered to the current handler, not yet consumed.
    pub thrown: Option<Value>,
}

impl Frame {
    pub fn take_thrown(&mut self) -> Option<Value> {
        self.thrown.take()
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Ready,
    /// Waiting on a resume token (timer, event, yield).
    Suspended,
    /// Stopped at a breakpoint.
    Paused,
    Done,
    Crashed,
}

/// Why a fiber exists; decides what happens when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberKind {
    Main,
    Handler { key: QueueKey, mode: HandlerMode },
    Forked,
}

/// Handed out by `build_resume`; consumed by `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResumeToken {
    pub fiber: FiberId,
    pub frame: FrameId,
    pub nonce: u64,
}

#[derive(Debug, Clone)]
pub struct Fiber {
    pub id: FiberId,
    pub kind: FiberKind,
    pub state: FiberState,
    /// Innermost frame; `None` once the fiber completed.
    pub frame: Option<FrameId>,
    pub pending_resume: Option<ResumeToken>,
    pub result: Option<Value>,
}

impl Fiber {
    pub fn is_finished(&self) -> bool {
        matches!(self.state, FiberState::Done | FiberState::Crashed)
    }
}
