use super::engine::Engine;
use super::frame::{FiberId, FiberState, FrameId};
use super::runner::Step;
use crate::dap::{DebuggerMessage, PauseInfo, SimMessage, StackFrameInfo, VariableInfo};
use crate::debugger::{BreakScope, RunMode};
use crate::error::EngineResult;
use crate::heap::ObjectKind;

impl Engine {
    fn scope_of(&self, frame: FrameId) -> Option<BreakScope> {
        self.frames.get(&frame).map(|f| BreakScope {
            fiber: f.fiber,
            frame: f.id,
            depth: f.depth,
        })
    }

    pub(crate) fn hit_breakpoint(&mut self, fiber: FiberId, frame: FrameId, id: u32) -> Step {
        let Some(here) = self.scope_of(frame) else {
            return Step::Continue;
        };
        if self.debug.should_stop(id, &here) {
            self.pause_at(fiber, id);
            return Step::Paused;
        }

        let now = self.clock.now_ms();
        if self.debug.should_trace(now) {
            let info = self.pause_info(fiber, Some(id));
            self.debug.variables.clear();
            self.emit(SimMessage::Debugger(DebuggerMessage::Trace(info)));
        }
        Step::Continue
    }

    fn pause_at(&mut self, fiber: FiberId, id: u32) {
        let info = self.pause_info(fiber, Some(id));
        self.debug.enter_pause();
        let now = self.clock.now_ms();
        self.timers.pause(now);
        if let Some(f) = self.fibers.get_mut(&fiber) {
            f.state = FiberState::Paused;
        }
        self.paused = Some(fiber);
        tracing::info!(%fiber, breakpoint = id, "paused at breakpoint");
        self.emit(SimMessage::Debugger(DebuggerMessage::Breakpoint(info)));
    }

    /// Snapshot globals and the fiber's frame chain, innermost frame first.
    pub(crate) fn pause_info(&mut self, fiber: FiberId, breakpoint_id: Option<u32>) -> PauseInfo {
        let heap = &self.heap;
        let (breakpoints, vars) = self.debug.inspect();

        let globals: Vec<VariableInfo> = self
            .globals
            .iter()
            .map(|(name, value)| vars.describe(heap, name, value))
            .collect();

        let mut stackframes = Vec::new();
        let mut current = self.fibers.get(&fiber).and_then(|f| f.frame);
        while let Some(frame) = current.and_then(|id| self.frames.get(&id)) {
            let function = self.program.functions.get(frame.function);
            let location = frame
                .last_breakpoint
                .and_then(|id| breakpoints.get(id));

            let locals = frame
                .locals
                .iter()
                .enumerate()
                .map(|(slot, value)| {
                    let name = function
                        .and_then(|f| f.locals.get(slot))
                        .map_or_else(|| format!("local{slot}"), Clone::clone);
                    vars.describe(heap, &name, value)
                })
                .collect();

            let captured = frame
                .captures
                .and_then(|c| heap.get(c))
                .map(|obj| match &obj.kind {
                    ObjectKind::Action { captures, .. } => captures.clone(),
                    _ => Vec::new(),
                })
                .unwrap_or_default();
            let captures = captured
                .iter()
                .enumerate()
                .map(|(i, value)| vars.describe(heap, &format!("capture{i}"), value))
                .collect();

            stackframes.push(StackFrameInfo {
                id: frame.id.0,
                name: function.map_or_else(|| "?".to_string(), |f| f.name.clone()),
                breakpoint_id: frame.last_breakpoint,
                source: location.map(|bp| bp.path.clone()),
                line: location.map_or_else(
                    || {
                        function.map_or(0, |f| f.line_of(frame.pc.saturating_sub(1)) as u32)
                    },
                    |bp| bp.line,
                ),
                column: location.map_or(0, |bp| bp.column),
                locals,
                captures,
            });
            current = frame.parent;
        }

        PauseInfo {
            breakpoint_id,
            globals,
            stackframes,
            exception_message: None,
        }
    }

    /// Apply a resume/step/pause directive from the debugger.
    pub(crate) fn run_directive(&mut self, mode: RunMode) -> EngineResult<()> {
        let Some(fiber) = self.paused else {
            self.debug.apply(mode, None, None);
            return Ok(());
        };
        if mode == RunMode::Pause {
            return Ok(());
        }

        let current = self.fibers.get(&fiber).and_then(|f| f.frame);
        let parent = current
            .and_then(|id| self.frames.get(&id))
            .and_then(|f| f.parent);
        let current_scope = current.and_then(|id| self.scope_of(id));
        let parent_scope = parent.and_then(|id| self.scope_of(id));
        self.debug.apply(mode, current_scope, parent_scope);
        self.debug.leave_pause();

        let now = self.clock.now_ms();
        self.timers.resume(now);
        self.paused = None;
        if let Some(f) = self.fibers.get_mut(&fiber) {
            if f.state == FiberState::Paused {
                f.state = FiberState::Ready;
                self.ready.push_front(fiber);
            }
        }
        tracing::info!(%fiber, ?mode, "resuming");
        self.run_until_idle()
    }
}
