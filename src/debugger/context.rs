use super::breakpoints::BreakpointMap;
use super::variables::VariableStore;
use super::RunMode;
use crate::executor::{FiberId, FrameId};

/// Where a step-over/step-out should be allowed to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakScope {
    pub fiber: FiberId,
    pub frame: FrameId,
    pub depth: usize,
}

impl BreakScope {
    /// True when `here` is the scope frame itself or one of its ancestors.
    ///
    /// Frames of one fiber form a single chain, so a shallower frame on the
    /// same fiber is an ancestor (or the caller the scope frame returned to).
    pub fn contains(&self, here: &BreakScope) -> bool {
        here.fiber == self.fiber && (here.frame == self.frame || here.depth < self.depth)
    }
}

pub struct DebugState {
    breakpoints: BreakpointMap,
    armed: Vec<u8>,
    mode: RunMode,
    break_on_next: bool,
    break_scope: Option<BreakScope>,
    paused_on_breakpoint: bool,
    trace_interval_ms: Option<u64>,
    last_trace_ms: Option<u64>,
    pub variables: VariableStore,
}

impl DebugState {
    pub fn new(breakpoints: BreakpointMap, trace_interval_ms: Option<u64>) -> Self {
        let armed = vec![0; breakpoints.max_id() as usize + 1];
        Self {
            breakpoints,
            armed,
            mode: RunMode::Continue,
            break_on_next: false,
            break_scope: None,
            paused_on_breakpoint: false,
            trace_interval_ms,
            last_trace_ms: None,
            variables: VariableStore::new(),
        }
    }

    pub fn breakpoints(&self) -> &BreakpointMap {
        &self.breakpoints
    }

    /// Breakpoint table and variable store, borrowed together for building pause snapshots.
    pub fn inspect(&mut self) -> (&BreakpointMap, &mut VariableStore) {
        (&self.breakpoints, &mut self.variables)
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn break_on_next(&self) -> bool {
        self.break_on_next
    }

    pub fn break_scope(&self) -> Option<BreakScope> {
        self.break_scope
    }

    pub fn is_paused(&self) -> bool {
        self.paused_on_breakpoint
    }

    /// Replace the armed set. Ids outside the breakpoint table are ignored.
    pub fn set_armed(&mut self, ids: &[u32]) {
        self.armed.iter_mut().for_each(|b| *b = 0);
        for &id in ids {
            match self.armed.get_mut(id as usize) {
                Some(slot) if self.breakpoints.get(id).is_some() => *slot = 1,
                _ => tracing::debug!(id, "ignoring unknown breakpoint id"),
            }
        }
    }

    pub fn is_armed(&self, id: u32) -> bool {
        self.armed.get(id as usize).is_some_and(|b| *b != 0)
    }

    pub fn armed_ids(&self) -> Vec<u32> {
        self.armed
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Apply a run directive. `current` is the paused frame, `parent` its caller.
    pub fn apply(&mut self, mode: RunMode, current: Option<BreakScope>, parent: Option<BreakScope>) {
        self.mode = mode;
        match mode {
            RunMode::Continue => {
                self.break_on_next = false;
                self.break_scope = None;
            }
            RunMode::StepInto | RunMode::Pause => {
                self.break_on_next = true;
                self.break_scope = None;
            }
            RunMode::StepOver => {
                self.break_on_next = true;
                self.break_scope = current;
            }
            RunMode::StepOut => {
                self.break_on_next = true;
                self.break_scope = parent.or(current);
            }
        }
        tracing::debug!(?mode, scope = ?self.break_scope, "debugger directive");
    }

    pub fn should_stop(&self, id: u32, here: &BreakScope) -> bool {
        if self.is_armed(id) {
            return true;
        }
        self.break_on_next && self.break_scope.map_or(true, |scope| scope.contains(here))
    }

    pub fn enter_pause(&mut self) {
        self.break_on_next = false;
        self.break_scope = None;
        self.paused_on_breakpoint = true;
    }

    pub fn leave_pause(&mut self) {
        self.paused_on_breakpoint = false;
        self.variables.clear();
    }

    /// Rate limit for trace messages. Returns `false` when tracing is off.
    pub fn should_trace(&mut self, now_ms: u64) -> bool {
        let Some(interval) = self.trace_interval_ms else {
            return false;
        };
        match self.last_trace_ms {
            Some(last) if now_ms.saturating_sub(last) < interval => false,
            _ => {
                self.last_trace_ms = Some(now_ms);
                true
            }
        }
    }
}
