/// Run modes for the debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continue,
    StepOver,
    StepInto,
    StepOut,
    Pause,
}

impl RunMode {
    /// Accepts both wire subtypes (`stepover`) and DAP command names (`next`).
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "continue" | "resume" => Some(RunMode::Continue),
            "next" | "stepOver" | "stepover" => Some(RunMode::StepOver),
            "stepIn" | "stepInto" | "stepinto" => Some(RunMode::StepInto),
            "stepOut" | "stepout" => Some(RunMode::StepOut),
            "pause" => Some(RunMode::Pause),
            _ => None,
        }
    }
}
