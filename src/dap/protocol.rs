use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DapMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub content: DapMessageContent,
}

/// Variants are tried in order: a response also carries `command`, so it
/// must be matched before a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DapMessageContent {
    Response {
        request_seq: u64,
        success: bool,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Request {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },
}

/// Messages exchanged between the engine and its host or debugger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SimMessage {
    Debugger(DebuggerMessage),
    /// External stimulus for the event bus.
    #[serde(rename = "eventbus")]
    EventBus {
        id: u32,
        eventid: u32,
        #[serde(default)]
        value: Value,
    },
    Status {
        state: RunState,
    },
    #[serde(rename = "toplevelcodefinished")]
    TopLevelCodeFinished,
    /// Text written by the program's `print`.
    Output {
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "lowercase")]
pub enum DebuggerMessage {
    /// The program stopped.
    Breakpoint(PauseInfo),
    /// Non-pausing instrumentation tick.
    Trace(PauseInfo),
    /// Replace the armed breakpoint set.
    Config {
        #[serde(rename = "setBreakpoints", default)]
        set_breakpoints: Vec<u32>,
    },
    Resume,
    StepOver,
    StepInto,
    StepOut,
    Pause,
    Variables(VariablesMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    #[serde(rename = "breakpointId", default)]
    pub breakpoint_id: Option<u32>,
    #[serde(default)]
    pub globals: Vec<VariableInfo>,
    #[serde(default)]
    pub stackframes: Vec<StackFrameInfo>,
    #[serde(
        rename = "exceptionMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exception_message: Option<String>,
}

/// One frame of a pause snapshot, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrameInfo {
    pub id: u64,
    pub name: String,
    #[serde(rename = "breakpointId", default)]
    pub breakpoint_id: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub locals: Vec<VariableInfo>,
    #[serde(default)]
    pub captures: Vec<VariableInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Non-zero when the value can be expanded with a `variables` request.
    #[serde(rename = "variablesReference", default)]
    pub variables_reference: u32,
}

/// Request (`variables` unset) or response (`variables` set) for the
/// children of an expandable value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablesMessage {
    #[serde(default)]
    pub req_seq: u64,
    #[serde(rename = "variablesReference")]
    pub variables_reference: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<VariableInfo>>,
    /// Set on a response when the reference could not be expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
