use serde::{Deserialize, Serialize};

/// One physical→logical joined line, after comment stripping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    pub text: String,
    /// 0-based physical line where the logical line starts.
    pub phys_start: usize,
    pub phys_end: usize,
}

/// Compile-time constants pushed by `num`/`str`/`bool`/`null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Lt,
    Eq,
}

/// One resumption point of a compiled function.
///
/// Jump targets are instruction indexes, locals are slot indexes and
/// functions are indexes into [`Program::functions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instr", rename_all = "snake_case")]
pub enum Instr {
    Push { value: Literal },
    Load { slot: usize },
    Store { slot: usize },
    LoadGlobal { name: String },
    StoreGlobal { name: String },
    LoadCapture { index: usize },
    MakeClosure { function: usize, captures: usize },
    Call { function: usize, argc: usize },
    CallIndirect { argc: usize },
    Return,
    Jump { target: usize },
    JumpIfFalse { target: usize },
    Binary { op: BinaryOp },
    Not,
    Pop,
    Dup,
    BeginTry { handler: usize },
    EndTry,
    Catch,
    Throw,
    EndFinally,
    Breakpoint { id: u32 },
    NewRecord { type_name: String },
    SetField { name: String },
    GetField { name: String },
    NewArray,
    ArrayPush,
    Index,
    NewMap,
    NewBuffer { size: usize },
    Sleep,
    Listen { source: u32, event: u32, background: bool },
    Unlisten { source: u32, event: u32, background: bool },
    Raise { source: u32, event: u32 },
    WaitEvent { source: u32, event: u32 },
    Fork { argc: usize },
    Print,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: usize,
    /// Slot names: parameters first, then declared locals.
    pub locals: Vec<String>,
    pub code: Vec<Instr>,
    /// 1-based source line of each instruction.
    pub lines: Vec<usize>,
}

impl Function {
    pub fn line_of(&self, pc: usize) -> usize {
        self.lines.get(pc).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    /// Instances the program keeps around on purpose; leak reports ignore up to this many.
    #[serde(default)]
    pub expected_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: u32,
    pub path: String,
    pub line: u32,
    pub column: u32,
    #[serde(rename = "endLine")]
    pub end_line: u32,
    #[serde(rename = "endColumn")]
    pub end_column: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
    #[serde(default)]
    pub globals: Vec<String>,
    #[serde(default)]
    pub records: Vec<RecordType>,
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
}

impl Program {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn record(&self, name: &str) -> Option<&RecordType> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn breakpoint(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.id == id)
    }
}
