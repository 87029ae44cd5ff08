use thiserror::Error;

use crate::executor::FiberId;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("resume already pending for fiber {fiber}")]
    DoubleResume { fiber: FiberId },
    #[error("stale resume token for fiber {fiber}")]
    StaleResume { fiber: FiberId },
    #[error("end-try without an active try frame in `{function}`")]
    MismatchedTry { function: String },
    #[error("oops: {0}")]
    Oops(String),
    #[error("stack overflow at depth {depth}")]
    StackOverflow { depth: usize },
    #[error("uncaught exception: {message}")]
    Uncaught { message: String },
}

impl EngineError {
    /// Internal invariant violations, as opposed to errors caused by the user program.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EngineError::DoubleResume { .. }
                | EngineError::StaleResume { .. }
                | EngineError::MismatchedTry { .. }
                | EngineError::Oops(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("malformed arguments: {0}")]
    BadArguments(String),
    #[error("no active debug session")]
    NoSession,
    #[error("invalid reference {0}")]
    InvalidReference(i64),
    #[error("request {0} timed out")]
    Timeout(u64),
    #[error("request {0} cancelled")]
    Cancelled(u64),
    #[error("engine error: {0}")]
    Engine(String),
}

impl ProtocolError {
    pub fn code(&self) -> u32 {
        match self {
            ProtocolError::UnknownCommand(_) => 1000,
            ProtocolError::BadArguments(_) => 1001,
            ProtocolError::NoSession => 1002,
            ProtocolError::InvalidReference(_) => 1003,
            ProtocolError::Timeout(_) => 1004,
            ProtocolError::Cancelled(_) => 1005,
            ProtocolError::Engine(_) => 1006,
        }
    }
}

impl From<EngineError> for ProtocolError {
    fn from(err: EngineError) -> Self {
        ProtocolError::Engine(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("reading program: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing program JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("assembling program: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
}
