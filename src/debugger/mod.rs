mod breakpoints;
mod context;
mod session;
mod stepping;
mod variables;

pub use breakpoints::BreakpointMap;
pub use context::{BreakScope, DebugState};
pub use session::PendingRequests;
pub use stepping::RunMode;
pub use variables::VariableStore;
