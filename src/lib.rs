//! Cooperative execution engine for a simulated embedded device: frame
//! scheduler, event bus, debugger protocol and heap leak tracing.

pub mod config;
pub mod console;
pub mod dap;
pub mod debugger;
pub mod error;
pub mod events;
pub mod executor;
pub mod heap;
pub mod logging;
pub mod parser;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use executor::Engine;
