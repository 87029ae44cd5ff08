mod bus;
mod queue;

pub use bus::{EventBus, QueueOutcome};
pub use queue::{EventQueue, HandlerMode, HandlerOp, Invocation, QueueKey};
