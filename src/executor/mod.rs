mod clock;
mod debug_hooks;
mod dispatch;
mod engine;
mod frame;
mod runner;
mod timers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineState, ErrorHandler};
pub use frame::{Fiber, FiberId, FiberKind, FiberState, Frame, FrameId, ResumeToken, TryFrame};
pub use timers::{Timer, TimerAction, TimerQueue};
