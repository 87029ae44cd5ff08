use super::protocol::SimMessage;
use crate::error::EngineResult;
use crate::executor::Engine;

/// Transport between the debug adapter and a running simulation.
pub trait SimLink {
    fn start(&mut self) -> EngineResult<()>;
    /// Deliver a message to the simulation.
    fn post(&mut self, msg: SimMessage) -> EngineResult<()>;
    /// Let the simulation advance and collect what it sent back.
    fn pump(&mut self) -> Vec<SimMessage>;
    fn now_ms(&self) -> u64;
    /// The simulation has nothing left to run.
    fn is_finished(&self) -> bool;
}

/// Runs the engine in-process.
pub struct LocalLink {
    engine: Engine,
}

impl LocalLink {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

impl SimLink for LocalLink {
    fn start(&mut self) -> EngineResult<()> {
        self.engine.start().map(|_| ())
    }

    fn post(&mut self, msg: SimMessage) -> EngineResult<()> {
        self.engine.handle_message(msg)
    }

    fn pump(&mut self) -> Vec<SimMessage> {
        let ticked = self.engine.tick();
        let mut messages = self.engine.drain_outbox();
        if let Err(err) = ticked {
            tracing::error!(error = %err, "engine error");
            messages.push(SimMessage::Output {
                text: format!("engine error: {err}"),
            });
        }
        messages
    }

    fn now_ms(&self) -> u64 {
        self.engine.now_ms()
    }

    fn is_finished(&self) -> bool {
        self.engine.is_quiescent()
    }
}
