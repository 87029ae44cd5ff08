mod handles;
mod link;
mod protocol;
mod server;

use std::io::{self, BufReader};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

pub use handles::{Handle, Handles, ScopeKind};
pub use link::{LocalLink, SimLink};
pub use protocol::{
    DapMessage, DapMessageContent, DebuggerMessage, PauseInfo, RunState, SimMessage,
    StackFrameInfo, VariableInfo, VariablesMessage,
};
pub use server::{read_message, write_message, DapServer};

use crate::config::EngineConfig;

/// How often the engine is pumped while the client is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Serve one debug session over stdin/stdout until the client disconnects
/// or closes its end.
pub fn run_dap_mode(config: EngineConfig) -> io::Result<()> {
    tracing::info!("DAP server starting");

    let (tx, rx) = mpsc::channel::<DapMessage>();
    thread::spawn(move || {
        let mut reader = BufReader::new(io::stdin().lock());
        loop {
            match read_message(&mut reader) {
                Ok(Some(msg)) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(error = %err, "dropping malformed DAP frame");
                }
                Err(err) => {
                    tracing::error!(error = %err, "reading stdin failed");
                    break;
                }
            }
        }
        tracing::debug!("stdin closed");
    });

    let mut server = DapServer::new(io::stdout(), config);
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(msg) => {
                if !server.handle(msg) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        server.poll();
    }

    tracing::info!("DAP server exiting");
    Ok(())
}
