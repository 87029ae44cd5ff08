use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, BufRead, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::handles::{Handle, Handles, ScopeKind};
use super::link::{LocalLink, SimLink};
use super::protocol::{
    DapMessage, DapMessageContent, DebuggerMessage, PauseInfo, RunState, SimMessage,
    VariablesMessage,
};
use crate::config::EngineConfig;
use crate::debugger::{BreakpointMap, PendingRequests};
use crate::error::ProtocolError;
use crate::executor::{Engine, SystemClock};
use crate::parser::{load_program, Program};

/// The engine is presented to the client as a single thread.
const THREAD_ID: u64 = 1;

/// Read one `Content-Length` framed message. `Ok(None)` means the stream ended.
pub fn read_message<R: BufRead>(reader: &mut R) -> io::Result<Option<DapMessage>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Content-Length:") {
            let len = rest
                .trim()
                .parse()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            content_length = Some(len);
        }
    }

    let mut buffer = vec![0u8; content_length.unwrap_or(0)];
    reader.read_exact(&mut buffer)?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

pub fn write_message<W: Write>(out: &mut W, msg: &DapMessage) -> io::Result<()> {
    let json = serde_json::to_string(msg)?;
    write!(out, "Content-Length: {}\r\n\r\n{}", json.len(), json)?;
    out.flush()
}

enum Reply {
    Body(Option<Value>),
    /// Answered later, once the engine replies.
    Deferred,
}

/// A `variables` request waiting on the engine to expand a remote object.
struct PendingVariables {
    request_seq: u64,
    handle: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchArgs {
    program: String,
    #[serde(default)]
    stop_on_entry: bool,
}

#[derive(Deserialize)]
struct SourceArg {
    path: String,
}

#[derive(Deserialize)]
struct SourceBreakpoint {
    line: u32,
}

#[derive(Deserialize)]
struct SetBreakpointsArgs {
    source: SourceArg,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesArgs {
    frame_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArgs {
    variables_reference: i64,
}

fn parse_args<T: DeserializeOwned>(arguments: Option<Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(arguments.unwrap_or(Value::Null))
        .map_err(|err| ProtocolError::BadArguments(err.to_string()))
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsStepBack": false,
        "supportsFunctionBreakpoints": false,
        "supportsConditionalBreakpoints": false,
        "supportsSetVariable": false,
        "supportsTerminateRequest": false,
    })
}

/// Debug adapter in front of one simulation.
///
/// Requests come in through [`DapServer::handle`]; engine traffic is picked
/// up by [`DapServer::poll`], which the host calls whenever it is idle.
pub struct DapServer<W: Write> {
    seq: u64,
    out: W,
    config: EngineConfig,
    link: Option<Box<dyn SimLink>>,
    breakpoints: BreakpointMap,
    /// Verified breakpoint ids per program path.
    verified: BTreeMap<String, Vec<u32>>,
    /// Program path -> the path the client used for it.
    client_paths: HashMap<String, String>,
    program_path: Option<String>,
    stop_on_entry: bool,
    started: bool,
    stop: Option<PauseInfo>,
    stop_reason: &'static str,
    handles: Handles,
    pending: PendingRequests<PendingVariables>,
    next_remote_seq: u64,
    terminated: bool,
}

impl<W: Write> DapServer<W> {
    pub fn new(out: W, config: EngineConfig) -> Self {
        Self {
            seq: 0,
            out,
            config,
            link: None,
            breakpoints: BreakpointMap::new(&[]),
            verified: BTreeMap::new(),
            client_paths: HashMap::new(),
            program_path: None,
            stop_on_entry: false,
            started: false,
            stop: None,
            stop_reason: "breakpoint",
            handles: Handles::new(),
            pending: PendingRequests::new(),
            next_remote_seq: 0,
            terminated: false,
        }
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Connect a simulation. `launch` does this itself; hosts that build
    /// their own engine call it directly.
    pub fn attach(&mut self, link: Box<dyn SimLink>, program: &Program, path: &str) {
        tracing::info!(program = path, "debug session attached");
        self.link = Some(link);
        self.breakpoints = BreakpointMap::new(&program.breakpoints);
        self.verified.clear();
        self.client_paths.clear();
        self.program_path = Some(path.to_string());
        self.started = false;
        self.stop = None;
        self.handles.reset();
        self.terminated = false;
    }

    pub fn set_stop_on_entry(&mut self, stop_on_entry: bool) {
        self.stop_on_entry = stop_on_entry;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Handle one client message. Returns `false` once the client disconnected.
    pub fn handle(&mut self, msg: DapMessage) -> bool {
        let DapMessageContent::Request { command, arguments } = msg.content else {
            tracing::debug!(seq = msg.seq, "ignoring non-request message");
            return true;
        };
        tracing::debug!(seq = msg.seq, %command, "request");

        let outcome = match command.as_str() {
            "initialize" => Ok(Reply::Body(Some(capabilities()))),
            "launch" => self.launch(arguments),
            "setBreakpoints" => self.set_breakpoints(arguments),
            "configurationDone" => self.require_session(),
            "threads" => Ok(Reply::Body(Some(json!({
                "threads": [{ "id": THREAD_ID, "name": "main" }]
            })))),
            "stackTrace" => self.stack_trace(),
            "scopes" => self.scopes(arguments),
            "variables" => self.variables(msg.seq, arguments),
            "continue" | "next" | "stepIn" | "stepOut" | "pause" => self.require_session(),
            "disconnect" => {
                self.disconnect();
                self.send_response(msg.seq, &command, None);
                return false;
            }
            _ => Err(ProtocolError::UnknownCommand(command.clone())),
        };

        match outcome {
            Ok(Reply::Body(body)) => {
                self.send_response(msg.seq, &command, body);
                self.after_response(&command);
            }
            Ok(Reply::Deferred) => {}
            Err(err) => {
                tracing::warn!(%command, error = %err, "request failed");
                self.send_error(msg.seq, &command, &err);
            }
        }
        true
    }

    /// Effects that must follow the response on the wire.
    fn after_response(&mut self, command: &str) {
        match command {
            "launch" => self.send_event("initialized", None),
            "configurationDone" => self.start(),
            "continue" => self.run(DebuggerMessage::Resume, "breakpoint"),
            "next" => self.run(DebuggerMessage::StepOver, "step"),
            "stepIn" => self.run(DebuggerMessage::StepInto, "step"),
            "stepOut" => self.run(DebuggerMessage::StepOut, "step"),
            "pause" => {
                self.stop_reason = "pause";
                self.post_or_report(SimMessage::Debugger(DebuggerMessage::Pause));
                self.forward();
            }
            _ => {}
        }
    }

    /// Collect engine traffic, expire stale requests and notice termination.
    pub fn poll(&mut self) {
        self.forward();
        let Some(now) = self.link.as_ref().map(|link| link.now_ms()) else {
            return;
        };
        for (pending, err) in self.pending.expire(now) {
            self.send_error(pending.request_seq, "variables", &err);
        }
        let finished = self.link.as_ref().is_some_and(|link| link.is_finished());
        if self.started && finished && !self.terminated && self.stop.is_none() {
            self.terminate();
        }
    }

    fn require_session(&self) -> Result<Reply, ProtocolError> {
        match self.link {
            Some(_) => Ok(Reply::Body(None)),
            None => Err(ProtocolError::NoSession),
        }
    }

    fn launch(&mut self, arguments: Option<Value>) -> Result<Reply, ProtocolError> {
        let args: LaunchArgs = parse_args(arguments)?;
        let program = load_program(Path::new(&args.program))
            .map_err(|err| ProtocolError::BadArguments(format!("{}: {err}", args.program)))?;
        let engine = Engine::new(
            program.clone(),
            self.config.clone(),
            Box::new(SystemClock::new()),
        );
        self.attach(Box::new(LocalLink::new(engine)), &program, &args.program);
        self.stop_on_entry = args.stop_on_entry;
        Ok(Reply::Body(None))
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        if self.stop_on_entry {
            self.stop_reason = "entry";
            self.post_or_report(SimMessage::Debugger(DebuggerMessage::Pause));
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(err) = link.start() {
            tracing::error!(error = %err, "failed to start program");
            self.send_output("stderr", format!("failed to start: {err}\n"));
        }
        self.started = true;
        self.forward();
    }

    /// Map a client source path onto a program path: exact or suffix match.
    fn resolve_path(&self, client: &str) -> Option<String> {
        let client = client.replace('\\', "/");
        self.breakpoints
            .paths()
            .find(|path| client == *path || client.ends_with(&format!("/{path}")))
            .map(str::to_string)
    }

    fn set_breakpoints(&mut self, arguments: Option<Value>) -> Result<Reply, ProtocolError> {
        let args: SetBreakpointsArgs = parse_args(arguments)?;
        if self.link.is_none() {
            return Err(ProtocolError::NoSession);
        }
        let resolved = self.resolve_path(&args.source.path);

        let mut ids = Vec::new();
        let results: Vec<Value> = args
            .breakpoints
            .iter()
            .map(|requested| {
                let found = resolved
                    .as_deref()
                    .and_then(|path| self.breakpoints.find(path, requested.line));
                match found {
                    Some(bp) => {
                        ids.push(bp.id);
                        json!({
                            "verified": true,
                            "id": bp.id,
                            "line": bp.line,
                            "column": bp.column,
                            "endLine": bp.end_line,
                            "endColumn": bp.end_column,
                        })
                    }
                    None => json!({
                        "verified": false,
                        "line": requested.line,
                        "message": "no statement on this line",
                    }),
                }
            })
            .collect();

        if let Some(path) = resolved {
            tracing::debug!(%path, ?ids, "breakpoints verified");
            self.client_paths.insert(path.clone(), args.source.path);
            self.verified.insert(path, ids);
        }

        let armed: BTreeSet<u32> = self.verified.values().flatten().copied().collect();
        self.post(SimMessage::Debugger(DebuggerMessage::Config {
            set_breakpoints: armed.into_iter().collect(),
        }))?;
        Ok(Reply::Body(Some(json!({ "breakpoints": results }))))
    }

    fn source(&self, path: &str) -> Value {
        let client = self
            .client_paths
            .get(path)
            .map_or(path, String::as_str);
        let name = Path::new(client)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(client);
        json!({ "name": name, "path": client })
    }

    fn stack_trace(&mut self) -> Result<Reply, ProtocolError> {
        let stop = self.stop.as_ref().ok_or(ProtocolError::NoSession)?;
        let frames: Vec<Value> = stop
            .stackframes
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let mut entry = json!({
                    "id": i + 1,
                    "name": frame.name,
                    "line": frame.line,
                    "column": frame.column,
                });
                let path = frame.source.as_deref().or(self.program_path.as_deref());
                if let Some(path) = path {
                    entry["source"] = self.source(path);
                }
                entry
            })
            .collect();

        self.handles.frames_fetched(frames.len());
        Ok(Reply::Body(Some(json!({
            "stackFrames": frames,
            "totalFrames": frames.len(),
        }))))
    }

    fn scopes(&mut self, arguments: Option<Value>) -> Result<Reply, ProtocolError> {
        let args: ScopesArgs = parse_args(arguments)?;
        let frame = self.handles.frame_index(args.frame_id)?;
        let has_captures = !self
            .stop
            .as_ref()
            .and_then(|stop| stop.stackframes.get(frame))
            .ok_or(ProtocolError::InvalidReference(args.frame_id))?
            .captures
            .is_empty();

        let scopes: Vec<Value> = [ScopeKind::Locals, ScopeKind::Captures, ScopeKind::Globals]
            .into_iter()
            .filter(|kind| *kind != ScopeKind::Captures || has_captures)
            .map(|kind| {
                let reference = self.handles.alloc(Handle::Scope { frame, kind });
                json!({
                    "name": kind.label(),
                    "variablesReference": reference,
                    "expensive": false,
                })
            })
            .collect();
        Ok(Reply::Body(Some(json!({ "scopes": scopes }))))
    }

    fn variables(&mut self, seq: u64, arguments: Option<Value>) -> Result<Reply, ProtocolError> {
        let args: VariablesArgs = parse_args(arguments)?;
        let id = args.variables_reference;
        if let Some(listing) = self.handles.cached(id) {
            return Ok(Reply::Body(Some(json!({ "variables": listing }))));
        }

        match self.handles.get(id)? {
            Handle::Scope { frame, kind } => {
                let stop = self.stop.as_ref().ok_or(ProtocolError::NoSession)?;
                let infos = match kind {
                    ScopeKind::Globals => Some(stop.globals.clone()),
                    ScopeKind::Locals => stop.stackframes.get(frame).map(|f| f.locals.clone()),
                    ScopeKind::Captures => {
                        stop.stackframes.get(frame).map(|f| f.captures.clone())
                    }
                }
                .ok_or(ProtocolError::InvalidReference(id))?;

                let listing: Vec<Value> =
                    infos.iter().map(|info| self.handles.variable(info)).collect();
                self.handles.memoize(id, listing.clone());
                Ok(Reply::Body(Some(json!({ "variables": listing }))))
            }
            Handle::Remote(reference) => {
                self.next_remote_seq += 1;
                let req_seq = self.next_remote_seq;
                self.post(SimMessage::Debugger(DebuggerMessage::Variables(
                    VariablesMessage {
                        req_seq,
                        variables_reference: reference,
                        fields: None,
                        variables: None,
                        error: None,
                    },
                )))?;
                let now = self.link.as_ref().map_or(0, |link| link.now_ms());
                self.pending.insert(
                    req_seq,
                    now,
                    self.config.request_timeout_ms,
                    PendingVariables {
                        request_seq: seq,
                        handle: id,
                    },
                );
                self.forward();
                Ok(Reply::Deferred)
            }
        }
    }

    fn run(&mut self, directive: DebuggerMessage, reason: &'static str) {
        self.stop = None;
        self.handles.reset();
        for (pending, err) in self.pending.cancel_all() {
            self.send_error(pending.request_seq, "variables", &err);
        }
        self.stop_reason = reason;
        self.send_event(
            "continued",
            Some(json!({ "threadId": THREAD_ID, "allThreadsContinued": true })),
        );
        self.post_or_report(SimMessage::Debugger(directive));
        self.forward();
    }

    fn disconnect(&mut self) {
        for (pending, err) in self.pending.cancel_all() {
            self.send_error(pending.request_seq, "variables", &err);
        }
        if self.started && !self.terminated {
            self.post_or_report(SimMessage::Status {
                state: RunState::Killed,
            });
            self.terminated = true;
        }
        tracing::info!("debug session disconnected");
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.stop = None;
        self.handles.reset();
        self.send_event("terminated", None);
    }

    fn post(&mut self, msg: SimMessage) -> Result<(), ProtocolError> {
        let link = self.link.as_mut().ok_or(ProtocolError::NoSession)?;
        link.post(msg)?;
        Ok(())
    }

    fn post_or_report(&mut self, msg: SimMessage) {
        if let Err(err) = self.post(msg) {
            tracing::error!(error = %err, "engine rejected message");
            self.send_output("stderr", format!("{err}\n"));
        }
    }

    fn forward(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        for msg in link.pump() {
            self.on_sim_message(msg);
        }
    }

    fn on_sim_message(&mut self, msg: SimMessage) {
        match msg {
            SimMessage::Debugger(DebuggerMessage::Breakpoint(info)) => {
                if let Some(message) = &info.exception_message {
                    self.send_output("stderr", format!("{message}\n"));
                    return;
                }
                let reason = std::mem::replace(&mut self.stop_reason, "breakpoint");
                self.handles.reset();
                self.stop = Some(info);
                self.send_event(
                    "stopped",
                    Some(json!({
                        "reason": reason,
                        "threadId": THREAD_ID,
                        "allThreadsStopped": true,
                    })),
                );
            }
            SimMessage::Debugger(DebuggerMessage::Trace(info)) => {
                tracing::trace!(breakpoint = ?info.breakpoint_id, "trace");
            }
            SimMessage::Debugger(DebuggerMessage::Variables(reply)) => self.answer_remote(reply),
            SimMessage::Output { text } => self.send_output("stdout", format!("{text}\n")),
            SimMessage::Status {
                state: RunState::Killed,
            } => {
                if !self.terminated {
                    self.terminate();
                }
            }
            SimMessage::TopLevelCodeFinished => tracing::info!("top-level code finished"),
            other => tracing::debug!(?other, "unexpected engine message"),
        }
    }

    fn answer_remote(&mut self, reply: VariablesMessage) {
        let Some(pending) = self.pending.resolve(reply.req_seq) else {
            tracing::debug!(req_seq = reply.req_seq, "late variables reply dropped");
            return;
        };
        if reply.error.is_some() {
            let err = ProtocolError::InvalidReference(pending.handle);
            self.send_error(pending.request_seq, "variables", &err);
            return;
        }
        let listing: Vec<Value> = reply
            .variables
            .unwrap_or_default()
            .iter()
            .map(|info| self.handles.variable(info))
            .collect();
        self.handles.memoize(pending.handle, listing.clone());
        self.send_response(
            pending.request_seq,
            "variables",
            Some(json!({ "variables": listing })),
        );
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn send(&mut self, content: DapMessageContent, msg_type: &str) {
        let msg = DapMessage {
            seq: self.next_seq(),
            msg_type: msg_type.to_string(),
            content,
        };
        if let Err(err) = write_message(&mut self.out, &msg) {
            tracing::error!(error = %err, "failed to write DAP message");
        }
    }

    fn send_response(&mut self, request_seq: u64, command: &str, body: Option<Value>) {
        self.send(
            DapMessageContent::Response {
                request_seq,
                success: true,
                command: command.to_string(),
                message: None,
                body,
            },
            "response",
        );
    }

    fn send_error(&mut self, request_seq: u64, command: &str, err: &ProtocolError) {
        self.send(
            DapMessageContent::Response {
                request_seq,
                success: false,
                command: command.to_string(),
                message: Some(err.to_string()),
                body: Some(json!({
                    "error": { "id": err.code(), "format": err.to_string() }
                })),
            },
            "response",
        );
    }

    fn send_event(&mut self, event: &str, body: Option<Value>) {
        self.send(
            DapMessageContent::Event {
                event: event.to_string(),
                body,
            },
            "event",
        );
    }

    fn send_output(&mut self, category: &str, output: String) {
        self.send_event(
            "output",
            Some(json!({ "category": category, "output": output })),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn request(seq: u64, command: &str, arguments: Option<Value>) -> DapMessage {
        DapMessage {
            seq,
            msg_type: "request".into(),
            content: DapMessageContent::Request {
                command: command.into(),
                arguments,
            },
        }
    }

    fn frames(bytes: &[u8]) -> Vec<Value> {
        let mut reader = Cursor::new(bytes);
        let mut out = Vec::new();
        while let Some(msg) = read_message(&mut reader).unwrap() {
            out.push(serde_json::to_value(&msg).unwrap());
        }
        out
    }

    #[test]
    fn framing_round_trips_through_a_buffer() {
        let mut buf = Vec::new();
        write_message(&mut buf, &request(7, "threads", None)).unwrap();
        assert!(buf.starts_with(b"Content-Length: "));

        let parsed = frames(&buf);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["command"], "threads");
        assert_eq!(parsed[0]["seq"], 7);
    }

    #[test]
    fn unknown_command_gets_error_code() {
        let mut server = DapServer::new(Vec::new(), EngineConfig::default());
        assert!(server.handle(request(1, "reverseContinue", None)));
        let out = frames(server.writer_mut().as_slice());
        assert_eq!(out[0]["success"], false);
        assert_eq!(out[0]["body"]["error"]["id"], 1000);
    }

    #[test]
    fn requests_before_launch_have_no_session() {
        let mut server = DapServer::new(Vec::new(), EngineConfig::default());
        server.handle(request(1, "stackTrace", None));
        server.handle(request(
            2,
            "setBreakpoints",
            Some(json!({"source": {"path": "main.ts"}, "breakpoints": [{"line": 1}]})),
        ));
        server.handle(request(3, "scopes", Some(json!({"frame": 1}))));
        let out = frames(server.writer_mut().as_slice());
        assert_eq!(out[0]["body"]["error"]["id"], 1002);
        assert_eq!(out[1]["body"]["error"]["id"], 1002);
        assert_eq!(out[2]["body"]["error"]["id"], 1001);
    }

    #[test]
    fn disconnect_ends_the_loop() {
        let mut server = DapServer::new(Vec::new(), EngineConfig::default());
        assert!(!server.handle(request(1, "disconnect", None)));
        let out = frames(server.writer_mut().as_slice());
        assert_eq!(out[0]["command"], "disconnect");
        assert_eq!(out[0]["success"], true);
    }
}
