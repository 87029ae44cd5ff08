use std::cell::{Cell, RefCell};
use std::io::Cursor;
use std::rc::Rc;

use serde_json::{json, Value as Json};

use sim_engine::dap::{
    read_message, DapMessage, DapMessageContent, DapServer, DebuggerMessage, LocalLink, PauseInfo,
    SimLink, SimMessage, StackFrameInfo, VariableInfo, VariablesMessage,
};
use sim_engine::executor::ManualClock;
use sim_engine::parser::{parse_program, Program};
use sim_engine::{Engine, EngineConfig, EngineResult};

const STEPPING: &str = r#"
breakpoint 1 main.ts 2 2 2 20
breakpoint 2 main.ts 3 2 3 20
breakpoint 3 main.ts 4 2 4 20
breakpoint 4 helper.ts 10 2 10 20
breakpoint 5 helper.ts 11 2 11 20

function main
  bp 1
  call helper 0
  bp 2
  call helper 0
  bp 3
  ret
end

function helper
  bp 4
  bp 5
  ret
end
"#;

const SESSION: &str = r#"
record Sprite
global total
breakpoint 1 main.ts 2 2 2 30
breakpoint 2 main.ts 3 2 3 30

function main
  local s
  bp 1
  new Sprite
  store s
  load s
  num 7
  setf hp
  num 5
  setg total
  bp 2
  str bye
  print
  ret
end
"#;

fn engine_for(source: &str) -> (Engine, Program) {
    let program = parse_program(source).expect("program should assemble");
    let engine = Engine::new(
        program.clone(),
        EngineConfig::default(),
        Box::new(ManualClock::new()),
    );
    (engine, program)
}

fn send(engine: &mut Engine, msg: DebuggerMessage) {
    engine
        .handle_message(SimMessage::Debugger(msg))
        .expect("engine should accept the directive");
}

/// Breakpoint id of the last pause reported since the previous call.
fn stopped_at(engine: &mut Engine) -> Option<u32> {
    engine
        .drain_outbox()
        .into_iter()
        .filter_map(|msg| match msg {
            SimMessage::Debugger(DebuggerMessage::Breakpoint(info)) => info.breakpoint_id,
            _ => None,
        })
        .last()
}

fn request(seq: u64, command: &str, arguments: Option<Json>) -> DapMessage {
    DapMessage {
        seq,
        msg_type: "request".into(),
        content: DapMessageContent::Request {
            command: command.into(),
            arguments,
        },
    }
}

/// Everything the server wrote since the last call, as JSON objects.
fn drain_frames(server: &mut DapServer<Vec<u8>>) -> Vec<Json> {
    let bytes = std::mem::take(server.writer_mut());
    let mut reader = Cursor::new(bytes);
    let mut out = Vec::new();
    while let Some(msg) = read_message(&mut reader).expect("well-formed frame") {
        out.push(serde_json::to_value(&msg).expect("frame serializes"));
    }
    out
}

fn response_to(frames: &[Json], request_seq: u64) -> &Json {
    frames
        .iter()
        .find(|f| f["type"] == "response" && f["request_seq"] == request_seq)
        .unwrap_or_else(|| panic!("no response to request {request_seq} in {frames:?}"))
}

fn event_names(frames: &[Json]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f["type"] == "event")
        .filter_map(|f| f["event"].as_str().map(str::to_string))
        .collect()
}

/// Link that replays whatever the test queues and never answers posted requests itself.
struct ScriptedLink {
    now: Rc<Cell<u64>>,
    script: Rc<RefCell<Vec<SimMessage>>>,
    posted: Rc<RefCell<Vec<SimMessage>>>,
}

impl SimLink for ScriptedLink {
    fn start(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn post(&mut self, msg: SimMessage) -> EngineResult<()> {
        self.posted.borrow_mut().push(msg);
        Ok(())
    }

    fn pump(&mut self) -> Vec<SimMessage> {
        std::mem::take(&mut *self.script.borrow_mut())
    }

    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn is_finished(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod stepping_tests {
    use super::*;

    fn paused_at_first(engine: &mut Engine) {
        send(engine, DebuggerMessage::Config {
            set_breakpoints: vec![1],
        });
        engine.start().unwrap();
        assert_eq!(stopped_at(engine), Some(1), "should pause at the armed breakpoint");
    }

    #[test]
    fn test_step_over_skips_callee_breakpoints() {
        let (mut engine, _) = engine_for(STEPPING);
        paused_at_first(&mut engine);

        send(&mut engine, DebuggerMessage::StepOver);
        assert_eq!(stopped_at(&mut engine), Some(2));
    }

    #[test]
    fn test_step_into_stops_in_callee() {
        let (mut engine, _) = engine_for(STEPPING);
        paused_at_first(&mut engine);

        send(&mut engine, DebuggerMessage::StepOver);
        assert_eq!(stopped_at(&mut engine), Some(2));
        send(&mut engine, DebuggerMessage::StepInto);
        assert_eq!(stopped_at(&mut engine), Some(4));
    }

    #[test]
    fn test_step_out_returns_to_caller() {
        let (mut engine, _) = engine_for(STEPPING);
        send(&mut engine, DebuggerMessage::Config {
            set_breakpoints: vec![4],
        });
        engine.start().unwrap();
        assert_eq!(stopped_at(&mut engine), Some(4));

        send(&mut engine, DebuggerMessage::StepOut);
        assert_eq!(stopped_at(&mut engine), Some(2), "bp 5 in helper must be skipped");
    }

    #[test]
    fn test_step_out_of_root_frame_acts_like_step_over() {
        let (mut engine, _) = engine_for(STEPPING);
        paused_at_first(&mut engine);

        send(&mut engine, DebuggerMessage::StepOut);
        assert_eq!(stopped_at(&mut engine), Some(2));
    }

    #[test]
    fn test_pause_before_start_stops_at_first_breakpoint() {
        let (mut engine, _) = engine_for(STEPPING);
        send(&mut engine, DebuggerMessage::Pause);
        engine.start().unwrap();

        assert!(engine.is_paused());
        assert_eq!(stopped_at(&mut engine), Some(1));
    }

    #[test]
    fn test_continue_runs_to_completion() {
        let (mut engine, _) = engine_for(STEPPING);
        paused_at_first(&mut engine);

        send(&mut engine, DebuggerMessage::Resume);
        let remaining = engine.drain_outbox();
        assert!(remaining.contains(&SimMessage::TopLevelCodeFinished));
        assert!(!engine.is_paused());
        assert!(engine.is_quiescent());
    }

    #[test]
    fn test_pause_while_paused_is_ignored() {
        let (mut engine, _) = engine_for(STEPPING);
        paused_at_first(&mut engine);

        send(&mut engine, DebuggerMessage::Pause);
        assert!(engine.is_paused());
        assert_eq!(stopped_at(&mut engine), None, "no second pause notification");
    }

    #[test]
    fn test_remote_variables_expand_records() {
        let (mut engine, _) = engine_for(SESSION);
        send(&mut engine, DebuggerMessage::Config {
            set_breakpoints: vec![2],
        });
        engine.start().unwrap();

        let info = engine
            .drain_outbox()
            .into_iter()
            .find_map(|msg| match msg {
                SimMessage::Debugger(DebuggerMessage::Breakpoint(info)) => Some(info),
                _ => None,
            })
            .expect("paused");
        let frame = &info.stackframes[0];
        assert_eq!(frame.name, "main");
        assert_eq!(frame.line, 3);
        let sprite = &frame.locals[0];
        assert_eq!(sprite.name, "s");
        assert_eq!(sprite.value, "Sprite");
        assert_ne!(sprite.variables_reference, 0);

        send(
            &mut engine,
            DebuggerMessage::Variables(VariablesMessage {
                req_seq: 9,
                variables_reference: sprite.variables_reference,
                fields: None,
                variables: None,
                error: None,
            }),
        );
        let reply = engine.drain_outbox().into_iter().find_map(|msg| match msg {
            SimMessage::Debugger(DebuggerMessage::Variables(reply)) => Some(reply),
            _ => None,
        });
        let reply = reply.expect("variables reply");
        assert_eq!(reply.req_seq, 9);
        let fields = reply.variables.expect("listing");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "hp");
        assert_eq!(fields[0].value, "7");
    }

    #[test]
    fn test_unknown_variables_reference_is_an_error() {
        let (mut engine, _) = engine_for(SESSION);
        send(&mut engine, DebuggerMessage::Config {
            set_breakpoints: vec![2],
        });
        engine.start().unwrap();
        engine.drain_outbox();

        send(
            &mut engine,
            DebuggerMessage::Variables(VariablesMessage {
                req_seq: 4,
                variables_reference: 9999,
                fields: None,
                variables: None,
                error: None,
            }),
        );
        let reply = engine
            .drain_outbox()
            .into_iter()
            .find_map(|msg| match msg {
                SimMessage::Debugger(DebuggerMessage::Variables(reply)) => Some(reply),
                _ => None,
            })
            .expect("variables reply");
        assert_eq!(reply.req_seq, 4);
        assert!(reply.variables.is_none());
        assert_eq!(reply.error.as_deref(), Some("invalid reference 9999"));
    }
}

#[cfg(test)]
mod dap_session_tests {
    use super::*;

    fn session() -> DapServer<Vec<u8>> {
        let (engine, program) = engine_for(SESSION);
        let mut server = DapServer::new(Vec::new(), EngineConfig::default());
        server.attach(
            Box::new(LocalLink::new(engine)),
            &program,
            "/work/app/main.ts",
        );
        server
    }

    #[test]
    fn test_full_debug_session() {
        let mut server = session();

        assert!(server.handle(request(1, "initialize", None)));
        assert!(server.handle(request(
            2,
            "setBreakpoints",
            Some(json!({
                "source": { "path": "/work/app/main.ts" },
                "breakpoints": [{ "line": 3 }, { "line": 9 }]
            })),
        )));
        let frames = drain_frames(&mut server);
        let caps = response_to(&frames, 1);
        assert_eq!(caps["body"]["supportsConfigurationDoneRequest"], true);
        let verified = &response_to(&frames, 2)["body"]["breakpoints"];
        assert_eq!(verified[0]["verified"], true);
        assert_eq!(verified[0]["id"], 2);
        assert_eq!(verified[1]["verified"], false);

        server.handle(request(3, "configurationDone", None));
        let frames = drain_frames(&mut server);
        assert_eq!(response_to(&frames, 3)["success"], true);
        let stopped = frames
            .iter()
            .find(|f| f["event"] == "stopped")
            .expect("stopped event");
        assert_eq!(stopped["body"]["reason"], "breakpoint");
        assert!(server.is_stopped());

        server.handle(request(4, "stackTrace", None));
        let frames = drain_frames(&mut server);
        let top = &response_to(&frames, 4)["body"]["stackFrames"][0];
        assert_eq!(top["id"], 1);
        assert_eq!(top["name"], "main");
        assert_eq!(top["line"], 3);
        assert_eq!(top["source"]["path"], "/work/app/main.ts");
        assert_eq!(top["source"]["name"], "main.ts");

        server.handle(request(5, "scopes", Some(json!({ "frameId": 1 }))));
        let frames = drain_frames(&mut server);
        let scopes = response_to(&frames, 5)["body"]["scopes"]
            .as_array()
            .expect("scope list")
            .clone();
        let names: Vec<&str> = scopes.iter().filter_map(|s| s["name"].as_str()).collect();
        assert_eq!(names, vec!["Locals", "Globals"]);
        let locals_ref = scopes[0]["variablesReference"].clone();
        let globals_ref = scopes[1]["variablesReference"].clone();

        server.handle(request(
            6,
            "variables",
            Some(json!({ "variablesReference": locals_ref })),
        ));
        let frames = drain_frames(&mut server);
        let local = &response_to(&frames, 6)["body"]["variables"][0];
        assert_eq!(local["name"], "s");
        assert_eq!(local["type"], "Sprite");
        let sprite_ref = local["variablesReference"].clone();
        assert!(sprite_ref.as_i64().is_some_and(|r| r > 0));

        server.handle(request(
            7,
            "variables",
            Some(json!({ "variablesReference": sprite_ref })),
        ));
        let frames = drain_frames(&mut server);
        let field = &response_to(&frames, 7)["body"]["variables"][0];
        assert_eq!(field["name"], "hp");
        assert_eq!(field["value"], "7");

        server.handle(request(
            8,
            "variables",
            Some(json!({ "variablesReference": globals_ref })),
        ));
        let frames = drain_frames(&mut server);
        let global = &response_to(&frames, 8)["body"]["variables"][0];
        assert_eq!(global["name"], "total");
        assert_eq!(global["value"], "5");

        server.handle(request(9, "continue", None));
        server.poll();
        let frames = drain_frames(&mut server);
        assert_eq!(response_to(&frames, 9)["success"], true);
        assert_eq!(
            event_names(&frames),
            vec!["continued", "output", "terminated"]
        );
        let output = frames.iter().find(|f| f["event"] == "output").unwrap();
        assert_eq!(output["body"]["output"], "bye\n");
        assert!(server.is_terminated());

        assert!(!server.handle(request(10, "disconnect", None)));
        let frames = drain_frames(&mut server);
        assert_eq!(response_to(&frames, 10)["success"], true);
    }

    #[test]
    fn test_stop_on_entry_reports_entry_reason() {
        let mut server = session();
        server.set_stop_on_entry(true);
        server.handle(request(1, "configurationDone", None));

        let frames = drain_frames(&mut server);
        let stopped = frames
            .iter()
            .find(|f| f["event"] == "stopped")
            .expect("stopped on entry");
        assert_eq!(stopped["body"]["reason"], "entry");

        server.handle(request(2, "stackTrace", None));
        let frames = drain_frames(&mut server);
        assert_eq!(response_to(&frames, 2)["body"]["stackFrames"][0]["line"], 2);
    }

    #[test]
    fn test_step_request_reports_step_reason() {
        let mut server = session();
        server.set_stop_on_entry(true);
        server.handle(request(1, "configurationDone", None));
        drain_frames(&mut server);

        server.handle(request(2, "next", None));
        let frames = drain_frames(&mut server);
        let stopped = frames
            .iter()
            .find(|f| f["event"] == "stopped")
            .expect("stopped after step");
        assert_eq!(stopped["body"]["reason"], "step");
    }

    #[test]
    fn test_stale_frame_id_is_rejected() {
        let mut server = session();
        server.set_stop_on_entry(true);
        server.handle(request(1, "configurationDone", None));
        drain_frames(&mut server);

        // Scopes before stackTrace: no frame ids handed out yet.
        server.handle(request(2, "scopes", Some(json!({ "frameId": 1 }))));
        let frames = drain_frames(&mut server);
        let reply = response_to(&frames, 2);
        assert_eq!(reply["success"], false);
        assert_eq!(reply["body"]["error"]["id"], 1003);
    }

    /// Session over a scripted link, paused with a map global whose expansion
    /// has been forwarded as request 5.
    struct RemoteExpansion {
        server: DapServer<Vec<u8>>,
        now: Rc<Cell<u64>>,
        script: Rc<RefCell<Vec<SimMessage>>>,
        forwarded: VariablesMessage,
    }

    fn remote_expansion() -> RemoteExpansion {
        let program =
            parse_program("breakpoint 1 main.ts 2 0 2 10\nfunction main\n  bp 1\n  ret\nend\n")
                .unwrap();
        let now = Rc::new(Cell::new(0));
        let posted = Rc::new(RefCell::new(Vec::new()));
        let script = Rc::new(RefCell::new(Vec::new()));
        let pause = PauseInfo {
            breakpoint_id: Some(1),
            globals: vec![VariableInfo {
                name: "cfg".into(),
                value: "Map(1)".into(),
                type_name: "(map)".into(),
                variables_reference: 4,
            }],
            stackframes: vec![StackFrameInfo {
                id: 1,
                name: "main".into(),
                breakpoint_id: Some(1),
                source: Some("main.ts".into()),
                line: 2,
                ..Default::default()
            }],
            exception_message: None,
        };
        script
            .borrow_mut()
            .push(SimMessage::Debugger(DebuggerMessage::Breakpoint(pause)));
        let link = ScriptedLink {
            now: Rc::clone(&now),
            script: Rc::clone(&script),
            posted: Rc::clone(&posted),
        };

        let mut server = DapServer::new(Vec::new(), EngineConfig::default());
        server.attach(Box::new(link), &program, "main.ts");
        server.handle(request(1, "configurationDone", None));
        server.handle(request(2, "stackTrace", None));
        server.handle(request(3, "scopes", Some(json!({ "frameId": 1 }))));
        let frames = drain_frames(&mut server);
        let globals_ref = response_to(&frames, 3)["body"]["scopes"][1]["variablesReference"].clone();

        server.handle(request(
            4,
            "variables",
            Some(json!({ "variablesReference": globals_ref })),
        ));
        let frames = drain_frames(&mut server);
        let cfg_ref = response_to(&frames, 4)["body"]["variables"][0]["variablesReference"].clone();

        server.handle(request(
            5,
            "variables",
            Some(json!({ "variablesReference": cfg_ref })),
        ));
        let forwarded = posted
            .borrow()
            .iter()
            .find_map(|m| match m {
                SimMessage::Debugger(DebuggerMessage::Variables(req))
                    if req.variables_reference == 4 =>
                {
                    Some(req.clone())
                }
                _ => None,
            })
            .expect("expansion should be forwarded to the simulation");

        RemoteExpansion {
            server,
            now,
            script,
            forwarded,
        }
    }

    #[test]
    fn test_unanswered_expansion_times_out() {
        let RemoteExpansion {
            mut server, now, ..
        } = remote_expansion();

        now.set(4_999);
        server.poll();
        assert!(drain_frames(&mut server).is_empty(), "still within the timeout");

        now.set(5_000);
        server.poll();
        let frames = drain_frames(&mut server);
        let reply = response_to(&frames, 5);
        assert_eq!(reply["success"], false);
        assert_eq!(reply["body"]["error"]["id"], 1004);
    }

    #[test]
    fn test_failed_expansion_is_an_invalid_reference() {
        let RemoteExpansion {
            mut server,
            script,
            forwarded,
            ..
        } = remote_expansion();

        script
            .borrow_mut()
            .push(SimMessage::Debugger(DebuggerMessage::Variables(VariablesMessage {
                error: Some("invalid reference 4".into()),
                ..forwarded
            })));
        server.poll();
        let frames = drain_frames(&mut server);
        let reply = response_to(&frames, 5);
        assert_eq!(reply["success"], false);
        assert_eq!(reply["body"]["error"]["id"], 1003);
    }
}
