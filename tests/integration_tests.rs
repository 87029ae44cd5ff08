use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use sim_engine::dap::{DebuggerMessage, SimMessage};
use sim_engine::error::LoadError;
use sim_engine::events::{HandlerMode, QueueKey};
use sim_engine::executor::{FiberState, ManualClock};
use sim_engine::heap::Value;
use sim_engine::parser::{load_program, parse_program, Program};
use sim_engine::{Engine, EngineConfig, EngineError};

// Helper to write a program file next to the other test artifacts
fn create_test_program(content: &str, name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "sim_engine_{}_{}.prog",
        name,
        std::process::id()
    ));
    fs::write(&path, content).expect("Failed to write test program");
    path
}

fn create_json_program(program: &Program, name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "sim_engine_{}_{}.json",
        name,
        std::process::id()
    ));
    let text = serde_json::to_string_pretty(program).expect("program serializes");
    fs::write(&path, text).expect("Failed to write test program");
    path
}

fn cleanup_test_program(path: &PathBuf) {
    let _ = fs::remove_file(path);
}

fn engine_for(source: &str) -> (Engine, ManualClock) {
    let program = parse_program(source).expect("program should assemble");
    let clock = ManualClock::new();
    let engine = Engine::new(program, EngineConfig::default(), Box::new(clock.clone()));
    (engine, clock)
}

fn engine_with(source: &str, config: EngineConfig) -> (Engine, ManualClock) {
    let program = parse_program(source).expect("program should assemble");
    let clock = ManualClock::new();
    let engine = Engine::new(program, config, Box::new(clock.clone()));
    (engine, clock)
}

fn collect_errors(engine: &mut Engine) -> Rc<RefCell<Vec<EngineError>>> {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&errors);
    engine.set_error_handler(move |err| sink.borrow_mut().push(err.clone()));
    errors
}

fn global(engine: &Engine, name: &str) -> Value {
    engine.global(name).cloned().unwrap_or_default()
}

fn logged(engine: &Engine, name: &str) -> Vec<Value> {
    let r = global(engine, name)
        .as_object()
        .expect("global should hold an array");
    engine.array_items(r).expect("array is live").to_vec()
}

const RECURSION: &str = r#"
global result

function main
  num DEPTH
  call rec 1
  setg result
  ret
end

function rec n
  load n
  num 0
  eq
  jz recurse
  num 0
  ret
:recurse
  load n
  num 1
  sub
  call rec 1
  num 1
  add
  ret
end
"#;

const LOGGER: &str = r#"
global log

function main
  array
  setg log
  closure onEvent 0
  listen 5 1
  ret
end

function onEvent v
  num 10
  sleep
  getg log
  load v
  apush
  ret
end
"#;

#[cfg(test)]
mod scheduler_tests {
    use super::*;

    #[test]
    fn test_program_file_loads_and_runs() {
        let path = create_test_program(
            "global answer\nfunction main\n  num 6\n  num 7\n  mul\n  setg answer\n  ret\nend\n",
            "load",
        );
        let program = load_program(&path).expect("program file should load");
        let mut engine = Engine::new(
            program,
            EngineConfig::default(),
            Box::new(ManualClock::new()),
        );
        engine.start().unwrap();
        assert_eq!(global(&engine, "answer"), Value::Number(42.0));
        assert!(engine.is_quiescent());
        assert!(engine
            .drain_outbox()
            .contains(&SimMessage::TopLevelCodeFinished));

        cleanup_test_program(&path);
    }

    #[test]
    fn test_json_program_file_loads_and_runs() {
        let assembled = parse_program(
            "global answer\nbreakpoint 1 main.ts 2 2 2 9\nfunction main\n  num 5\n  setg answer\n  bp 1\n  ret\nend\n",
        )
        .unwrap();
        let path = create_json_program(&assembled, "json_load");
        let program = load_program(&path).expect("JSON program should load");
        assert_eq!(program, assembled);

        let mut engine = Engine::new(
            program,
            EngineConfig::default(),
            Box::new(ManualClock::new()),
        );
        engine.start().unwrap();
        assert_eq!(global(&engine, "answer"), Value::Number(5.0));

        cleanup_test_program(&path);
    }

    #[test]
    fn test_json_program_with_inverted_breakpoint_is_rejected() {
        let mut program = parse_program(
            "breakpoint 1 main.ts 10 0 10 4\nbreakpoint 2 main.ts 3 0 4 0\nfunction main\n  ret\nend\n",
        )
        .unwrap();
        program.breakpoints[0].end_line = 5;
        let path = create_json_program(&program, "json_inverted");

        let loaded = load_program(&path);
        assert!(matches!(loaded, Err(LoadError::Parse(_))));

        // Built in memory the program bypasses loading and still runs.
        let mut engine = Engine::new(
            program,
            EngineConfig::default(),
            Box::new(ManualClock::new()),
        );
        engine.start().unwrap();
        assert!(engine.is_quiescent());

        cleanup_test_program(&path);
    }

    #[test]
    fn test_huge_sleep_saturates_due_time() {
        let (mut engine, clock) = engine_for("function main\n  num 1e300\n  sleep\n  ret\nend\n");
        clock.set(1);
        let main = engine.start().unwrap();

        assert_eq!(engine.fiber(main).map(|f| f.state), Some(FiberState::Suspended));
        assert_eq!(engine.next_timer_due(), Some(u64::MAX));
    }

    #[test]
    fn test_negative_array_index_is_a_type_error() {
        let source = r#"
global head missing caught

function main
  local arr
  array
  dup
  str first
  apush
  store arr
  load arr
  num 0
  index
  setg head
  load arr
  num 5
  index
  setg missing
  try handler
  load arr
  num -1
  index
  setg head
  endtry
  ret
:handler
  catch
  setg caught
  ret
end
"#;
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();

        assert_eq!(global(&engine, "head"), Value::Str("first".into()));
        assert_eq!(global(&engine, "missing"), Value::Null, "out of range reads null");
        assert_eq!(
            global(&engine, "caught"),
            Value::Str("invalid array index -1".into())
        );
    }

    #[test]
    fn test_call_depth_limit_is_inclusive() {
        // main is depth 1, rec(n) bottoms out at depth n + 2.
        let (mut engine, _) = engine_for(&RECURSION.replace("DEPTH", "98"));
        let errors = collect_errors(&mut engine);
        engine.start().unwrap();
        assert_eq!(global(&engine, "result"), Value::Number(98.0));
        assert!(errors.borrow().is_empty(), "depth 100 must be allowed");
        assert_eq!(engine.live_frames(), 0);
    }

    #[test]
    fn test_call_depth_overflow_crashes_the_fiber() {
        let (mut engine, _) = engine_for(&RECURSION.replace("DEPTH", "99"));
        let errors = collect_errors(&mut engine);
        let main = engine.start().unwrap();

        assert_eq!(
            errors.borrow().as_slice(),
            &[EngineError::StackOverflow { depth: 101 }]
        );
        assert_eq!(engine.fiber(main).map(|f| f.state), Some(FiberState::Crashed));
        assert_eq!(engine.live_frames(), 0, "crashed fiber frames are freed");
        assert_eq!(global(&engine, "result"), Value::Null);
    }

    #[test]
    fn test_uncaught_exception_emits_diagnostic() {
        let (mut engine, _) = engine_for("function main\n  str boom\n  throw\nend\n");
        engine.start().unwrap();

        let diagnostic = engine.drain_outbox().into_iter().find_map(|msg| match msg {
            SimMessage::Debugger(DebuggerMessage::Breakpoint(info)) => info.exception_message,
            _ => None,
        });
        assert_eq!(diagnostic.as_deref(), Some("uncaught exception: boom"));
        assert!(!engine.is_paused(), "diagnostics do not pause");
    }

    #[test]
    fn test_double_resume_and_stale_token() {
        let (mut engine, clock) = engine_for("function main\n  num 100\n  sleep\n  ret\nend\n");
        let main = engine.start().unwrap();

        assert_eq!(
            engine.build_resume(main),
            Err(EngineError::DoubleResume { fiber: main })
        );

        let token = engine
            .fiber(main)
            .and_then(|f| f.pending_resume)
            .expect("sleeping fiber holds a token");
        engine.resume(token, None).unwrap();
        assert_eq!(engine.fiber(main).map(|f| f.state), Some(FiberState::Done));
        assert_eq!(
            engine.resume(token, None),
            Err(EngineError::StaleResume { fiber: main })
        );

        // The original sleep timer still fires and is ignored.
        clock.advance(100);
        engine.tick().unwrap();
        assert!(engine.timers().is_empty());
    }

    #[test]
    fn test_long_burst_yields_to_host() {
        let source = r#"
global counter

function main
  local i
  num 0
  store i
:top
  load i
  num 200
  lt
  jz done
  load i
  num 1
  add
  store i
  load i
  setg counter
  jmp top
:done
  ret
end
"#;
        let program = parse_program(source).unwrap();
        let clock = ManualClock::ticking(1);
        let mut engine = Engine::new(program, EngineConfig::default(), Box::new(clock.clone()));
        let main = engine.start().unwrap();

        let partial = global(&engine, "counter").as_number().unwrap_or(0.0);
        assert!(partial < 200.0, "budget should interrupt the loop");
        assert!(clock.peek() >= 20, "slice ran for the whole budget");
        assert_eq!(engine.fiber(main).map(|f| f.state), Some(FiberState::Suspended));
        assert_eq!(engine.timers().len(), 1);

        for _ in 0..500 {
            if engine.fiber(main).is_some_and(|f| f.is_finished()) {
                break;
            }
            clock.advance(5);
            engine.tick().unwrap();
        }
        assert_eq!(global(&engine, "counter"), Value::Number(200.0));
    }

    #[test]
    fn test_try_catch_unwinds_intermediate_frames() {
        let source = r#"
global caught again
breakpoint 1 main.ts 9 2 9 10

function main
  try handler
  call outer 0
  endtry
  ret
:handler
  catch
  setg caught
  catch
  setg again
  bp 1
  ret
end

function outer
  call inner 0
  ret
end

function inner
  str boom
  throw
end
"#;
        let (mut engine, _) = engine_for(source);
        engine
            .handle_message(SimMessage::Debugger(DebuggerMessage::Config {
                set_breakpoints: vec![1],
            }))
            .unwrap();
        engine.start().unwrap();

        assert!(engine.is_paused());
        assert_eq!(engine.live_frames(), 1, "outer and inner were unwound");
        assert_eq!(global(&engine, "caught"), Value::Str("boom".into()));
        assert_eq!(global(&engine, "again"), Value::Null, "catch yields the value once");

        engine
            .handle_message(SimMessage::Debugger(DebuggerMessage::Resume))
            .unwrap();
        assert_eq!(engine.live_frames(), 0);
    }

    #[test]
    fn test_finally_rethrows_pending_exception() {
        let source = r#"
global trail

function main
  try recover
  call work 0
  endtry
  ret
:recover
  catch
  setg trail
  ret
end

function work
  try cleanup
  str inner
  throw
:cleanup
  str cleanup ran
  print
  endfinally
  ret
end
"#;
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();

        assert_eq!(global(&engine, "trail"), Value::Str("inner".into()));
        assert!(engine.drain_outbox().contains(&SimMessage::Output {
            text: "cleanup ran".into()
        }));
    }

    #[test]
    fn test_trace_messages_are_rate_limited() {
        let source = r#"
breakpoint 1 main.ts 2 2 2 10

function main
  bp 1
  bp 1
  num 50
  sleep
  bp 1
  ret
end
"#;
        let config = EngineConfig {
            trace_interval_ms: Some(50),
            ..Default::default()
        };
        let (mut engine, clock) = engine_with(source, config);
        let traces = |engine: &mut Engine| {
            engine
                .drain_outbox()
                .into_iter()
                .filter_map(|msg| match msg {
                    SimMessage::Debugger(DebuggerMessage::Trace(info)) => Some(info),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        engine.start().unwrap();
        let first = traces(&mut engine);
        assert_eq!(first.len(), 1, "second hit falls inside the interval");
        assert_eq!(first[0].breakpoint_id, Some(1));
        assert_eq!(first[0].stackframes[0].name, "main");
        assert!(!engine.is_paused(), "tracing never pauses");

        clock.advance(50);
        engine.tick().unwrap();
        assert_eq!(traces(&mut engine).len(), 1);

        // Tracing is off by default.
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();
        assert!(traces(&mut engine).is_empty());
    }

    #[test]
    fn test_end_try_without_try_is_internal_error() {
        let (mut engine, _) = engine_for("function main\n  endtry\n  ret\nend\n");
        assert!(matches!(
            engine.start(),
            Err(EngineError::MismatchedTry { .. })
        ));
    }
}

#[cfg(test)]
mod event_tests {
    use super::*;

    #[test]
    fn test_events_are_handled_in_order_one_at_a_time() {
        let (mut engine, clock) = engine_for(LOGGER);
        engine.start().unwrap();

        engine.queue_event(5, 1, Value::Number(1.0));
        engine.queue_event(5, 1, Value::Number(2.0));
        engine.run_until_idle().unwrap();
        assert!(logged(&engine, "log").is_empty(), "first handler is asleep");

        clock.advance(10);
        engine.tick().unwrap();
        assert_eq!(logged(&engine, "log"), vec![Value::Number(1.0)]);

        clock.advance(10);
        engine.tick().unwrap();
        assert_eq!(
            logged(&engine, "log"),
            vec![Value::Number(1.0), Value::Number(2.0)]
        );

        let queue = engine
            .event_bus()
            .queue(QueueKey::new(5, 1), HandlerMode::Foreground)
            .expect("queue exists");
        assert!(!queue.is_locked(), "drained queue unlocks");
    }

    #[test]
    fn test_backlog_overflow_drops_newest() {
        let (mut engine, clock) = engine_for(LOGGER);
        engine.start().unwrap();

        engine.queue_event(5, 1, Value::Number(1.0));
        engine.run_until_idle().unwrap();

        let outcomes: Vec<_> = (2..=7)
            .map(|n| engine.queue_event(5, 1, Value::Number(f64::from(n))))
            .collect();
        assert!(outcomes[..5].iter().all(|o| o.delivered == 1));
        assert_eq!(outcomes[5].dropped, 1);

        let queue = engine
            .event_bus()
            .queue(QueueKey::new(5, 1), HandlerMode::Foreground)
            .unwrap();
        assert_eq!(queue.buffered_len(), 5);

        for _ in 0..10 {
            clock.advance(10);
            engine.tick().unwrap();
        }
        let values: Vec<Value> = (1..=6).map(|n| Value::Number(f64::from(n))).collect();
        assert_eq!(logged(&engine, "log"), values);
    }

    #[test]
    fn test_backlog_applies_to_raises_from_the_program() {
        let source = LOGGER.replace(
            "  listen 5 1\n",
            "  listen 5 1\nRAISES",
        );
        let raises: String = (1..=7).map(|n| format!("  num {n}\n  raise 5 1\n")).collect();
        let (mut engine, clock) = engine_for(&source.replace("RAISES", &raises));
        engine.start().unwrap();

        for _ in 0..10 {
            clock.advance(10);
            engine.tick().unwrap();
        }
        let values: Vec<Value> = (1..=6).map(|n| Value::Number(f64::from(n))).collect();
        assert_eq!(logged(&engine, "log"), values, "one in flight plus five waiting");
    }

    #[test]
    fn test_notify_one_wakes_a_single_waiter() {
        let source = r#"
global woke

function main
  num 0
  setg woke
  closure waiter 0
  fork 0
  closure waiter 0
  fork 0
  ret
end

function waiter
  wait 7 1
  pop
  getg woke
  num 1
  add
  setg woke
  ret
end
"#;
        let config = EngineConfig {
            notify_one_id: Some(7),
            ..Default::default()
        };
        let (mut engine, _) = engine_with(source, config);
        engine.start().unwrap();

        let outcome = engine.queue_event(7, 1, Value::Null);
        engine.run_until_idle().unwrap();
        assert_eq!(outcome.woken.len(), 1);
        assert_eq!(global(&engine, "woke"), Value::Number(1.0));

        engine.queue_event(7, 1, Value::Null);
        engine.run_until_idle().unwrap();
        assert_eq!(global(&engine, "woke"), Value::Number(2.0));

        // Without the setting every waiter wakes at once.
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();
        let outcome = engine.queue_event(7, 1, Value::Null);
        engine.run_until_idle().unwrap();
        assert_eq!(outcome.woken.len(), 2);
        assert_eq!(global(&engine, "woke"), Value::Number(2.0));
    }

    #[test]
    fn test_unlisten_during_dispatch_is_deferred() {
        let source = r#"
global log second

function main
  array
  setg log
  closure onFirst 0
  listen 5 1 bg
  closure onSecond 0
  dup
  setg second
  listen 5 1 bg
  ret
end

function onFirst v
  getg second
  unlisten 5 1 bg
  getg log
  str first
  apush
  ret
end

function onSecond v
  getg log
  str second
  apush
  ret
end
"#;
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();

        engine.queue_event(5, 1, Value::Null);
        engine.run_until_idle().unwrap();
        assert_eq!(
            logged(&engine, "log"),
            vec![Value::Str("first".into()), Value::Str("second".into())],
            "removal waits until the in-flight event is delivered"
        );

        engine.queue_event(5, 1, Value::Null);
        engine.run_until_idle().unwrap();
        let log = logged(&engine, "log");
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], Value::Str("first".into()));

        let queue = engine
            .event_bus()
            .queue(QueueKey::new(5, 1), HandlerMode::Background)
            .expect("queue exists");
        assert_eq!(queue.handlers().len(), 1);
    }

    #[test]
    fn test_wait_is_woken_by_raise() {
        let source = r#"
global got

function main
  closure producer 0
  fork 0
  wait 7 1
  setg got
  ret
end

function producer
  num 42
  raise 7 1
  ret
end
"#;
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();
        assert_eq!(global(&engine, "got"), Value::Number(42.0));
    }

    #[test]
    fn test_idle_handlers_tick() {
        let source = r#"
global ticks

function main
  num 0
  setg ticks
  closure onIdle 0
  listen 15 2
  ret
end

function onIdle v
  getg ticks
  num 1
  add
  setg ticks
  ret
end
"#;
        let (mut engine, clock) = engine_for(source);
        engine.start().unwrap();
        assert_eq!(engine.next_timer_due(), Some(20));

        clock.advance(20);
        engine.tick().unwrap();
        clock.advance(20);
        engine.tick().unwrap();
        assert_eq!(global(&engine, "ticks"), Value::Number(2.0));
    }

    #[test]
    fn test_pause_preserves_remaining_timer_delay() {
        let source = r#"
global woke
breakpoint 1 main.ts 6 2 6 8

function main
  closure sleeper 0
  fork 0
  num 400
  sleep
  bp 1
  ret
end

function sleeper
  num 1000
  sleep
  bool true
  setg woke
  ret
end
"#;
        let (mut engine, clock) = engine_for(source);
        engine
            .handle_message(SimMessage::Debugger(DebuggerMessage::Config {
                set_breakpoints: vec![1],
            }))
            .unwrap();
        engine.start().unwrap();

        clock.set(400);
        engine.tick().unwrap();
        assert!(engine.is_paused());

        clock.set(5_400);
        engine.tick().unwrap();
        assert_eq!(global(&engine, "woke"), Value::Null, "timers are frozen while paused");

        engine
            .handle_message(SimMessage::Debugger(DebuggerMessage::Resume))
            .unwrap();
        assert_eq!(engine.next_timer_due(), Some(6_000));

        clock.set(5_999);
        engine.tick().unwrap();
        assert_eq!(global(&engine, "woke"), Value::Null);
        clock.set(6_000);
        engine.tick().unwrap();
        assert_eq!(global(&engine, "woke"), Value::Bool(true));
    }
}

#[cfg(test)]
mod heap_tests {
    use super::*;

    const SPAWNER: &str = r#"
record Sprite
global keep

function main
  array
  setg keep
  closure spawn 0
  listen 5 1
  ret
end

function spawn v
  getg keep
  new Sprite
  apush
  ret
end
"#;

    #[test]
    fn test_leak_report_is_idempotent() {
        let (mut engine, _) = engine_for(SPAWNER);
        engine.start().unwrap();

        engine.heap_snapshot();
        engine.queue_event(5, 1, Value::Null);
        engine.run_until_idle().unwrap();
        engine.heap_snapshot();
        assert!(engine.leak_report().is_none(), "needs three snapshots");
        engine.heap_snapshot();

        let first = engine.leak_report().expect("report available");
        let second = engine.leak_report().expect("report available");
        assert_eq!(first.candidates.len(), 1);
        assert_eq!(first.candidates[0].key, "Sprite");
        assert!(first.candidates[0].still_live);
        assert_eq!(first.candidates[0].path, "keep[0]");
        assert_eq!(
            first.candidates.iter().map(|c| c.id).collect::<Vec<_>>(),
            second.candidates.iter().map(|c| c.id).collect::<Vec<_>>()
        );

        // Nothing new between the last two snapshots.
        engine.heap_snapshot();
        assert!(engine.leak_report().unwrap().candidates.is_empty());
    }

    #[test]
    fn test_short_lived_objects_are_not_leaks() {
        let source = r#"
record Sprite
record Scratch
global keep

function main
  array
  setg keep
  closure spawn 0
  listen 5 1
  ret
end

function spawn v
  local scratch
  new Scratch
  store scratch
  getg keep
  new Sprite
  apush
  ret
end
"#;
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();

        engine.heap_snapshot();
        engine.queue_event(5, 1, Value::Null);
        engine.run_until_idle().unwrap();
        engine.heap_snapshot();
        engine.heap_snapshot();

        let report = engine.leak_report().expect("report available");
        let keys: Vec<&str> = report.candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["Sprite"], "scratch was released before the second snapshot");
    }

    #[test]
    fn test_expected_instances_are_not_leaks() {
        let (mut engine, _) = engine_for(&SPAWNER.replace("record Sprite", "record Sprite 1"));
        engine.start().unwrap();

        engine.heap_snapshot();
        engine.queue_event(5, 1, Value::Null);
        engine.run_until_idle().unwrap();
        engine.heap_snapshot();
        engine.heap_snapshot();
        assert!(engine.leak_report().unwrap().candidates.is_empty());
    }

    #[test]
    fn test_collect_garbage_frees_unreachable() {
        let source = r#"
record Sprite
global keep

function main
  local temp
  new Sprite
  setg keep
  new Sprite
  store temp
  ret
end
"#;
        let (mut engine, _) = engine_for(source);
        engine.start().unwrap();

        let kept = global(&engine, "keep").as_object().unwrap();
        assert_eq!(engine.collect_garbage(), 1);
        assert!(engine.heap().get(kept).is_some());
        assert_eq!(engine.collect_garbage(), 0);
    }

    #[test]
    fn test_snapshot_groups_by_type() {
        let (mut engine, _) = engine_for(SPAWNER);
        engine.start().unwrap();
        for _ in 0..3 {
            engine.queue_event(5, 1, Value::Null);
        }
        for _ in 0..3 {
            engine.run_until_idle().unwrap();
        }

        let snapshot = engine.heap_snapshot();
        assert_eq!(snapshot.by_type.get("Sprite").map(|s| s.count), Some(3));
        assert_eq!(snapshot.by_type.get("(array)").map(|s| s.count), Some(1));
        assert!(snapshot.total.count >= 5);
    }
}
