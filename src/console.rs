//! Line-oriented debugger for running a program from a terminal.

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use serde_json::Value as Json;
use thiserror::Error;

use crate::dap::{DebuggerMessage, PauseInfo, SimMessage, VariableInfo, VariablesMessage};
use crate::executor::Engine;

/// Longest nap between timer checks while the program runs.
const MAX_WAIT_MS: u64 = 50;

const HELP: &str = "\
commands:
  break [id...]         arm breakpoints (no ids: list them)
  clear <id...>         disarm breakpoints
  c | continue          resume
  n | next              step over
  s | step              step into
  o | out               step out
  p | pause             stop at the next breakpoint instruction
  vars [ref]            show the stop snapshot, or expand a reference
  event <src> <evt> [value]
                        queue an event (value is JSON, else a string)
  heap                  take a heap snapshot
  leaks                 snapshot and report leak candidates
  gc                    free unreachable objects
  q | quit              kill the program and exit";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unbalanced quotes")]
    Unbalanced,
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Break(Vec<u32>),
    Clear(Vec<u32>),
    Continue,
    Next,
    Step,
    Out,
    Pause,
    Vars(Option<u32>),
    Event { source: u32, event: u32, value: Json },
    Heap,
    Leaks,
    Gc,
    Help,
    Quit,
}

fn ids(args: &[String], usage: &'static str) -> Result<Vec<u32>, CommandError> {
    args.iter()
        .map(|a| a.parse().map_err(|_| CommandError::Usage(usage)))
        .collect()
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let tokens = shlex::split(line).ok_or(CommandError::Unbalanced)?;
        let Some((head, args)) = tokens.split_first() else {
            return Ok(None);
        };

        let cmd = match head.as_str() {
            "b" | "break" => Command::Break(ids(args, "break [id...]")?),
            "clear" if !args.is_empty() => Command::Clear(ids(args, "clear <id...>")?),
            "clear" => return Err(CommandError::Usage("clear <id...>")),
            "c" | "continue" => Command::Continue,
            "n" | "next" => Command::Next,
            "s" | "step" => Command::Step,
            "o" | "out" => Command::Out,
            "p" | "pause" => Command::Pause,
            "vars" => match args.first() {
                None => Command::Vars(None),
                Some(r) => Command::Vars(Some(
                    r.parse().map_err(|_| CommandError::Usage("vars [ref]"))?,
                )),
            },
            "event" => {
                const USAGE: &str = "event <src> <evt> [value]";
                let [source, event, rest @ ..] = args else {
                    return Err(CommandError::Usage(USAGE));
                };
                let value = match rest.join(" ") {
                    raw if raw.is_empty() => Json::Null,
                    raw => serde_json::from_str(&raw).unwrap_or(Json::String(raw)),
                };
                Command::Event {
                    source: source.parse().map_err(|_| CommandError::Usage(USAGE))?,
                    event: event.parse().map_err(|_| CommandError::Usage(USAGE))?,
                    value,
                }
            }
            "heap" => Command::Heap,
            "leaks" => Command::Leaks,
            "gc" => Command::Gc,
            "h" | "help" | "?" => Command::Help,
            "q" | "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(cmd))
    }
}

/// Drives an [`Engine`] from a terminal: runs it in real time and prompts
/// whenever it stops at a breakpoint or has nothing left to do on its own.
pub struct Console<W: Write> {
    engine: Engine,
    out: W,
    last_stop: Option<PauseInfo>,
    finished_reported: bool,
}

impl<W: Write> Console<W> {
    pub fn new(engine: Engine, out: W) -> Self {
        Self {
            engine,
            out,
            last_stop: None,
            finished_reported: false,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Start the program and serve commands from `input` until `quit` or EOF.
    pub fn run<R: BufRead>(&mut self, mut input: R) -> io::Result<()> {
        if let Err(err) = self.engine.start() {
            writeln!(self.out, "cannot start program: {err}")?;
            return Ok(());
        }

        loop {
            self.show_messages()?;
            if !self.engine.is_paused() {
                if let Some(due) = self.engine.next_timer_due() {
                    let wait = due.saturating_sub(self.engine.now_ms()).min(MAX_WAIT_MS);
                    thread::sleep(Duration::from_millis(wait));
                    if let Err(err) = self.engine.tick() {
                        writeln!(self.out, "engine error: {err}")?;
                    }
                    continue;
                }
                if self.engine.is_quiescent() && !self.finished_reported {
                    writeln!(self.out, "program finished")?;
                    self.finished_reported = true;
                }
            }

            write!(self.out, "> ")?;
            self.out.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            match Command::parse(&line) {
                Ok(Some(cmd)) => {
                    if !self.execute(cmd)? {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => writeln!(self.out, "{err}")?,
            }
        }

        self.engine.kill();
        self.show_messages()
    }

    /// Run one command. Returns `false` for `quit`.
    pub fn execute(&mut self, cmd: Command) -> io::Result<bool> {
        match cmd {
            Command::Break(ids) if ids.is_empty() => self.list_breakpoints()?,
            Command::Break(ids) => {
                let mut armed: BTreeSet<u32> =
                    self.engine.debugger().armed_ids().into_iter().collect();
                armed.extend(ids);
                self.arm(armed)?;
            }
            Command::Clear(ids) => {
                let mut armed: BTreeSet<u32> =
                    self.engine.debugger().armed_ids().into_iter().collect();
                for id in ids {
                    armed.remove(&id);
                }
                self.arm(armed)?;
            }
            Command::Continue => self.send(SimMessage::Debugger(DebuggerMessage::Resume))?,
            Command::Next => self.send(SimMessage::Debugger(DebuggerMessage::StepOver))?,
            Command::Step => self.send(SimMessage::Debugger(DebuggerMessage::StepInto))?,
            Command::Out => self.send(SimMessage::Debugger(DebuggerMessage::StepOut))?,
            Command::Pause => self.send(SimMessage::Debugger(DebuggerMessage::Pause))?,
            Command::Vars(None) => self.show_stop()?,
            Command::Vars(Some(reference)) => {
                self.send(SimMessage::Debugger(DebuggerMessage::Variables(
                    VariablesMessage {
                        req_seq: 0,
                        variables_reference: reference,
                        fields: None,
                        variables: None,
                        error: None,
                    },
                )))?;
            }
            Command::Event {
                source,
                event,
                value,
            } => self.send(SimMessage::EventBus {
                id: source,
                eventid: event,
                value,
            })?,
            Command::Heap => {
                let snapshot = self.engine.heap_snapshot();
                writeln!(
                    self.out,
                    "snapshot {}: {} objects, {} bytes",
                    snapshot.seq, snapshot.total.count, snapshot.total.size
                )?;
                for (key, stats) in &snapshot.by_type {
                    writeln!(self.out, "  {key:<16} {:>6} {:>8}", stats.count, stats.size)?;
                }
            }
            Command::Leaks => {
                self.engine.heap_snapshot();
                match self.engine.leak_report() {
                    None => writeln!(self.out, "need at least three snapshots")?,
                    Some(report) if report.candidates.is_empty() => {
                        writeln!(self.out, "no leak candidates")?
                    }
                    Some(report) => {
                        for c in &report.candidates {
                            let live = if c.still_live { "" } else { " (gone)" };
                            writeln!(self.out, "  #{} {} {}{live}", c.id, c.key, c.path)?;
                        }
                    }
                }
            }
            Command::Gc => {
                let freed = self.engine.collect_garbage();
                writeln!(self.out, "freed {freed} objects")?;
            }
            Command::Help => writeln!(self.out, "{HELP}")?,
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn arm(&mut self, armed: BTreeSet<u32>) -> io::Result<()> {
        self.send(SimMessage::Debugger(DebuggerMessage::Config {
            set_breakpoints: armed.into_iter().collect(),
        }))?;
        let armed = self.engine.debugger().armed_ids();
        writeln!(self.out, "armed: {armed:?}")
    }

    fn list_breakpoints(&mut self) -> io::Result<()> {
        let debugger = self.engine.debugger();
        let map = debugger.breakpoints();
        for path in map.paths() {
            for bp in map.for_path(path) {
                let mark = if debugger.is_armed(bp.id) { '*' } else { ' ' };
                writeln!(
                    self.out,
                    "{mark} {:>3} {}:{}:{}",
                    bp.id, bp.path, bp.line, bp.column
                )?;
            }
        }
        Ok(())
    }

    fn send(&mut self, msg: SimMessage) -> io::Result<()> {
        if let Err(err) = self.engine.handle_message(msg) {
            writeln!(self.out, "engine error: {err}")?;
        }
        self.show_messages()
    }

    fn show_messages(&mut self) -> io::Result<()> {
        for msg in self.engine.drain_outbox() {
            match msg {
                SimMessage::Output { text } => writeln!(self.out, "{text}")?,
                SimMessage::Debugger(DebuggerMessage::Breakpoint(info)) => {
                    if let Some(message) = &info.exception_message {
                        writeln!(self.out, "{message}")?;
                        continue;
                    }
                    match info.stackframes.first() {
                        Some(top) => writeln!(
                            self.out,
                            "stopped in {} at {}:{}",
                            top.name,
                            top.source.as_deref().unwrap_or("?"),
                            top.line
                        )?,
                        None => writeln!(self.out, "stopped")?,
                    }
                    self.last_stop = Some(info);
                }
                SimMessage::Debugger(DebuggerMessage::Variables(reply)) => {
                    if let Some(error) = reply.error {
                        writeln!(self.out, "{error}")?;
                        continue;
                    }
                    let vars = reply.variables.unwrap_or_default();
                    if vars.is_empty() {
                        writeln!(self.out, "nothing to expand")?;
                    }
                    self.write_vars("", &vars)?;
                }
                SimMessage::TopLevelCodeFinished => writeln!(self.out, "main finished")?,
                SimMessage::Status { state } => {
                    tracing::debug!(?state, "status");
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn show_stop(&mut self) -> io::Result<()> {
        let Some(stop) = self.last_stop.take() else {
            return writeln!(self.out, "not stopped");
        };
        if self.engine.is_paused() {
            writeln!(self.out, "globals:")?;
            self.write_vars("  ", &stop.globals)?;
            for (i, frame) in stop.stackframes.iter().enumerate() {
                writeln!(self.out, "#{i} {} line {}", frame.name, frame.line)?;
                self.write_vars("  ", &frame.locals)?;
                self.write_vars("  ^", &frame.captures)?;
            }
            self.last_stop = Some(stop);
        } else {
            writeln!(self.out, "not stopped")?;
        }
        Ok(())
    }

    fn write_vars(&mut self, indent: &str, vars: &[VariableInfo]) -> io::Result<()> {
        for v in vars {
            match v.variables_reference {
                0 => writeln!(self.out, "{indent}{} = {}", v.name, v.value)?,
                r => writeln!(self.out, "{indent}{} = {} [ref {r}]", v.name, v.value)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::ManualClock;
    use crate::parser::parse_program;

    const PROGRAM: &str = r#"
global total
record Sprite
breakpoint 1 main.ts 2 0 2 12
breakpoint 2 main.ts 3 0 3 12

function main
  local s
  new Sprite
  store s
  bp 1
  num 5
  setg total
  bp 2
  str done
  print
  ret
end
"#;

    fn console() -> Console<Vec<u8>> {
        let program = parse_program(PROGRAM).unwrap();
        let engine = Engine::new(
            program,
            EngineConfig::default(),
            Box::new(ManualClock::new()),
        );
        Console::new(engine, Vec::new())
    }

    fn output(console: &mut Console<Vec<u8>>) -> String {
        String::from_utf8(std::mem::take(console.writer_mut())).unwrap()
    }

    #[test]
    fn parses_commands_with_quotes() {
        assert_eq!(Command::parse("  "), Ok(None));
        assert_eq!(Command::parse("break 1 3"), Ok(Some(Command::Break(vec![1, 3]))));
        assert_eq!(
            Command::parse(r#"event 5 1 "hello world""#),
            Ok(Some(Command::Event {
                source: 5,
                event: 1,
                value: Json::String("hello world".into()),
            }))
        );
        assert_eq!(
            Command::parse("event 5 1 42"),
            Ok(Some(Command::Event {
                source: 5,
                event: 1,
                value: serde_json::json!(42),
            }))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Command::parse("event 5"), Err(CommandError::Usage("event <src> <evt> [value]")));
        assert_eq!(Command::parse("break x"), Err(CommandError::Usage("break [id...]")));
        assert_eq!(Command::parse("str \"oops"), Err(CommandError::Unbalanced));
        assert!(matches!(Command::parse("jump 3"), Err(CommandError::Unknown(_))));
    }

    #[test]
    fn break_then_continue_walks_the_program() {
        let mut console = console();
        console.execute(Command::Break(vec![2])).unwrap();
        assert!(output(&mut console).contains("armed: [2]"));

        console.engine.start().unwrap();
        console.show_messages().unwrap();
        assert!(console.engine().is_paused());
        assert!(output(&mut console).contains("stopped in main at main.ts:3"));

        console.execute(Command::Vars(None)).unwrap();
        let vars = output(&mut console);
        assert!(vars.contains("total = 5"));
        assert!(vars.contains("s = Sprite"));

        console.execute(Command::Continue).unwrap();
        let rest = output(&mut console);
        assert!(rest.contains("done"));
        assert!(!console.engine().is_paused());
    }

    #[test]
    fn quit_stops_the_loop() {
        let mut console = console();
        assert!(!console.execute(Command::Quit).unwrap());
        assert!(console.execute(Command::Gc).unwrap());
        assert!(output(&mut console).starts_with("freed"));
    }
}
