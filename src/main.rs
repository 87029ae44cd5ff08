use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use sim_engine::console::Console;
use sim_engine::dap::{self, DebuggerMessage, SimMessage};
use sim_engine::executor::{Engine, SystemClock};
use sim_engine::logging::init_tracing;
use sim_engine::parser::load_program;
use sim_engine::EngineConfig;

const USAGE: &str = "usage: sim-engine [--config <file>] (run <program> | debug <program> | --dap)";

enum Mode {
    Run(PathBuf),
    Debug(PathBuf),
    Dap,
}

fn parse_args(args: &[String]) -> Result<(Mode, Option<PathBuf>), String> {
    let mut config = None;
    let mut mode = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config needs a file")?;
                config = Some(PathBuf::from(path));
            }
            "--dap" | "--debug-adapter" => mode = Some(Mode::Dap),
            "run" | "debug" => {
                let program = iter
                    .next()
                    .ok_or_else(|| format!("`{arg}` needs a program"))?;
                let program = PathBuf::from(program);
                mode = Some(if arg == "run" {
                    Mode::Run(program)
                } else {
                    Mode::Debug(program)
                });
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("unexpected argument `{other}`\n{USAGE}")),
        }
    }
    let mode = mode.ok_or_else(|| USAGE.to_string())?;
    Ok((mode, config))
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, config_path) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let config = match &config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    init_tracing(&config.logging);
    tracing::debug!(?config_path, "configuration loaded");

    match mode {
        Mode::Dap => dap::run_dap_mode(config)?,
        Mode::Run(program) => run_program(&program, config)?,
        Mode::Debug(program) => {
            let engine = build_engine(&program, config)?;
            let mut console = Console::new(engine, io::stderr());
            console.run(io::stdin().lock())?;
        }
    }
    Ok(())
}

fn build_engine(path: &Path, config: EngineConfig) -> Result<Engine, Box<dyn Error>> {
    let program = load_program(path)?;
    tracing::info!(program = %path.display(), functions = program.functions.len(), "program loaded");
    Ok(Engine::new(program, config, Box::new(SystemClock::new())))
}

/// Run without a debugger until nothing is left to do on its own.
fn run_program(path: &Path, config: EngineConfig) -> Result<(), Box<dyn Error>> {
    let mut engine = build_engine(path, config)?;
    engine.start()?;
    loop {
        for msg in engine.drain_outbox() {
            match msg {
                SimMessage::Output { text } => println!("{text}"),
                SimMessage::Debugger(DebuggerMessage::Breakpoint(info)) => {
                    if let Some(message) = info.exception_message {
                        eprintln!("{message}");
                    }
                }
                _ => {}
            }
        }
        let Some(due) = engine.next_timer_due() else {
            break;
        };
        let wait = due.saturating_sub(engine.now_ms());
        thread::sleep(Duration::from_millis(wait));
        engine.tick()?;
    }

    if !engine.is_quiescent() {
        tracing::info!("no timers left; remaining handlers wait for external events");
    }
    Ok(())
}
