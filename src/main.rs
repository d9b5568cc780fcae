//! cellm - LLM formulas for spreadsheet cells
//!
//! Headless host: reads cell edits and commands from stdin and prints cell
//! values as generations stream into them.
//!
//! ```text
//! B1 What is the capital of France?
//! A1 =LLM(B1)
//! A2 =LLM("Write a haiku about Rust", "You are a poet.")
//! chat Hello there
//! stop A1 | stop | forget | reset | status | show | quit
//! ```

use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cellm::controller::formula::{is_llm_formula, FormulaError};
use cellm::controller::sheet::{CellSurface, MemorySheet};
use cellm::controller::{Caller, Controller, ControllerError};
use cellm::inference::{Engine, Event, LlamaSource};
use cellm::storage::{self, settings::load_settings};
use cellm::types::CellAddress;

/// How long to wait for an engine event before checking stdin again
const TICK: Duration = Duration::from_millis(50);
/// Conversation used by the `chat` command
const CHAT: &str = "console";

fn main() {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("cellm=info".parse().unwrap()))
        .init();

    info!("Starting cellm v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Prints every cell write on one overwritten line
#[derive(Default)]
struct ConsoleSheet {
    cells: MemorySheet,
}

impl CellSurface for ConsoleSheet {
    fn get_value(&self, addr: CellAddress) -> String {
        self.cells.get_value(addr)
    }

    fn set_value(&mut self, addr: CellAddress, text: &str) {
        self.cells.set_value(addr, text);
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r\x1b[2K{}: {}", addr, text.replace('\n', " "));
        let _ = out.flush();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn run() -> Result<(), ControllerError> {
    if let Err(e) = storage::init_storage() {
        warn!("Failed to initialize storage: {}", e);
    }
    let settings = load_settings();

    let source = LlamaSource::new(&settings);
    info!("Using model {}", source.model_path().display());

    let engine = Engine::spawn(source)?;
    let mut controller = Controller::new(engine, ConsoleSheet::default(), settings.system_prompt.clone());
    controller.check()?;
    controller.load()?;

    let lines = spawn_stdin_reader();
    let mut stdin_open = true;
    loop {
        if stdin_open {
            match lines.try_recv() {
                Ok(line) => match handle_line(&mut controller, line.trim()) {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e @ ControllerError::Engine(_)) => return Err(e),
                    Err(e) => println!("\n{e}"),
                },
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => stdin_open = false,
            }
        } else if controller.is_idle() {
            break;
        }

        if let Some(event) = controller.pump_event(TICK)? {
            render(&controller, &event);
        }
    }

    controller.interrupt_all()?;
    info!("Shutting down");
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn handle_line(
    controller: &mut Controller<ConsoleSheet>,
    line: &str,
) -> Result<Flow, ControllerError> {
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match head {
        "" => {}
        "quit" | "exit" => return Ok(Flow::Quit),
        "status" => print_status(controller),
        "show" => {
            for (addr, text) in controller.surface().cells.filled() {
                println!("{addr}: {text}");
            }
        }
        "reset" => controller.reset()?,
        "load" => controller.load()?,
        "chat" => controller.chat(CHAT, rest)?,
        "forget" => controller.forget(CHAT)?,
        "stop" if rest.is_empty() => controller.interrupt_all()?,
        "stop" => {
            let addr = CellAddress::from_a1(rest).map_err(FormulaError::from)?;
            controller.interrupt(&Caller::Cell(addr))?;
        }
        cell => {
            let addr = CellAddress::from_a1(cell).map_err(FormulaError::from)?;
            if is_llm_formula(rest) {
                controller.submit_formula(addr, rest)?;
            } else {
                controller.surface_mut().set_value(addr, rest);
                println!();
            }
        }
    }
    Ok(Flow::Continue)
}

fn render(controller: &Controller<ConsoleSheet>, event: &Event) {
    match event {
        Event::Progress { .. } => {
            if let Some(fraction) = controller.status().load_fraction() {
                print!("\r\x1b[2KLoading model {:.0}%", fraction * 100.0);
                let _ = std::io::stdout().flush();
            }
        }
        Event::Ready | Event::Error { id: None, .. } => {
            println!("\r\x1b[2K{}", controller.status().text);
        }
        Event::Update { output, .. } => {
            if let Some(Caller::Chat(_)) = controller.busy() {
                print!("{output}");
                let _ = std::io::stdout().flush();
            }
        }
        Event::Complete { .. } | Event::Error { id: Some(_), .. } | Event::Rejected { .. } => {
            println!();
        }
        _ => {}
    }
}

fn print_status(controller: &Controller<ConsoleSheet>) {
    let status = controller.status();
    println!("{}", status.text);
    if let Some(busy) = controller.busy() {
        println!(
            "generating for {} ({} tokens, {:.1} tok/s)",
            busy,
            status.num_tokens,
            status.tokens_per_second.unwrap_or(0.0)
        );
    }
    if controller.queued() > 0 {
        println!("{} queued", controller.queued());
    }
}
