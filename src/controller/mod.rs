//! Controller
//!
//! Runs on the interactive thread. Turns formula cells and chat callers into
//! engine commands, serializes generations into the single engine channel,
//! and routes the resulting events back to whoever asked.
//!
//! A cell has at most one pending request. A second request from a cell
//! whose request is still queued replaces it; a request from a cell whose
//! generation is running interrupts that generation and queues behind it.
//! Chat messages are never replaced: each one queues behind the last and
//! sees the exchanges before it in the conversation history.
//!
//! Histories are kept whole. When a conversation outgrows the context window
//! the engine drops its oldest exchanges from the prompt, keeping the system
//! prompt and the newest message.

pub mod formula;
pub mod sheet;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::inference::engine::{Engine, EngineError};
use crate::inference::protocol::{Event, FinishReason, GenerationId};
use crate::types::{CellAddress, ChatTurn};

use self::formula::FormulaError;
use self::sheet::CellSurface;

/// Text shown in a cell while its request waits for the engine
pub const PENDING: &str = "…";

/// Errors surfaced to the host
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out waiting for the engine")]
    Timeout,
}

/// Who receives the output of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// A formula cell; output is written into the cell
    Cell(CellAddress),
    /// A named conversation; output is appended to its history
    Chat(String),
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Cell(addr) => write!(f, "{addr}"),
            Caller::Chat(name) => write!(f, "chat:{name}"),
        }
    }
}

/// Controller view of the model lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelPhase {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

/// Bytes acquired for one artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileProgress {
    pub loaded: u64,
    pub total: u64,
    pub done: bool,
}

/// Everything a host needs to render a status line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerStatus {
    /// Coarse status text
    pub text: String,
    /// Load progress per file id
    pub files: BTreeMap<String, FileProgress>,
    /// Rate of the running (or last) generation
    pub tokens_per_second: Option<f64>,
    /// Tokens generated by the running (or last) generation
    pub num_tokens: usize,
    /// How the last generation ended
    pub last_finish: Option<FinishReason>,
}

impl ControllerStatus {
    /// Fraction of all known artifact bytes acquired so far
    pub fn load_fraction(&self) -> Option<f64> {
        let (loaded, total) = self
            .files
            .values()
            .fold((0u64, 0u64), |(l, t), f| (l + f.loaded, t + f.total));
        (total > 0).then(|| loaded as f64 / total as f64)
    }
}

/// Commands that end in exactly one `ready` or id-less `error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Check,
    Load,
}

#[derive(Debug)]
struct Request {
    caller: Caller,
    turns: Vec<ChatTurn>,
}

#[derive(Debug)]
struct InFlight {
    id: GenerationId,
    caller: Caller,
    /// User turn of a chat request, recorded with the reply on completion
    chat_turn: Option<ChatTurn>,
    output: String,
    /// A newer request from the same caller is queued; stop rendering this one
    superseded: bool,
}

/// Routes requests from cells and chats through one [`Engine`].
pub struct Controller<C: CellSurface> {
    engine: Engine,
    surface: C,
    system_prompt: String,
    phase: ModelPhase,
    awaiting: VecDeque<Awaiting>,
    queue: VecDeque<Request>,
    in_flight: Option<InFlight>,
    histories: HashMap<String, Vec<ChatTurn>>,
    status: ControllerStatus,
}

impl<C: CellSurface> Controller<C> {
    pub fn new(engine: Engine, surface: C, system_prompt: impl Into<String>) -> Self {
        Self {
            engine,
            surface,
            system_prompt: system_prompt.into(),
            phase: ModelPhase::Unloaded,
            awaiting: VecDeque::new(),
            queue: VecDeque::new(),
            in_flight: None,
            histories: HashMap::new(),
            status: ControllerStatus {
                text: "Model not loaded".to_string(),
                ..Default::default()
            },
        }
    }

    pub fn surface(&self) -> &C {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut C {
        &mut self.surface
    }

    pub fn status(&self) -> &ControllerStatus {
        &self.status
    }

    pub fn phase(&self) -> &ModelPhase {
        &self.phase
    }

    /// Completed exchanges of a chat caller
    pub fn history(&self, name: &str) -> &[ChatTurn] {
        self.histories.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of requests waiting for the engine
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Caller whose generation is running
    pub fn busy(&self) -> Option<&Caller> {
        self.in_flight.as_ref().map(|f| &f.caller)
    }

    /// Probe the execution backend
    pub fn check(&mut self) -> Result<(), ControllerError> {
        self.engine.check()?;
        self.awaiting.push_back(Awaiting::Check);
        Ok(())
    }

    /// Load the model. Safe to call again after a failure.
    pub fn load(&mut self) -> Result<(), ControllerError> {
        self.engine.load()?;
        self.awaiting.push_back(Awaiting::Load);
        if self.phase != ModelPhase::Ready {
            self.phase = ModelPhase::Loading;
            self.status.files.clear();
            self.status.text = "Loading model...".to_string();
        }
        Ok(())
    }

    /// Submit the formula written in `addr`.
    ///
    /// Parse and resolution errors are written into the cell and returned.
    pub fn submit_formula(&mut self, addr: CellAddress, formula: &str) -> Result<(), ControllerError> {
        let turns = formula::parse(formula)
            .and_then(|call| call.resolve(&self.surface, &self.system_prompt));
        match turns {
            Ok(turns) => self.submit(Caller::Cell(addr), turns),
            Err(e) => {
                self.surface.set_value(addr, &error_text("", &e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Send `text` as the next user turn of the conversation `name`.
    pub fn chat(&mut self, name: &str, text: &str) -> Result<(), ControllerError> {
        self.submit(Caller::Chat(name.to_string()), vec![ChatTurn::user(text)])
    }

    /// Drop the history of `name`, cancel its pending work and clear the
    /// engine cache.
    pub fn forget(&mut self, name: &str) -> Result<(), ControllerError> {
        let caller = Caller::Chat(name.to_string());
        self.histories.remove(name);
        self.queue.retain(|r| r.caller != caller);
        if let Some(flight) = self.in_flight.as_mut().filter(|f| f.caller == caller) {
            flight.superseded = true;
            flight.chat_turn = None;
            self.engine.interrupt(Some(flight.id))?;
        }
        self.engine.reset()?;
        tracing::debug!("Forgot conversation {}", name);
        Ok(())
    }

    /// Cancel `caller`'s request, queued or running.
    pub fn interrupt(&mut self, caller: &Caller) -> Result<(), ControllerError> {
        let before = self.queue.len();
        self.queue.retain(|r| &r.caller != caller);
        if self.queue.len() != before {
            if let Caller::Cell(addr) = caller {
                self.surface.set_value(*addr, "");
            }
        }
        if let Some(flight) = self.in_flight.as_ref().filter(|f| &f.caller == caller) {
            self.engine.interrupt(Some(flight.id))?;
        }
        Ok(())
    }

    /// Cancel every queued request and the running generation.
    pub fn interrupt_all(&mut self) -> Result<(), ControllerError> {
        for request in self.queue.drain(..) {
            if let Caller::Cell(addr) = request.caller {
                self.surface.set_value(addr, "");
            }
        }
        if self.in_flight.is_some() {
            self.engine.interrupt(None)?;
        }
        Ok(())
    }

    /// Clear the engine's decode cache
    pub fn reset(&mut self) -> Result<(), ControllerError> {
        self.engine.reset()?;
        Ok(())
    }

    fn submit(&mut self, caller: Caller, turns: Vec<ChatTurn>) -> Result<(), ControllerError> {
        if let ModelPhase::Failed(message) = &self.phase {
            let message = message.clone();
            if let Caller::Cell(addr) = &caller {
                self.surface.set_value(*addr, &error_text("", &message));
            }
            return Err(ControllerError::Unavailable(message));
        }

        match &caller {
            Caller::Cell(addr) => {
                self.surface.set_value(*addr, PENDING);
                if let Some(pos) = self.queue.iter().position(|r| r.caller == caller) {
                    tracing::debug!("Replacing queued request from {}", caller);
                    self.queue[pos].turns = turns;
                    return self.dispatch_next();
                }
                if let Some(flight) = self.in_flight.as_mut().filter(|f| f.caller == caller) {
                    tracing::debug!(
                        "Interrupting generation {} for newer request from {}",
                        flight.id,
                        caller
                    );
                    flight.superseded = true;
                    self.engine.interrupt(Some(flight.id))?;
                }
            }
            Caller::Chat(_) => tracing::debug!("Queueing message from {}", caller),
        }

        self.queue.push_back(Request { caller, turns });
        self.dispatch_next()
    }

    fn dispatch_next(&mut self) -> Result<(), ControllerError> {
        if self.in_flight.is_some() || self.phase != ModelPhase::Ready {
            return Ok(());
        }
        let Some(request) = self.queue.pop_front() else {
            return Ok(());
        };

        let (turns, chat_turn) = match &request.caller {
            Caller::Chat(name) => {
                let mut turns = Vec::new();
                if !self.system_prompt.trim().is_empty() {
                    turns.push(ChatTurn::system(self.system_prompt.clone()));
                }
                turns.extend_from_slice(self.history(name));
                turns.extend(request.turns.iter().cloned());
                (turns, request.turns.last().cloned())
            }
            Caller::Cell(_) => (request.turns, None),
        };

        let id = self.engine.generate(turns)?;
        tracing::debug!("Dispatched generation {} for {}", id, request.caller);
        self.in_flight = Some(InFlight {
            id,
            caller: request.caller,
            chat_turn,
            output: String::new(),
            superseded: false,
        });
        Ok(())
    }

    /// Apply every event already waiting. Returns how many were handled.
    pub fn pump(&mut self) -> Result<usize, ControllerError> {
        let mut handled = 0;
        while let Some(event) = self.engine.try_event()? {
            self.handle_event(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Wait up to `timeout` for one event and apply it.
    pub fn pump_event(&mut self, timeout: Duration) -> Result<Option<Event>, ControllerError> {
        match self.engine.recv_event(timeout)? {
            Some(event) => {
                self.handle_event(event.clone())?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Whether nothing is running or waiting on the engine
    pub fn is_idle(&self) -> bool {
        self.awaiting.is_empty()
            && self.in_flight.is_none()
            && (self.queue.is_empty() || self.phase != ModelPhase::Ready)
    }

    /// Apply events until [`Controller::is_idle`], failing after `timeout`.
    pub fn pump_until_idle(&mut self, timeout: Duration) -> Result<(), ControllerError> {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.pump_event(remaining)?.is_none() {
                return Err(ControllerError::Timeout);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<(), ControllerError> {
        match event {
            Event::Ready => match self.awaiting.pop_front() {
                Some(Awaiting::Load) => {
                    self.phase = ModelPhase::Ready;
                    self.status.text = "Model ready".to_string();
                    tracing::info!("Model ready");
                    self.dispatch_next()?;
                }
                Some(Awaiting::Check) => {
                    if self.phase == ModelPhase::Unloaded {
                        self.status.text = "Backend available".to_string();
                    }
                }
                None => tracing::warn!("Unexpected ready event"),
            },
            Event::Loading { message } => {
                self.status.text = message;
            }
            Event::Initiate { file } => {
                self.status.files.insert(file, FileProgress::default());
            }
            Event::Progress {
                file,
                loaded,
                total,
            } => {
                let entry = self.status.files.entry(file).or_default();
                entry.loaded = loaded;
                entry.total = total;
            }
            Event::Done { file } => {
                let entry = self.status.files.entry(file).or_default();
                entry.loaded = entry.total;
                entry.done = true;
            }
            Event::Start { id } => {
                self.status.tokens_per_second = None;
                self.status.num_tokens = 0;
                if let Some(addr) = self.rendered_cell(id) {
                    self.surface.set_value(addr, "");
                }
            }
            Event::Update {
                id,
                output,
                tps,
                num_tokens,
            } => {
                self.status.tokens_per_second = tps;
                self.status.num_tokens = num_tokens;
                let Some(flight) = self.in_flight.as_mut().filter(|f| f.id == id) else {
                    return Ok(());
                };
                flight.output.push_str(&output);
                if let (Caller::Cell(addr), false) = (&flight.caller, flight.superseded) {
                    self.surface.set_value(*addr, &flight.output);
                }
            }
            Event::Complete { id, reason } => {
                self.status.last_finish = Some(reason);
                if let Some(flight) = self.take_flight(id) {
                    tracing::debug!("Generation {} for {} completed: {:?}", id, flight.caller, reason);
                    if let (Caller::Chat(name), Some(turn)) = (&flight.caller, flight.chat_turn) {
                        let history = self.histories.entry(name.clone()).or_default();
                        history.push(turn);
                        history.push(ChatTurn::assistant(flight.output));
                    }
                }
                self.dispatch_next()?;
            }
            Event::Error {
                id: Some(id),
                message,
                partial,
            } => {
                if let Some(flight) = self.take_flight(id) {
                    tracing::warn!("Generation {} for {} failed: {}", id, flight.caller, message);
                    if let (Caller::Cell(addr), false) = (&flight.caller, flight.superseded) {
                        let partial = partial.as_deref().unwrap_or(&flight.output);
                        self.surface.set_value(*addr, &error_text(partial, &message));
                    }
                }
                self.status.text = format!("Generation failed: {message}");
                self.dispatch_next()?;
            }
            Event::Error {
                id: None, message, ..
            } => match self.awaiting.pop_front() {
                Some(Awaiting::Load) => {
                    tracing::error!("Model load failed: {}", message);
                    self.status.text = format!("Load failed: {message}");
                    self.fail_queued(&message);
                    self.phase = ModelPhase::Failed(message);
                }
                Some(Awaiting::Check) => {
                    self.status.text = format!("Backend unavailable: {message}");
                    if self.phase == ModelPhase::Unloaded {
                        self.fail_queued(&message);
                        self.phase = ModelPhase::Failed(message);
                    }
                }
                None => tracing::warn!("Unexpected error event: {}", message),
            },
            Event::Rejected { id, message } => {
                tracing::warn!("Engine rejected generation {:?}: {}", id, message);
                if let Some(flight) = id.and_then(|id| self.take_flight(id)) {
                    if let Caller::Cell(addr) = flight.caller {
                        self.surface.set_value(addr, &error_text("", &message));
                    }
                }
            }
        }
        Ok(())
    }

    fn flight(&self, id: GenerationId) -> Option<&InFlight> {
        self.in_flight.as_ref().filter(|f| f.id == id)
    }

    /// Cell that shows the output of generation `id`, unless superseded
    fn rendered_cell(&self, id: GenerationId) -> Option<CellAddress> {
        match self.flight(id) {
            Some(InFlight {
                caller: Caller::Cell(addr),
                superseded: false,
                ..
            }) => Some(*addr),
            _ => None,
        }
    }

    fn take_flight(&mut self, id: GenerationId) -> Option<InFlight> {
        if self.flight(id).is_some() {
            self.in_flight.take()
        } else {
            None
        }
    }

    fn fail_queued(&mut self, message: &str) {
        for request in self.queue.drain(..) {
            if let Caller::Cell(addr) = request.caller {
                self.surface.set_value(addr, &error_text("", message));
            }
        }
    }
}

/// Cell text for a failed request
fn error_text(partial: &str, message: &str) -> String {
    if partial.is_empty() {
        format!("#ERROR: {message}")
    } else {
        format!("{partial}\n#ERROR: {message}")
    }
}
