//! Inference engine implementation
//!
//! The [`Engine`] owns a long-lived worker thread. All model state lives on
//! that thread inside a [`Session`]; the caller only sends [`Command`]s and
//! receives [`Event`]s.
//!
//! # Architecture
//!
//! llama.cpp handles (`LlamaModel`, `LlamaContext`) are not `Send`, so the
//! worker creates them itself after receiving `load` and never hands them
//! out. Generation runs as a sequence of single-token steps; between steps
//! the worker drains the command channel, which is how `interrupt` reaches a
//! running generation.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::inference::artifacts::ArtifactError;
use crate::inference::backend::{
    ChatTokenizer, GenerationParams, LanguageModel, LoadReporter, ModelSource, TokenId,
};
use crate::inference::protocol::{Command, EngineState, Event, FinishReason, GenerationId};
use crate::inference::stopping::StoppingToken;
use crate::inference::streaming::{TextStreamer, TokenRate};
use crate::types::{ChatTurn, Role};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Execution backend unavailable: {0}")]
    Capability(String),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt of {prompt} tokens does not fit the {capacity}-token context window")]
    ContextOverflow { prompt: usize, capacity: usize },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ArtifactError> for EngineError {
    fn from(e: ArtifactError) -> Self {
        EngineError::ModelLoad(e.to_string())
    }
}

/// Handle to the engine's worker thread.
///
/// Commands are processed strictly in send order. Events come back through a
/// single ordered channel read with [`Engine::try_event`] or
/// [`Engine::recv_event`].
pub struct Engine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<Command>>,
    /// Events emitted by the worker
    event_rx: Receiver<Event>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Id handed to the next generation
    next_generation: GenerationId,
}

impl Engine {
    /// Spawn the worker thread around `source`.
    ///
    /// Nothing is loaded yet; send [`Engine::load`] to acquire the model.
    pub fn spawn<S: ModelSource>(source: S) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let (event_tx, event_rx) = mpsc::channel::<Event>();

        let handle = thread::Builder::new()
            .name("cellm-engine".to_string())
            .spawn(move || worker_thread_main(source, command_rx, event_tx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        tracing::info!("Engine worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            event_rx,
            worker_handle: Some(handle),
            next_generation: 1,
        })
    }

    /// Send a raw protocol command
    pub fn send(&self, command: Command) -> Result<(), EngineError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("engine shut down".to_string()))?
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Probe the execution backend
    pub fn check(&self) -> Result<(), EngineError> {
        self.send(Command::Check)
    }

    /// Acquire tokenizer and model
    pub fn load(&self) -> Result<(), EngineError> {
        self.send(Command::Load)
    }

    /// Queue a generation over `turns` and return its id.
    ///
    /// Callers must wait for the previous generation's terminal event first;
    /// the worker rejects a `generate` that arrives mid-generation.
    pub fn generate(&mut self, turns: Vec<ChatTurn>) -> Result<GenerationId, EngineError> {
        let id = self.next_generation;
        self.send(Command::Generate { id, turns })?;
        self.next_generation += 1;
        Ok(id)
    }

    /// Ask a running generation to stop. Fire-and-forget: the caller learns
    /// of termination only through the later `complete` event.
    pub fn interrupt(&self, id: Option<GenerationId>) -> Result<(), EngineError> {
        self.send(Command::Interrupt { id })
    }

    /// Drop the decode cache
    pub fn reset(&self) -> Result<(), EngineError> {
        self.send(Command::Reset)
    }

    /// Next event if one is already waiting
    pub fn try_event(&self) -> Result<Option<Event>, EngineError> {
        match self.event_rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(EngineError::WorkerError("worker thread exited".to_string()))
            }
        }
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_event(&self, timeout: Duration) -> Result<Option<Event>, EngineError> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::WorkerError("worker thread exited".to_string()))
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Interrupt { id: None });
            let _ = tx.send(Command::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Incremental decode state plus the tokens resident in it
struct DecodeCache<C> {
    state: C,
    tokens: Vec<TokenId>,
}

impl<C> DecodeCache<C> {
    fn new(state: C) -> Self {
        Self {
            state,
            tokens: Vec::new(),
        }
    }
}

/// Everything the worker owns. Only [`dispatch`] holds it mutably.
struct Session<S: ModelSource> {
    tokenizer: Option<S::Tokenizer>,
    model: Option<S::Model>,
    cache: Option<DecodeCache<<S::Model as LanguageModel>::Cache>>,
    stopping: StoppingToken,
    state: EngineState,
}

impl<S: ModelSource> Session<S> {
    fn new() -> Self {
        Self {
            tokenizer: None,
            model: None,
            cache: None,
            stopping: StoppingToken::new(),
            state: EngineState::Uninitialized,
        }
    }
}

/// The worker's two channel ends plus commands deferred during generation
struct Link {
    commands: Receiver<Command>,
    backlog: VecDeque<Command>,
    events: Sender<Event>,
}

impl Link {
    fn next_command(&mut self) -> Option<Command> {
        self.backlog
            .pop_front()
            .or_else(|| self.commands.recv().ok())
    }

    /// Returns false once the controller side has gone away.
    fn emit(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    /// Drain commands that arrived while a generation is running.
    ///
    /// Interrupts apply immediately, a second `generate` is rejected, and
    /// everything else waits in order until the generation ends.
    fn poll_during_generation(&mut self, stopping: &StoppingToken) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Interrupt { id: Some(id) }) => {
                    if !stopping.interrupt_generation(id) {
                        tracing::debug!("Ignoring stale interrupt for generation {}", id);
                    }
                }
                Ok(Command::Interrupt { id: None }) => stopping.interrupt(),
                Ok(Command::Generate { id, .. }) => {
                    tracing::warn!("Generation {} rejected: another generation is running", id);
                    self.emit(Event::Rejected {
                        id: Some(id),
                        message: "another generation is already in progress".to_string(),
                    });
                }
                Ok(command) => self.backlog.push_back(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stopping.interrupt();
                    break;
                }
            }
        }
    }
}

/// Forwards load progress as protocol events
struct EventReporter<'a> {
    link: &'a Link,
}

impl LoadReporter for EventReporter<'_> {
    fn status(&mut self, message: &str) {
        self.link.emit(Event::Loading {
            message: message.to_string(),
        });
    }

    fn initiate(&mut self, file: &str) {
        self.link.emit(Event::Initiate {
            file: file.to_string(),
        });
    }

    fn progress(&mut self, file: &str, loaded: u64, total: u64) {
        self.link.emit(Event::Progress {
            file: file.to_string(),
            loaded,
            total,
        });
    }

    fn done(&mut self, file: &str) {
        self.link.emit(Event::Done {
            file: file.to_string(),
        });
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Worker thread main loop
fn worker_thread_main<S: ModelSource>(
    mut source: S,
    commands: Receiver<Command>,
    events: Sender<Event>,
) {
    let mut session = Session::<S>::new();
    let mut link = Link {
        commands,
        backlog: VecDeque::new(),
        events,
    };

    while let Some(command) = link.next_command() {
        if dispatch(&mut session, &mut source, command, &mut link) == Flow::Shutdown {
            tracing::info!("Worker thread shutting down");
            return;
        }
    }
    tracing::debug!("Command channel closed, worker exiting");
}

/// Apply one command to the session.
fn dispatch<S: ModelSource>(
    session: &mut Session<S>,
    source: &mut S,
    command: Command,
    link: &mut Link,
) -> Flow {
    match command {
        Command::Check => match source.probe() {
            Ok(()) => {
                link.emit(Event::Ready);
            }
            Err(e) => {
                tracing::warn!("Capability check failed: {}", e);
                link.emit(Event::error(e.to_string()));
            }
        },
        Command::Load => load(session, source, link),
        Command::Generate { id, turns } => {
            let params = source.params();
            generate(session, id, &turns, &params, link);
        }
        Command::Interrupt { id } => {
            tracing::debug!("Interrupt {:?} received while {:?}, ignoring", id, session.state);
        }
        Command::Reset => {
            session.cache = None;
            session.stopping.clear();
            tracing::debug!("Session cache cleared");
        }
        Command::Shutdown => return Flow::Shutdown,
    }
    Flow::Continue
}

fn load<S: ModelSource>(session: &mut Session<S>, source: &mut S, link: &Link) {
    if session.state == EngineState::Ready {
        tracing::debug!("Model already loaded, re-announcing ready");
        link.emit(Event::Ready);
        return;
    }

    session.state = EngineState::Loading;
    link.emit(Event::Loading {
        message: "Model is being loaded...".to_string(),
    });

    let mut reporter = EventReporter { link };
    match source.load(&mut reporter) {
        Ok((tokenizer, model)) => {
            session.tokenizer = Some(tokenizer);
            session.model = Some(model);
            session.cache = None;
            session.state = EngineState::Ready;
            tracing::info!("Model loaded");
            link.emit(Event::Ready);
        }
        Err(e) => {
            session.state = EngineState::Uninitialized;
            tracing::error!("Model load failed: {}", e);
            link.emit(Event::error(e.to_string()));
        }
    }
}

fn generate<S: ModelSource>(
    session: &mut Session<S>,
    id: GenerationId,
    turns: &[ChatTurn],
    params: &GenerationParams,
    link: &mut Link,
) {
    let (Some(tokenizer), Some(model)) = (session.tokenizer.as_ref(), session.model.as_mut())
    else {
        link.emit(Event::Error {
            id: Some(id),
            message: EngineError::NoModelLoaded.to_string(),
            partial: None,
        });
        return;
    };

    session.state = EngineState::Generating;
    session.stopping.reset(id);
    link.emit(Event::Start { id });

    let mut run = Run {
        id,
        streamer: TextStreamer::new(),
        rate: TokenRate::new(),
    };
    let outcome = run.decode(
        model,
        tokenizer,
        &mut session.cache,
        turns,
        params,
        &session.stopping,
        link,
    );
    session.state = EngineState::Ready;

    match outcome {
        Ok(reason) => {
            if let Some(tail) = run.streamer.finish() {
                run.emit_update(link, tail);
            }
            tracing::info!(
                "Generation {} finished: {:?} after {} tokens ({:.1} tok/s)",
                id,
                reason,
                run.rate.count(),
                run.rate.tokens_per_second().unwrap_or(0.0)
            );
            link.emit(Event::Complete { id, reason });
        }
        Err(e) => {
            // cache contents are unknown after a failed step
            session.cache = None;
            tracing::warn!("Generation {} failed: {}", id, e);
            link.emit(Event::Error {
                id: Some(id),
                message: e.to_string(),
                partial: Some(run.streamer.output().to_string()),
            });
        }
    }
}

/// Per-generation streaming state
struct Run {
    id: GenerationId,
    streamer: TextStreamer,
    rate: TokenRate,
}

impl Run {
    fn emit_update(&self, link: &Link, output: String) -> bool {
        link.emit(Event::Update {
            id: self.id,
            output,
            tps: self.rate.tokens_per_second(),
            num_tokens: self.rate.count(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn decode<M: LanguageModel, T: ChatTokenizer>(
        &mut self,
        model: &mut M,
        tokenizer: &T,
        slot: &mut Option<DecodeCache<M::Cache>>,
        turns: &[ChatTurn],
        params: &GenerationParams,
        stopping: &StoppingToken,
        link: &mut Link,
    ) -> Result<FinishReason, EngineError> {
        let cache = match slot.take() {
            Some(cache) => cache,
            None => DecodeCache::new(model.new_cache(params)?),
        };
        let cache = slot.insert(cache);
        let capacity = model.capacity(&cache.state);

        let prompt = fit_prompt(tokenizer, turns, capacity, params.max_new_tokens)?;
        prefill(model, cache, &prompt)?;
        model.begin(params)?;

        for _ in 0..params.max_new_tokens {
            let token = model.sample(&mut cache.state)?;
            if model.is_end_of_generation(token) {
                return Ok(FinishReason::Stop);
            }

            self.rate.tick();
            let bytes = tokenizer.token_bytes(token)?;
            if let Some(fragment) = self.streamer.push(&bytes) {
                if !self.emit_update(link, fragment) {
                    tracing::debug!("Event receiver dropped, stopping generation");
                    return Ok(FinishReason::Interrupted);
                }
            }

            link.poll_during_generation(stopping);
            if stopping.is_set() {
                tracing::debug!("Generation {} stopped by interrupt", self.id);
                return Ok(FinishReason::Interrupted);
            }

            if cache.tokens.len() >= capacity {
                tracing::debug!("Generation {} filled the {}-token context", self.id, capacity);
                return Ok(FinishReason::Length);
            }
            model.feed(&mut cache.state, &[token])?;
            cache.tokens.push(token);
        }
        Ok(FinishReason::Length)
    }
}

/// Tokenize `turns`, dropping the oldest conversation turns until the prompt
/// leaves room to generate.
///
/// System turns at the head and the final turn are never dropped. With
/// nothing left to drop, a prompt that still fits the window is used as is;
/// generation then ends with [`FinishReason::Length`] when the window fills.
fn fit_prompt<T: ChatTokenizer>(
    tokenizer: &T,
    turns: &[ChatTurn],
    capacity: usize,
    max_new_tokens: usize,
) -> Result<Vec<TokenId>, EngineError> {
    let reserve = max_new_tokens.min(capacity / 4);
    let limit = capacity.saturating_sub(reserve);
    let pinned = turns.iter().take_while(|t| t.role == Role::System).count();
    let last = turns.len().saturating_sub(1).max(pinned);

    let mut start = pinned;
    loop {
        let window: Vec<ChatTurn> = turns[..pinned]
            .iter()
            .chain(&turns[start..])
            .cloned()
            .collect();
        let prompt = tokenizer.encode_chat(&window)?;
        if prompt.len() <= limit || start >= last {
            if prompt.len() >= capacity {
                return Err(EngineError::ContextOverflow {
                    prompt: prompt.len(),
                    capacity,
                });
            }
            if start > pinned {
                tracing::info!(
                    "Dropped {} oldest turns to fit the {}-token context",
                    start - pinned,
                    capacity
                );
            }
            return Ok(prompt);
        }

        // never open the window on an assistant reply
        start += 1;
        while start < last && turns[start].role == Role::Assistant {
            start += 1;
        }
    }
}

/// Bring the cache in line with `prompt`, re-encoding only what differs.
///
/// The cache ends with the full prompt afterwards.
fn prefill<M: LanguageModel>(
    model: &mut M,
    cache: &mut DecodeCache<M::Cache>,
    prompt: &[TokenId],
) -> Result<(), EngineError> {
    if prompt.is_empty() {
        return Err(EngineError::Tokenization("prompt is empty".to_string()));
    }

    // at least the final prompt token is re-fed so its logits are fresh
    let keep = common_prefix_len(&cache.tokens, prompt).min(prompt.len() - 1);
    if keep < cache.tokens.len() {
        model.truncate(&mut cache.state, keep)?;
        cache.tokens.truncate(keep);
    }

    let fresh = &prompt[keep..];
    model.feed(&mut cache.state, fresh)?;
    cache.tokens.extend_from_slice(fresh);

    tracing::debug!(
        "Prefill reused {} cached tokens, encoded {} new",
        keep,
        fresh.len()
    );
    Ok(())
}

fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
