//! Deterministic model collaborators for tests.
//!
//! Byte-level vocabulary: ids 0..=255 are raw bytes, the rest are control
//! tokens that render as nothing. The model answers every request with a
//! fixed prefix followed by the last user turn it finds in its cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::inference::backend::{
    ChatTokenizer, GenerationParams, LanguageModel, LoadReporter, ModelSource, TokenId,
};
use crate::inference::engine::{Engine, EngineError};
use crate::inference::protocol::Event;
use crate::types::{ChatTurn, Role};

pub const TURN_START: TokenId = 256;
pub const TURN_END: TokenId = 257;
const ROLE_BASE: TokenId = 258;

fn role_token(role: Role) -> TokenId {
    match role {
        Role::System => ROLE_BASE,
        Role::User => ROLE_BASE + 1,
        Role::Assistant => ROLE_BASE + 2,
    }
}

/// Tokenize `turns` the way the scripted tokenizer does.
pub fn encode(turns: &[ChatTurn]) -> Vec<TokenId> {
    let mut tokens = Vec::new();
    for turn in turns {
        tokens.push(TURN_START);
        tokens.push(role_token(turn.role));
        tokens.extend(turn.content.bytes().map(TokenId::from));
        tokens.push(TURN_END);
    }
    tokens.push(TURN_START);
    tokens.push(role_token(Role::Assistant));
    tokens
}

/// What the scripted model observed, shared with the test thread
#[derive(Debug, Default)]
pub struct Stats {
    pub loads: usize,
    pub caches_created: usize,
    /// Tokens encoded by each prefill, in order
    pub prefills: Vec<usize>,
}

/// How the scripted model generates
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub prefix: String,
    /// Emit `a` forever instead of the scripted reply
    pub endless: bool,
    /// Fail the first generation once this many tokens were sampled
    pub fail_after: Option<usize>,
    /// Sleep inside every sampling step
    pub step_delay: Duration,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            prefix: "echo: ".to_string(),
            endless: false,
            fail_after: None,
            step_delay: Duration::ZERO,
        }
    }
}

pub struct ScriptedSource {
    pub probe_ok: bool,
    /// Number of initial `load` calls that fail
    pub load_failures: usize,
    pub artifacts: Vec<(String, u64)>,
    pub chunk: u64,
    pub behaviour: Behaviour,
    pub max_new_tokens: usize,
    /// Positions every cache can hold
    pub context_size: u32,
    stats: Arc<Mutex<Stats>>,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self {
            probe_ok: true,
            load_failures: 0,
            artifacts: vec![("model.gguf".to_string(), 64)],
            chunk: 16,
            behaviour: Behaviour::default(),
            max_new_tokens: 256,
            context_size: 4096,
            stats: Arc::default(),
        }
    }
}

impl ScriptedSource {
    pub fn stats(&self) -> Arc<Mutex<Stats>> {
        Arc::clone(&self.stats)
    }
}

impl ModelSource for ScriptedSource {
    type Tokenizer = ScriptedTokenizer;
    type Model = ScriptedModel;

    fn probe(&mut self) -> Result<(), EngineError> {
        if self.probe_ok {
            Ok(())
        } else {
            Err(EngineError::Capability("no compute backend".to_string()))
        }
    }

    fn load(
        &mut self,
        reporter: &mut dyn LoadReporter,
    ) -> Result<(Self::Tokenizer, Self::Model), EngineError> {
        self.stats.lock().unwrap().loads += 1;
        if self.load_failures > 0 {
            self.load_failures -= 1;
            return Err(EngineError::ModelLoad("artifact unavailable".to_string()));
        }

        for (file, total) in &self.artifacts {
            reporter.initiate(file);
            let mut loaded = 0;
            while loaded < *total {
                loaded = (loaded + self.chunk).min(*total);
                reporter.progress(file, loaded, *total);
            }
            reporter.done(file);
        }

        Ok((
            ScriptedTokenizer,
            ScriptedModel {
                behaviour: self.behaviour.clone(),
                stats: Arc::clone(&self.stats),
                reply: None,
                generated: 0,
                last_feed: 0,
            },
        ))
    }

    fn params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_new_tokens,
            context_size: self.context_size,
            ..Default::default()
        }
    }
}

pub struct ScriptedTokenizer;

impl ChatTokenizer for ScriptedTokenizer {
    fn encode_chat(&self, turns: &[ChatTurn]) -> Result<Vec<TokenId>, EngineError> {
        Ok(encode(turns))
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        Ok(u8::try_from(token).map(|b| vec![b]).unwrap_or_default())
    }
}

/// Scripted KV cache: just the tokens fed so far
#[derive(Debug)]
pub struct ScriptedCache {
    pub tokens: Vec<TokenId>,
    capacity: usize,
}

pub struct ScriptedModel {
    behaviour: Behaviour,
    stats: Arc<Mutex<Stats>>,
    reply: Option<Vec<u8>>,
    generated: usize,
    last_feed: usize,
}

impl ScriptedModel {
    /// Prefix plus the content of the last user turn resident in the cache
    fn reply_for(&self, cache: &ScriptedCache) -> Vec<u8> {
        let user = role_token(Role::User);
        let mut reply = self.behaviour.prefix.clone().into_bytes();
        if let Some(pos) = cache.tokens.windows(2).rposition(|w| w == [TURN_START, user]) {
            reply.extend(
                cache.tokens[pos + 2..]
                    .iter()
                    .take_while(|t| **t != TURN_END)
                    .filter_map(|t| u8::try_from(*t).ok()),
            );
        }
        reply
    }
}

impl LanguageModel for ScriptedModel {
    type Cache = ScriptedCache;

    fn new_cache(&mut self, params: &GenerationParams) -> Result<Self::Cache, EngineError> {
        self.stats.lock().unwrap().caches_created += 1;
        Ok(ScriptedCache {
            tokens: Vec::new(),
            capacity: params.context_size as usize,
        })
    }

    fn capacity(&self, cache: &Self::Cache) -> usize {
        cache.capacity
    }

    fn truncate(&mut self, cache: &mut Self::Cache, len: usize) -> Result<(), EngineError> {
        cache.tokens.truncate(len);
        Ok(())
    }

    fn feed(&mut self, cache: &mut Self::Cache, tokens: &[TokenId]) -> Result<(), EngineError> {
        if cache.tokens.len() + tokens.len() > cache.capacity {
            return Err(EngineError::Inference(format!(
                "Context window of {} tokens exhausted",
                cache.capacity
            )));
        }
        cache.tokens.extend_from_slice(tokens);
        self.last_feed = tokens.len();
        Ok(())
    }

    fn begin(&mut self, _params: &GenerationParams) -> Result<(), EngineError> {
        // the engine prefills immediately before beginning
        self.stats.lock().unwrap().prefills.push(self.last_feed);
        self.reply = None;
        self.generated = 0;
        Ok(())
    }

    fn sample(&mut self, cache: &mut Self::Cache) -> Result<TokenId, EngineError> {
        if !self.behaviour.step_delay.is_zero() {
            std::thread::sleep(self.behaviour.step_delay);
        }
        if self.behaviour.fail_after == Some(self.generated) {
            self.behaviour.fail_after = None;
            return Err(EngineError::Inference("scripted failure".to_string()));
        }

        let token = if self.behaviour.endless {
            TokenId::from(b'a')
        } else {
            if self.reply.is_none() {
                self.reply = Some(self.reply_for(cache));
            }
            self.reply
                .as_ref()
                .and_then(|r| r.get(self.generated))
                .map_or(TURN_END, |b| TokenId::from(*b))
        };
        self.generated += 1;
        Ok(token)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == TURN_END
    }
}

/// Collects load progress calls as strings
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<String>,
}

impl LoadReporter for RecordingReporter {
    fn status(&mut self, message: &str) {
        self.events.push(format!("status {message}"));
    }

    fn initiate(&mut self, file: &str) {
        self.events.push(format!("initiate {file}"));
    }

    fn progress(&mut self, file: &str, loaded: u64, total: u64) {
        self.events.push(format!("progress {file} {loaded}/{total}"));
    }

    fn done(&mut self, file: &str) {
        self.events.push(format!("done {file}"));
    }
}

/// Read events until a terminal one, panicking if the engine goes quiet.
pub fn collect_until_terminal(engine: &Engine, timeout: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match engine.recv_event(timeout) {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Ok(None) => panic!("timed out waiting for terminal event, got {events:?}"),
            Err(e) => panic!("engine failed: {e}"),
        }
    }
}
