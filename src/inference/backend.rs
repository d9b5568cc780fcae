//! Model collaborator traits
//!
//! The engine drives generation one token at a time through these traits.
//! [`crate::inference::llama`] implements them on top of llama.cpp; tests use
//! a scripted implementation.

use crate::inference::engine::EngineError;
use crate::types::ChatTurn;

/// Token id as seen by the engine
pub type TokenId = u32;

/// Receives per-artifact progress while a model is acquired
pub trait LoadReporter {
    /// Coarse narration ("Loading model...")
    fn status(&mut self, message: &str);
    /// An artifact identified by `file` is about to be acquired
    fn initiate(&mut self, file: &str);
    /// `loaded` of `total` bytes of `file` are available
    fn progress(&mut self, file: &str, loaded: u64, total: u64);
    /// `file` is fully acquired
    fn done(&mut self, file: &str);
}

/// Produces tokenizer and model handles.
///
/// Moved onto the worker thread at spawn; the handles it yields never leave
/// that thread, so they need not be `Send`.
pub trait ModelSource: Send + 'static {
    type Tokenizer: ChatTokenizer;
    type Model: LanguageModel;

    /// Check that the execution backend is usable. Independent of load state.
    fn probe(&mut self) -> Result<(), EngineError>;

    /// Acquire tokenizer and model, reporting progress as artifacts arrive.
    fn load(
        &mut self,
        reporter: &mut dyn LoadReporter,
    ) -> Result<(Self::Tokenizer, Self::Model), EngineError>;

    /// Generation parameters to use for every request
    fn params(&self) -> GenerationParams;
}

/// Chat template application and detokenization
pub trait ChatTokenizer {
    /// Render `turns` with the generation prompt appended and tokenize.
    fn encode_chat(&self, turns: &[ChatTurn]) -> Result<Vec<TokenId>, EngineError>;

    /// Bytes of one generated token. Special tokens render as nothing.
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;
}

/// Single-step decoding over an explicit incremental cache
pub trait LanguageModel {
    /// Incremental decode state (key/value cache)
    type Cache;

    /// Allocate an empty cache.
    fn new_cache(&mut self, params: &GenerationParams) -> Result<Self::Cache, EngineError>;

    /// Number of positions `cache` can hold. Feeding past it fails.
    fn capacity(&self, cache: &Self::Cache) -> usize;

    /// Drop every cached position at or after `len`.
    fn truncate(&mut self, cache: &mut Self::Cache, len: usize) -> Result<(), EngineError>;

    /// Append `tokens` to the cache, computing their logits.
    fn feed(&mut self, cache: &mut Self::Cache, tokens: &[TokenId]) -> Result<(), EngineError>;

    /// Prepare sampling state for a new generation.
    fn begin(&mut self, params: &GenerationParams) -> Result<(), EngineError>;

    /// Sample the next token from the logits of the last fed position.
    fn sample(&mut self, cache: &mut Self::Cache) -> Result<TokenId, EngineError>;

    /// Whether `token` is a model-defined stop token
    fn is_end_of_generation(&self, token: TokenId) -> bool;
}

/// Sampling and budget settings for one generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of new tokens
    pub max_new_tokens: usize,
    /// Temperature (below 0.01 means greedy)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed (0 picks one)
    pub seed: u32,
    /// Context window of the cache
    pub context_size: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
            context_size: 4096,
        }
    }
}
