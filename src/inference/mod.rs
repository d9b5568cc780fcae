//! LLM inference engine
//!
//! The worker protocol, the engine thread that speaks it, and the llama.cpp
//! backend it drives.

pub mod artifacts;
pub mod backend;
pub mod engine;
pub mod llama;
pub mod protocol;
pub mod stopping;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backend::{ChatTokenizer, GenerationParams, LanguageModel, LoadReporter, ModelSource};
pub use engine::{Engine, EngineError};
pub use llama::LlamaSource;
pub use protocol::{Command, EngineState, Event, FinishReason, GenerationId};
pub use stopping::StoppingToken;
pub use streaming::{TextStreamer, TokenRate};
