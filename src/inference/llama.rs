//! llama.cpp backend
//!
//! Implements the model collaborator traits with `llama-cpp-2`.
//!
//! The backend can be initialized only once per process, so it lives in a
//! static. A loaded model is leaked to `'static`: contexts borrow the model,
//! and the engine keeps one context alive across generations as its decode
//! cache. The leak is per process: every successful load keeps its weights
//! (and any offloaded VRAM) until exit, even after the [`Engine`] is dropped.
//! The headless host spawns a single engine that loads once.
//!
//! [`Engine`]: crate::inference::Engine

use std::num::NonZeroU32;
use std::path::PathBuf;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::artifacts::{self, Artifact};
use crate::inference::backend::{
    ChatTokenizer, GenerationParams, LanguageModel, LoadReporter, ModelSource, TokenId,
};
use crate::inference::engine::EngineError;
use crate::storage::settings::AppSettings;
use crate::types::message::plain_transcript;
use crate::types::ChatTurn;

/// Tokens decoded per `llama_decode` call
const BATCH_SIZE: usize = 512;
/// Smallest context window ever allocated
const MIN_CONTEXT: u32 = 2048;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND
        .get_or_try_init(LlamaBackend::init)
        .map_err(|e| EngineError::Capability(e.to_string()))
}

/// Loads a GGUF model as configured in [`AppSettings`]
pub struct LlamaSource {
    artifact: Artifact,
    gpu_layers: u32,
    params: GenerationParams,
}

impl LlamaSource {
    pub fn new(settings: &AppSettings) -> Self {
        let mut artifact = Artifact::local(settings.model_path());
        if let Some(url) = &settings.model_url {
            artifact = artifact.with_url(url.clone());
        }
        Self {
            artifact,
            gpu_layers: settings.gpu_layers,
            params: settings.generation_params(),
        }
    }

    /// Path the model is read from
    pub fn model_path(&self) -> &PathBuf {
        &self.artifact.path
    }
}

impl ModelSource for LlamaSource {
    type Tokenizer = LlamaTokenizer;
    type Model = LlamaChat;

    fn probe(&mut self) -> Result<(), EngineError> {
        backend().map(|_| ())
    }

    fn load(
        &mut self,
        reporter: &mut dyn LoadReporter,
    ) -> Result<(Self::Tokenizer, Self::Model), EngineError> {
        let backend = backend()?;

        reporter.status("Fetching model files...");
        let path = artifacts::acquire(&self.artifact, reporter)?;

        reporter.status("Loading model weights...");
        let model_params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(backend, &path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        // freed only at process exit
        let model: &'static LlamaModel = Box::leak(Box::new(model));
        let template = match model.chat_template(None) {
            Ok(template) => Some(template),
            Err(e) => {
                tracing::warn!("Chat template not available, using plain transcript: {e}");
                None
            }
        };

        Ok((
            LlamaTokenizer { model, template },
            LlamaChat {
                model,
                backend,
                sampler: None,
            },
        ))
    }

    fn params(&self) -> GenerationParams {
        self.params.clone()
    }
}

/// Tokenizer embedded in the GGUF file
pub struct LlamaTokenizer {
    model: &'static LlamaModel,
    template: Option<LlamaChatTemplate>,
}

impl LlamaTokenizer {
    fn render(&self, turns: &[ChatTurn]) -> Result<String, EngineError> {
        let Some(template) = &self.template else {
            return Ok(plain_transcript(turns));
        };
        let messages = turns
            .iter()
            .map(|t| LlamaChatMessage::new(t.role.as_str().to_string(), t.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Tokenization(format!("Failed to build chat message: {e}")))?;
        self.model
            .apply_chat_template(template, &messages, true)
            .map_err(|e| EngineError::Tokenization(format!("Failed to apply chat template: {e}")))
    }
}

impl ChatTokenizer for LlamaTokenizer {
    fn encode_chat(&self, turns: &[ChatTurn]) -> Result<Vec<TokenId>, EngineError> {
        let prompt = self.render(turns)?;
        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());
        Ok(tokens.into_iter().map(|t| t.0 as TokenId).collect())
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        // Plaintext renders control tokens as nothing
        self.model
            .token_to_bytes(LlamaToken::new(token as i32), Special::Plaintext)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token to bytes: {e}")))
    }
}

/// Decode state kept between generations
pub struct LlamaCache {
    ctx: LlamaContext<'static>,
    /// Positions filled in the KV cache
    n_past: i32,
    /// Index of the logits row of the last fed token in its batch
    logits_index: i32,
}

/// Model handle driving single-token decode steps
pub struct LlamaChat {
    model: &'static LlamaModel,
    backend: &'static LlamaBackend,
    sampler: Option<LlamaSampler>,
}

impl LanguageModel for LlamaChat {
    type Cache = LlamaCache;

    fn new_cache(&mut self, params: &GenerationParams) -> Result<Self::Cache, EngineError> {
        let n_ctx = params
            .context_size
            .min(self.model.n_ctx_train())
            .max(MIN_CONTEXT);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(BATCH_SIZE as u32);
        let ctx = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;
        tracing::debug!("Created context with {} tokens", n_ctx);

        Ok(LlamaCache {
            ctx,
            n_past: 0,
            logits_index: -1,
        })
    }

    fn capacity(&self, cache: &Self::Cache) -> usize {
        cache.ctx.n_ctx() as usize
    }

    fn truncate(&mut self, cache: &mut Self::Cache, len: usize) -> Result<(), EngineError> {
        cache
            .ctx
            .clear_kv_cache_seq(Some(0), Some(len as u32), None)
            .map_err(|e| EngineError::Inference(format!("Failed to evict cache tail: {e}")))?;
        cache.n_past = len as i32;
        cache.logits_index = -1;
        Ok(())
    }

    fn feed(&mut self, cache: &mut Self::Cache, tokens: &[TokenId]) -> Result<(), EngineError> {
        let capacity = self.capacity(cache);
        if cache.n_past as usize + tokens.len() > capacity {
            return Err(EngineError::Inference(format!(
                "Context window of {capacity} tokens exhausted"
            )));
        }

        let chunks = tokens.chunks(BATCH_SIZE);
        let last_chunk = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.enumerate() {
            let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
            for (j, token) in chunk.iter().enumerate() {
                let wants_logits = i == last_chunk && j == chunk.len() - 1;
                batch
                    .add(LlamaToken::new(*token as i32), cache.n_past, &[0], wants_logits)
                    .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
                cache.n_past += 1;
            }
            cache
                .ctx
                .decode(&mut batch)
                .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;
            cache.logits_index = batch.n_tokens() - 1;
        }
        Ok(())
    }

    fn begin(&mut self, params: &GenerationParams) -> Result<(), EngineError> {
        let seed = if params.seed == 0 {
            rand_seed()
        } else {
            params.seed
        };

        self.sampler = Some(if params.temperature < 0.01 {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(params.top_k as i32),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(seed),
            ])
        });
        Ok(())
    }

    fn sample(&mut self, cache: &mut Self::Cache) -> Result<TokenId, EngineError> {
        if cache.logits_index < 0 {
            return Err(EngineError::Inference("No logits to sample from".to_string()));
        }
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| EngineError::Inference("Sampler not initialized".to_string()))?;

        let token = sampler.sample(&cache.ctx, cache.logits_index);
        sampler.accept(token);
        Ok(token.0 as TokenId)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token as i32))
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_uses_settings() {
        let settings = AppSettings {
            model_file: "tiny.gguf".to_string(),
            models_directory: PathBuf::from("/models"),
            model_url: Some("http://localhost/tiny.gguf".to_string()),
            max_tokens: 12,
            ..Default::default()
        };
        let source = LlamaSource::new(&settings);

        assert_eq!(source.model_path(), &PathBuf::from("/models/tiny.gguf"));
        assert_eq!(source.artifact.file_id, "tiny.gguf");
        assert_eq!(source.artifact.url.as_deref(), Some("http://localhost/tiny.gguf"));
        assert_eq!(source.params().max_new_tokens, 12);
    }

    #[test]
    fn test_load_missing_model_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            model_file: "absent.gguf".to_string(),
            models_directory: dir.path().to_path_buf(),
            model_url: None,
            ..Default::default()
        };
        let mut source = LlamaSource::new(&settings);
        let mut reporter = crate::inference::testing::RecordingReporter::default();

        // either the backend is unusable here or the file is missing
        assert!(source.load(&mut reporter).is_err());
    }
}
