//! Settings storage
//!
//! Manages persistence of model and generation settings.

use crate::inference::backend::GenerationParams;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// File name of the GGUF model inside `models_directory`
    pub model_file: String,
    /// Where to download the model from when it is missing
    pub model_url: Option<String>,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// System prompt prepended to formula requests
    pub system_prompt: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_file: "smollm2-1.7b-instruct-q4_k_m.gguf".to_string(),
            model_url: Some(
                "https://huggingface.co/HuggingFaceTB/SmolLM2-1.7B-Instruct-GGUF/resolve/main/smollm2-1.7b-instruct-q4_k_m.gguf"
                    .to_string(),
            ),
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            gpu_layers: 99, // Offload all layers to GPU by default
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 1024,
            context_size: 4096,
            seed: 0,
            system_prompt: "You are a helpful assistant. Answer concisely; your reply is shown inside a spreadsheet cell.".to_string(),
        }
    }
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        // Clamp temperature between 0.0 and 2.0
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Clamp top_p between 0.0 and 1.0
        self.top_p = self.top_p.clamp(0.0, 1.0);

        // Ensure reasonable values for other parameters
        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 1024;
        }

        if self.context_size == 0 {
            self.context_size = 4096;
        }

        if self.model_url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            self.model_url = None;
        }
    }

    /// Full path of the configured model
    pub fn model_path(&self) -> PathBuf {
        self.models_directory.join(&self.model_file)
    }

    /// Sampling and budget parameters for the engine
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_tokens as usize,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
            context_size: self.context_size,
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the default location
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Load settings from an explicit file, with error propagation
pub fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to an explicit file
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
