//! Engine settings
//!
//! Persisted defaults for contexts and completions, stored as JSON in the
//! platform data directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::params::{default_threads, CompletionParams, ContextParams, Prompt};

/// Settings-related errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\ctxrt\ctxrt\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.ctxrt.ctxrt`
/// - Linux: `/home/{user}/.local/share/ctxrt`
pub fn get_data_dir() -> Result<PathBuf, SettingsError> {
    directories::ProjectDirs::from("com", "ctxrt", "ctxrt")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| SettingsError::DataDirError("Could not determine data directory".to_string()))
}

const DEFAULT_LOG_FILTER: &str = "ctxrt=info";
const DEFAULT_MAX_SESSION_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Model used when a command names none
    pub model_path: Option<PathBuf>,
    /// Context window size
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub n_gpu_layers: u32,
    pub flash_attn: bool,
    pub use_mlock: bool,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    pub top_k: i32,
    pub min_p: f32,
    /// Maximum number of tokens to generate (-1 = until end of generation)
    pub n_predict: i32,
    pub seed: Option<u32>,
    pub system_prompt: Option<String>,
    /// Directory relative session paths resolve against
    pub session_dir: PathBuf,
    /// Upper bound for a saved session file in bytes
    pub max_session_size: u64,
    /// Directive added to `RUST_LOG`
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            n_ctx: 4096,
            n_batch: 512,
            n_threads: default_threads(),
            n_gpu_layers: 0,
            flash_attn: false,
            use_mlock: false,
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            min_p: 0.05,
            n_predict: -1,
            seed: None,
            system_prompt: None,
            session_dir: get_data_dir()
                .ok()
                .map(|d| d.join("sessions"))
                .unwrap_or_else(|| PathBuf::from("./sessions")),
            max_session_size: DEFAULT_MAX_SESSION_SIZE,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl EngineSettings {
    /// Validate settings values
    ///
    /// Clamps sampling values and replaces zero sizes with defaults
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.min_p = self.min_p.clamp(0.0, 1.0);
        self.top_k = self.top_k.max(0);

        if self.n_ctx == 0 {
            self.n_ctx = 4096;
        }
        if self.n_batch == 0 {
            self.n_batch = 512;
        }
        if self.n_threads == 0 {
            self.n_threads = default_threads();
        }
        if self.n_predict < -1 {
            self.n_predict = -1;
        }
        if self.max_session_size == 0 {
            self.max_session_size = DEFAULT_MAX_SESSION_SIZE;
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = DEFAULT_LOG_FILTER.to_string();
        }
    }

    /// Context parameters for `model` built from these settings
    pub fn context_params(&self, model: impl Into<PathBuf>) -> ContextParams {
        let mut params = ContextParams::new(model)
            .with_n_ctx(self.n_ctx)
            .with_n_threads(self.n_threads)
            .with_n_gpu_layers(self.n_gpu_layers);
        params.n_batch = self.n_batch;
        params.n_ubatch = params.n_ubatch.min(self.n_batch);
        params.flash_attn = self.flash_attn;
        params.use_mlock = self.use_mlock;
        params
    }

    /// Resolves a session file name against `session_dir`; absolute paths are kept
    pub fn session_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.session_dir.join(path)
        }
    }

    /// Completion request for `prompt` with these sampling defaults
    pub fn completion_params(&self, prompt: impl Into<Prompt>) -> CompletionParams {
        let mut params = CompletionParams::new(prompt).with_n_predict(self.n_predict);
        params.system_prompt = self.system_prompt.clone();
        params.sampling.temperature = self.temperature;
        params.sampling.top_p = self.top_p;
        params.sampling.top_k = self.top_k;
        params.sampling.min_p = self.min_p;
        params.sampling.seed = self.seed;
        params
    }
}

/// Get the settings file path
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Loads and validates settings from `path`; a missing file yields defaults
pub fn load_settings_from(path: &Path) -> Result<EngineSettings, SettingsError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &EngineSettings) -> Result<(), SettingsError> {
    save_settings_to(settings, &settings_path()?)
}

pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
