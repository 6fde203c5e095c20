//! Context, completion and adapter parameters
//!
//! Plain data captured at load or request time. `validate()` runs synchronously
//! before anything is dispatched to a worker.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::ChatMessage;

/// Vocabulary token id
pub type Token = i32;

/// KV cache element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KvCacheType {
    #[serde(rename = "f32")]
    F32,
    #[default]
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    Bf16,
    #[serde(rename = "q8_0")]
    Q8_0,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q4_1")]
    Q4_1,
    #[serde(rename = "iq4_nl")]
    Iq4Nl,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q5_1")]
    Q5_1,
}

impl KvCacheType {
    pub const ALL: [KvCacheType; 9] = [
        KvCacheType::F32,
        KvCacheType::F16,
        KvCacheType::Bf16,
        KvCacheType::Q8_0,
        KvCacheType::Q4_0,
        KvCacheType::Q4_1,
        KvCacheType::Iq4Nl,
        KvCacheType::Q5_0,
        KvCacheType::Q5_1,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KvCacheType::F32 => "f32",
            KvCacheType::F16 => "f16",
            KvCacheType::Bf16 => "bf16",
            KvCacheType::Q8_0 => "q8_0",
            KvCacheType::Q4_0 => "q4_0",
            KvCacheType::Q4_1 => "q4_1",
            KvCacheType::Iq4Nl => "iq4_nl",
            KvCacheType::Q5_0 => "q5_0",
            KvCacheType::Q5_1 => "q5_1",
        }
    }
}

impl fmt::Display for KvCacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KvCacheType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        KvCacheType::ALL
            .into_iter()
            .find(|t| t.name() == lower)
            .ok_or_else(|| EngineError::InvalidParams(format!("unsupported cache type: {s}")))
    }
}

/// Pooling applied to token embeddings in embedding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    /// Use the model's default
    #[default]
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
    Rank,
}

/// Immutable configuration of a context, captured at load time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Context window size in tokens
    pub n_ctx: u32,
    /// Logical batch size for prompt processing
    pub n_batch: u32,
    /// Physical batch size
    pub n_ubatch: u32,
    /// Threads used for generation and batch processing
    pub n_threads: u32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub n_gpu_layers: u32,
    pub flash_attn: bool,
    pub cache_type_k: KvCacheType,
    pub cache_type_v: KvCacheType,
    pub use_mlock: bool,
    pub use_mmap: bool,
    /// Load only the vocabulary (tokenize/detokenize only)
    pub vocab_only: bool,
    /// RoPE base frequency, 0 = from model
    pub rope_freq_base: f32,
    /// RoPE frequency scale, 0 = from model
    pub rope_freq_scale: f32,
    pub pooling: PoolingType,
    /// Enable embedding extraction
    pub embedding: bool,
    /// Default embedding normalization (-1 none, 0 max-abs, 1 taxicab, 2 euclidean, >2 p-norm)
    pub embd_normalize: i32,
    /// Chat template overriding the one embedded in the model
    pub chat_template: Option<String>,
    /// Prompt tokens kept when truncating or shifting (-1 = whole prompt)
    pub n_keep: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            n_ctx: 2048,
            n_batch: 512,
            n_ubatch: 512,
            n_threads: default_threads(),
            n_gpu_layers: 0,
            flash_attn: false,
            cache_type_k: KvCacheType::F16,
            cache_type_v: KvCacheType::F16,
            use_mlock: false,
            use_mmap: true,
            vocab_only: false,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            pooling: PoolingType::Unspecified,
            embedding: false,
            embd_normalize: 2,
            chat_template: None,
            n_keep: 0,
        }
    }
}

/// Thread count used when none is configured: half of a small core count,
/// otherwise at most four.
pub fn default_threads() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    if cores == 4 {
        2
    } else {
        cores.clamp(1, 4)
    }
}

impl ContextParams {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_threads(mut self, n_threads: u32) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_n_gpu_layers(mut self, n_gpu_layers: u32) -> Self {
        self.n_gpu_layers = n_gpu_layers;
        self
    }

    pub fn with_embedding(mut self, embedding: bool) -> Self {
        self.embedding = embedding;
        self
    }

    /// Checks every value that would otherwise only fail inside the native loader
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidParams(msg.to_string()));

        if self.model_path.as_os_str().is_empty() {
            return invalid("model path is empty");
        }
        if self.n_ctx == 0 {
            return invalid("context size must be positive");
        }
        if self.n_threads == 0 {
            return invalid("thread count must be positive");
        }
        if self.n_batch == 0 || self.n_ubatch == 0 {
            return invalid("batch sizes must be positive");
        }
        if self.n_ubatch > self.n_batch {
            return invalid("physical batch size exceeds logical batch size");
        }
        if self.vocab_only && self.embedding {
            return invalid("embedding mode requires model weights, not vocab_only");
        }
        if !self.rope_freq_base.is_finite() || self.rope_freq_base < 0.0 {
            return invalid("rope_freq_base must be a non-negative finite number");
        }
        if !self.rope_freq_scale.is_finite() || self.rope_freq_scale < 0.0 {
            return invalid("rope_freq_scale must be a non-negative finite number");
        }
        if self.embd_normalize < -1 {
            return invalid("embedding normalization must be >= -1");
        }
        if self.n_keep < -1 {
            return invalid("n_keep must be >= -1");
        }
        Ok(())
    }
}

/// Mirostat sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mirostat {
    #[default]
    Off,
    V1,
    V2,
}

/// Structural constraint on generated text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// GBNF grammar with a `root` rule
    Grammar(String),
    /// JSON schema, converted to GBNF before generation
    JsonSchema(serde_json::Value),
}

/// Sampling knobs forwarded to the native sampler chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    /// Tokens considered by the penalties (-1 = whole context)
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub mirostat: Mirostat,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// Keeps tokens within `n` standard deviations of the top logit (<= 0 = off)
    pub top_n_sigma: f32,
    /// Chance per step that XTC removes the most likely tokens (0 = off)
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    /// DRY repetition penalty strength (0 = off)
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    /// Tokens scanned by DRY (-1 = whole context)
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,
    /// Top candidates and their probabilities attached to each token event
    pub n_probs: usize,
    /// Seed for the sampler, `None` draws a random one
    pub seed: Option<u32>,
    pub logit_bias: Vec<(Token, f32)>,
    pub constraint: Option<Constraint>,
}

/// Upper bound for `SamplingParams::n_probs`
pub const MAX_N_PROBS: usize = 100;

/// Resolves a look-back window where -1 means the whole context
pub fn resolve_last_n(last_n: i32, n_ctx: u32) -> i32 {
    if last_n < 0 {
        i32::try_from(n_ctx).unwrap_or(i32::MAX)
    } else {
        last_n
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: Mirostat::Off,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            top_n_sigma: -1.0,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: ["\n", ":", "\"", "*"].map(String::from).to_vec(),
            n_probs: 0,
            seed: None,
            logit_bias: Vec::new(),
            constraint: None,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidParams(msg.to_string()));

        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid("temperature must be a non-negative finite number");
        }
        for (name, p) in [
            ("top_p", self.top_p),
            ("min_p", self.min_p),
            ("typical_p", self.typical_p),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(EngineError::InvalidParams(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }
        if self.penalty_last_n < -1 {
            return invalid("penalty_last_n must be >= -1");
        }
        if [
            self.penalty_repeat,
            self.penalty_freq,
            self.penalty_present,
            self.mirostat_tau,
            self.mirostat_eta,
            self.top_n_sigma,
        ]
        .iter()
        .any(|v| !v.is_finite())
        {
            return invalid("penalties, mirostat and top_n_sigma values must be finite");
        }
        if !(0.0..=1.0).contains(&self.xtc_probability) || !(0.0..=1.0).contains(&self.xtc_threshold) {
            return invalid("xtc_probability and xtc_threshold must be within [0, 1]");
        }
        if !(self.dry_multiplier.is_finite() && self.dry_multiplier >= 0.0) {
            return invalid("dry_multiplier must be a non-negative finite number");
        }
        if !(self.dry_base.is_finite() && self.dry_base >= 1.0) {
            return invalid("dry_base must be >= 1");
        }
        if self.dry_allowed_length < 0 {
            return invalid("dry_allowed_length must be >= 0");
        }
        if self.dry_penalty_last_n < -1 {
            return invalid("dry_penalty_last_n must be >= -1");
        }
        if self.dry_sequence_breakers.iter().any(|b| b.is_empty() || b.contains('\0')) {
            return invalid("dry sequence breakers must be non-empty and free of NUL bytes");
        }
        if self.n_probs > MAX_N_PROBS {
            return Err(EngineError::InvalidParams(format!(
                "n_probs must be at most {MAX_N_PROBS}"
            )));
        }
        if self.logit_bias.iter().any(|(_, bias)| bias.is_nan()) {
            return invalid("logit bias must not be NaN");
        }
        Ok(())
    }
}

/// Prompt of a completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Chat(Vec<ChatMessage>),
}

impl Default for Prompt {
    fn default() -> Self {
        Prompt::Text(String::new())
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Vec<ChatMessage>> for Prompt {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Prompt::Chat(messages)
    }
}

/// Parameters of a single completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionParams {
    pub prompt: Prompt,
    pub system_prompt: Option<String>,
    /// Template overriding the context's chat template for this request
    pub chat_template: Option<String>,
    /// Maximum tokens to generate, -1 = until end of generation
    pub n_predict: i32,
    /// Overrides the context's `n_keep`
    pub n_keep: Option<i32>,
    pub sampling: SamplingParams,
    /// Stop sequences; matched text is never emitted
    pub stop: Vec<String>,
    pub ignore_eos: bool,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            prompt: Prompt::default(),
            system_prompt: None,
            chat_template: None,
            n_predict: -1,
            n_keep: None,
            sampling: SamplingParams::default(),
            stop: Vec::new(),
            ignore_eos: false,
        }
    }
}

impl CompletionParams {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.sampling.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.n_predict < -1 {
            return Err(EngineError::InvalidParams(
                "n_predict must be >= -1".to_string(),
            ));
        }
        if matches!(self.n_keep, Some(n) if n < -1) {
            return Err(EngineError::InvalidParams(
                "n_keep must be >= -1".to_string(),
            ));
        }
        if let Prompt::Chat(messages) = &self.prompt {
            if messages.is_empty() {
                return Err(EngineError::InvalidParams(
                    "chat prompt has no messages".to_string(),
                ));
            }
        }
        self.sampling.validate()
    }

    /// Stop sequences with empty entries removed
    pub fn stop_sequences(&self) -> Vec<String> {
        self.stop.iter().filter(|s| !s.is_empty()).cloned().collect()
    }
}

/// Embedding request options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingParams {
    /// Overrides the context's normalization mode
    pub normalize: Option<i32>,
}

/// One LoRA adapter of a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub path: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl AdapterSpec {
    pub fn new(path: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}
