//! Scripted in-process backend for tests
//!
//! Tokens are bytes offset by 3 (0 = pad, 1 = BOS, 2 = EOS). The "KV cache" is
//! the list of decoded tokens, so cache bookkeeping mistakes surface as
//! decode errors.

use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::inference::backend::{
    top_probabilities, AdapterFailure, Backend, ModelDescriptor, NativeContext, NativeError,
    SamplerConfig,
};
use crate::inference::gguf::GgufFile;
use crate::inference::params::{AdapterSpec, ContextParams, Token};
use crate::types::ChatMessage;

pub const BOS: Token = 1;
pub const EOS: Token = 2;
const OFFSET: Token = 3;
const STATE_MAGIC: &[u8; 4] = b"FAKE";

#[derive(Debug, Clone)]
pub enum Output {
    /// Emits the bytes in order, then EOS
    Script(Vec<u8>),
    /// Never-ending letters derived from the cache contents and seed
    Hashed,
}

#[derive(Debug, Clone)]
pub struct FakeConfig {
    pub output: Output,
    /// Sleep per decode call
    pub step_delay: Duration,
    pub load_delay: Duration,
    /// Fail decoding once the cache would grow past this many tokens
    pub fail_decode_at: Option<usize>,
    /// Panic in decode once the cache would grow past this many tokens
    pub panic_decode_at: Option<usize>,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            output: Output::Script(b"Hello from the fake model.".to_vec()),
            step_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_decode_at: None,
            panic_decode_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub config: FakeConfig,
}

impl FakeBackend {
    pub fn new(config: FakeConfig) -> Self {
        Self { config }
    }

    pub fn script(text: &str) -> Self {
        Self::new(FakeConfig {
            output: Output::Script(text.as_bytes().to_vec()),
            ..FakeConfig::default()
        })
    }

    pub fn endless(step_delay: Duration) -> Self {
        Self::new(FakeConfig {
            output: Output::Hashed,
            step_delay,
            ..FakeConfig::default()
        })
    }
}

impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open(
        &self,
        params: &ContextParams,
        progress: &mut dyn FnMut(f32),
        serve: &mut dyn FnMut(&mut dyn NativeContext),
    ) -> Result<(), NativeError> {
        progress(0.0);
        let gguf = GgufFile::open(&params.model_path).map_err(NativeError::new)?;
        thread::sleep(self.config.load_delay / 2);
        progress(0.5);
        progress(0.5);
        progress(0.25);

        if gguf.get("fake.fail_load").and_then(|v| v.as_bool()) == Some(true) {
            return Err(NativeError::new("simulated load failure"));
        }
        thread::sleep(self.config.load_delay / 2);
        progress(1.0);

        let size_bytes = std::fs::metadata(&params.model_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let mut ctx = FakeContext {
            descriptor: ModelDescriptor {
                architecture: gguf.architecture().unwrap_or("fake").to_string(),
                n_ctx_train: 4096,
                n_ctx: params.n_ctx,
                n_vocab: 256 + OFFSET,
                n_embd: 4,
                n_params: 1000,
                size_bytes,
                has_chat_template: true,
            },
            config: self.config.clone(),
            cache: Vec::new(),
            sampler: None,
            adapters: Vec::new(),
        };
        serve(&mut ctx);
        Ok(())
    }
}

struct FakeSampler {
    seed: u32,
    ban_eos: bool,
    emitted: usize,
}

pub struct FakeContext {
    descriptor: ModelDescriptor,
    config: FakeConfig,
    cache: Vec<Token>,
    sampler: Option<FakeSampler>,
    adapters: Vec<AdapterSpec>,
}

impl NativeContext for FakeContext {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, NativeError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| b as Token + OFFSET));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, NativeError> {
        match token {
            0..=2 => Ok(Vec::new()),
            t if t < 256 + OFFSET => Ok(vec![(t - OFFSET) as u8]),
            t => Err(NativeError(format!("token {t} out of vocabulary"))),
        }
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOS
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[ChatMessage],
    ) -> Result<String, NativeError> {
        let mut out = String::new();
        for m in messages {
            match template {
                Some(name) => out.push_str(&format!("[{name}] {}: {}\n", m.role.as_str(), m.content)),
                None => out.push_str(&format!("<|{}|>\n{}\n", m.role.as_str(), m.content)),
            }
        }
        out.push_str(match template {
            Some(_) => "assistant:",
            None => "<|assistant|>\n",
        });
        Ok(out)
    }

    fn decode(&mut self, tokens: &[Token], start: usize) -> Result<(), NativeError> {
        if start != self.cache.len() {
            return Err(NativeError(format!(
                "decode at {start} but cache holds {}",
                self.cache.len()
            )));
        }
        let end = start + tokens.len();
        if let Some(limit) = self.config.fail_decode_at {
            if end > limit {
                return Err(NativeError::new("simulated decode failure"));
            }
        }
        if let Some(limit) = self.config.panic_decode_at {
            if end > limit {
                panic!("simulated native crash");
            }
        }
        if end > self.descriptor.n_ctx as usize {
            return Err(NativeError(format!(
                "context overflow: {end} > {}",
                self.descriptor.n_ctx
            )));
        }
        self.cache.extend_from_slice(tokens);
        thread::sleep(self.config.step_delay);
        Ok(())
    }

    fn truncate_cache(&mut self, from: usize) -> Result<(), NativeError> {
        self.cache.truncate(from);
        Ok(())
    }

    fn shift_cache(&mut self, keep: usize, discard: usize, end: usize) -> Result<(), NativeError> {
        if end != self.cache.len() || keep + discard > end {
            return Err(NativeError(format!(
                "bad shift {keep}+{discard} of {end} (cache {})",
                self.cache.len()
            )));
        }
        self.cache.drain(keep..keep + discard);
        Ok(())
    }

    fn set_sampler(&mut self, config: &SamplerConfig, _history: &[Token]) -> Result<(), NativeError> {
        let ban_eos = config
            .logit_bias
            .iter()
            .any(|(t, bias)| *t == EOS && *bias == f32::NEG_INFINITY);
        self.sampler = Some(FakeSampler {
            seed: config.seed,
            ban_eos,
            emitted: 0,
        });
        Ok(())
    }

    fn sample(&mut self) -> Result<Token, NativeError> {
        let token = self.next_token()?;
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.emitted += 1;
        }
        Ok(token)
    }

    /// The next token gets logit 4, its successor 2, everything else 0
    fn top_probs(&self, n: usize) -> Result<Vec<(Token, f32)>, NativeError> {
        let next = self.next_token()?;
        let mut logits = vec![0.0; self.descriptor.n_vocab as usize];
        logits[next as usize] = 4.0;
        if let Some(l) = logits.get_mut(next as usize + 1) {
            *l = 2.0;
        }
        Ok(top_probabilities(&logits, n))
    }

    fn embed(&mut self, tokens: &[Token]) -> Result<Vec<f32>, NativeError> {
        self.cache.clear();
        let first = tokens.first().copied().unwrap_or(0);
        let last = tokens.last().copied().unwrap_or(0);
        let sum: Token = tokens.iter().sum();
        Ok(vec![tokens.len() as f32, sum as f32, first as f32, -(last as f32)])
    }

    fn state(&self) -> Result<Vec<u8>, NativeError> {
        let mut out = STATE_MAGIC.to_vec();
        for t in &self.cache {
            out.extend_from_slice(&t.to_le_bytes());
        }
        Ok(out)
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), NativeError> {
        let body = state
            .strip_prefix(STATE_MAGIC.as_slice())
            .ok_or_else(|| NativeError::new("not a fake state blob"))?;
        if body.len() % 4 != 0 || body.len() / 4 > self.descriptor.n_ctx as usize {
            return Err(NativeError::new("corrupt state blob"));
        }
        self.cache = body
            .chunks_exact(4)
            .map(|c| Token::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(())
    }

    fn set_adapters(&mut self, adapters: &[AdapterSpec]) -> Result<(), AdapterFailure> {
        for (index, adapter) in adapters.iter().enumerate() {
            if file_name(&adapter.path).contains("broken") {
                return Err(AdapterFailure {
                    index,
                    reason: "simulated adapter init failure".into(),
                });
            }
        }
        self.adapters = adapters.to_vec();
        Ok(())
    }
}

impl FakeContext {
    /// Token the next `sample` call returns
    fn next_token(&self) -> Result<Token, NativeError> {
        if self.cache.is_empty() {
            return Err(NativeError::new("no logits: nothing decoded"));
        }
        let sampler = self
            .sampler
            .as_ref()
            .ok_or_else(|| NativeError::new("sampler not initialized"))?;
        let token = match &self.config.output {
            Output::Script(bytes) if sampler.emitted < bytes.len() => {
                bytes[sampler.emitted] as Token + OFFSET
            }
            Output::Script(bytes) if sampler.ban_eos && !bytes.is_empty() => {
                bytes[sampler.emitted % bytes.len()] as Token + OFFSET
            }
            Output::Script(_) => EOS,
            Output::Hashed => {
                let h = self.cache.iter().fold(sampler.seed as u64, |h, t| {
                    h.wrapping_mul(31).wrapping_add(*t as u64)
                });
                (b'a' + (h % 26) as u8) as Token + OFFSET
            }
        };
        Ok(token)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
