//! llama.cpp backend
//!
//! Wraps `llama-cpp-2`. Model, context, sampler and adapters live inside
//! [`Backend::open`] on the context worker and are dropped there, context
//! before model.

use std::num::NonZeroU32;
use std::sync::Arc;

use llama_cpp_2::context::params::{
    KvCacheType as LlamaKvCacheType, LlamaContextParams, LlamaPoolingType,
};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{
    AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaLoraAdapter, LlamaModel, Special,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::logit_bias::LlamaLogitBias;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::OnceCell;

use crate::error::EngineError;
use crate::inference::backend::{
    top_probabilities, AdapterFailure, Backend, ModelDescriptor, NativeContext, NativeError,
    SamplerConfig,
};
use crate::inference::params::{
    resolve_last_n, AdapterSpec, ContextParams, KvCacheType, Mirostat, PoolingType, Token,
};
use crate::types::ChatMessage;

/// `llama_backend_init` may run once per process
static SHARED: OnceCell<Arc<LlamaCppBackend>> = OnceCell::new();

/// Fraction of the load reported once the weights are in memory
const MODEL_LOADED: f32 = 0.8;

pub struct LlamaCppBackend {
    backend: LlamaBackend,
}

impl LlamaCppBackend {
    /// The process-wide backend, initialized on first use.
    ///
    /// Native llama.cpp and ggml logs are routed into `tracing`.
    pub fn shared() -> Result<Arc<Self>, EngineError> {
        SHARED
            .get_or_try_init(|| {
                send_logs_to_tracing(LogOptions::default());
                let backend = LlamaBackend::init().map_err(|e| {
                    EngineError::ModelLoadFailed(format!("Failed to init backend: {e}"))
                })?;
                tracing::info!("llama.cpp backend initialized");
                Ok(Arc::new(Self { backend }))
            })
            .cloned()
    }
}

fn kv_cache_type(t: KvCacheType) -> LlamaKvCacheType {
    match t {
        KvCacheType::F32 => LlamaKvCacheType::F32,
        KvCacheType::F16 => LlamaKvCacheType::F16,
        KvCacheType::Bf16 => LlamaKvCacheType::BF16,
        KvCacheType::Q8_0 => LlamaKvCacheType::Q8_0,
        KvCacheType::Q4_0 => LlamaKvCacheType::Q4_0,
        KvCacheType::Q4_1 => LlamaKvCacheType::Q4_1,
        KvCacheType::Iq4Nl => LlamaKvCacheType::IQ4_NL,
        KvCacheType::Q5_0 => LlamaKvCacheType::Q5_0,
        KvCacheType::Q5_1 => LlamaKvCacheType::Q5_1,
    }
}

fn pooling_type(p: PoolingType) -> LlamaPoolingType {
    match p {
        PoolingType::Unspecified => LlamaPoolingType::Unspecified,
        PoolingType::None => LlamaPoolingType::None,
        PoolingType::Mean => LlamaPoolingType::Mean,
        PoolingType::Cls => LlamaPoolingType::Cls,
        PoolingType::Last => LlamaPoolingType::Last,
        PoolingType::Rank => LlamaPoolingType::Rank,
    }
}

fn context_params(params: &ContextParams) -> LlamaContextParams {
    let n_threads = params.n_threads as i32;
    let mut ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(params.n_ctx))
        .with_n_batch(params.n_batch)
        .with_n_ubatch(params.n_ubatch)
        .with_n_threads(n_threads)
        .with_n_threads_batch(n_threads)
        .with_embeddings(params.embedding)
        .with_pooling_type(pooling_type(params.pooling))
        .with_type_k(kv_cache_type(params.cache_type_k))
        .with_type_v(kv_cache_type(params.cache_type_v))
        // llama_flash_attn_type: 0 = disabled, 1 = enabled
        .with_flash_attention_policy(if params.flash_attn { 1 } else { 0 });

    if params.rope_freq_base > 0.0 {
        ctx_params = ctx_params.with_rope_freq_base(params.rope_freq_base);
    }
    if params.rope_freq_scale > 0.0 {
        ctx_params = ctx_params.with_rope_freq_scale(params.rope_freq_scale);
    }
    ctx_params
}

/// Parameters `llama-cpp-2` has no way to forward
fn unsupported(params: &ContextParams) -> Option<&'static str> {
    if !params.use_mmap {
        return Some("use_mmap=false is not supported by the llama.cpp backend");
    }
    None
}

fn describe(model: &LlamaModel, n_ctx: u32) -> ModelDescriptor {
    ModelDescriptor {
        architecture: model
            .meta_val_str("general.architecture")
            .unwrap_or_else(|_| "unknown".to_string()),
        n_ctx_train: model.n_ctx_train(),
        n_ctx,
        n_vocab: model.n_vocab(),
        n_embd: model.n_embd(),
        n_params: model.n_params(),
        size_bytes: model.size(),
        has_chat_template: model.chat_template(None).is_ok(),
    }
}

impl Backend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn check_params(&self, params: &ContextParams) -> Result<(), EngineError> {
        match unsupported(params) {
            Some(reason) => Err(EngineError::InvalidParams(reason.to_string())),
            None => Ok(()),
        }
    }

    fn open(
        &self,
        params: &ContextParams,
        progress: &mut dyn FnMut(f32),
        serve: &mut dyn FnMut(&mut dyn NativeContext),
    ) -> Result<(), NativeError> {
        progress(0.0);

        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(params.n_gpu_layers)
            .with_use_mlock(params.use_mlock)
            .with_vocab_only(params.vocab_only);

        let model = LlamaModel::load_from_file(&self.backend, &params.model_path, &model_params)
            .map_err(|e| NativeError(format!("Failed to load model: {e}")))?;
        progress(MODEL_LOADED);

        let ctx = if params.vocab_only {
            None
        } else {
            let ctx = model
                .new_context(&self.backend, context_params(params))
                .map_err(|e| NativeError(format!("Failed to create context: {e}")))?;
            Some(ctx)
        };
        let n_ctx = ctx.as_ref().map(|c| c.n_ctx()).unwrap_or(params.n_ctx);
        progress(1.0);

        let mut native = LlamaNativeContext {
            descriptor: describe(&model, n_ctx),
            model: &model,
            ctx,
            n_batch: params.n_batch.max(1) as usize,
            logits_index: 0,
            sampler: None,
            adapters: Vec::new(),
        };
        serve(&mut native);
        Ok(())
    }
}

struct LlamaNativeContext<'m> {
    descriptor: ModelDescriptor,
    model: &'m LlamaModel,
    /// `None` for vocab-only models
    ctx: Option<LlamaContext<'m>>,
    n_batch: usize,
    /// Batch index of the last token whose logits were requested
    logits_index: i32,
    sampler: Option<LlamaSampler>,
    adapters: Vec<(LlamaLoraAdapter, f32)>,
}

impl<'m> LlamaNativeContext<'m> {
    fn ctx(&self) -> Result<&LlamaContext<'m>, NativeError> {
        self.ctx
            .as_ref()
            .ok_or_else(|| NativeError::new("model was loaded vocab-only"))
    }

    fn ctx_mut(&mut self) -> Result<&mut LlamaContext<'m>, NativeError> {
        self.ctx
            .as_mut()
            .ok_or_else(|| NativeError::new("model was loaded vocab-only"))
    }

    fn build_sampler(&self, config: &SamplerConfig) -> Result<LlamaSampler, NativeError> {
        let p = &config.params;
        let n_vocab = self.model.n_vocab();
        let n_ctx = self.descriptor.n_ctx;
        let mut samplers = Vec::new();

        if !config.logit_bias.is_empty() {
            let biases: Vec<LlamaLogitBias> = config
                .logit_bias
                .iter()
                .map(|(t, bias)| LlamaLogitBias::new(LlamaToken(*t), *bias))
                .collect();
            samplers.push(LlamaSampler::logit_bias(n_vocab, &biases));
        }

        let has_penalties =
            p.penalty_repeat != 1.0 || p.penalty_freq != 0.0 || p.penalty_present != 0.0;
        if has_penalties {
            samplers.push(LlamaSampler::penalties(
                resolve_last_n(p.penalty_last_n, n_ctx),
                p.penalty_repeat,
                p.penalty_freq,
                p.penalty_present,
            ));
        }

        if p.dry_multiplier > 0.0 {
            samplers.push(LlamaSampler::dry(
                self.model,
                p.dry_multiplier,
                p.dry_base,
                p.dry_allowed_length,
                resolve_last_n(p.dry_penalty_last_n, n_ctx),
                &p.dry_sequence_breakers,
            ));
        }

        if let Some(grammar) = &config.grammar {
            let sampler = LlamaSampler::grammar(self.model, grammar, "root")
                .map_err(|e| NativeError(format!("Failed to compile grammar: {e:?}")))?;
            samplers.push(sampler);
        }

        match p.mirostat {
            Mirostat::V1 => {
                samplers.push(LlamaSampler::temp(p.temperature));
                samplers.push(LlamaSampler::mirostat(
                    n_vocab,
                    config.seed,
                    p.mirostat_tau,
                    p.mirostat_eta,
                    100,
                ));
            }
            Mirostat::V2 => {
                samplers.push(LlamaSampler::temp(p.temperature));
                samplers.push(LlamaSampler::mirostat_v2(
                    config.seed,
                    p.mirostat_tau,
                    p.mirostat_eta,
                ));
            }
            Mirostat::Off if p.temperature <= 0.0 => samplers.push(LlamaSampler::greedy()),
            Mirostat::Off => {
                if p.top_n_sigma > 0.0 {
                    samplers.push(LlamaSampler::top_n_sigma(p.top_n_sigma));
                }
                samplers.push(LlamaSampler::top_k(p.top_k));
                samplers.push(LlamaSampler::typical(p.typical_p, 1));
                samplers.push(LlamaSampler::top_p(p.top_p, 1));
                samplers.push(LlamaSampler::min_p(p.min_p, 1));
                if p.xtc_probability > 0.0 {
                    samplers.push(LlamaSampler::xtc(
                        p.xtc_probability,
                        p.xtc_threshold,
                        1,
                        config.seed,
                    ));
                }
                samplers.push(LlamaSampler::temp(p.temperature));
                samplers.push(LlamaSampler::dist(config.seed));
            }
        }

        Ok(LlamaSampler::chain_simple(samplers))
    }

    fn batch(&self, tokens: &[Token], start: usize, all_logits: bool) -> Result<LlamaBatch, NativeError> {
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken(*token), (start + i) as i32, &[0], all_logits || i == last)
                .map_err(|e| NativeError(format!("Failed to add token to batch: {e}")))?;
        }
        Ok(batch)
    }
}

impl NativeContext for LlamaNativeContext<'_> {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, NativeError> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| NativeError(format!("Failed to tokenize: {e}")))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, NativeError> {
        if token < 0 || token >= self.model.n_vocab() {
            return Err(NativeError(format!("token {token} out of vocabulary")));
        }
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| NativeError(format!("Failed to detokenize {token}: {e}")))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn eos_token(&self) -> Token {
        self.model.token_eos().0
    }

    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[ChatMessage],
    ) -> Result<String, NativeError> {
        let template = match template {
            Some(t) => LlamaChatTemplate::new(t)
                .map_err(|e| NativeError(format!("Invalid chat template: {e}")))?,
            None => self
                .model
                .chat_template(None)
                .map_err(|e| NativeError(format!("Failed to load chat template: {e}")))?,
        };
        let messages = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| NativeError(format!("Failed to build chat message: {e}")))?;
        self.model
            .apply_chat_template(&template, &messages, true)
            .map_err(|e| NativeError(format!("Failed to apply chat template: {e}")))
    }

    fn decode(&mut self, tokens: &[Token], start: usize) -> Result<(), NativeError> {
        let n_chunks = tokens.len().div_ceil(self.n_batch);
        for (i, chunk) in tokens.chunks(self.n_batch).enumerate() {
            let offset = start + i * self.n_batch;
            let mut batch = self.batch(chunk, offset, false)?;
            self.ctx_mut()?
                .decode(&mut batch)
                .map_err(|e| NativeError(format!("Failed to decode: {e}")))?;
            if i + 1 == n_chunks {
                self.logits_index = batch.n_tokens() - 1;
            }
        }
        Ok(())
    }

    fn truncate_cache(&mut self, from: usize) -> Result<(), NativeError> {
        self.ctx_mut()?
            .clear_kv_cache_seq(Some(0), Some(from as u32), None)
            .map_err(|e| NativeError(format!("Failed to truncate cache: {e}")))?;
        Ok(())
    }

    fn shift_cache(&mut self, keep: usize, discard: usize, end: usize) -> Result<(), NativeError> {
        let ctx = self.ctx_mut()?;
        let (keep, discard, end) = (keep as u32, discard as u32, end as u32);
        ctx.clear_kv_cache_seq(Some(0), Some(keep), Some(keep + discard))
            .map_err(|e| NativeError(format!("Failed to shift cache: {e}")))?;
        ctx.kv_cache_seq_add(0, Some(keep + discard), Some(end), -(discard as i32))
            .map_err(|e| NativeError(format!("Failed to shift cache: {e}")))?;
        Ok(())
    }

    fn set_sampler(&mut self, config: &SamplerConfig, history: &[Token]) -> Result<(), NativeError> {
        let mut sampler = self.build_sampler(config)?;
        // a grammar sampler must start at its root rule
        if config.grammar.is_none() {
            let n_ctx = self.descriptor.n_ctx;
            let last_n = resolve_last_n(config.params.penalty_last_n, n_ctx)
                .max(resolve_last_n(config.params.dry_penalty_last_n, n_ctx))
                .max(0) as usize;
            let skip = history.len().saturating_sub(last_n);
            for token in &history[skip..] {
                sampler.accept(LlamaToken(*token));
            }
        }
        self.sampler = Some(sampler);
        Ok(())
    }

    fn sample(&mut self) -> Result<Token, NativeError> {
        let idx = self.logits_index;
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| NativeError::new("model was loaded vocab-only"))?;
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| NativeError::new("sampler not initialized"))?;
        Ok(sampler.sample(ctx, idx).0)
    }

    fn top_probs(&self, n: usize) -> Result<Vec<(Token, f32)>, NativeError> {
        let ctx = self.ctx()?;
        Ok(top_probabilities(ctx.get_logits_ith(self.logits_index), n))
    }

    fn embed(&mut self, tokens: &[Token]) -> Result<Vec<f32>, NativeError> {
        if tokens.is_empty() {
            return Err(NativeError::new("nothing to embed"));
        }
        if tokens.len() > self.n_batch {
            return Err(NativeError(format!(
                "input of {} tokens exceeds the batch size {}",
                tokens.len(),
                self.n_batch
            )));
        }

        let mut batch = self.batch(tokens, 0, true)?;
        let ctx = self.ctx_mut()?;
        ctx.clear_kv_cache();
        ctx.decode(&mut batch)
            .map_err(|e| NativeError(format!("Failed to decode: {e}")))?;

        let values = match ctx.embeddings_seq_ith(0) {
            Ok(values) => values.to_vec(),
            Err(_) => ctx
                .embeddings_ith(batch.n_tokens() - 1)
                .map_err(|e| NativeError(format!("Failed to read embeddings: {e}")))?
                .to_vec(),
        };
        ctx.clear_kv_cache();
        Ok(values)
    }

    fn state(&self) -> Result<Vec<u8>, NativeError> {
        let ctx = self.ctx()?;
        let mut state = vec![0u8; ctx.get_state_size()];
        // SAFETY: `state` holds `get_state_size()` bytes, the most llama.cpp writes
        let written = unsafe { ctx.copy_state_data(state.as_mut_ptr()) };
        state.truncate(written);
        Ok(state)
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), NativeError> {
        let ctx = self.ctx_mut()?;
        // SAFETY: llama.cpp validates the blob against the context and reads at
        // most `state.len()` bytes
        let read = unsafe { ctx.set_state_data(state) };
        if read == 0 && !state.is_empty() {
            return Err(NativeError::new("state blob rejected"));
        }
        Ok(())
    }

    fn set_adapters(&mut self, adapters: &[AdapterSpec]) -> Result<(), AdapterFailure> {
        let mut fresh = Vec::with_capacity(adapters.len());
        for (index, spec) in adapters.iter().enumerate() {
            let adapter = self
                .model
                .lora_adapter_init(&spec.path)
                .map_err(|e| AdapterFailure {
                    index,
                    reason: e.to_string(),
                })?;
            fresh.push((adapter, spec.scale));
        }

        let ctx = self.ctx.as_mut().ok_or_else(|| AdapterFailure {
            index: 0,
            reason: "model was loaded vocab-only".to_string(),
        })?;

        for (adapter, _) in self.adapters.iter_mut() {
            if let Err(e) = ctx.lora_adapter_remove(adapter) {
                tracing::warn!("Failed to detach adapter: {}", e);
            }
        }

        for index in 0..fresh.len() {
            let (adapter, scale) = &mut fresh[index];
            if let Err(e) = ctx.lora_adapter_set(adapter, *scale) {
                for (attached, _) in fresh[..index].iter_mut() {
                    let _ = ctx.lora_adapter_remove(attached);
                }
                for (old, old_scale) in self.adapters.iter_mut() {
                    let _ = ctx.lora_adapter_set(old, *old_scale);
                }
                return Err(AdapterFailure {
                    index,
                    reason: e.to_string(),
                });
            }
        }

        self.adapters = fresh;
        Ok(())
    }
}
