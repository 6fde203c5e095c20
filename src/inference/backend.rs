//! Seam between the runtime and the wrapped inference library
//!
//! # Architecture
//!
//! Native model and context handles are not `Send` and the context borrows the
//! model, so a [`Backend`] never hands a handle out. Instead `open` loads the
//! model on the calling thread (the context worker) and runs `serve` with a
//! borrowed [`NativeContext`]. The handle is dropped when `serve` returns,
//! on the same thread that created it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::inference::params::{AdapterSpec, ContextParams, SamplingParams, Token};
use crate::types::ChatMessage;

/// Failure reported by the wrapped library
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(msg: impl ToString) -> Self {
        NativeError(msg.to_string())
    }
}

/// Adapter stack rejected at `index`; the previous stack is still attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub index: usize,
    pub reason: String,
}

/// Model information captured after load
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Value of `general.architecture`
    pub architecture: String,
    /// Context length the model was trained with
    pub n_ctx_train: u32,
    /// Context window actually allocated
    pub n_ctx: u32,
    pub n_vocab: i32,
    pub n_embd: i32,
    pub n_params: u64,
    pub size_bytes: u64,
    pub has_chat_template: bool,
}

/// Sampler configuration resolved by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub params: SamplingParams,
    pub seed: u32,
    /// GBNF grammar with a `root` rule
    pub grammar: Option<String>,
    /// Biases including the end-of-sequence ban for `ignore_eos`
    pub logit_bias: Vec<(Token, f32)>,
}

/// Softmax over `logits`, keeping the `n` most likely token ids
pub fn top_probabilities(logits: &[f32], n: usize) -> Vec<(Token, f32)> {
    if n == 0 || logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Vec::new();
    }
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();

    let mut ranked: Vec<(Token, f32)> = (0..)
        .zip(logits)
        .map(|(id, l)| (id, (l - max).exp() / sum))
        .collect();
    let n = n.min(ranked.len());
    ranked.select_nth_unstable_by(n - 1, |a, b| b.1.total_cmp(&a.1));
    ranked.truncate(n);
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

/// Loader for native contexts
pub trait Backend: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Rejects parameters this backend cannot honor. Runs before the context
    /// id is reserved.
    fn check_params(&self, _params: &ContextParams) -> Result<(), EngineError> {
        Ok(())
    }

    /// Loads the model described by `params` and runs `serve` with the opened
    /// context on the calling thread.
    ///
    /// `progress` receives load fractions in `0.0..=1.0`. Returns an error only
    /// when loading failed before `serve` was called.
    fn open(
        &self,
        params: &ContextParams,
        progress: &mut dyn FnMut(f32),
        serve: &mut dyn FnMut(&mut dyn NativeContext),
    ) -> Result<(), NativeError>;
}

/// A loaded model and its inference context
///
/// Positions passed to the cache operations are token positions in the single
/// sequence this runtime uses.
pub trait NativeContext {
    fn descriptor(&self) -> &ModelDescriptor;

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<Token>, NativeError>;

    /// Raw bytes of a token's piece; may end inside a UTF-8 sequence
    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, NativeError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    fn eos_token(&self) -> Token;

    /// Formats `messages` with `template`, or the model's own template when `None`
    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[ChatMessage],
    ) -> Result<String, NativeError>;

    /// Evaluates `tokens` starting at position `start`; logits of the last
    /// token become available to `sample`.
    fn decode(&mut self, tokens: &[Token], start: usize) -> Result<(), NativeError>;

    /// Drops cached positions `from..`
    fn truncate_cache(&mut self, from: usize) -> Result<(), NativeError>;

    /// Drops positions `keep..keep + discard` and moves `keep + discard..end`
    /// down by `discard`.
    fn shift_cache(&mut self, keep: usize, discard: usize, end: usize) -> Result<(), NativeError>;

    /// Installs a fresh sampler; `history` primes the repetition penalties
    fn set_sampler(&mut self, config: &SamplerConfig, history: &[Token]) -> Result<(), NativeError>;

    /// Samples from the last decoded logits and records the token in the sampler
    fn sample(&mut self) -> Result<Token, NativeError>;

    /// The `n` most likely tokens under the last decoded logits with their
    /// softmax probabilities, most likely first
    fn top_probs(&self, n: usize) -> Result<Vec<(Token, f32)>, NativeError>;

    /// Unnormalized embedding of `tokens`. Clears the cache.
    fn embed(&mut self, tokens: &[Token]) -> Result<Vec<f32>, NativeError>;

    /// Serialized cache and sampler-independent state
    fn state(&self) -> Result<Vec<u8>, NativeError>;

    fn restore_state(&mut self, state: &[u8]) -> Result<(), NativeError>;

    /// Replaces the attached adapter stack. Every adapter is initialized before
    /// the old stack is detached; on failure the old stack stays attached.
    fn set_adapters(&mut self, adapters: &[AdapterSpec]) -> Result<(), AdapterFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_probabilities() {
        let logits = [0.0, 2.0, 1.0, 2.0, -1.0];
        let top = top_probabilities(&logits, 3);
        let ids: Vec<Token> = top.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
        assert!((top[0].1 - top[1].1).abs() < 1e-6);
        assert!(top[1].1 > top[2].1);

        let all: f32 = top_probabilities(&logits, 10).iter().map(|(_, p)| p).sum();
        assert!((all - 1.0).abs() < 1e-5);

        assert!(top_probabilities(&logits, 0).is_empty());
        assert!(top_probabilities(&[f32::NEG_INFINITY; 3], 2).is_empty());
    }
}
