//! Completion driver
//!
//! Runs on the context worker: formats and tokenizes the prompt, reuses the
//! cached prefix, evaluates the rest in batches and samples until a halt
//! condition, emitting one event per sampled token.

use tokio::sync::mpsc::UnboundedSender;

use crate::error::EngineError;
use crate::inference::backend::{NativeContext, NativeError, SamplerConfig};
use crate::inference::params::{CompletionParams, ContextParams, Prompt, Token};
use crate::inference::streaming::{
    CancellationToken, CompletionEvent, CompletionStats, Piece, StopReason, TextAssembler,
    TokenEvent, TokenProb,
};
use crate::truncate_str;
use crate::types::message::{with_system_prompt, ChatMessage};

/// Extra tokens granted past the budget to complete a UTF-8 sequence
const MAX_UTF8_EXTENSION: usize = 4;

fn generation_failed(e: NativeError) -> EngineError {
    EngineError::GenerationFailed(e.0)
}

/// Formats the request into the prompt text fed to the tokenizer
pub(crate) fn build_prompt(
    handle: &dyn NativeContext,
    ctx_params: &ContextParams,
    request: &CompletionParams,
) -> Result<String, EngineError> {
    let template = request
        .chat_template
        .as_deref()
        .or(ctx_params.chat_template.as_deref());

    let messages = match &request.prompt {
        Prompt::Text(text) => match &request.system_prompt {
            None => return Ok(text.clone()),
            Some(system) => vec![ChatMessage::system(system), ChatMessage::user(text)],
        },
        Prompt::Chat(messages) => with_system_prompt(messages, request.system_prompt.as_deref()),
    };

    handle
        .apply_chat_template(template, &messages)
        .map_err(|e| EngineError::GenerationFailed(format!("Failed to apply chat template: {e}")))
}

/// Tokens kept at the head of the prompt when truncating or shifting
pub(crate) fn resolve_n_keep(n_keep: i32, n_prompt: usize, n_ctx: usize) -> usize {
    let n_keep = if n_keep < 0 { n_prompt } else { n_keep as usize };
    n_keep.min(n_ctx.saturating_sub(4))
}

/// Shortens a prompt that does not fit the window: keeps `n_keep` head tokens
/// and drops whole blocks of half the remaining window from the middle.
pub(crate) fn truncate_prompt(tokens: &[Token], n_keep: usize, n_ctx: usize) -> Vec<Token> {
    let n_left = n_ctx.saturating_sub(n_keep);
    let block = (n_left / 2).max(1);
    let erased = (tokens.len() - n_keep).saturating_sub(block) / block;

    let mut out = Vec::with_capacity(n_ctx);
    out.extend_from_slice(&tokens[..n_keep]);
    out.extend_from_slice(&tokens[n_keep + erased * block..]);
    out
}

pub(crate) fn common_prefix(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Generates a random seed using system entropy
pub(crate) fn random_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// Counts delivered events and detects a dropped receiver
struct Emitter<'a> {
    events: &'a UnboundedSender<CompletionEvent>,
    completion_tokens: usize,
    partial_tokens: usize,
}

impl Emitter<'_> {
    /// Returns false once nobody is listening anymore
    fn token(&mut self, text: String, token_id: Token, probs: Vec<TokenProb>) -> bool {
        let is_partial = text.is_empty();
        if is_partial {
            self.partial_tokens += 1;
        } else {
            self.completion_tokens += 1;
        }
        self.events
            .send(CompletionEvent::Token(TokenEvent {
                text,
                is_partial,
                token_id,
                probs,
            }))
            .is_ok()
    }
}

/// Top candidates of the current step; empty when `n_probs` is 0
fn step_probs(handle: &dyn NativeContext, n_probs: usize) -> Result<Vec<TokenProb>, EngineError> {
    if n_probs == 0 {
        return Ok(Vec::new());
    }
    handle
        .top_probs(n_probs)
        .map_err(generation_failed)?
        .into_iter()
        .map(|(token_id, prob)| {
            let bytes = handle.token_to_bytes(token_id).map_err(generation_failed)?;
            Ok(TokenProb {
                token_id,
                text: String::from_utf8_lossy(&bytes).into_owned(),
                prob,
            })
        })
        .collect()
}

/// Runs one completion to its halt condition.
///
/// `history` mirrors the tokens held in the native cache and is kept in sync
/// on every path, including errors. Cancellation is a successful result.
pub(crate) fn run_completion(
    handle: &mut dyn NativeContext,
    history: &mut Vec<Token>,
    ctx_params: &ContextParams,
    request: &CompletionParams,
    grammar: Option<String>,
    cancel: &CancellationToken,
    events: &UnboundedSender<CompletionEvent>,
) -> Result<CompletionStats, EngineError> {
    let n_ctx = ctx_params.n_ctx as usize;

    let prompt = build_prompt(&*handle, ctx_params, request)?;
    let mut tokens = handle.tokenize(&prompt, true).map_err(generation_failed)?;
    if tokens.is_empty() {
        return Err(EngineError::GenerationFailed(
            "prompt produced no tokens".to_string(),
        ));
    }

    let n_keep = resolve_n_keep(
        request.n_keep.unwrap_or(ctx_params.n_keep),
        tokens.len(),
        n_ctx,
    );
    let truncated = tokens.len() >= n_ctx;
    if truncated {
        let original = tokens.len();
        tokens = truncate_prompt(&tokens, n_keep, n_ctx);
        tracing::warn!(
            "Prompt truncated from {} to {} tokens (n_ctx {}, n_keep {})",
            original,
            tokens.len(),
            n_ctx,
            n_keep
        );
    }

    // Reuse the cached prefix; always evaluate at least one token for fresh logits
    let mut n_past = common_prefix(history, &tokens);
    if n_past == tokens.len() {
        n_past -= 1;
    }
    handle.truncate_cache(n_past).map_err(generation_failed)?;
    history.truncate(n_past);

    tracing::debug!(
        "Prompt '{}': {} tokens, {} cached",
        truncate_str(&prompt, 80),
        tokens.len(),
        n_past
    );

    let mut logit_bias = request.sampling.logit_bias.clone();
    if request.ignore_eos {
        logit_bias.push((handle.eos_token(), f32::NEG_INFINITY));
    }
    let sampler = SamplerConfig {
        params: request.sampling.clone(),
        seed: request.sampling.seed.unwrap_or_else(random_seed),
        grammar,
        logit_bias,
    };
    handle
        .set_sampler(&sampler, &tokens)
        .map_err(generation_failed)?;

    let mut emitter = Emitter {
        events,
        completion_tokens: 0,
        partial_tokens: 0,
    };
    let mut assembler = TextAssembler::new(request.stop_sequences());
    let mut stopping_word = None;
    let mut last_token: Token = 0;

    let batch = ctx_params.n_batch.max(1) as usize;
    let mut prompt_cancelled = false;
    for chunk in tokens[n_past..].chunks(batch) {
        if cancel.is_cancelled() {
            prompt_cancelled = true;
            break;
        }
        if let Err(e) = handle.decode(chunk, history.len()) {
            // Part of the chunk may be cached; drop it so history stays accurate
            let _ = handle.truncate_cache(history.len());
            return Err(generation_failed(e));
        }
        history.extend_from_slice(chunk);
    }

    let mut remaining: i64 = request.n_predict as i64;
    let mut extensions = 0;

    let stop_reason = if prompt_cancelled {
        StopReason::Cancelled
    } else {
        loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if remaining == 0 {
                if assembler.is_incomplete() && extensions < MAX_UTF8_EXTENSION {
                    extensions += 1;
                } else {
                    break StopReason::Limit;
                }
            }

            let probs = step_probs(&*handle, request.sampling.n_probs)?;
            let token = handle.sample().map_err(generation_failed)?;
            if !request.ignore_eos && handle.is_end_of_generation(token) {
                break StopReason::Eos;
            }
            if remaining > 0 {
                remaining -= 1;
            }
            last_token = token;

            let bytes = handle.token_to_bytes(token).map_err(generation_failed)?;
            let delivered = match assembler.push(&bytes) {
                Piece::Text(text) => emitter.token(text, token, probs),
                Piece::Withheld => emitter.token(String::new(), token, probs),
                Piece::Stop { text, word } => {
                    emitter.token(text, token, probs);
                    stopping_word = Some(word.clone());
                    break StopReason::StopWord(word);
                }
            };
            if !delivered {
                tracing::debug!("Receiver dropped, stopping generation");
                break StopReason::Cancelled;
            }

            // Make room: discard half of the tokens after the kept head
            if history.len() >= n_ctx {
                let n_discard = history.len().saturating_sub(n_keep + 1) / 2;
                if n_discard == 0 {
                    break StopReason::Limit;
                }
                handle
                    .shift_cache(n_keep + 1, n_discard, history.len())
                    .map_err(generation_failed)?;
                history.drain(n_keep + 1..n_keep + 1 + n_discard);
                tracing::debug!("Context shifted: discarded {} tokens", n_discard);
            }

            if let Err(e) = handle.decode(&[token], history.len()) {
                let _ = handle.truncate_cache(history.len());
                return Err(generation_failed(e));
            }
            history.push(token);
        }
    };

    if !matches!(stop_reason, StopReason::StopWord(_)) {
        if let Some(rest) = assembler.finish() {
            emitter.token(rest, last_token, Vec::new());
        }
    }

    let stats = CompletionStats {
        text: assembler.into_text(),
        completion_tokens: emitter.completion_tokens,
        partial_tokens: emitter.partial_tokens,
        prompt_tokens: tokens.len(),
        cached_prompt_tokens: n_past,
        truncated,
        stop_reason,
        stopping_word,
    };

    tracing::debug!(
        "Completion finished: {:?}, {} tokens",
        stats.stop_reason,
        stats.completion_tokens
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::Backend;
    use crate::inference::fake::{FakeBackend, FakeConfig, Output};
    use crate::inference::gguf::testing;
    use tokio::sync::mpsc;

    /// Runs `f` against an opened fake context
    fn with_fake<R>(
        backend: FakeBackend,
        n_ctx: u32,
        f: impl FnOnce(&mut dyn NativeContext, &ContextParams) -> R,
    ) -> R {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::model(dir.path(), "m.gguf", "llama");
        let params = ContextParams::new(model).with_n_ctx(n_ctx);
        let mut f = Some(f);
        let mut result = None;
        backend
            .open(&params, &mut |_| {}, &mut |handle| {
                if let Some(f) = f.take() {
                    result = Some(f(handle, &params));
                }
            })
            .unwrap();
        result.unwrap()
    }

    fn run(
        handle: &mut dyn NativeContext,
        history: &mut Vec<Token>,
        params: &ContextParams,
        request: &CompletionParams,
    ) -> (Vec<TokenEvent>, Result<CompletionStats, EngineError>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = run_completion(
            handle,
            history,
            params,
            request,
            None,
            &CancellationToken::new(),
            &tx,
        );
        drop(tx);
        let mut tokens = Vec::new();
        while let Ok(CompletionEvent::Token(t)) = rx.try_recv() {
            tokens.push(t);
        }
        (tokens, result)
    }

    #[test]
    fn test_truncate_prompt_fits_window() {
        let tokens: Vec<Token> = (0..100).collect();
        let out = truncate_prompt(&tokens, 4, 32);
        assert!(out.len() < 32);
        assert_eq!(&out[..4], &[0, 1, 2, 3]);
        assert_eq!(*out.last().unwrap(), 99);
    }

    #[test]
    fn test_resolve_n_keep() {
        assert_eq!(resolve_n_keep(-1, 10, 2048), 10);
        assert_eq!(resolve_n_keep(5, 10, 2048), 5);
        assert_eq!(resolve_n_keep(-1, 5000, 2048), 2044);
        assert_eq!(resolve_n_keep(3, 10, 2), 0);
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix(&[], &[1]), 0);
    }

    #[test]
    fn test_script_until_eos() {
        with_fake(FakeBackend::script("Hi there"), 256, |handle, params| {
            let mut history = Vec::new();
            let (tokens, stats) = run(handle, &mut history, params, &CompletionParams::new("Q"));
            let stats = stats.unwrap();
            assert_eq!(stats.text, "Hi there");
            assert_eq!(stats.stop_reason, StopReason::Eos);
            assert_eq!(stats.completion_tokens, tokens.len());
            assert_eq!(stats.prompt_tokens, 2);
            let joined: String = tokens.iter().map(|t| t.text.as_str()).collect();
            assert_eq!(joined, "Hi there");
        });
    }

    #[test]
    fn test_stop_word_not_emitted() {
        with_fake(FakeBackend::script("Hello###World"), 256, |handle, params| {
            let mut history = Vec::new();
            let request = CompletionParams::new("Q").with_stop("###");
            let (tokens, stats) = run(handle, &mut history, params, &request);
            let stats = stats.unwrap();
            assert_eq!(stats.stop_reason, StopReason::StopWord("###".into()));
            assert_eq!(stats.stopping_word.as_deref(), Some("###"));
            assert_eq!(stats.text, "Hello");
            let joined: String = tokens.iter().map(|t| t.text.as_str()).collect();
            assert_eq!(joined, "Hello");
            assert!(tokens.iter().all(|t| !t.text.contains('#')));
            let non_partial = tokens.iter().filter(|t| !t.is_partial).count();
            assert_eq!(stats.completion_tokens, non_partial);
            assert_eq!(stats.partial_tokens, tokens.len() - non_partial);
        });
    }

    #[test]
    fn test_budget_and_ignore_eos() {
        with_fake(FakeBackend::script("ab"), 256, |handle, params| {
            let mut history = Vec::new();
            let mut request = CompletionParams::new("Q").with_n_predict(5);
            request.ignore_eos = true;
            let (_, stats) = run(handle, &mut history, params, &request);
            let stats = stats.unwrap();
            assert_eq!(stats.text, "ababa");
            assert_eq!(stats.stop_reason, StopReason::Limit);
            assert_eq!(stats.completion_tokens, 5);

            let (tokens, stats) = run(
                handle,
                &mut history,
                params,
                &CompletionParams::new("Q").with_n_predict(0),
            );
            assert!(tokens.is_empty());
            assert_eq!(stats.unwrap().stop_reason, StopReason::Limit);
        });
    }

    #[test]
    fn test_utf8_extension_past_budget() {
        with_fake(FakeBackend::script("é!"), 256, |handle, params| {
            let mut history = Vec::new();
            let request = CompletionParams::new("Q").with_n_predict(1);
            let (tokens, stats) = run(handle, &mut history, params, &request);
            let stats = stats.unwrap();
            assert_eq!(tokens.len(), 2);
            assert!(tokens[0].is_partial);
            assert_eq!(tokens[1].text, "é");
            assert_eq!(stats.text, "é");
            assert_eq!(stats.completion_tokens, 1);
            assert_eq!(stats.partial_tokens, 1);
        });
    }

    #[test]
    fn test_prompt_prefix_reused() {
        with_fake(FakeBackend::script("ok"), 256, |handle, params| {
            let mut history = Vec::new();
            let request = CompletionParams::new("The same prompt").with_n_predict(1);
            let (_, first) = run(handle, &mut history, params, &request);
            assert_eq!(first.unwrap().cached_prompt_tokens, 0);

            let (_, second) = run(handle, &mut history, params, &request);
            let second = second.unwrap();
            assert_eq!(second.cached_prompt_tokens, second.prompt_tokens - 1);
        });
    }

    #[test]
    fn test_long_prompt_truncated_and_context_shifted() {
        with_fake(FakeBackend::endless(std::time::Duration::ZERO), 32, |handle, params| {
            let mut history = Vec::new();
            let request = CompletionParams::new("x".repeat(100)).with_n_predict(80);
            let (tokens, stats) = run(handle, &mut history, params, &request);
            let stats = stats.unwrap();
            assert!(stats.truncated);
            assert!(stats.prompt_tokens < 32);
            assert_eq!(stats.stop_reason, StopReason::Limit);
            assert_eq!(stats.completion_tokens, 80);
            assert_eq!(tokens.len(), 80);
            assert!(history.len() <= 32);
        });
    }

    #[test]
    fn test_cancelled_before_first_step() {
        with_fake(FakeBackend::endless(std::time::Duration::ZERO), 256, |handle, params| {
            let (tx, _rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            cancel.cancel();
            let mut history = Vec::new();
            let stats = run_completion(
                handle,
                &mut history,
                params,
                &CompletionParams::new("Q"),
                None,
                &cancel,
                &tx,
            )
            .unwrap();
            assert_eq!(stats.stop_reason, StopReason::Cancelled);
            assert_eq!(stats.completion_tokens, 0);
        });
    }

    #[test]
    fn test_decode_failure_keeps_history_consistent() {
        let backend = FakeBackend::new(FakeConfig {
            output: Output::Hashed,
            fail_decode_at: Some(10),
            ..FakeConfig::default()
        });
        with_fake(backend, 256, |handle, params| {
            let mut history = Vec::new();
            let (_, result) = run(handle, &mut history, params, &CompletionParams::new("abc"));
            assert_eq!(
                result.unwrap_err().kind(),
                crate::error::ErrorKind::GenerationFailed
            );
            assert_eq!(history.len(), 10);

            // The cache still matches history, so the next request decodes cleanly
            let (_, result) = run(
                handle,
                &mut history,
                params,
                &CompletionParams::new("ab").with_n_predict(2),
            );
            assert_eq!(result.unwrap().completion_tokens, 2);
        });
    }

    #[test]
    fn test_token_probabilities_attached() {
        with_fake(FakeBackend::script("Hi"), 256, |handle, params| {
            let mut history = Vec::new();
            let mut request = CompletionParams::new("Q");
            request.sampling.n_probs = 3;
            let (tokens, stats) = run(handle, &mut history, params, &request);
            assert_eq!(stats.unwrap().text, "Hi");
            assert_eq!(tokens.len(), 2);
            for (event, expected) in tokens.iter().zip(["H", "i"]) {
                assert_eq!(event.probs.len(), 3);
                assert_eq!(event.probs[0].token_id, event.token_id);
                assert_eq!(event.probs[0].text, expected);
                assert!(event.probs[0].prob > event.probs[1].prob);
                assert!(event.probs[1].prob > event.probs[2].prob);
            }

            let (tokens, _) = run(handle, &mut history, params, &CompletionParams::new("Q"));
            assert!(tokens.iter().all(|t| t.probs.is_empty()));
        });
    }

    #[test]
    fn test_system_prompt_uses_template() {
        with_fake(FakeBackend::default(), 256, |handle, params| {
            let mut request = CompletionParams::new("question");
            request.system_prompt = Some("be brief".into());
            let prompt = build_prompt(&*handle, params, &request).unwrap();
            assert!(prompt.starts_with("<|system|>\nbe brief\n<|user|>\nquestion\n"));

            request.chat_template = Some("chatml".into());
            let prompt = build_prompt(&*handle, params, &request).unwrap();
            assert!(prompt.starts_with("[chatml] system: be brief"));
        });
    }
}
