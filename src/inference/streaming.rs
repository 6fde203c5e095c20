//! Streaming inference support
//!
//! Token events, completion stats, cooperative cancellation and the text
//! assembly that turns raw token bytes into deliverable text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::EngineError;
use crate::inference::params::Token;
use crate::inference::ContextId;

/// Cooperative stop flag shared between a caller and a running generation
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Candidate token of one sampling step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub token_id: Token,
    /// Lossy text of the token's piece
    pub text: String,
    pub prob: f32,
}

/// One generated token as delivered to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    /// Deliverable text, empty when `is_partial`
    pub text: String,
    /// The token's text is withheld: it ends inside a UTF-8 sequence or may
    /// begin a stop sequence
    pub is_partial: bool,
    pub token_id: Token,
    /// Top candidates of the step that sampled `token_id`, most likely first.
    /// Empty unless `n_probs` was requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probs: Vec<TokenProb>,
}

/// Why a generation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// End-of-generation token
    Eos,
    /// A stop sequence matched; holds the sequence
    StopWord(String),
    /// Token budget or context window exhausted
    Limit,
    Cancelled,
}

/// Final statistics of a completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStats {
    /// Full generated text, stop sequence excluded
    pub text: String,
    /// Number of non-partial token events delivered
    pub completion_tokens: usize,
    /// Number of partial token events delivered
    pub partial_tokens: usize,
    /// Prompt length in tokens after truncation
    pub prompt_tokens: usize,
    /// Prompt tokens reused from the cache
    pub cached_prompt_tokens: usize,
    /// The prompt did not fit and was truncated
    pub truncated: bool,
    pub stop_reason: StopReason,
    pub stopping_word: Option<String>,
}

/// Represents an event emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// A generated token
    Token(TokenEvent),
    /// Generation completed (including cancellation)
    Done(CompletionStats),
    /// Generation failed
    Error(EngineError),
}

impl CompletionEvent {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, CompletionEvent::Token(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, CompletionEvent::Error(_))
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_token()
    }

    /// Extracts the token if this is a Token variant
    pub fn as_token(&self) -> Option<&TokenEvent> {
        match self {
            CompletionEvent::Token(t) => Some(t),
            _ => None,
        }
    }

    /// Extracts the error if this is an Error variant
    pub fn as_error(&self) -> Option<&EngineError> {
        match self {
            CompletionEvent::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Receiving end of one completion
///
/// Events arrive in generation order, followed by exactly one terminal event.
pub struct CompletionHandle {
    context_id: ContextId,
    cancel: CancellationToken,
    events: UnboundedReceiver<CompletionEvent>,
}

impl CompletionHandle {
    pub(crate) fn new(
        context_id: ContextId,
        cancel: CancellationToken,
        events: UnboundedReceiver<CompletionEvent>,
    ) -> Self {
        Self {
            context_id,
            cancel,
            events,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Requests cancellation; the completion still ends with a `Done` event
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn recv(&mut self) -> Option<CompletionEvent> {
        self.events.recv().await
    }

    /// Blocking receive. Must not be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<CompletionEvent> {
        self.events.blocking_recv()
    }

    /// Blocks until the terminal event, discarding tokens
    pub fn wait(self) -> Result<CompletionStats, EngineError> {
        self.collect().1
    }

    /// Blocks until the terminal event, returning every token event
    pub fn collect(mut self) -> (Vec<TokenEvent>, Result<CompletionStats, EngineError>) {
        let mut tokens = Vec::new();
        while let Some(event) = self.events.blocking_recv() {
            match event {
                CompletionEvent::Token(t) => tokens.push(t),
                CompletionEvent::Done(stats) => return (tokens, Ok(stats)),
                CompletionEvent::Error(e) => return (tokens, Err(e)),
            }
        }
        (tokens, Err(self.closed()))
    }

    pub async fn collect_async(mut self) -> (Vec<TokenEvent>, Result<CompletionStats, EngineError>) {
        let mut tokens = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                CompletionEvent::Token(t) => tokens.push(t),
                CompletionEvent::Done(stats) => return (tokens, Ok(stats)),
                CompletionEvent::Error(e) => return (tokens, Err(e)),
            }
        }
        (tokens, Err(self.closed()))
    }

    fn closed(&self) -> EngineError {
        EngineError::WorkerGone(format!(
            "completion stream of context {} closed without a result",
            self.context_id
        ))
    }
}

/// Buffers token bytes until they form complete UTF-8 sequences
#[derive(Debug, Default)]
pub(crate) struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    /// Appends `bytes` and returns the longest decodable prefix
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_owned();
                self.pending.clear();
                out
            }
            // Incomplete sequence at the end: keep the tail for the next token
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => self.flush(),
        }
    }

    pub fn is_incomplete(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Position and word of the earliest stop sequence in `text`
pub(crate) fn find_stop<'a>(text: &str, stops: &'a [String]) -> Option<(usize, &'a str)> {
    stops
        .iter()
        .filter_map(|word| text.find(word.as_str()).map(|pos| (pos, word.as_str())))
        .min_by_key(|(pos, _)| *pos)
}

/// Length of the longest suffix of `text` that is a proper prefix of a stop sequence
pub(crate) fn partial_stop_len(text: &str, stops: &[String]) -> usize {
    stops
        .iter()
        .filter_map(|word| {
            let max = word.len().saturating_sub(1).min(text.len());
            (1..=max)
                .rev()
                .find(|&k| word.is_char_boundary(k) && text.ends_with(&word[..k]))
        })
        .max()
        .unwrap_or(0)
}

/// Result of feeding one token's bytes to a [`TextAssembler`]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Piece {
    /// Text ready for delivery
    Text(String),
    /// Nothing deliverable yet
    Withheld,
    /// A stop sequence matched; `text` precedes it and is the last delivery
    Stop { text: String, word: String },
}

/// Accumulates generated text, withholding incomplete UTF-8 and possible
/// stop-sequence prefixes
#[derive(Debug)]
pub(crate) struct TextAssembler {
    utf8: Utf8Buffer,
    stops: Vec<String>,
    text: String,
    sent: usize,
}

impl TextAssembler {
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            utf8: Utf8Buffer::default(),
            stops,
            text: String::new(),
            sent: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Piece {
        let decoded = self.utf8.push(bytes);
        self.text.push_str(&decoded);

        // Withheld text always covers any stop prefix, so a match can only
        // start in the unsent region.
        let unsent = &self.text[self.sent..];
        if let Some((pos, word)) = find_stop(unsent, &self.stops) {
            let word = word.to_string();
            let text = unsent[..pos].to_string();
            self.text.truncate(self.sent + pos);
            self.sent = self.text.len();
            return Piece::Stop { text, word };
        }

        let hold = partial_stop_len(unsent, &self.stops);
        let end = self.text.len() - hold;
        if end > self.sent {
            let out = self.text[self.sent..end].to_string();
            self.sent = end;
            Piece::Text(out)
        } else {
            Piece::Withheld
        }
    }

    /// The last token left an incomplete UTF-8 sequence behind
    pub fn is_incomplete(&self) -> bool {
        self.utf8.is_incomplete()
    }

    /// Releases everything still withheld
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.utf8.flush();
        self.text.push_str(&rest);
        if self.sent < self.text.len() {
            let out = self.text[self.sent..].to_string();
            self.sent = self.text.len();
            Some(out)
        } else {
            None
        }
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_event_variants() {
        let token = CompletionEvent::Token(TokenEvent {
            text: "hello".to_string(),
            is_partial: false,
            token_id: 5,
            probs: Vec::new(),
        });
        assert!(token.is_token());
        assert!(!token.is_terminal());
        assert_eq!(token.as_token().map(|t| t.text.as_str()), Some("hello"));
        let json = serde_json::to_value(token.as_token().unwrap()).unwrap();
        assert!(json.get("probs").is_none());

        let error = CompletionEvent::Error(EngineError::GenerationFailed("boom".into()));
        assert!(error.is_error());
        assert!(error.is_terminal());
        assert!(error.as_token().is_none());
        assert!(error.as_error().is_some());
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());

        let t = std::thread::spawn(move || clone.is_cancelled());
        assert!(t.join().unwrap());
    }

    #[test]
    fn test_utf8_buffer_split_sequence() {
        let mut buf = Utf8Buffer::default();
        let bytes = "é".as_bytes();
        assert_eq!(buf.push(&bytes[..1]), "");
        assert!(buf.is_incomplete());
        assert_eq!(buf.push(&bytes[1..]), "é");
        assert!(!buf.is_incomplete());

        assert_eq!(buf.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(buf.push(&[0xAC, b'!']), "€!");
    }

    #[test]
    fn test_utf8_buffer_invalid_bytes_are_replaced() {
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(&[0xFF, b'x']), "\u{FFFD}x");
        assert!(!buf.is_incomplete());
    }

    #[test]
    fn test_partial_stop_len() {
        let stops = vec!["</s>".to_string(), "\n\n".to_string()];
        assert_eq!(partial_stop_len("hello <", &stops), 1);
        assert_eq!(partial_stop_len("hello </", &stops), 2);
        assert_eq!(partial_stop_len("a\n", &stops), 1);
        assert_eq!(partial_stop_len("hello", &stops), 0);
        assert_eq!(partial_stop_len("", &stops), 0);
    }

    #[test]
    fn test_find_stop_earliest() {
        let stops = vec!["b".to_string(), "a".to_string()];
        assert_eq!(find_stop("xxab", &stops), Some((2, "a")));
        assert_eq!(find_stop("xx", &stops), None);
    }

    #[test]
    fn test_assembler_never_leaks_stop_word() {
        let mut asm = TextAssembler::new(vec!["STOP".to_string()]);
        let mut delivered = String::new();
        let mut stopped = None;
        for piece in ["Hel", "lo S", "T", "OP and more"] {
            match asm.push(piece.as_bytes()) {
                Piece::Text(t) => delivered.push_str(&t),
                Piece::Withheld => {}
                Piece::Stop { text, word } => {
                    delivered.push_str(&text);
                    stopped = Some(word);
                    break;
                }
            }
        }
        assert_eq!(stopped.as_deref(), Some("STOP"));
        assert_eq!(delivered, "Hello ");
        assert_eq!(asm.into_text(), "Hello ");
    }

    #[test]
    fn test_assembler_releases_false_prefix() {
        let mut asm = TextAssembler::new(vec!["STOP".to_string()]);
        assert_eq!(asm.push(b"ab S"), Piece::Text("ab ".into()));
        assert_eq!(asm.push(b"T"), Piece::Withheld);
        assert_eq!(asm.push(b"ay"), Piece::Text("STay".into()));
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn test_assembler_finish_flushes_withheld() {
        let mut asm = TextAssembler::new(vec!["###".to_string()]);
        assert_eq!(asm.push(b"done#"), Piece::Text("done".into()));
        assert_eq!(asm.finish(), Some("#".into()));
        assert_eq!(asm.into_text(), "done#");
    }
}
