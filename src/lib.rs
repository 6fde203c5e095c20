//! ctxrt Library
//!
//! Context lifecycle and streaming-completion runtime for llama.cpp models.

pub mod diagnostics;
pub mod error;
pub mod inference;
pub mod protocol;
pub mod settings;
pub mod types;

pub use error::{EngineError, ErrorKind};
pub use inference::{CompletionParams, ContextId, ContextParams, Engine};

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_respects_char_boundary() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 3), "hel");
        assert_eq!(truncate_str("héllo", 2), "h");
    }
}
