//! Session files
//!
//! Layout: `CTXS` magic, u32 header length, JSON header, token history as
//! little-endian i32, native state blob.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::inference::backend::ModelDescriptor;
use crate::inference::params::Token;

const SESSION_MAGIC: &[u8; 4] = b"CTXS";
pub const SESSION_FORMAT: u32 = 1;

/// Result of a successful save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSaved {
    pub bytes_written: u64,
    pub tokens_saved: usize,
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLoaded {
    pub tokens_loaded: usize,
    /// Restored history, detokenized
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub format: u32,
    pub architecture: String,
    /// Context size at save time, informational
    pub n_ctx: u32,
    pub n_tokens: usize,
    pub state_len: usize,
    pub saved_at: DateTime<Utc>,
}

/// A decoded session file
#[derive(Debug)]
pub struct Session {
    pub header: SessionHeader,
    pub tokens: Vec<Token>,
    pub state: Vec<u8>,
}

pub fn encode(
    model: &ModelDescriptor,
    n_ctx: u32,
    tokens: &[Token],
    state: &[u8],
) -> Result<Vec<u8>, EngineError> {
    let header = SessionHeader {
        format: SESSION_FORMAT,
        architecture: model.architecture.clone(),
        n_ctx,
        n_tokens: tokens.len(),
        state_len: state.len(),
        saved_at: Utc::now(),
    };
    let header = serde_json::to_vec(&header)
        .map_err(|e| EngineError::Io(format!("Failed to serialize session header: {e}")))?;

    let mut out = Vec::with_capacity(8 + header.len() + tokens.len() * 4 + state.len());
    out.extend_from_slice(SESSION_MAGIC);
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    for t in tokens {
        out.extend_from_slice(&t.to_le_bytes());
    }
    out.extend_from_slice(state);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Session, EngineError> {
    let incompatible = |msg: &str| EngineError::SessionIncompatible(msg.to_string());

    let rest = bytes
        .strip_prefix(SESSION_MAGIC.as_slice())
        .ok_or_else(|| incompatible("not a session file"))?;
    if rest.len() < 4 {
        return Err(incompatible("truncated header"));
    }
    let header_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let rest = &rest[4..];
    if rest.len() < header_len {
        return Err(incompatible("truncated header"));
    }

    let header: SessionHeader = serde_json::from_slice(&rest[..header_len])
        .map_err(|e| EngineError::SessionIncompatible(format!("bad header: {e}")))?;
    if header.format != SESSION_FORMAT {
        return Err(EngineError::SessionIncompatible(format!(
            "unsupported session format {}",
            header.format
        )));
    }

    let body = &rest[header_len..];
    let token_bytes = header
        .n_tokens
        .checked_mul(4)
        .ok_or_else(|| incompatible("token count overflow"))?;
    if body.len() != token_bytes + header.state_len {
        return Err(incompatible("body length does not match header"));
    }

    let tokens = body[..token_bytes]
        .chunks_exact(4)
        .map(|c| Token::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let state = body[token_bytes..].to_vec();

    Ok(Session {
        header,
        tokens,
        state,
    })
}

impl Session {
    /// Checks the session can be restored into a context with `model` and `n_ctx`.
    ///
    /// The saved `n_ctx` is not compared: the state blob only carries the used
    /// cache cells, so any context holding `n_tokens` can take it.
    pub fn check_compatible(&self, model: &ModelDescriptor, n_ctx: u32) -> Result<(), EngineError> {
        if self.header.architecture != model.architecture {
            return Err(EngineError::SessionIncompatible(format!(
                "saved for architecture '{}', context runs '{}'",
                self.header.architecture, model.architecture
            )));
        }
        if self.header.n_tokens > n_ctx as usize {
            return Err(EngineError::SessionIncompatible(format!(
                "{} tokens do not fit a context of {}",
                self.header.n_tokens, n_ctx
            )));
        }
        Ok(())
    }
}

/// Writes an encoded session unless it exceeds `max_size` bytes
pub fn write(path: &Path, bytes: &[u8], max_size: u64) -> Result<u64, EngineError> {
    let size = bytes.len() as u64;
    if size > max_size {
        return Err(EngineError::SessionTooLarge {
            size,
            limit: max_size,
        });
    }
    fs::write(path, bytes)?;
    Ok(size)
}

pub fn read(path: &Path) -> Result<Session, EngineError> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}
