//! Context lifecycle and inference
//!
//! This module owns every native context: loading, completion, sessions,
//! adapters and embeddings all run on the worker thread of their context.

pub mod adapters;
pub mod backend;
pub mod embedding;
pub mod engine;
pub mod gguf;
pub mod grammar;
#[cfg(feature = "llama")]
pub mod llama;
pub mod loader;
pub mod params;
pub mod pending;
pub mod registry;
pub mod session;
pub mod streaming;

mod generation;
mod worker;

#[cfg(test)]
pub(crate) mod fake;

// Re-export main types for convenience
pub use backend::{Backend, ModelDescriptor, NativeContext, NativeError};
pub use embedding::Embedding;
pub use engine::Engine;
pub use gguf::{model_info, validate_gguf, GgufError, GgufHeader, GGUF_MAGIC};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use loader::{LoadEvent, LoadHandle};
pub use params::{
    AdapterSpec, CompletionParams, Constraint, ContextParams, EmbeddingParams, KvCacheType,
    Mirostat, PoolingType, Prompt, SamplingParams, Token, MAX_N_PROBS,
};
pub use pending::Pending;
pub use registry::{ContextId, ContextInfo, ContextStatus};
pub use session::{SessionLoaded, SessionSaved};
pub use streaming::{
    CancellationToken, CompletionEvent, CompletionHandle, CompletionStats, StopReason, TokenEvent,
    TokenProb,
};
