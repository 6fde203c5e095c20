//! Engine facade
//!
//! # Architecture
//!
//! Native handles are not `Send`, so every context gets a dedicated worker
//! thread that loads the model and owns the handle until release. The engine
//! validates requests on the caller's thread, claims the context in the
//! registry and hands the work to the worker over a channel. Results come back
//! as event streams ([`LoadHandle`], [`CompletionHandle`]) or one-shot
//! [`Pending`] values; no call blocks on native work.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use tokio::sync::mpsc as tokio_mpsc;

use crate::error::EngineError;
use crate::inference::backend::Backend;
use crate::inference::embedding::Embedding;
use crate::inference::gguf;
use crate::inference::grammar::{json_schema_to_grammar, validate_grammar};
use crate::inference::loader::{self, LoadHandle};
use crate::inference::params::{
    AdapterSpec, CompletionParams, Constraint, ContextParams, EmbeddingParams, Token,
};
use crate::inference::pending::{Pending, Reply};
use crate::inference::registry::{ContextId, ContextInfo, ContextRegistry, Requirement};
use crate::inference::session::{SessionLoaded, SessionSaved};
use crate::inference::streaming::CompletionHandle;
use crate::inference::worker::{self, WorkerCommand};
use crate::types::ChatMessage;

/// Context lifecycle and completion runtime
///
/// Dropping the engine releases every context it still holds.
pub struct Engine {
    backend: Arc<dyn Backend>,
    registry: Arc<ContextRegistry>,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        tracing::info!("Engine started with backend {}", backend.name());
        Self {
            backend,
            registry: Arc::new(ContextRegistry::new()),
        }
    }

    /// Engine on the process-wide llama.cpp backend
    #[cfg(feature = "llama")]
    pub fn with_llama() -> Result<Self, EngineError> {
        let backend = crate::inference::llama::LlamaCppBackend::shared()?;
        Ok(Self::new(backend))
    }

    /// Starts loading a context.
    ///
    /// Parameters and the model file are checked before anything is spawned.
    /// The returned handle streams progress and ends with exactly one of
    /// `Complete` or `Error`.
    pub fn create_context(
        &self,
        id: Option<ContextId>,
        params: ContextParams,
    ) -> Result<LoadHandle, EngineError> {
        loader::prevalidate(&params)?;
        self.backend.check_params(&params)?;
        let slot = self.registry.reserve(id, params)?;
        let id = slot.id;

        let (commands_tx, commands_rx) = mpsc::channel();
        slot.attach_commands(commands_tx);
        let (reporter, handle) = loader::channel(id);

        let spawned = slot.spawn_worker(|| {
            worker::spawn(
                self.backend.clone(),
                self.registry.clone(),
                slot.clone(),
                commands_rx,
                reporter,
            )
        });
        if let Err(e) = spawned {
            self.registry.forget(id);
            return Err(e);
        }

        tracing::debug!("Context {} reserved, loading in background", id);
        Ok(handle)
    }

    pub fn context(&self, id: ContextId) -> Result<ContextInfo, EngineError> {
        self.registry.get(id)
    }

    /// Snapshots of every context, loading ones included
    pub fn contexts(&self) -> Vec<ContextInfo> {
        self.registry
            .ids()
            .into_iter()
            .filter_map(|id| self.registry.get(id).ok())
            .collect()
    }

    /// Starts a completion.
    ///
    /// Rejected with `ContextBusy` while another completion runs; requests are
    /// never queued.
    pub fn complete(
        &self,
        id: ContextId,
        params: CompletionParams,
    ) -> Result<CompletionHandle, EngineError> {
        params.validate()?;
        let grammar = resolve_constraint(params.sampling.constraint.as_ref())?;
        let slot = self.registry.slot(id)?;

        let (events_tx, events_rx) = tokio_mpsc::unbounded_channel();
        let cancel = slot.begin_generation(worker::complete_command(params, grammar, events_tx))?;

        tracing::debug!("Completion started on context {}", id);
        Ok(CompletionHandle::new(id, cancel, events_rx))
    }

    /// Requests cancellation of the running completion; succeeds when idle
    pub fn stop_completion(&self, id: ContextId) -> Result<(), EngineError> {
        self.registry.slot(id)?.stop()
    }

    fn request<T>(
        &self,
        id: ContextId,
        requirement: Requirement,
        command: impl FnOnce(Reply<T>) -> WorkerCommand,
    ) -> Result<Pending<T>, EngineError> {
        let slot = self.registry.slot(id)?;
        let (reply, pending) = Pending::channel(id);
        slot.dispatch(requirement, command(reply))?;
        Ok(pending)
    }

    pub fn tokenize(&self, id: ContextId, text: impl Into<String>) -> Result<Pending<Vec<Token>>, EngineError> {
        let text = text.into();
        self.request(id, Requirement::Loaded, |reply| WorkerCommand::Tokenize { text, reply })
    }

    pub fn detokenize(&self, id: ContextId, tokens: Vec<Token>) -> Result<Pending<String>, EngineError> {
        self.request(id, Requirement::Loaded, |reply| WorkerCommand::Detokenize { tokens, reply })
    }

    /// Formats messages with `template`, the context's configured template or
    /// the model's own, in that order.
    pub fn format_chat(
        &self,
        id: ContextId,
        messages: Vec<ChatMessage>,
        template: Option<String>,
    ) -> Result<Pending<String>, EngineError> {
        self.request(id, Requirement::Loaded, |reply| WorkerCommand::FormatChat {
            messages,
            template,
            reply,
        })
    }

    /// Embeds `text`. The context must have been created with `embedding`.
    ///
    /// Clears the context's cache.
    pub fn embedding(
        &self,
        id: ContextId,
        text: impl Into<String>,
        params: EmbeddingParams,
    ) -> Result<Pending<Embedding>, EngineError> {
        let slot = self.registry.slot(id)?;
        if !slot.params.embedding {
            return Err(EngineError::InvalidParams(format!(
                "context {id} was not created with embedding enabled"
            )));
        }
        if matches!(params.normalize, Some(n) if n < -1) {
            return Err(EngineError::InvalidParams(
                "normalize must be >= -1".to_string(),
            ));
        }

        let text = text.into();
        self.request(id, Requirement::Idle, |reply| WorkerCommand::Embedding {
            text,
            params,
            reply,
        })
    }

    /// Writes the context's cache and token history to `path`.
    ///
    /// Nothing is written when the encoded session exceeds `max_size` bytes.
    pub fn save_session(
        &self,
        id: ContextId,
        path: impl Into<PathBuf>,
        max_size: u64,
    ) -> Result<Pending<SessionSaved>, EngineError> {
        let path = path.into();
        self.request(id, Requirement::Idle, |reply| WorkerCommand::SaveSession {
            path,
            max_size,
            reply,
        })
    }

    pub fn load_session(
        &self,
        id: ContextId,
        path: impl Into<PathBuf>,
    ) -> Result<Pending<SessionLoaded>, EngineError> {
        let path = path.into();
        self.request(id, Requirement::Idle, |reply| WorkerCommand::LoadSession { path, reply })
    }

    /// Replaces the adapter stack. Resolves to the new stack length; on
    /// failure the previous stack stays attached.
    pub fn apply_adapters(
        &self,
        id: ContextId,
        adapters: Vec<AdapterSpec>,
    ) -> Result<Pending<usize>, EngineError> {
        self.request(id, Requirement::Idle, |reply| WorkerCommand::ApplyAdapters {
            adapters,
            reply,
        })
    }

    pub fn remove_adapters(&self, id: ContextId) -> Result<Pending<()>, EngineError> {
        self.request(id, Requirement::Idle, |reply| WorkerCommand::RemoveAdapters { reply })
    }

    /// The attached adapter stack in application order
    pub fn loaded_adapters(&self, id: ContextId) -> Result<Vec<AdapterSpec>, EngineError> {
        Ok(self.registry.slot(id)?.adapters())
    }

    /// Releases a context, cancelling its completion and waiting for its
    /// worker to drop the native handle.
    pub fn release_context(&self, id: ContextId) -> Result<(), EngineError> {
        self.registry.release(id)
    }

    /// Releases every context; failures are collected per id
    pub fn release_all(&self) -> Vec<(ContextId, EngineError)> {
        let failures = self.registry.release_all();
        for (id, e) in &failures {
            tracing::warn!("Failed to release context {}: {}", id, e);
        }
        failures
    }

    /// GGUF metadata of a model file, without loading it
    pub fn model_info(
        path: impl AsRef<Path>,
        skip: &[String],
    ) -> Result<BTreeMap<String, String>, EngineError> {
        Ok(gguf::model_info(path, skip)?)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.registry.ids().is_empty() {
            tracing::info!("Engine dropped, releasing remaining contexts");
            self.release_all();
        }
    }
}

/// Turns a sampling constraint into the GBNF grammar handed to the sampler
fn resolve_constraint(constraint: Option<&Constraint>) -> Result<Option<String>, EngineError> {
    match constraint {
        None => Ok(None),
        Some(Constraint::Grammar(grammar)) => {
            validate_grammar(grammar)?;
            Ok(Some(grammar.clone()))
        }
        Some(Constraint::JsonSchema(schema)) => json_schema_to_grammar(schema).map(Some),
    }
}
