//! Context worker thread
//!
//! Each context is owned by one worker thread. The thread loads the model,
//! then executes commands one at a time until it is told to shut down or the
//! command channel closes. The native handle never leaves the thread.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::EngineError;
use crate::inference::adapters::check_stack;
use crate::inference::backend::{Backend, NativeContext};
use crate::inference::embedding::{normalize, Embedding};
use crate::inference::generation::run_completion;
use crate::inference::loader::LoadReporter;
use crate::inference::params::{AdapterSpec, CompletionParams, EmbeddingParams, Token};
use crate::inference::pending::Reply;
use crate::inference::registry::{ContextRegistry, ContextSlot};
use crate::inference::session::{self, SessionLoaded, SessionSaved};
use crate::inference::streaming::{CancellationToken, CompletionEvent};
use crate::types::ChatMessage;

/// Commands executed on a context worker
pub(crate) enum WorkerCommand {
    Complete {
        params: Box<CompletionParams>,
        grammar: Option<String>,
        cancel: CancellationToken,
        events: UnboundedSender<CompletionEvent>,
    },
    Tokenize {
        text: String,
        reply: Reply<Vec<Token>>,
    },
    Detokenize {
        tokens: Vec<Token>,
        reply: Reply<String>,
    },
    FormatChat {
        messages: Vec<ChatMessage>,
        template: Option<String>,
        reply: Reply<String>,
    },
    Embedding {
        text: String,
        params: EmbeddingParams,
        reply: Reply<Embedding>,
    },
    SaveSession {
        path: PathBuf,
        max_size: u64,
        reply: Reply<SessionSaved>,
    },
    LoadSession {
        path: PathBuf,
        reply: Reply<SessionLoaded>,
    },
    ApplyAdapters {
        adapters: Vec<AdapterSpec>,
        reply: Reply<usize>,
    },
    RemoveAdapters {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Spawns the worker of `slot`, which reports its load through `reporter`
pub(crate) fn spawn(
    backend: Arc<dyn Backend>,
    registry: Arc<ContextRegistry>,
    slot: Arc<ContextSlot>,
    commands: Receiver<WorkerCommand>,
    reporter: LoadReporter,
) -> Result<JoinHandle<()>, EngineError> {
    let id = slot.id;
    thread::Builder::new()
        .name(format!("ctxrt-ctx-{id}"))
        .spawn(move || run(backend, registry, slot, commands, reporter))
        .map_err(|e| EngineError::WorkerGone(format!("Failed to spawn worker for context {id}: {e}")))
}

fn run(
    backend: Arc<dyn Backend>,
    registry: Arc<ContextRegistry>,
    slot: Arc<ContextSlot>,
    commands: Receiver<WorkerCommand>,
    reporter: LoadReporter,
) {
    let id = slot.id;
    tracing::info!(
        "Loading context {} from {:?} with backend {}",
        id,
        slot.params.model_path,
        backend.name()
    );

    let opened = backend.open(
        &slot.params,
        &mut |fraction| reporter.progress(fraction),
        &mut |handle| {
            if !slot.mark_ready(handle.descriptor().clone()) {
                tracing::info!("Context {} released during load, dropping handle", id);
                reporter.fail(EngineError::ContextNotFound(id));
                return;
            }
            tracing::info!(
                "Context {} ready: {} ({} params, n_ctx {})",
                id,
                handle.descriptor().architecture,
                handle.descriptor().n_params,
                slot.params.n_ctx
            );
            reporter.complete(slot.info());

            let mut worker = Worker {
                slot: &slot,
                handle,
                history: Vec::new(),
            };
            worker.serve(&commands);
        },
    );

    if let Err(e) = opened {
        tracing::error!("Failed to load context {}: {}", id, e);
        registry.forget(id);
        reporter.fail(EngineError::ModelLoadFailed(e.0));
    }
    tracing::debug!("Worker of context {} exiting", id);
}

struct Worker<'a> {
    slot: &'a ContextSlot,
    handle: &'a mut dyn NativeContext,
    /// Tokens currently held in the native cache
    history: Vec<Token>,
}

impl Worker<'_> {
    fn serve(&mut self, commands: &Receiver<WorkerCommand>) {
        while let Ok(command) = commands.recv() {
            match command {
                WorkerCommand::Shutdown => break,
                WorkerCommand::Complete {
                    params,
                    grammar,
                    cancel,
                    events,
                } => self.complete(&params, grammar, &cancel, &events),
                WorkerCommand::Tokenize { text, reply } => {
                    let _ = reply.send(self.tokenize(&text));
                }
                WorkerCommand::Detokenize { tokens, reply } => {
                    let _ = reply.send(self.detokenize(&tokens));
                }
                WorkerCommand::FormatChat {
                    messages,
                    template,
                    reply,
                } => {
                    let _ = reply.send(self.format_chat(&messages, template.as_deref()));
                }
                WorkerCommand::Embedding {
                    text,
                    params,
                    reply,
                } => {
                    let _ = reply.send(self.embedding(&text, params));
                }
                WorkerCommand::SaveSession {
                    path,
                    max_size,
                    reply,
                } => {
                    let _ = reply.send(self.save_session(&path, max_size));
                }
                WorkerCommand::LoadSession { path, reply } => {
                    let _ = reply.send(self.load_session(&path));
                }
                WorkerCommand::ApplyAdapters { adapters, reply } => {
                    let _ = reply.send(self.apply_adapters(adapters));
                }
                WorkerCommand::RemoveAdapters { reply } => {
                    let _ = reply.send(self.apply_adapters(Vec::new()).map(|_| ()));
                }
            }
        }
    }

    fn complete(
        &mut self,
        params: &CompletionParams,
        grammar: Option<String>,
        cancel: &CancellationToken,
        events: &UnboundedSender<CompletionEvent>,
    ) {
        let handle = &mut *self.handle;
        let history = &mut self.history;
        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            run_completion(
                &mut *handle,
                &mut *history,
                &self.slot.params,
                params,
                grammar,
                cancel,
                events,
            )
        }));
        let result = run.unwrap_or_else(|_| {
            tracing::error!("Completion on context {} panicked, clearing its cache", self.slot.id);
            self.history.clear();
            if let Err(e) = self.handle.truncate_cache(0) {
                tracing::warn!("Failed to clear cache of context {}: {}", self.slot.id, e);
            }
            Err(EngineError::GenerationFailed("generation panicked".to_string()))
        });

        // the slot must leave Generating even when the completion panicked
        self.slot.finish_generation();
        let event = match result {
            Ok(stats) => CompletionEvent::Done(stats),
            Err(e) => {
                tracing::error!("Completion on context {} failed: {}", self.slot.id, e);
                let e = match e {
                    EngineError::GenerationFailed(_) => e,
                    other => EngineError::GenerationFailed(other.to_string()),
                };
                CompletionEvent::Error(e)
            }
        };
        let _ = events.send(event);
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        self.handle
            .tokenize(text, false)
            .map_err(|e| EngineError::GenerationFailed(format!("Tokenization failed: {e}")))
    }

    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError> {
        let mut bytes = Vec::new();
        for token in tokens {
            let piece = self
                .handle
                .token_to_bytes(*token)
                .map_err(|e| EngineError::InvalidParams(e.0))?;
            bytes.extend_from_slice(&piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn format_chat(&self, messages: &[ChatMessage], template: Option<&str>) -> Result<String, EngineError> {
        let template = template.or(self.slot.params.chat_template.as_deref());
        self.handle
            .apply_chat_template(template, messages)
            .map_err(|e| EngineError::InvalidParams(format!("Failed to apply chat template: {e}")))
    }

    fn embedding(&mut self, text: &str, params: EmbeddingParams) -> Result<Embedding, EngineError> {
        let tokens = self
            .handle
            .tokenize(text, true)
            .map_err(|e| EngineError::GenerationFailed(format!("Tokenization failed: {e}")))?;
        if tokens.len() > self.slot.params.n_ctx as usize {
            return Err(EngineError::InvalidParams(format!(
                "input of {} tokens exceeds the context size {}",
                tokens.len(),
                self.slot.params.n_ctx
            )));
        }

        let result = self.handle.embed(&tokens);
        // the cache is cleared whether or not embedding succeeded
        self.history.clear();
        let mut values = result.map_err(|e| EngineError::GenerationFailed(e.0))?;

        let mode = params.normalize.unwrap_or(self.slot.params.embd_normalize);
        normalize(&mut values, mode);
        Ok(Embedding {
            values,
            n_tokens: tokens.len(),
            normalize: mode,
        })
    }

    fn save_session(&self, path: &Path, max_size: u64) -> Result<SessionSaved, EngineError> {
        let state = self
            .handle
            .state()
            .map_err(|e| EngineError::Io(format!("Failed to read context state: {e}")))?;
        let bytes = session::encode(
            self.handle.descriptor(),
            self.slot.params.n_ctx,
            &self.history,
            &state,
        )?;
        let bytes_written = session::write(path, &bytes, max_size)?;

        tracing::info!(
            "Saved session of context {} to {:?} ({} tokens, {} bytes)",
            self.slot.id,
            path,
            self.history.len(),
            bytes_written
        );
        Ok(SessionSaved {
            bytes_written,
            tokens_saved: self.history.len(),
        })
    }

    fn load_session(&mut self, path: &Path) -> Result<SessionLoaded, EngineError> {
        let session = session::read(path)?;
        session.check_compatible(self.handle.descriptor(), self.slot.params.n_ctx)?;

        if let Err(e) = self.handle.restore_state(&session.state) {
            // a failed restore leaves the native state undefined
            let _ = self.handle.truncate_cache(0);
            self.history.clear();
            return Err(EngineError::SessionIncompatible(format!(
                "Failed to restore context state: {e}"
            )));
        }
        self.history = session.tokens;

        let prompt = self.detokenize(&self.history)?;
        tracing::info!(
            "Loaded session into context {} from {:?} ({} tokens)",
            self.slot.id,
            path,
            self.history.len()
        );
        Ok(SessionLoaded {
            tokens_loaded: self.history.len(),
            prompt,
        })
    }

    fn apply_adapters(&mut self, adapters: Vec<AdapterSpec>) -> Result<usize, EngineError> {
        check_stack(&self.handle.descriptor().architecture, &adapters)?;
        self.handle
            .set_adapters(&adapters)
            .map_err(|f| EngineError::AdapterLoadFailed {
                index: f.index,
                reason: f.reason,
            })?;

        let count = adapters.len();
        self.slot.set_adapters(adapters);
        tracing::info!("Context {} now has {} adapter(s)", self.slot.id, count);
        Ok(count)
    }
}

/// Builds the command for a completion whose token is created by the slot
pub(crate) fn complete_command(
    params: CompletionParams,
    grammar: Option<String>,
    events: UnboundedSender<CompletionEvent>,
) -> impl FnOnce(CancellationToken) -> WorkerCommand {
    move |cancel| WorkerCommand::Complete {
        params: Box::new(params),
        grammar,
        cancel,
        events,
    }
}

