//! ctxrt - command line front end
//!
//! Runs completions, embeddings and model inspection against local GGUF
//! models, or serves the JSON protocol over stdin/stdout.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use ctxrt::diagnostics;
use ctxrt::inference::{
    CompletionEvent, CompletionStats, ContextId, ContextInfo, EmbeddingParams, Engine, TokenEvent,
};
use ctxrt::protocol::{Dispatcher, EventSink, Response};
use ctxrt::settings::{self, EngineSettings};
use ctxrt::EngineError;

#[derive(Parser)]
#[command(name = "ctxrt")]
#[command(about = "Context runtime for local llama.cpp models", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// GGUF model (defaults to the one in settings)
    #[arg(short, long, global = true)]
    model: Option<PathBuf>,

    /// Context window size (overrides settings)
    #[arg(long, global = true)]
    n_ctx: Option<u32>,

    /// Layers to offload to GPU (overrides settings)
    #[arg(long, global = true)]
    gpu_layers: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a completion to stdout
    Complete {
        prompt: String,

        /// Maximum tokens to generate (-1 = until end of generation)
        #[arg(short, long)]
        n_predict: Option<i32>,

        #[arg(short, long)]
        temperature: Option<f32>,

        #[arg(long)]
        seed: Option<u32>,

        /// Stop sequence, may be repeated
        #[arg(long)]
        stop: Vec<String>,

        /// Session file restored before and saved after the completion.
        /// Relative paths resolve against the session directory in settings.
        #[arg(long)]
        session: Option<PathBuf>,
    },

    /// Print GGUF metadata without loading the model
    Info {
        /// Metadata keys to leave out, may be repeated
        #[arg(long)]
        skip: Vec<String>,
    },

    /// Print the token ids of a text
    Tokenize { text: String },

    /// Print the embedding of a text
    Embed {
        text: String,

        /// Normalization (-1 none, 0 max-abs, 1 taxicab, 2 euclidean, >2 p-norm)
        #[arg(long, allow_hyphen_values = true)]
        normalize: Option<i32>,
    },

    /// Answer JSON requests read line by line from stdin
    Serve,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = settings::load_settings();

    let directive = if cli.verbose {
        "ctxrt=debug"
    } else {
        settings.log_filter.as_str()
    };
    if let Err(e) = diagnostics::init_tracing(directive) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting ctxrt v{}", env!("CARGO_PKG_VERSION"));

    match run(cli, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, mut settings: EngineSettings) -> Result<(), EngineError> {
    if let Some(n_ctx) = cli.n_ctx {
        settings.n_ctx = n_ctx;
    }
    if let Some(gpu_layers) = cli.gpu_layers {
        settings.n_gpu_layers = gpu_layers;
    }
    let model = cli.model.or_else(|| settings.model_path.clone());
    let require_model = || {
        model
            .clone()
            .ok_or_else(|| EngineError::InvalidParams("no model given (use --model)".to_string()))
    };

    match cli.command {
        Commands::Info { skip } => {
            for (key, value) in Engine::model_info(require_model()?, &skip)? {
                println!("{key}: {value}");
            }
            Ok(())
        }
        Commands::Complete {
            prompt,
            n_predict,
            temperature,
            seed,
            stop,
            session,
        } => {
            let session = session.map(|p| settings.session_path(p));
            let engine = Engine::with_llama()?;
            let id = load(&engine, settings.context_params(require_model()?))?;

            if let Some(path) = session.as_ref().filter(|p| p.exists()) {
                let loaded = engine.load_session(id, path)?.wait()?;
                info!("Restored {} tokens from {:?}", loaded.tokens_loaded, path);
            }

            let mut request = settings.completion_params(prompt);
            if let Some(n) = n_predict {
                request.n_predict = n;
            }
            if let Some(t) = temperature {
                request.sampling.temperature = t;
            }
            if seed.is_some() {
                request.sampling.seed = seed;
            }
            request.stop = stop;

            let stats = stream(&engine, id, request)?;
            eprintln!(
                "\n[{} prompt tokens ({} cached), {} generated, {:?}]",
                stats.prompt_tokens,
                stats.cached_prompt_tokens,
                stats.completion_tokens,
                stats.stop_reason
            );

            if let Some(path) = session {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let saved = engine
                    .save_session(id, &path, settings.max_session_size)?
                    .wait()?;
                info!("Saved {} tokens to {:?}", saved.tokens_saved, path);
            }
            Ok(())
        }
        Commands::Tokenize { text } => {
            let engine = Engine::with_llama()?;
            let id = load(&engine, settings.context_params(require_model()?))?;
            let tokens = engine.tokenize(id, text)?.wait()?;
            println!("{tokens:?}");
            Ok(())
        }
        Commands::Embed { text, normalize } => {
            let engine = Engine::with_llama()?;
            let params = settings
                .context_params(require_model()?)
                .with_embedding(true);
            let id = load(&engine, params)?;
            let embedding = engine
                .embedding(id, text, EmbeddingParams { normalize })?
                .wait()?;
            let values: Vec<String> = embedding.values.iter().map(|v| format!("{v:.6}")).collect();
            println!("[{}]", values.join(", "));
            Ok(())
        }
        Commands::Serve => serve(),
    }
}

/// Loads a context, logging progress
fn load(engine: &Engine, params: ctxrt::ContextParams) -> Result<ContextId, EngineError> {
    let info = engine.create_context(None, params)?.wait()?;
    if let Some(model) = &info.model {
        info!(
            "Loaded {} ({} params, trained on {} tokens)",
            model.architecture, model.n_params, model.n_ctx_train
        );
    }
    Ok(info.id)
}

fn stream(
    engine: &Engine,
    id: ContextId,
    request: ctxrt::CompletionParams,
) -> Result<CompletionStats, EngineError> {
    let mut handle = engine.complete(id, request)?;
    let mut stdout = io::stdout();
    while let Some(event) = handle.blocking_recv() {
        match event {
            CompletionEvent::Token(t) => {
                print!("{}", t.text);
                let _ = stdout.flush();
            }
            CompletionEvent::Done(stats) => return Ok(stats),
            CompletionEvent::Error(e) => return Err(e),
        }
    }
    Err(EngineError::WorkerGone("completion ended without a result".to_string()))
}

/// Writes streamed events as JSON lines
struct StdoutSink;

impl StdoutSink {
    fn emit(&self, value: serde_json::Value) {
        println!("{value}");
    }
}

impl EventSink for StdoutSink {
    fn on_progress(&self, context_id: ContextId, percent: u8) {
        self.emit(json!({"event": "progress", "context_id": context_id, "percent": percent}));
    }

    fn on_load_complete(&self, info: &ContextInfo) {
        self.emit(json!({"event": "loaded", "context": info}));
    }

    fn on_load_error(&self, context_id: ContextId, error: &EngineError) {
        self.emit(json!({
            "event": "load_error",
            "context_id": context_id,
            "kind": error.kind(),
            "message": error.to_string(),
        }));
    }

    fn on_token(&self, context_id: ContextId, token: &TokenEvent) {
        let mut value = json!({
            "event": "token",
            "context_id": context_id,
            "text": token.text,
            "is_partial": token.is_partial,
            "token_id": token.token_id,
        });
        if !token.probs.is_empty() {
            value["probs"] = json!(token.probs);
        }
        self.emit(value);
    }

    fn on_completion(&self, context_id: ContextId, stats: &CompletionStats) {
        self.emit(json!({"event": "completion", "context_id": context_id, "stats": stats}));
    }

    fn on_completion_error(&self, context_id: ContextId, error: &EngineError) {
        self.emit(json!({
            "event": "completion_error",
            "context_id": context_id,
            "kind": error.kind(),
            "message": error.to_string(),
        }));
    }

    fn on_response(&self, request_id: Option<u64>, response: &Response) {
        let mut value = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                json!({"type": "error", "kind": "io", "message": "response serialization failed"})
            }
        };
        if let (Some(id), Some(object)) = (request_id, value.as_object_mut()) {
            object.insert("request_id".to_string(), id.into());
        }
        self.emit(value);
    }
}

fn serve() -> Result<(), EngineError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ctxrt-serve")
        .build()
        .map_err(|e| EngineError::Io(format!("Failed to start runtime: {e}")))?;
    let entered = runtime.enter();
    let engine = Arc::new(Engine::with_llama()?);
    let dispatcher = Dispatcher::new(engine, Arc::new(StdoutSink));

    info!("Serving JSON requests on stdin");
    let mut in_flight = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        in_flight.retain(|task: &tokio::task::JoinHandle<()>| !task.is_finished());
        in_flight.extend(dispatcher.submit_json(&line));
    }

    // cancels generations so queued requests can drain
    let failures = dispatcher.engine().release_all();
    if !failures.is_empty() {
        tracing::warn!("{} context(s) failed to release", failures.len());
    }
    drop(entered);
    runtime.block_on(async {
        for task in in_flight {
            if let Err(e) = task.await {
                tracing::warn!("Request task failed: {}", e);
            }
        }
    });
    Ok(())
}
