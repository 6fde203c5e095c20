//! Request/response protocol
//!
//! A serde-friendly surface over [`Engine`] for hosts that talk JSON. Requests
//! are answered once; load progress and token streams are pushed to an
//! [`EventSink`] from a forwarding thread per stream.
//!
//! [`Dispatcher::submit`] runs each request as its own task, so a request
//! queued behind a generation never holds up the ones read after it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{EngineError, ErrorKind};
use crate::inference::{
    AdapterSpec, CompletionEvent, CompletionHandle, CompletionParams, CompletionStats, ContextId,
    ContextInfo, ContextParams, Embedding, EmbeddingParams, Engine, LoadEvent, LoadHandle,
    SessionLoaded, SessionSaved, Token, TokenEvent,
};
use crate::types::ChatMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    CreateContext {
        #[serde(default)]
        id: Option<ContextId>,
        params: ContextParams,
    },
    GetContext {
        context_id: ContextId,
    },
    Completion {
        context_id: ContextId,
        params: CompletionParams,
    },
    StopCompletion {
        context_id: ContextId,
    },
    Tokenize {
        context_id: ContextId,
        text: String,
    },
    Detokenize {
        context_id: ContextId,
        tokens: Vec<Token>,
    },
    FormatChat {
        context_id: ContextId,
        messages: Vec<ChatMessage>,
        #[serde(default)]
        template: Option<String>,
    },
    Embedding {
        context_id: ContextId,
        text: String,
        #[serde(default)]
        params: EmbeddingParams,
    },
    ApplyLoraAdapters {
        context_id: ContextId,
        adapters: Vec<AdapterSpec>,
    },
    RemoveLoraAdapters {
        context_id: ContextId,
    },
    GetLoadedLoraAdapters {
        context_id: ContextId,
    },
    SaveSession {
        context_id: ContextId,
        path: PathBuf,
        /// Unbounded when absent
        #[serde(default)]
        max_size: Option<u64>,
    },
    LoadSession {
        context_id: ContextId,
        path: PathBuf,
    },
    ReleaseContext {
        context_id: ContextId,
    },
    ReleaseAllContexts,
    ModelInfo {
        path: PathBuf,
        #[serde(default)]
        skip: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFailure {
    pub context_id: ContextId,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// The load continues in the background; its result goes to the sink
    ContextCreated { context_id: ContextId },
    Context { info: ContextInfo },
    /// Tokens and the final stats go to the sink
    CompletionStarted { context_id: ContextId },
    Ack,
    Tokens { tokens: Vec<Token> },
    Text { text: String },
    Embedding { embedding: Embedding },
    AdapterCount { count: usize },
    Adapters { adapters: Vec<AdapterSpec> },
    SessionSaved { saved: SessionSaved },
    SessionLoaded { loaded: SessionLoaded },
    Released { failures: Vec<ReleaseFailure> },
    ModelInfo { info: BTreeMap<String, String> },
    Error { kind: ErrorKind, message: String },
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

fn respond<T>(result: Result<T, EngineError>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => e.into(),
    }
}

/// Receiver of streamed events. Called from forwarding threads.
#[allow(unused_variables)]
pub trait EventSink: Send + Sync + 'static {
    fn on_progress(&self, context_id: ContextId, percent: u8) {}

    fn on_load_complete(&self, info: &ContextInfo) {}

    fn on_load_error(&self, context_id: ContextId, error: &EngineError) {}

    fn on_token(&self, context_id: ContextId, token: &TokenEvent) {}

    fn on_completion(&self, context_id: ContextId, stats: &CompletionStats) {}

    fn on_completion_error(&self, context_id: ContextId, error: &EngineError) {}

    /// Answer to a request passed to [`Dispatcher::submit`]
    fn on_response(&self, request_id: Option<u64>, response: &Response) {}
}

#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<Engine>,
    sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, sink: Arc<dyn EventSink>) -> Self {
        Self { engine, sink }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runs `request` on the current tokio runtime and hands the answer to
    /// the sink's `on_response`, tagged with `request_id`.
    pub fn submit(&self, request_id: Option<u64>, request: Request) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let response = dispatcher.handle(request).await;
            dispatcher.sink.on_response(request_id, &response);
        })
    }

    /// Parses a JSON request line and submits it.
    ///
    /// An optional top-level `request_id` is echoed with the answer. Malformed
    /// lines are answered right away and return `None`.
    pub fn submit_json(&self, line: &str) -> Option<JoinHandle<()>> {
        let mut value = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => value,
            Err(e) => {
                self.reject(None, e);
                return None;
            }
        };
        let request_id = value
            .as_object_mut()
            .and_then(|object| object.remove("request_id"))
            .and_then(|id| id.as_u64());
        match serde_json::from_value::<Request>(value) {
            Ok(request) => Some(self.submit(request_id, request)),
            Err(e) => {
                self.reject(request_id, e);
                None
            }
        }
    }

    fn reject(&self, request_id: Option<u64>, e: serde_json::Error) {
        let response = EngineError::InvalidParams(format!("Malformed request: {e}")).into();
        self.sink.on_response(request_id, &response);
    }

    /// Parses a JSON request and answers with a JSON response
    pub async fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<Request>(request) {
            Ok(request) => self.handle(request).await,
            Err(e) => EngineError::InvalidParams(format!("Malformed request: {e}")).into(),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize response: {}", e);
            r#"{"type":"error","kind":"io","message":"response serialization failed"}"#.to_string()
        })
    }

    /// Executes one request. Validation errors are answered directly.
    pub async fn handle(&self, request: Request) -> Response {
        let engine = &self.engine;
        match request {
            Request::CreateContext { id, params } => respond(
                engine
                    .create_context(id, params)
                    .and_then(|handle| self.forward_load(handle)),
                |context_id| Response::ContextCreated { context_id },
            ),
            Request::GetContext { context_id } => {
                respond(engine.context(context_id), |info| Response::Context { info })
            }
            Request::Completion { context_id, params } => respond(
                engine
                    .complete(context_id, params)
                    .and_then(|handle| self.forward_completion(handle)),
                |context_id| Response::CompletionStarted { context_id },
            ),
            Request::StopCompletion { context_id } => {
                respond(engine.stop_completion(context_id), |_| Response::Ack)
            }
            Request::Tokenize { context_id, text } => match engine.tokenize(context_id, text) {
                Ok(pending) => respond(pending.wait_async().await, |tokens| Response::Tokens {
                    tokens,
                }),
                Err(e) => e.into(),
            },
            Request::Detokenize { context_id, tokens } => {
                match engine.detokenize(context_id, tokens) {
                    Ok(pending) => respond(pending.wait_async().await, |text| Response::Text { text }),
                    Err(e) => e.into(),
                }
            }
            Request::FormatChat {
                context_id,
                messages,
                template,
            } => match engine.format_chat(context_id, messages, template) {
                Ok(pending) => respond(pending.wait_async().await, |text| Response::Text { text }),
                Err(e) => e.into(),
            },
            Request::Embedding {
                context_id,
                text,
                params,
            } => match engine.embedding(context_id, text, params) {
                Ok(pending) => respond(pending.wait_async().await, |embedding| {
                    Response::Embedding { embedding }
                }),
                Err(e) => e.into(),
            },
            Request::ApplyLoraAdapters {
                context_id,
                adapters,
            } => match engine.apply_adapters(context_id, adapters) {
                Ok(pending) => respond(pending.wait_async().await, |count| {
                    Response::AdapterCount { count }
                }),
                Err(e) => e.into(),
            },
            Request::RemoveLoraAdapters { context_id } => {
                match engine.remove_adapters(context_id) {
                    Ok(pending) => respond(pending.wait_async().await, |_| Response::Ack),
                    Err(e) => e.into(),
                }
            }
            Request::GetLoadedLoraAdapters { context_id } => {
                respond(engine.loaded_adapters(context_id), |adapters| {
                    Response::Adapters { adapters }
                })
            }
            Request::SaveSession {
                context_id,
                path,
                max_size,
            } => match engine.save_session(context_id, path, max_size.unwrap_or(u64::MAX)) {
                Ok(pending) => respond(pending.wait_async().await, |saved| {
                    Response::SessionSaved { saved }
                }),
                Err(e) => e.into(),
            },
            Request::LoadSession { context_id, path } => {
                match engine.load_session(context_id, path) {
                    Ok(pending) => respond(pending.wait_async().await, |loaded| {
                        Response::SessionLoaded { loaded }
                    }),
                    Err(e) => e.into(),
                }
            }
            Request::ReleaseContext { context_id } => {
                respond(engine.release_context(context_id), |_| Response::Ack)
            }
            Request::ReleaseAllContexts => Response::Released {
                failures: engine
                    .release_all()
                    .into_iter()
                    .map(|(context_id, e)| ReleaseFailure {
                        context_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    })
                    .collect(),
            },
            Request::ModelInfo { path, skip } => {
                respond(Engine::model_info(&path, &skip), |info| Response::ModelInfo {
                    info,
                })
            }
        }
    }

    fn forward_load(&self, mut handle: LoadHandle) -> Result<ContextId, EngineError> {
        let id = handle.context_id();
        let sink = self.sink.clone();
        spawn_forwarder(format!("ctxrt-load-{id}"), move || {
            while let Some(event) = handle.blocking_recv() {
                match event {
                    LoadEvent::Progress(percent) => sink.on_progress(id, percent),
                    LoadEvent::Complete(info) => sink.on_load_complete(&info),
                    LoadEvent::Error(e) => sink.on_load_error(id, &e),
                }
            }
        })?;
        Ok(id)
    }

    fn forward_completion(&self, mut handle: CompletionHandle) -> Result<ContextId, EngineError> {
        let id = handle.context_id();
        let sink = self.sink.clone();
        let cancel = handle.cancel_token();
        let spawned = spawn_forwarder(format!("ctxrt-stream-{id}"), move || {
            while let Some(event) = handle.blocking_recv() {
                match event {
                    CompletionEvent::Token(t) => sink.on_token(id, &t),
                    CompletionEvent::Done(stats) => sink.on_completion(id, &stats),
                    CompletionEvent::Error(e) => sink.on_completion_error(id, &e),
                }
            }
        });
        if spawned.is_err() {
            // nobody would see the stream
            cancel.cancel();
        }
        spawned.map(|_| id)
    }
}

fn spawn_forwarder(name: String, f: impl FnOnce() + Send + 'static) -> Result<(), EngineError> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map(|_| ())
        .map_err(|e| EngineError::WorkerGone(format!("Failed to spawn event forwarder: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::fake::FakeBackend;
    use crate::inference::gguf::testing;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Recorded {
        Progress(u8),
        Loaded(ContextId),
        LoadError(ErrorKind),
        Token(String, bool),
        Done(CompletionStats),
        Failed(ErrorKind),
        Response(Option<u64>, Response),
    }

    struct Recorder(Mutex<Sender<Recorded>>);

    impl Recorder {
        fn send(&self, r: Recorded) {
            let _ = self.0.lock().unwrap().send(r);
        }
    }

    impl EventSink for Recorder {
        fn on_progress(&self, _id: ContextId, percent: u8) {
            self.send(Recorded::Progress(percent));
        }
        fn on_load_complete(&self, info: &ContextInfo) {
            self.send(Recorded::Loaded(info.id));
        }
        fn on_load_error(&self, _id: ContextId, error: &EngineError) {
            self.send(Recorded::LoadError(error.kind()));
        }
        fn on_token(&self, _id: ContextId, token: &TokenEvent) {
            self.send(Recorded::Token(token.text.clone(), token.is_partial));
        }
        fn on_completion(&self, _id: ContextId, stats: &CompletionStats) {
            self.send(Recorded::Done(stats.clone()));
        }
        fn on_completion_error(&self, _id: ContextId, error: &EngineError) {
            self.send(Recorded::Failed(error.kind()));
        }
        fn on_response(&self, request_id: Option<u64>, response: &Response) {
            self.send(Recorded::Response(request_id, response.clone()));
        }
    }

    fn dispatcher(backend: FakeBackend) -> (Dispatcher, Receiver<Recorded>) {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::new(Engine::new(Arc::new(backend)));
        (Dispatcher::new(engine, Arc::new(Recorder(Mutex::new(tx)))), rx)
    }

    /// Collects events up to and including the first terminal one
    fn until_terminal(rx: &Receiver<Recorded>) -> Vec<Recorded> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            let terminal = !matches!(
                event,
                Recorded::Progress(_) | Recorded::Token(..) | Recorded::Response(..)
            );
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    #[test]
    fn test_request_json_shape() {
        let request: Request = serde_json::from_str(
            r#"{"op":"completion","context_id":2,"params":{"prompt":"Hi","n_predict":8}}"#,
        )
        .unwrap();
        match request {
            Request::Completion { context_id, params } => {
                assert_eq!(context_id, 2);
                assert_eq!(params.n_predict, 8);
            }
            other => panic!("unexpected {other:?}"),
        }

        let request: Request = serde_json::from_str(r#"{"op":"releaseAllContexts"}"#).unwrap();
        assert_eq!(request, Request::ReleaseAllContexts);

        let json = serde_json::to_value(Response::from(EngineError::ContextNotFound(4))).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "context_not_found");
    }

    #[tokio::test]
    async fn test_load_and_complete_through_sink() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::model(dir.path(), "m.gguf", "llama");
        let (dispatcher, rx) = dispatcher(FakeBackend::script("Hi!"));

        let response = dispatcher
            .handle(Request::CreateContext {
                id: Some(1),
                params: ContextParams::new(&model),
            })
            .await;
        assert_eq!(response, Response::ContextCreated { context_id: 1 });
        let events = until_terminal(&rx);
        assert_eq!(events.last(), Some(&Recorded::Loaded(1)));
        assert!(events.contains(&Recorded::Progress(100)));

        let response = dispatcher
            .handle(Request::Completion {
                context_id: 1,
                params: CompletionParams::new("Hello"),
            })
            .await;
        assert_eq!(response, Response::CompletionStarted { context_id: 1 });
        let events = until_terminal(&rx);
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                Recorded::Token(t, _) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hi!");
        match events.last() {
            Some(Recorded::Done(stats)) => assert_eq!(stats.text, "Hi!"),
            other => panic!("unexpected {other:?}"),
        }

        let response = dispatcher
            .handle(Request::Tokenize {
                context_id: 1,
                text: "ab".into(),
            })
            .await;
        assert!(matches!(response, Response::Tokens { ref tokens } if tokens.len() == 2));

        let response = dispatcher
            .handle(Request::GetLoadedLoraAdapters { context_id: 1 })
            .await;
        assert_eq!(response, Response::Adapters { adapters: vec![] });

        assert_eq!(
            dispatcher.handle(Request::ReleaseContext { context_id: 1 }).await,
            Response::Ack
        );
        let response = dispatcher.handle(Request::GetContext { context_id: 1 }).await;
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::ContextNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_load_failure_reaches_sink() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("bad.gguf");
        testing::write(
            &model,
            &[
                ("general.architecture", crate::inference::gguf::GgufValue::String("llama".into())),
                ("fake.fail_load", crate::inference::gguf::GgufValue::Bool(true)),
            ],
        );
        let (dispatcher, rx) = dispatcher(FakeBackend::default());

        let response = dispatcher
            .handle(Request::CreateContext {
                id: None,
                params: ContextParams::new(&model),
            })
            .await;
        assert!(matches!(response, Response::ContextCreated { .. }));
        let events = until_terminal(&rx);
        assert_eq!(
            events.last(),
            Some(&Recorded::LoadError(ErrorKind::ModelLoadFailed))
        );
    }

    #[tokio::test]
    async fn test_json_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::model(dir.path(), "m.gguf", "llama");
        let (dispatcher, _rx) = dispatcher(FakeBackend::default());

        let reply: serde_json::Value =
            serde_json::from_str(&dispatcher.handle_json("{ nope").await).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["kind"], "invalid_params");

        let request = serde_json::json!({
            "op": "modelInfo",
            "path": model,
            "skip": ["general.architecture"],
        });
        let reply: serde_json::Value =
            serde_json::from_str(&dispatcher.handle_json(&request.to_string()).await).unwrap();
        assert_eq!(reply["type"], "modelInfo");
        assert!(reply["info"].get("general.architecture").is_none());
        assert!(reply["info"].get("version").is_some());

        let reply: serde_json::Value = serde_json::from_str(
            &dispatcher
                .handle_json(r#"{"op":"releaseAllContexts"}"#)
                .await,
        )
        .unwrap();
        assert_eq!(reply["type"], "released");
        assert_eq!(reply["failures"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_busy_completion_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::model(dir.path(), "m.gguf", "llama");
        let (dispatcher, rx) = dispatcher(FakeBackend::endless(Duration::from_millis(5)));
        dispatcher
            .handle(Request::CreateContext {
                id: Some(1),
                params: ContextParams::new(&model),
            })
            .await;
        until_terminal(&rx);

        let start = |prompt: &str| Request::Completion {
            context_id: 1,
            params: CompletionParams::new(prompt),
        };
        assert!(matches!(
            dispatcher.handle(start("one")).await,
            Response::CompletionStarted { .. }
        ));
        assert!(matches!(
            dispatcher.handle(start("two")).await,
            Response::Error {
                kind: ErrorKind::ContextBusy,
                ..
            }
        ));

        dispatcher.handle(Request::StopCompletion { context_id: 1 }).await;
        match until_terminal(&rx).last() {
            Some(Recorded::Done(stats)) => {
                assert_eq!(stats.stop_reason, crate::inference::StopReason::Cancelled)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_after_queued_request_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::model(dir.path(), "m.gguf", "llama");
        let (dispatcher, rx) = dispatcher(FakeBackend::endless(Duration::from_millis(5)));
        dispatcher
            .handle(Request::CreateContext {
                id: Some(1),
                params: ContextParams::new(&model),
            })
            .await;
        until_terminal(&rx);

        let started = dispatcher.submit(
            Some(1),
            Request::Completion {
                context_id: 1,
                params: CompletionParams::new("go"),
            },
        );
        started.await.unwrap();

        // queued on the worker behind the endless generation
        let tokenized = dispatcher.submit(
            Some(2),
            Request::Tokenize {
                context_id: 1,
                text: "ab".into(),
            },
        );
        let stopped = dispatcher.submit(Some(3), Request::StopCompletion { context_id: 1 });
        stopped.await.unwrap();
        tokenized.await.unwrap();

        let mut done = None;
        let mut responses = BTreeMap::new();
        while done.is_none() || responses.len() < 3 {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                Recorded::Done(stats) => done = Some(stats),
                Recorded::Response(Some(id), response) => {
                    responses.insert(id, response);
                }
                _ => {}
            }
        }
        assert_eq!(done.unwrap().stop_reason, crate::inference::StopReason::Cancelled);
        assert_eq!(responses[&1], Response::CompletionStarted { context_id: 1 });
        assert!(matches!(responses[&2], Response::Tokens { ref tokens } if tokens.len() == 2));
        assert_eq!(responses[&3], Response::Ack);
    }

    #[tokio::test]
    async fn test_submit_json_echoes_request_id() {
        let (dispatcher, rx) = dispatcher(FakeBackend::default());

        assert!(dispatcher.submit_json("{ nope").is_none());
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            Recorded::Response(None, Response::Error { kind, .. }) => {
                assert_eq!(kind, ErrorKind::InvalidParams)
            }
            other => panic!("unexpected {other:?}"),
        }

        let task = dispatcher
            .submit_json(r#"{"op":"getContext","context_id":9,"request_id":41}"#)
            .unwrap();
        task.await.unwrap();
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            Recorded::Response(Some(41), Response::Error { kind, .. }) => {
                assert_eq!(kind, ErrorKind::ContextNotFound)
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(dispatcher
            .submit_json(r#"{"op":"noSuchOp","request_id":42}"#)
            .is_none());
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            Recorded::Response(Some(42), Response::Error { .. })
        ));
    }
}
