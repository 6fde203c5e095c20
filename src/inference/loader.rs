//! Load pipeline events
//!
//! A load reports monotonic progress followed by exactly one terminal event.

use std::cell::{Cell, RefCell};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::EngineError;
use crate::inference::gguf::validate_gguf;
use crate::inference::params::ContextParams;
use crate::inference::registry::ContextInfo;
use crate::inference::ContextId;

/// Event emitted while a context loads
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    /// Percent complete, never decreasing
    Progress(u8),
    /// The context is ready
    Complete(ContextInfo),
    /// The load failed; the id is free again
    Error(EngineError),
}

impl LoadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadEvent::Progress(_))
    }
}

/// Receiving end of one load
pub struct LoadHandle {
    context_id: ContextId,
    events: UnboundedReceiver<LoadEvent>,
}

impl LoadHandle {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub async fn recv(&mut self) -> Option<LoadEvent> {
        self.events.recv().await
    }

    /// Blocking receive. Must not be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<LoadEvent> {
        self.events.blocking_recv()
    }

    /// Blocks until the terminal event, discarding progress
    pub fn wait(mut self) -> Result<ContextInfo, EngineError> {
        while let Some(event) = self.events.blocking_recv() {
            match event {
                LoadEvent::Progress(_) => {}
                LoadEvent::Complete(info) => return Ok(info),
                LoadEvent::Error(e) => return Err(e),
            }
        }
        Err(self.closed())
    }

    pub async fn wait_async(mut self) -> Result<ContextInfo, EngineError> {
        while let Some(event) = self.events.recv().await {
            match event {
                LoadEvent::Progress(_) => {}
                LoadEvent::Complete(info) => return Ok(info),
                LoadEvent::Error(e) => return Err(e),
            }
        }
        Err(self.closed())
    }

    fn closed(&self) -> EngineError {
        EngineError::WorkerGone(format!(
            "load of context {} ended without a result",
            self.context_id
        ))
    }
}

/// Sending end of a load, owned by the context worker.
///
/// Progress is deduplicated and never regresses. The first terminal event
/// closes the reporter; dropping it without one reports a failure.
pub(crate) struct LoadReporter {
    context_id: ContextId,
    last: Cell<Option<u8>>,
    tx: RefCell<Option<UnboundedSender<LoadEvent>>>,
}

pub(crate) fn channel(context_id: ContextId) -> (LoadReporter, LoadHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LoadReporter {
            context_id,
            last: Cell::new(None),
            tx: RefCell::new(Some(tx)),
        },
        LoadHandle {
            context_id,
            events: rx,
        },
    )
}

impl LoadReporter {
    /// Reports a load fraction in `0.0..=1.0`
    pub fn progress(&self, fraction: f32) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction };
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        self.percent(percent);
    }

    fn percent(&self, percent: u8) {
        if matches!(self.last.get(), Some(last) if percent <= last) {
            return;
        }
        if let Some(tx) = self.tx.borrow().as_ref() {
            self.last.set(Some(percent));
            let _ = tx.send(LoadEvent::Progress(percent));
        }
    }

    pub fn complete(&self, info: ContextInfo) {
        self.percent(100);
        self.finish(LoadEvent::Complete(info));
    }

    pub fn fail(&self, error: EngineError) {
        self.finish(LoadEvent::Error(error));
    }

    fn finish(&self, event: LoadEvent) {
        if let Some(tx) = self.tx.borrow_mut().take() {
            let _ = tx.send(event);
        }
    }
}

impl Drop for LoadReporter {
    fn drop(&mut self) {
        self.finish(LoadEvent::Error(EngineError::ModelLoadFailed(format!(
            "load of context {} aborted",
            self.context_id
        ))));
    }
}

/// Checks run on the caller's thread before a worker is spawned
pub(crate) fn prevalidate(params: &ContextParams) -> Result<(), EngineError> {
    params.validate()?;
    if !params.model_path.is_file() {
        return Err(EngineError::ModelLoadFailed(format!(
            "model file not found: {}",
            params.model_path.display()
        )));
    }
    let header = validate_gguf(&params.model_path)?;
    tracing::debug!(
        "GGUF validation passed for {:?} (v{}, {} tensors)",
        params.model_path,
        header.version,
        header.tensor_count
    );
    Ok(())
}
