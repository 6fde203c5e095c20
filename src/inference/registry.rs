//! Context registry
//!
//! Maps context ids to slots. The map is sharded (`DashMap`); status
//! transitions of a single context are serialized by the slot's own mutex,
//! which is never held while the map is locked.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::inference::backend::ModelDescriptor;
use crate::inference::params::{AdapterSpec, ContextParams};
use crate::inference::streaming::CancellationToken;
use crate::inference::worker::WorkerCommand;

/// Context identifier
pub type ContextId = u32;

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Loading,
    Ready,
    Generating,
    Released,
}

/// Snapshot of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub status: ContextStatus,
    pub params: ContextParams,
    /// Known once loading finished
    pub model: Option<ModelDescriptor>,
    pub adapters: Vec<AdapterSpec>,
}

/// What a command needs from the slot's state before it may be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Requirement {
    /// Loaded; queued behind a running generation if there is one
    Loaded,
    /// Loaded and not generating
    Idle,
}

struct SlotState {
    status: ContextStatus,
    model: Option<ModelDescriptor>,
    adapters: Vec<AdapterSpec>,
    cancel: Option<CancellationToken>,
    commands: Option<Sender<WorkerCommand>>,
    worker: Option<JoinHandle<()>>,
}

pub(crate) struct ContextSlot {
    pub id: ContextId,
    pub params: ContextParams,
    state: Mutex<SlotState>,
}

impl ContextSlot {
    fn new(id: ContextId, params: ContextParams) -> Self {
        Self {
            id,
            params,
            state: Mutex::new(SlotState {
                status: ContextStatus::Loading,
                model: None,
                adapters: Vec::new(),
                cancel: None,
                commands: None,
                worker: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn info(&self) -> ContextInfo {
        let state = self.lock();
        ContextInfo {
            id: self.id,
            status: state.status,
            params: self.params.clone(),
            model: state.model.clone(),
            adapters: state.adapters.clone(),
        }
    }

    pub fn status(&self) -> ContextStatus {
        self.lock().status
    }

    pub fn adapters(&self) -> Vec<AdapterSpec> {
        self.lock().adapters.clone()
    }

    pub fn attach_commands(&self, commands: Sender<WorkerCommand>) {
        self.lock().commands = Some(commands);
    }

    /// Spawns the worker and stores its handle under the slot lock, so a
    /// concurrent `release` always finds the handle to join.
    pub fn spawn_worker(
        &self,
        spawn: impl FnOnce() -> Result<JoinHandle<()>, EngineError>,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.worker = Some(spawn()?);
        Ok(())
    }

    /// Moves a loading context to `Ready`. Returns false if it was released meanwhile.
    pub fn mark_ready(&self, model: ModelDescriptor) -> bool {
        let mut state = self.lock();
        if state.status != ContextStatus::Loading {
            return false;
        }
        state.status = ContextStatus::Ready;
        state.model = Some(model);
        true
    }

    pub fn mark_released(&self) {
        self.lock().status = ContextStatus::Released;
    }

    fn check(&self, state: &SlotState, requirement: Requirement) -> Result<(), EngineError> {
        match (state.status, requirement) {
            (ContextStatus::Released, _) => Err(EngineError::ContextNotFound(self.id)),
            (ContextStatus::Loading, _) => Err(EngineError::busy(self.id, "context is still loading")),
            (ContextStatus::Generating, Requirement::Idle) => {
                Err(EngineError::busy(self.id, "generation in progress"))
            }
            _ => Ok(()),
        }
    }

    fn send(&self, state: &SlotState, command: WorkerCommand) -> Result<(), EngineError> {
        let commands = state
            .commands
            .as_ref()
            .ok_or_else(|| EngineError::WorkerGone(format!("context {} has no worker", self.id)))?;
        commands
            .send(command)
            .map_err(|_| EngineError::WorkerGone(format!("worker of context {} exited", self.id)))
    }

    /// Queues `command` if the slot satisfies `requirement`; check and send
    /// happen under one lock.
    pub fn dispatch(&self, requirement: Requirement, command: WorkerCommand) -> Result<(), EngineError> {
        let state = self.lock();
        self.check(&state, requirement)?;
        self.send(&state, command)
    }

    /// Claims the slot for a generation and queues the command built from the
    /// fresh cancellation token.
    pub fn begin_generation(
        &self,
        command: impl FnOnce(CancellationToken) -> WorkerCommand,
    ) -> Result<CancellationToken, EngineError> {
        let mut state = self.lock();
        self.check(&state, Requirement::Idle)?;

        let cancel = CancellationToken::new();
        self.send(&state, command(cancel.clone()))?;
        state.status = ContextStatus::Generating;
        state.cancel = Some(cancel.clone());
        Ok(cancel)
    }

    /// Returns the slot to `Ready` after a generation
    pub fn finish_generation(&self) {
        let mut state = self.lock();
        if state.status == ContextStatus::Generating {
            state.status = ContextStatus::Ready;
        }
        state.cancel = None;
    }

    /// Raises the in-flight generation's flag; a no-op when idle
    pub fn stop(&self) -> Result<(), EngineError> {
        let state = self.lock();
        if state.status == ContextStatus::Released {
            return Err(EngineError::ContextNotFound(self.id));
        }
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        Ok(())
    }

    pub fn set_adapters(&self, adapters: Vec<AdapterSpec>) {
        self.lock().adapters = adapters;
    }
}

/// Thread-safe map of live contexts
pub struct ContextRegistry {
    slots: DashMap<ContextId, Arc<ContextSlot>>,
    retired: DashSet<ContextId>,
    next_id: AtomicU32,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            retired: DashSet::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Reserves an id for a new context in `Loading` state
    pub(crate) fn reserve(
        &self,
        id: Option<ContextId>,
        params: ContextParams,
    ) -> Result<Arc<ContextSlot>, EngineError> {
        params.validate()?;

        match id {
            Some(id) => self.insert(id, params),
            None => loop {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                if id == ContextId::MAX {
                    return Err(EngineError::InvalidParams(
                        "context ids exhausted".to_string(),
                    ));
                }
                match self.insert(id, params.clone()) {
                    Err(EngineError::DuplicateContext(_)) => continue,
                    other => return other,
                }
            },
        }
    }

    fn insert(&self, id: ContextId, params: ContextParams) -> Result<Arc<ContextSlot>, EngineError> {
        if self.retired.contains(&id) {
            return Err(EngineError::DuplicateContext(id));
        }
        match self.slots.entry(id) {
            Entry::Occupied(_) => Err(EngineError::DuplicateContext(id)),
            Entry::Vacant(entry) => {
                let slot = Arc::new(ContextSlot::new(id, params));
                entry.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Drops a reservation whose load failed; the id may be used again
    pub(crate) fn forget(&self, id: ContextId) {
        self.slots.remove(&id);
    }

    pub(crate) fn slot(&self, id: ContextId) -> Result<Arc<ContextSlot>, EngineError> {
        let slot = self
            .slots
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::ContextNotFound(id))?;
        if slot.status() == ContextStatus::Released {
            return Err(EngineError::ContextNotFound(id));
        }
        Ok(slot)
    }

    pub fn get(&self, id: ContextId) -> Result<ContextInfo, EngineError> {
        self.slot(id).map(|s| s.info())
    }

    /// Ids of every context that is loading or live
    pub fn ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Releases a context: cancels its generation, stops and joins its worker
    /// and retires the id.
    ///
    /// Called from the context's own worker thread, the join is skipped and
    /// the worker exits after its current command.
    pub fn release(&self, id: ContextId) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::ContextNotFound(id))?;

        let (commands, worker) = {
            let mut state = slot.lock();
            if state.status == ContextStatus::Released {
                return Err(EngineError::ContextNotFound(id));
            }
            state.status = ContextStatus::Released;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            (state.commands.take(), state.worker.take())
        };

        self.retired.insert(id);
        self.slots.remove(&id);

        if let Some(commands) = commands {
            let _ = commands.send(WorkerCommand::Shutdown);
        }
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                tracing::debug!("Release of context {} from its own worker, not joining", id);
            } else if worker.join().is_err() {
                tracing::error!("Worker of context {} panicked", id);
            }
        }

        tracing::info!("Context {} released", id);
        Ok(())
    }

    /// Releases every context, collecting failures instead of stopping at one
    pub fn release_all(&self) -> Vec<(ContextId, EngineError)> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.release(id).err().map(|e| (id, e)))
            .collect()
    }
}
