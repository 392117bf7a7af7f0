//! Supervisor of provider workers.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use gateway_core::model::Provider;
use gateway_core::store::StoreError;
use gateway_core::{ConnectorRegistry, ErrorKind, Library, Searcher};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::worker::{Command, ProviderWorker, WorkerConfig, WorkerError, WorkerHandle, WorkerStatus};

#[derive(Debug, Error)]
pub enum PollerError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PollerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollerError::Worker(e) => e.kind(),
            PollerError::Store(e) => e.kind(),
        }
    }
}

/// What the poller holds for a provider id.
#[derive(Debug)]
enum Slot {
    Running(WorkerHandle),
    /// Disabled provider; keeps it from being started until it is updated.
    Disabled,
    /// The worker could not be built.
    Failed(String),
}

/// Externally visible state of a provider's slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderStatus {
    Running(WorkerStatus),
    Disabled,
    Failed(String),
}

pub struct Poller {
    searcher: Arc<Searcher>,
    library: Library,
    registry: Arc<ConnectorRegistry>,
    config: WorkerConfig,
    workers: Mutex<HashMap<Uuid, Slot>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("workers", &self.workers.lock().len()).finish()
    }
}

impl Poller {
    pub fn new(
        searcher: Arc<Searcher>,
        library: Library,
        registry: Arc<ConnectorRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self { searcher, library, registry, config, workers: Mutex::new(HashMap::new()) }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Starts a worker for every stored provider, then re-sorts the searcher.
    pub async fn start(&self) -> Result<usize, PollerError> {
        let providers = self.library.all::<Provider>().await?;
        let mut started = 0;
        for provider in &providers {
            match self.start_provider(provider) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!(provider = %provider.item.name, error = %e, "unable to start provider"),
            }
        }
        self.searcher.apply_priorities();
        info!(started, total = providers.len(), "poller started");
        Ok(started)
    }

    /// Starts `provider` unless its id already has a slot. Returns whether a
    /// worker was spawned.
    pub fn start_provider(&self, provider: &Provider) -> Result<bool, WorkerError> {
        let id = provider.item.id;
        let mut workers = self.workers.lock();
        if workers.contains_key(&id) {
            return Ok(false);
        }
        if !provider.enabled {
            info!(provider = %provider.item.name, "provider disabled, not starting");
            workers.insert(id, Slot::Disabled);
            return Ok(false);
        }

        match ProviderWorker::build(provider, &self.registry, self.searcher.clone(), self.config.clone()) {
            Ok(worker) => {
                workers.insert(id, Slot::Running(worker.spawn()));
                Ok(true)
            }
            Err(e) => {
                workers.insert(id, Slot::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stops the worker of `id`. With `restart`, the latest stored definition
    /// is started again; a provider deleted meanwhile stays stopped.
    pub async fn stop_provider(&self, id: Uuid, restart: bool) -> Result<(), PollerError> {
        let slot = self.workers.lock().remove(&id);
        if let Some(Slot::Running(handle)) = slot {
            handle.shutdown().await;
        }
        if !restart {
            return Ok(());
        }

        let provider = match self.library.get::<Provider>(id).await {
            Ok(p) => p,
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.start_provider(&provider)?;
        self.searcher.apply_priorities();
        Ok(())
    }

    /// Sends a refresh to every running worker. Returns how many accepted it.
    pub async fn refresh(&self) -> usize {
        let senders: Vec<_> = self
            .workers
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(handle) => Some(handle.commands()),
                _ => None,
            })
            .collect();
        let sent = join_all(senders.iter().map(|tx| tx.send(Command::Refresh))).await;
        let accepted = sent.iter().filter(|r| r.is_ok()).count();
        info!(workers = accepted, "refresh broadcast");
        accepted
    }

    /// Sends a refresh to one provider's worker. False when it is not running.
    pub async fn refresh_provider(&self, id: Uuid) -> bool {
        let sender = match self.workers.lock().get(&id) {
            Some(Slot::Running(handle)) => handle.commands(),
            _ => return false,
        };
        sender.send(Command::Refresh).await.is_ok()
    }

    pub fn status(&self, id: Uuid) -> Option<ProviderStatus> {
        self.workers.lock().get(&id).map(|slot| match slot {
            Slot::Running(handle) => ProviderStatus::Running(handle.status()),
            Slot::Disabled => ProviderStatus::Disabled,
            Slot::Failed(e) => ProviderStatus::Failed(e.clone()),
        })
    }

    /// Error recorded when the provider's worker could not be built.
    pub fn worker_error(&self, id: Uuid) -> Option<String> {
        match self.workers.lock().get(&id) {
            Some(Slot::Failed(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn running(&self) -> usize {
        self.workers.lock().values().filter(|s| matches!(s, Slot::Running(_))).count()
    }

    /// Stops every worker and waits for them.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .workers
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Running(handle) => Some(handle),
                _ => None,
            })
            .collect();
        info!(workers = handles.len(), "stopping provider workers");
        join_all(handles.into_iter().map(WorkerHandle::shutdown)).await;
    }
}
