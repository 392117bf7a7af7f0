//! Provider workers and their supervisor.
//!
//! Each enabled provider gets a [`ProviderWorker`] that keeps its catalog in
//! sync with the backend; the [`Poller`] starts, stops and restarts them as
//! provider definitions change.

pub mod poller;
pub mod worker;

pub use poller::{Poller, PollerError, ProviderStatus};
pub use worker::{ProviderWorker, WorkerConfig, WorkerError, WorkerHandle, WorkerState, WorkerStatus};
