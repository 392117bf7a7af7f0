//! One worker per enabled provider.
//!
//! The worker owns the provider's connector, filter chain and catalog. Its
//! event loop multiplexes commands, the refresh ticker and the records of
//! the refresh in flight. Connector I/O runs in a spawned task; records come
//! back over a channel and are inserted on the loop itself, so nothing is
//! inserted after the worker has begun stopping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gateway_core::filter::FilterError;
use gateway_core::model::Provider;
use gateway_core::{Catalog, Connector, ConnectorError, ConnectorRegistry, ErrorKind, FilterChain, Record, Searcher};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 8;
const RECORD_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Connector(e) => e.kind(),
            WorkerError::Filter(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Refresh,
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Starting,
    Running,
    Refreshing,
    Stopping,
    Stopped,
}

/// Published by the worker after every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Refreshes completed, successful or not.
    pub refreshes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory holding `state/<provider>.catalog` dumps.
    pub cache_path: Option<PathBuf>,
    /// How long a stopping worker waits for its refresh in flight.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { cache_path: None, shutdown_grace: Duration::from_secs(10) }
    }
}

// ------------------------------------------------------------------ //
//  Handle                                                             //
// ------------------------------------------------------------------ //

/// The poller's side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<WorkerStatus>,
    catalog: Arc<Catalog>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Watch channel over the worker status.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// Returns false when the worker is already gone.
    pub async fn refresh(&self) -> bool {
        self.commands.send(Command::Refresh).await.is_ok()
    }

    /// Asks the worker to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!(provider = %self.name, error = %e, "worker task failed");
        }
    }
}

// ------------------------------------------------------------------ //
//  Worker                                                             //
// ------------------------------------------------------------------ //

struct InFlight {
    generation: u64,
    records: mpsc::Receiver<Record>,
    task: JoinHandle<Result<(), ConnectorError>>,
}

pub struct ProviderWorker {
    name: String,
    connector: Arc<dyn Connector>,
    chain: Arc<FilterChain>,
    catalog: Arc<Catalog>,
    searcher: Arc<Searcher>,
    interval: Option<Duration>,
    config: WorkerConfig,
    status: watch::Sender<WorkerStatus>,
}

impl ProviderWorker {
    /// Builds the connector and filter chain of `provider`.
    pub fn build(
        provider: &Provider,
        registry: &ConnectorRegistry,
        searcher: Arc<Searcher>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let name = provider.item.name.clone();
        let connector = registry.create(&provider.connector.kind, &name, &provider.connector.settings)?;
        let chain = FilterChain::new(&provider.filters)?;

        let catalog = Arc::new(Catalog::new(name.clone(), connector.clone()));
        catalog.set_priority(provider.priority);

        let interval = u64::try_from(provider.refresh_interval)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            name,
            connector,
            chain: Arc::new(chain),
            catalog,
            searcher,
            interval,
            config,
            status: watch::Sender::new(WorkerStatus::default()),
        })
    }

    pub fn spawn(self) -> WorkerHandle {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle_name = self.name.clone();
        let status = self.status.subscribe();
        let catalog = self.catalog.clone();
        let task = tokio::spawn(self.run(rx));
        WorkerHandle { name: handle_name, commands, status, catalog, task }
    }

    fn cache_file(&self) -> Option<PathBuf> {
        self.config
            .cache_path
            .as_ref()
            .map(|dir| dir.join("state").join(format!("{}.catalog", self.name)))
    }

    fn set_state(&self, state: WorkerState) {
        self.status.send_modify(|s| s.state = state);
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        info!(provider = %self.name, "starting provider worker");

        if let Some(path) = self.cache_file() {
            match self.catalog.restore(&path).await {
                Ok(n) => info!(provider = %self.name, records = n, "restored catalog state"),
                Err(e) => debug!(provider = %self.name, error = %e, "no catalog state restored"),
            }
        }
        self.searcher.register(self.catalog.clone());

        let mut ticker = self.interval.map(|period| {
            let mut t = tokio::time::interval_at(Instant::now() + period, period);
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        });

        let mut in_flight = Some(self.start_refresh());
        self.set_state(WorkerState::Refreshing);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Refresh) => {
                        if in_flight.is_some() {
                            debug!(provider = %self.name, "refresh already in progress, skipping");
                        } else {
                            in_flight = Some(self.start_refresh());
                            self.set_state(WorkerState::Refreshing);
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = tick(&mut ticker) => {
                    if in_flight.is_none() {
                        debug!(provider = %self.name, "periodic refresh");
                        in_flight = Some(self.start_refresh());
                        self.set_state(WorkerState::Refreshing);
                    }
                }
                record = next_record(&mut in_flight) => match record {
                    Some(record) => self.catalog.insert(&record),
                    None => {
                        if let Some(done) = in_flight.take() {
                            self.finish_refresh(done.generation, done.task.await);
                        }
                        self.set_state(WorkerState::Running);
                    }
                },
            }
        }

        self.stop(in_flight).await;
    }

    /// Spawns the connector refresh, piping its records through the filter
    /// chain into a channel drained by the event loop.
    fn start_refresh(&self) -> InFlight {
        let generation = self.catalog.begin_generation();
        let (out_tx, records) = mpsc::channel(RECORD_BUFFER);
        let connector = self.connector.clone();
        let chain = self.chain.clone();

        let task = tokio::spawn(async move {
            let (sink, mut raw) = mpsc::channel::<Record>(RECORD_BUFFER);
            let forward = async move {
                while let Some(record) = raw.recv().await {
                    if let Some(record) = chain.apply(&record) {
                        if out_tx.send(record).await.is_err() {
                            break;
                        }
                    }
                }
            };
            let (result, ()) = tokio::join!(connector.refresh(sink), forward);
            result
        });

        InFlight { generation, records, task }
    }

    fn finish_refresh(&self, generation: u64, outcome: Result<Result<(), ConnectorError>, JoinError>) {
        let error = match outcome {
            Ok(Ok(())) => {
                let pruned = self.catalog.prune_before(generation);
                let counts = self.catalog.counts();
                info!(
                    provider = %self.name,
                    origins = counts.origins,
                    sources = counts.sources,
                    metrics = counts.metrics,
                    pruned,
                    "refresh completed"
                );
                None
            }
            Ok(Err(e)) => {
                warn!(provider = %self.name, error = %e, "refresh failed");
                Some(e.to_string())
            }
            Err(e) if e.is_panic() => {
                error!(provider = %self.name, error = %e, "refresh panicked");
                Some(ConnectorError::Panicked(e.to_string()).to_string())
            }
            Err(e) => {
                warn!(provider = %self.name, error = %e, "refresh cancelled");
                Some(e.to_string())
            }
        };
        self.status.send_modify(|s| {
            s.refreshes += 1;
            s.last_refresh = Some(Utc::now());
            s.last_error = error;
        });
    }

    async fn stop(self, in_flight: Option<InFlight>) {
        self.set_state(WorkerState::Stopping);
        self.searcher.unregister(&self.catalog);

        if let Some(mut flight) = in_flight {
            let abort = flight.task.abort_handle();
            let drain = async {
                while let Some(record) = flight.records.recv().await {
                    self.catalog.insert(&record);
                }
                flight.task.await
            };
            match tokio::time::timeout(self.config.shutdown_grace, drain).await {
                Ok(outcome) => self.finish_refresh(flight.generation, outcome),
                Err(_) => {
                    warn!(provider = %self.name, grace = ?self.config.shutdown_grace, "refresh still running, aborting");
                    abort.abort();
                }
            }
        }

        if let Some(path) = self.cache_file() {
            match self.catalog.dump(&path).await {
                Ok(n) => debug!(provider = %self.name, records = n, path = %path.display(), "dumped catalog state"),
                Err(e) => warn!(provider = %self.name, error = %e, "unable to dump catalog state"),
            }
        }

        self.set_state(WorkerState::Stopped);
        info!(provider = %self.name, "provider worker stopped");
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_record(in_flight: &mut Option<InFlight>) -> Option<Record> {
    match in_flight {
        Some(flight) => flight.records.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::connector::{RecordSink, Settings};
    use gateway_core::filter::{FilterAction, FilterRule, FilterTarget};
    use gateway_core::{PointsQuery, Series};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Connector serving a mutable record list.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub name: String,
        pub records: Mutex<Vec<Record>>,
        pub fail: AtomicBool,
        pub panic: AtomicBool,
        pub delay: Mutex<Duration>,
        pub calls: AtomicUsize,
    }

    impl FakeConnector {
        pub(crate) fn new(name: &str, metrics: &[(&str, &str)]) -> Arc<Self> {
            let records = metrics.iter().map(|(s, m)| Record::new(name, *s, *m)).collect();
            Arc::new(Self { name: name.to_string(), records: Mutex::new(records), ..Default::default() })
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn refresh(&self, sink: RecordSink) -> Result<(), ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.panic.load(Ordering::SeqCst) {
                panic!("connector exploded");
            }
            let records = self.records.lock().clone();
            for record in records {
                let _ = sink.send(record).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectorError::Backend("unreachable".into()));
            }
            Ok(())
        }

        async fn points(&self, query: &PointsQuery) -> Result<Vec<Series>, ConnectorError> {
            Ok(vec![Series::default(); query.metrics.len()])
        }
    }

    pub(crate) fn registry_with(connector: Arc<FakeConnector>) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register("fake", move |_name, _settings| Ok(connector.clone() as Arc<dyn Connector>));
        registry
    }

    pub(crate) async fn wait_refreshes(handle: &WorkerHandle, n: u64) -> WorkerStatus {
        let mut rx = handle.subscribe();
        let status = rx.wait_for(|s| s.refreshes >= n && s.state == WorkerState::Running).await.unwrap();
        status.clone()
    }

    fn spawn(provider: &Provider, connector: Arc<FakeConnector>, config: WorkerConfig) -> (WorkerHandle, Arc<Searcher>) {
        let searcher = Arc::new(Searcher::new());
        let worker = ProviderWorker::build(provider, &registry_with(connector), searcher.clone(), config).unwrap();
        (worker.spawn(), searcher)
    }

    fn metric_names(catalog: &Catalog) -> Vec<String> {
        catalog.records().into_iter().map(|r| format!("{}/{}", r.source, r.metric)).collect()
    }

    #[tokio::test]
    async fn initial_refresh_fills_filtered_catalog() {
        let connector = FakeConnector::new("prov", &[("h-1", "cpu"), ("h-2", "_hidden")]);
        let mut provider = Provider::new("prov", "fake", Settings::new());
        provider.filters = vec![
            FilterRule::new(FilterAction::Rewrite, FilterTarget::Source, "^h-(.*)$", "host-$1"),
            FilterRule::new(FilterAction::Discard, FilterTarget::Metric, "^_", ""),
        ];
        let (handle, searcher) = spawn(&provider, connector, WorkerConfig::default());

        let status = wait_refreshes(&handle, 1).await;
        assert_eq!(status.last_error, None);
        assert_eq!(metric_names(handle.catalog()), vec!["host-1/cpu"]);
        assert_eq!(searcher.metrics("prov", "host-1", "cpu", 1).len(), 1);

        handle.shutdown().await;
        assert!(searcher.catalogs().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_entries_and_success_prunes() {
        let connector = FakeConnector::new("prov", &[("web01", "cpu"), ("web01", "load")]);
        let provider = Provider::new("prov", "fake", Settings::new());
        let (handle, _searcher) = spawn(&provider, connector.clone(), WorkerConfig::default());
        wait_refreshes(&handle, 1).await;

        *connector.records.lock() = vec![Record::new("prov", "web01", "cpu")];
        connector.fail.store(true, Ordering::SeqCst);
        assert!(handle.refresh().await);
        let status = wait_refreshes(&handle, 2).await;
        assert!(status.last_error.unwrap().contains("unreachable"));
        assert_eq!(metric_names(handle.catalog()), vec!["web01/cpu", "web01/load"]);

        connector.fail.store(false, Ordering::SeqCst);
        assert!(handle.refresh().await);
        wait_refreshes(&handle, 3).await;
        assert_eq!(metric_names(handle.catalog()), vec!["web01/cpu"]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_connector_does_not_kill_worker() {
        let connector = FakeConnector::new("prov", &[("web01", "cpu")]);
        connector.panic.store(true, Ordering::SeqCst);
        let provider = Provider::new("prov", "fake", Settings::new());
        let (handle, _searcher) = spawn(&provider, connector.clone(), WorkerConfig::default());

        let status = wait_refreshes(&handle, 1).await;
        assert!(status.last_error.unwrap().contains("panicked"));

        connector.panic.store(false, Ordering::SeqCst);
        assert!(handle.refresh().await);
        let status = wait_refreshes(&handle, 2).await;
        assert_eq!(status.last_error, None);
        assert_eq!(metric_names(handle.catalog()), vec!["web01/cpu"]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_are_coalesced_while_in_flight() {
        let connector = FakeConnector::new("prov", &[("web01", "cpu")]);
        *connector.delay.lock() = Duration::from_secs(5);
        let provider = Provider::new("prov", "fake", Settings::new());
        let (handle, _searcher) = spawn(&provider, connector.clone(), WorkerConfig::default());

        for _ in 0..3 {
            assert!(handle.refresh().await);
        }
        wait_refreshes(&handle, 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_triggers_periodic_refresh() {
        let connector = FakeConnector::new("prov", &[("web01", "cpu")]);
        let mut provider = Provider::new("prov", "fake", Settings::new());
        provider.refresh_interval = 60;
        let (handle, _searcher) = spawn(&provider, connector.clone(), WorkerConfig::default());

        wait_refreshes(&handle, 3).await;
        assert!(connector.calls.load(Ordering::SeqCst) >= 3);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_refreshes_on_its_own() {
        let connector = FakeConnector::new("prov", &[("web01", "cpu")]);
        let provider = Provider::new("prov", "fake", Settings::new());
        let (handle, _searcher) = spawn(&provider, connector.clone(), WorkerConfig::default());

        wait_refreshes(&handle, 1).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_refresh_after_grace() {
        let connector = FakeConnector::new("prov", &[("web01", "cpu")]);
        *connector.delay.lock() = Duration::from_secs(3600);
        let provider = Provider::new("prov", "fake", Settings::new());
        let config = WorkerConfig { shutdown_grace: Duration::from_secs(2), ..Default::default() };
        let (handle, searcher) = spawn(&provider, connector, config);
        let mut status = handle.subscribe();

        let started = Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(status.borrow_and_update().state, WorkerState::Stopped);
        assert!(searcher.catalogs().is_empty());
    }

    #[tokio::test]
    async fn catalog_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig { cache_path: Some(dir.path().to_path_buf()), ..Default::default() };
        let connector = FakeConnector::new("prov", &[("web01", "cpu")]);
        let provider = Provider::new("prov", "fake", Settings::new());

        let (handle, _) = spawn(&provider, connector.clone(), config.clone());
        wait_refreshes(&handle, 1).await;
        handle.shutdown().await;
        assert!(dir.path().join("state").join("prov.catalog").exists());

        // The backend is now unreachable: restored entries are served anyway.
        connector.fail.store(true, Ordering::SeqCst);
        connector.records.lock().clear();
        let (handle, _) = spawn(&provider, connector, config);
        wait_refreshes(&handle, 1).await;
        assert_eq!(metric_names(handle.catalog()), vec!["web01/cpu"]);
        handle.shutdown().await;
    }

    #[test]
    fn build_reports_configuration_errors() {
        let searcher = Arc::new(Searcher::new());
        let registry = ConnectorRegistry::new();
        let provider = Provider::new("prov", "rrd", Settings::new());
        let err = ProviderWorker::build(&provider, &registry, searcher.clone(), WorkerConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let registry = registry_with(FakeConnector::new("prov", &[]));
        let mut provider = Provider::new("prov", "fake", Settings::new());
        provider.filters = vec![FilterRule::new(FilterAction::Discard, FilterTarget::Any, "regexp:(", "")];
        assert!(matches!(
            ProviderWorker::build(&provider, &registry, searcher, WorkerConfig::default()),
            Err(WorkerError::Filter(_))
        ));
    }
}
