//! Dispatch Worker
//!
//! Wires the shared state, ledger, queue fetcher and instance registry
//! together and owns their lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch_loop::{DispatchContext, DispatchSettings};
use crate::error::LedgerError;
use crate::fetcher::QueueFetcher;
use crate::ledger::{DispatchLedger, JsonFileLedgerStore, LedgerStore};
use crate::pacing::PacingPolicy;
use crate::provider::{HttpMessageSender, MessageSender, SenderConfig};
use crate::registry::{InstanceRegistry, InstanceStatus};
use crate::state::{DispatchState, StateSnapshot};
use crate::upstream::{Confirmer, HttpUpstream, InstanceSource, QueueSource, UpstreamConfig};

/// Worker timing and policy
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_interval: Duration,
    pub instances_interval: Duration,
    /// Bounded wait for loops on stop
    pub shutdown_timeout: Duration,
    pub settings: DispatchSettings,
    pub pacing: PacingPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_interval: Duration::from_secs(15),
            instances_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(30),
            settings: DispatchSettings::default(),
            pacing: PacingPolicy::default(),
        }
    }
}

/// External collaborators of the worker
pub struct WorkerDeps {
    pub queue: Arc<dyn QueueSource>,
    pub instances: Arc<dyn InstanceSource>,
    pub confirmer: Arc<dyn Confirmer>,
    pub sender: Arc<dyn MessageSender>,
    pub ledger_store: Arc<dyn LedgerStore>,
}

impl WorkerDeps {
    /// HTTP upstream and provider clients with a JSON file ledger
    pub fn http(
        upstream: UpstreamConfig,
        sender: SenderConfig,
        ledger_path: impl Into<PathBuf>,
    ) -> Result<Self, reqwest::Error> {
        let upstream = Arc::new(HttpUpstream::new(upstream)?);
        Ok(Self {
            queue: upstream.clone(),
            instances: upstream.clone(),
            confirmer: upstream,
            sender: Arc::new(HttpMessageSender::new(sender)?),
            ledger_store: Arc::new(JsonFileLedgerStore::new(ledger_path)),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub ready: bool,
    #[serde(flatten)]
    pub state: StateSnapshot,
    pub active_instances: usize,
    pub instances: Vec<InstanceStatus>,
}

pub struct DispatchWorker {
    config: WorkerConfig,
    state: Arc<DispatchState>,
    ledger: Arc<DispatchLedger>,
    fetcher: Arc<QueueFetcher>,
    registry: Arc<InstanceRegistry>,
    running: watch::Sender<bool>,
    ready: AtomicBool,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchWorker {
    pub fn new(config: WorkerConfig, deps: WorkerDeps) -> Self {
        let state = Arc::new(DispatchState::new());
        let ledger = Arc::new(DispatchLedger::new(deps.ledger_store));

        let ctx = DispatchContext {
            state: Arc::clone(&state),
            ledger: Arc::clone(&ledger),
            sender: deps.sender,
            confirmer: deps.confirmer,
            pacing: Arc::new(config.pacing.clone()),
            settings: config.settings.clone(),
        };

        let fetcher = Arc::new(QueueFetcher::new(
            deps.queue,
            Arc::clone(&state),
            config.queue_interval,
        ));
        let registry = Arc::new(InstanceRegistry::new(
            deps.instances,
            ctx,
            config.instances_interval,
        ));
        let (running, _) = watch::channel(true);

        Self {
            config,
            state,
            ledger,
            fetcher,
            registry,
            running,
            ready: AtomicBool::new(false),
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Load the ledger, run one queue fetch and one instance poll, then start
    /// both pollers in the background.
    ///
    /// A ledger that cannot be read is fatal.
    pub async fn start(&self) -> Result<(), LedgerError> {
        let loaded = self.ledger.load_into(&self.state).await?;
        info!(ledger_size = loaded, "Loaded sent-message ledger");
        self.ready.store(true, Ordering::SeqCst);

        self.fetcher.poll_once().await;
        let _ = self.registry.poll_once().await;

        let fetcher_task = {
            let fetcher = Arc::clone(&self.fetcher);
            let running = self.running.subscribe();
            tokio::spawn(async move { fetcher.run(running).await })
        };
        let registry_task = {
            let registry = Arc::clone(&self.registry);
            let running = self.running.subscribe();
            tokio::spawn(async move { registry.run(running).await })
        };
        self.pollers.lock().extend([fetcher_task, registry_task]);

        info!(
            queue_interval_ms = self.config.queue_interval.as_millis() as u64,
            instances_interval_ms = self.config.instances_interval.as_millis() as u64,
            max_messages_per_cycle = self.config.pacing.max_messages_per_cycle,
            max_send_attempts = self.config.settings.max_send_attempts,
            "Dispatch worker started"
        );
        Ok(())
    }

    /// Stop the pollers and every dispatch loop.
    ///
    /// Returns the number of loops still running when the wait ran out.
    pub async fn stop(&self) -> usize {
        info!("Stopping dispatch worker");
        self.running.send_replace(false);

        // Pollers first, so an in-progress instance poll cannot start loops
        // after the registry has been drained
        let pollers: Vec<JoinHandle<()>> = self.pollers.lock().drain(..).collect();
        if tokio::time::timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(pollers),
        )
        .await
        .is_err()
        {
            warn!("Timed out waiting for pollers to stop");
        }

        let lagging = self.registry.shutdown(self.config.shutdown_timeout).await;

        info!(lagging_loops = lagging, "Dispatch worker stopped");
        lagging
    }

    /// True once the ledger is loaded
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &Arc<DispatchState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            ready: self.is_ready(),
            state: self.state.snapshot(),
            active_instances: self.registry.active_loop_count(),
            instances: self.registry.statuses(),
        }
    }
}
