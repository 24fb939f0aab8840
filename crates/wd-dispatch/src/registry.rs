//! Instance Registry
//!
//! Tracks which provider instances are connected and owns one dispatch loop
//! per connected instance. Stopping is cooperative: a disconnected instance
//! has its life flag turned off and its loop exits on its own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wd_common::{ConnectionState, SenderInstance};

use crate::dispatch_loop::{DispatchContext, DispatchLoop, LoopPhase};
use crate::error::UpstreamError;
use crate::lifecycle::{is_alive, life_flag, sleep_while_alive};
use crate::upstream::InstanceSource;

/// Control handle for one running dispatch loop
struct LoopHandle {
    life: watch::Sender<bool>,
    phase: watch::Receiver<LoopPhase>,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Point-in-time view of one dispatch loop
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    /// Life flag value
    pub active: bool,
    pub phase: LoopPhase,
    pub started_at: DateTime<Utc>,
}

/// Loop changes made by one registry poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub started: Vec<String>,
    pub revived: Vec<String>,
    pub stopped: Vec<String>,
}

pub struct InstanceRegistry {
    source: Arc<dyn InstanceSource>,
    ctx: DispatchContext,
    loops: DashMap<String, LoopHandle>,
    known: RwLock<Vec<SenderInstance>>,
    interval: Duration,
    /// Set by `shutdown`; no loop is started afterwards
    closed: AtomicBool,
}

impl InstanceRegistry {
    pub fn new(source: Arc<dyn InstanceSource>, ctx: DispatchContext, interval: Duration) -> Self {
        Self {
            source,
            ctx,
            loops: DashMap::new(),
            known: RwLock::new(Vec::new()),
            interval,
            closed: AtomicBool::new(false),
        }
    }

    /// Fetch instances once and start or stop loops to match.
    ///
    /// On a fetch error nothing changes: running loops keep running and the
    /// known list is kept. After `shutdown` a poll changes nothing, even one
    /// whose fetch was already under way.
    pub async fn poll_once(&self) -> Result<RegistryDiff, UpstreamError> {
        let descriptors = match self.source.fetch_instances().await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!(error = %e, "Failed to fetch instances");
                return Err(e);
            }
        };

        if self.is_closed() {
            debug!("Registry is shut down, ignoring instance poll");
            return Ok(RegistryDiff::default());
        }

        let active: Vec<SenderInstance> = descriptors
            .into_iter()
            .filter(|d| d.connection_status == ConnectionState::Open)
            .filter(|d| {
                if d.token.is_empty() {
                    warn!(instance = %d.name, "Open instance has no token, ignoring");
                }
                !d.token.is_empty()
            })
            .map(SenderInstance::from)
            .collect();

        if active.is_empty() {
            warn!("No open instances");
        } else {
            let names: Vec<&str> = active.iter().map(|i| i.name.as_str()).collect();
            info!(instances = ?names, "Open instances");
        }

        let active_names: HashSet<String> = active.iter().map(|i| i.name.clone()).collect();
        let mut diff = RegistryDiff::default();

        for instance in &active {
            let needs_spawn = match self.loops.get(&instance.name) {
                Some(handle) if !handle.task.is_finished() => {
                    if !*handle.life.borrow() {
                        handle.life.send_replace(true);
                        info!(instance = %instance.name, "Instance reconnected, dispatch loop revived");
                        diff.revived.push(instance.name.clone());
                    }
                    false
                }
                _ => true,
            };

            if needs_spawn {
                self.spawn(instance.clone());
                diff.started.push(instance.name.clone());
            }
        }

        for entry in self.loops.iter() {
            if !active_names.contains(entry.key()) && *entry.life.borrow() {
                entry.life.send_replace(false);
                info!(instance = %entry.key(), "Instance disconnected, stopping dispatch loop");
                diff.stopped.push(entry.key().clone());
            }
        }

        self.loops
            .retain(|name, handle| active_names.contains(name) || !handle.task.is_finished());
        *self.known.write() = active;

        Ok(diff)
    }

    fn spawn(&self, instance: SenderInstance) {
        let name = instance.name.clone();
        let (life_tx, life_rx) = life_flag();
        let (phase_tx, phase_rx) = watch::channel(LoopPhase::Idle);

        let dispatch_loop = DispatchLoop::new(instance, self.ctx.clone(), life_rx, phase_tx);
        let task = tokio::spawn(dispatch_loop.run());

        info!(instance = %name, "Started dispatch loop");
        self.loops.insert(
            name.clone(),
            LoopHandle {
                life: life_tx,
                phase: phase_rx,
                task,
                started_at: Utc::now(),
            },
        );

        // Lost a race with shutdown's drain
        if self.is_closed() {
            if let Some(handle) = self.loops.get(&name) {
                handle.life.send_replace(false);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll until `running` turns false
    pub async fn run(&self, mut running: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Instance registry started");
        while is_alive(&running) {
            if !sleep_while_alive(&mut running, self.interval).await {
                break;
            }
            let _ = self.poll_once().await;
        }
        info!("Instance registry stopped");
    }

    /// Stop every loop and wait up to `timeout` for them to exit.
    ///
    /// Returns the number of loops that had not exited when the wait ended.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let names: Vec<String> = self.loops.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<LoopHandle> = names
            .iter()
            .filter_map(|name| self.loops.remove(name).map(|(_, handle)| handle))
            .collect();

        for handle in &handles {
            handle.life.send_replace(false);
        }

        let total = handles.len();
        let waits = handles.into_iter().map(|handle| handle.task);
        match tokio::time::timeout(timeout, futures::future::join_all(waits)).await {
            Ok(_) => {
                info!(loops = total, "All dispatch loops stopped");
                0
            }
            Err(_) => {
                warn!(loops = total, "Timed out waiting for dispatch loops to stop");
                total
            }
        }
    }

    /// Instances open as of the last successful poll
    pub fn active_instances(&self) -> Vec<SenderInstance> {
        self.known.read().clone()
    }

    /// Loops whose life flag is on
    pub fn active_loop_count(&self) -> usize {
        self.loops.iter().filter(|e| *e.life.borrow()).count()
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .loops
            .iter()
            .map(|entry| InstanceStatus {
                name: entry.key().clone(),
                active: *entry.life.borrow(),
                phase: *entry.phase.borrow(),
                started_at: entry.started_at,
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}
