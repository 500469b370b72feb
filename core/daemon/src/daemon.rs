//! Daemon lifecycle and the watch loop.
//!
//! One control thread ticks at a fixed interval: load managed workers, run the
//! mention pipeline for each, then sweep live processes. A schema error stops
//! the daemon; any other store error only skips the affected work until the
//! next tick.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use relay_protocol::{LockInfo, DEFAULT_LANE};

use crate::cancel::CancelToken;
use crate::config::DaemonConfig;
use crate::debounce::Debouncer;
use crate::driver::DriverRegistry;
use crate::error::{DaemonError, StoreError};
use crate::lock::InstanceLock;
use crate::pipeline::{Pipeline, WorkerTick};
use crate::router::FailOpenRouter;
use crate::store::Store;
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::telemetry::UsageTelemetry;

/// Per-worker results of one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub workers: BTreeMap<String, WorkerTick>,
}

impl TickReport {
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerTick> {
        self.workers.get(worker_id)
    }
}

pub struct Daemon {
    store: Arc<dyn Store>,
    pipeline: Pipeline,
    supervisor: Arc<Supervisor>,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl Daemon {
    pub fn new(
        config: &DaemonConfig,
        store: Arc<dyn Store>,
        drivers: DriverRegistry,
        telemetry: Arc<dyn UsageTelemetry>,
        router: FailOpenRouter,
    ) -> Self {
        let cancel = CancelToken::new();
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            drivers,
            telemetry,
            cancel.clone(),
            SupervisorSettings::from_config(config),
        ));
        let pipeline = Pipeline::new(
            store.clone(),
            Debouncer::new(store.clone(), DEFAULT_LANE),
            router,
            supervisor.clone(),
        );
        Self {
            store,
            pipeline,
            supervisor,
            cancel,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn tick(&self) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();
        let workers = match self.store.list_managed_workers() {
            Ok(workers) => workers,
            Err(err) if err.is_schema() => return Err(err),
            Err(err) => {
                warn!(error = %err, "Failed to load managed workers");
                Vec::new()
            }
        };

        for worker in &workers {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.pipeline.process_worker(worker) {
                Ok(outcome) => {
                    report.workers.insert(worker.id.clone(), outcome);
                }
                Err(err) if err.is_schema() => return Err(err),
                Err(err) => {
                    warn!(worker = %worker.id, error = %err, "Mention pipeline failed; retrying next tick");
                }
            }
        }

        self.supervisor.sweep()?;
        Ok(report)
    }

    /// Takes the singleton lock, heals orphaned presences and starts the
    /// watch loop on its own thread.
    pub fn start(self, lock_path: &Path) -> Result<RunningDaemon, DaemonError> {
        let lock = InstanceLock::acquire(lock_path)?;
        match self.supervisor.recover_orphans() {
            Ok(0) => {}
            Ok(reset) => info!(reset, "Recovered orphaned presences"),
            Err(err) if err.is_schema() => return Err(err.into()),
            Err(err) => warn!(error = %err, "Orphan recovery failed; the pipeline will self-heal"),
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = StopHandle {
            stop_tx,
            cancel: self.cancel.clone(),
        };
        let supervisor = self.supervisor.clone();
        let thread = thread::Builder::new()
            .name("relay-watch".to_string())
            .spawn(move || self.run(stop_rx))
            .map_err(DaemonError::Thread)?;

        info!(pid = lock.info().pid, path = %lock.path().display(), "relayd started");
        Ok(RunningDaemon {
            handle,
            thread,
            supervisor,
            lock,
        })
    }

    fn run(self, stop_rx: mpsc::Receiver<()>) -> Result<(), StoreError> {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Cancel token set; leaving watch loop");
                return Ok(());
            }
            if let Err(err) = self.tick() {
                error!(error = %err, "Store schema is incompatible; stopping daemon");
                self.cancel.cancel();
                return Err(err);
            }
            match stop_rx.recv_timeout(self.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Stop requested; leaving watch loop");
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

/// Cloneable stop trigger, safe to call from a signal handler thread.
#[derive(Clone)]
pub struct StopHandle {
    stop_tx: Sender<()>,
    cancel: CancelToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.stop_tx.send(());
    }
}

pub struct RunningDaemon {
    handle: StopHandle,
    thread: JoinHandle<Result<(), StoreError>>,
    supervisor: Arc<Supervisor>,
    lock: InstanceLock,
}

impl RunningDaemon {
    pub fn stop_handle(&self) -> StopHandle {
        self.handle.clone()
    }

    pub fn lock_info(&self) -> &LockInfo {
        self.lock.info()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn stop(self) -> Result<(), DaemonError> {
        self.handle.stop();
        self.wait()
    }

    /// Blocks until the watch loop ends, then kills every worker, joins the
    /// monitors and releases the lock.
    pub fn wait(self) -> Result<(), DaemonError> {
        let outcome = match self.thread.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DaemonError::Store(err)),
            Err(_) => Err(DaemonError::LoopPanicked),
        };
        self.supervisor.shutdown();
        self.lock.release();
        info!("relayd stopped");
        outcome
    }
}
