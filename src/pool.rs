//! Worker pool: N isolated environment instances pulling attempts from a
//! shared queue.
//!
//! Each worker owns exactly one environment instance and serves one attempt
//! at a time. Idle workers steal the next pending attempt, so a slow attempt
//! never holds up the others. A worker whose attempt ended in an
//! infrastructure failure tears its instance down and relaunches it before
//! taking more work; the failed attempt itself is never requeued.
//!
//! # Example
//!
//! ```rust,ignore
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let pool = WorkerPool::new(context, 3);
//! let (report, ()) = tokio::join!(pool.run(configs, tx, cancel), async {
//!     while let Some(event) = rx.recv().await { /* checkpoint */ }
//! });
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::capability::{Judge, Proposer};
use crate::checkpoint::CheckpointStore;
use crate::engine::EngineTimeouts;
use crate::error::{ConvergeError, Result};
use crate::gateway::{EnvironmentInstance, EnvironmentLauncher};
use crate::state::{AttemptConfig, AttemptId, AttemptResult, RunId, TaskSpec};
use crate::supervisor::{AttemptSupervisor, BaselineLedger, DEFAULT_RESET_TIMEOUT};

/// Default deadline for a launched instance to become ready.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Workers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Failed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One environment instance and its state.
pub struct Worker {
    id: usize,
    instance: Box<dyn EnvironmentInstance>,
    status: WorkerStatus,
}

impl Worker {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.instance.endpoint()
    }

    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    fn set_status(&mut self, status: WorkerStatus) {
        debug!(worker = self.id, "{} -> {}", self.status, status);
        self.status = status;
    }

    /// Terminate the instance. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.instance.terminate().await {
            warn!(worker = self.id, "Failed to terminate instance: {}", e);
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Progress reported while the pool runs.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker picked up an attempt.
    Started { worker: usize, attempt: AttemptId },
    /// An attempt reached a terminal status.
    Finished(AttemptResult),
    /// A worker could not be (re)started and left the pool.
    WorkerLost { worker: usize, error: String },
}

/// Summary of a pool run.
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Attempts never dispatched, in queue order.
    pub undispatched: Vec<AttemptConfig>,
    /// Workers that left the pool, with the reason.
    pub lost_workers: Vec<(usize, String)>,
}

/// Everything a worker needs, shared behind `Arc`s.
#[derive(Clone)]
pub struct PoolContext {
    pub run_id: RunId,
    pub task: TaskSpec,
    pub launcher: Arc<dyn EnvironmentLauncher>,
    pub proposer: Arc<dyn Proposer>,
    pub judge: Arc<dyn Judge>,
    pub checkpoints: CheckpointStore,
    pub artifacts: ArtifactStore,
    pub ledger: BaselineLedger,
    pub engine_timeouts: EngineTimeouts,
    pub reset_timeout: Duration,
    pub readiness_timeout: Duration,
}

impl PoolContext {
    #[must_use]
    pub fn new(
        run_id: RunId,
        task: TaskSpec,
        launcher: Arc<dyn EnvironmentLauncher>,
        proposer: Arc<dyn Proposer>,
        judge: Arc<dyn Judge>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            run_id,
            task,
            launcher,
            proposer,
            judge,
            checkpoints: CheckpointStore::new(artifacts.root()),
            artifacts,
            ledger: BaselineLedger::new(),
            engine_timeouts: EngineTimeouts::default(),
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, engine: EngineTimeouts, reset: Duration, readiness: Duration) -> Self {
        self.engine_timeouts = engine;
        self.reset_timeout = reset;
        self.readiness_timeout = readiness;
        self
    }
}

/// Fixed-size pool of workers.
pub struct WorkerPool {
    context: Arc<PoolContext>,
    size: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(context: PoolContext, size: usize) -> Self {
        Self {
            context: Arc::new(context),
            size: size.max(1),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Launch worker `id` and wait until its instance is ready.
    ///
    /// The instance is terminated again if it never becomes ready.
    pub async fn start_worker(context: &PoolContext, id: usize) -> Result<Worker> {
        let mut instance = context.launcher.launch(id).await?;
        let ready = tokio::time::timeout(context.readiness_timeout, async {
            while !instance.probe().await {
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        if !ready {
            if let Err(e) = instance.terminate().await {
                warn!(worker = id, "Failed to terminate unready instance: {}", e);
            }
            return Err(ConvergeError::worker_start(
                id,
                format!(
                    "not ready after {}s",
                    context.readiness_timeout.as_secs_f64()
                ),
            ));
        }

        info!(worker = id, endpoint = %instance.endpoint(), launcher = %context.launcher.name(), "Worker ready");
        Ok(Worker {
            id,
            instance,
            status: WorkerStatus::Idle,
        })
    }

    /// Run every config in `queue` and return once all workers are done.
    ///
    /// Dispatch stops on cancellation; attempts already running observe the
    /// same token. Undispatched attempts are returned in the report.
    pub async fn run(
        &self,
        queue: Vec<AttemptConfig>,
        events: mpsc::UnboundedSender<PoolEvent>,
        cancel: CancellationToken,
    ) -> PoolReport {
        let workers = self.size.min(queue.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(queue)));
        let mut join_set: JoinSet<Option<(usize, String)>> = JoinSet::new();

        info!(workers, run_id = %self.context.run_id, "Worker pool started");

        for id in 0..workers {
            let context = self.context.clone();
            let queue = queue.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move { worker_loop(context, id, queue, events, cancel).await });
        }
        drop(events);

        let mut report = PoolReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(lost)) => report.lost_workers.push(lost),
                Ok(None) => {}
                Err(e) => error!("Worker task panicked: {}", e),
            }
        }

        report.undispatched = queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        info!(
            undispatched = report.undispatched.len(),
            lost_workers = report.lost_workers.len(),
            "Worker pool stopped"
        );
        report
    }
}

fn next_config(queue: &Mutex<VecDeque<AttemptConfig>>) -> Option<AttemptConfig> {
    queue
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .pop_front()
}

/// Pull attempts until the queue is empty, the run is cancelled or the
/// worker cannot be restarted. Returns the reason the worker was lost.
async fn worker_loop(
    context: Arc<PoolContext>,
    id: usize,
    queue: Arc<Mutex<VecDeque<AttemptConfig>>>,
    events: mpsc::UnboundedSender<PoolEvent>,
    cancel: CancellationToken,
) -> Option<(usize, String)> {
    let mut worker = match WorkerPool::start_worker(&context, id).await {
        Ok(worker) => worker,
        Err(e) => return lose(&events, id, e),
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(config) = next_config(&queue) else {
            break;
        };

        worker.set_status(WorkerStatus::Busy);
        let _ = events.send(PoolEvent::Started {
            worker: id,
            attempt: config.attempt_id.clone(),
        });

        let supervisor = AttemptSupervisor::new(
            id,
            context.proposer.clone(),
            context.judge.clone(),
            worker.instance.gateway(),
            context.checkpoints.clone(),
            context.artifacts.clone(),
        )
        .with_timeouts(context.engine_timeouts, context.reset_timeout)
        .with_ledger(context.ledger.clone());

        let result = supervisor
            .run_attempt(&context.run_id, &context.task, &config, &cancel)
            .await;
        let restart = result.restart_worker;
        let _ = events.send(PoolEvent::Finished(result));

        if restart {
            worker.set_status(WorkerStatus::Failed);
            warn!(worker = id, attempt = %config.attempt_id, "Restarting worker after infrastructure failure");
            worker.shutdown().await;
            if cancel.is_cancelled() {
                return None;
            }
            worker = match WorkerPool::start_worker(&context, id).await {
                Ok(worker) => worker,
                Err(e) => return lose(&events, id, e),
            };
        } else {
            worker.set_status(WorkerStatus::Idle);
        }
    }

    worker.shutdown().await;
    None
}

fn lose(
    events: &mpsc::UnboundedSender<PoolEvent>,
    id: usize,
    e: ConvergeError,
) -> Option<(usize, String)> {
    error!(worker = id, "Worker lost: {}", e);
    let error = e.to_string();
    let _ = events.send(PoolEvent::WorkerLost {
        worker: id,
        error: error.clone(),
    });
    Some((id, error))
}
