//! Background job manager.
//!
//! One cancellable loop per [`JobKind`], each ticking at its configured
//! interval. Manual triggers run on the same task tracker, so `stop` waits for
//! them as well. The lifecycle only moves forward:
//! not started, running, shutting down, stopped.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::jobs::runner::JobExecutor;
use crate::jobs::{JobConfig, JobKind, JobRegistry, SharedConfig};
use crate::models::{JobHealth, JobStatus};

enum Lifecycle {
    NotStarted,
    Running {
        cancel: CancellationToken,
        tasks: TaskTracker,
    },
    ShuttingDown {
        tasks: TaskTracker,
    },
    Stopped,
}

/// Everything a job run needs, cheap to clone into tasks.
#[derive(Clone)]
struct JobContext {
    executor: Arc<dyn JobExecutor>,
    registry: Arc<JobRegistry>,
    config: SharedConfig,
}

pub struct JobManager {
    context: JobContext,
    lifecycle: Mutex<Lifecycle>,
}

impl JobManager {
    pub fn new(executor: Arc<dyn JobExecutor>, config: SharedConfig) -> Self {
        let registry = Arc::new(JobRegistry::new(config.clone()));
        Self {
            context: JobContext {
                executor,
                registry,
                config,
            },
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.context.registry
    }

    /// Spawns one loop per job kind. Must be called inside a tokio runtime.
    pub fn start(&self, config: JobConfig) -> Result<()> {
        config.validate()?;
        let mut lifecycle = self.lifecycle();
        if !matches!(*lifecycle, Lifecycle::NotStarted) {
            return Err(AppError::AlreadyStarted);
        }

        info!(
            rating_reminder_secs = config.rating_reminder_interval.as_secs(),
            auto_release_secs = config.auto_release_interval.as_secs(),
            dispute_escalation_secs = config.dispute_escalation_interval.as_secs(),
            "starting background jobs"
        );
        self.context.config.replace(config);
        self.context.registry.initialize(&JobKind::ALL);

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        for kind in JobKind::ALL {
            tasks.spawn(run_job_loop(kind, self.context.clone(), cancel.clone()));
        }
        *lifecycle = Lifecycle::Running { cancel, tasks };

        info!("all background jobs started");
        Ok(())
    }

    /// Runs `kind` once, now, without touching its schedule.
    pub fn trigger(&self, kind: JobKind) -> Result<()> {
        let lifecycle = self.lifecycle();
        match &*lifecycle {
            Lifecycle::NotStarted => Err(AppError::SchedulerNotStarted),
            Lifecycle::Running { tasks, .. } => {
                info!(job = %kind, "manual trigger");
                tasks.spawn(run_once(kind, self.context.clone()));
                Ok(())
            }
            Lifecycle::ShuttingDown { .. } | Lifecycle::Stopped => Err(AppError::SchedulerStopped),
        }
    }

    /// Signals shutdown and waits for every loop and in-flight run to finish.
    ///
    /// Calls that arrive while another `stop` is draining wait for the same
    /// tasks. Once stopped, further calls return immediately.
    pub async fn stop(&self) {
        let (cancel, tasks) = {
            let mut lifecycle = self.lifecycle();
            match &*lifecycle {
                Lifecycle::Running { cancel, tasks } => {
                    let running = (Some(cancel.clone()), tasks.clone());
                    *lifecycle = Lifecycle::ShuttingDown {
                        tasks: running.1.clone(),
                    };
                    running
                }
                Lifecycle::ShuttingDown { tasks } => (None, tasks.clone()),
                Lifecycle::NotStarted | Lifecycle::Stopped => return,
            }
        };
        let Some(cancel) = cancel else {
            tasks.wait().await;
            return;
        };

        info!("shutting down background jobs");
        cancel.cancel();
        tasks.close();
        tasks.wait().await;

        *self.lifecycle() = Lifecycle::Stopped;
        info!("all background jobs stopped");
    }

    /// Swaps in a new config. Each loop picks up its new period after its next tick.
    pub fn update_config(&self, config: JobConfig) -> Result<()> {
        config.validate()?;
        self.ensure_running()?;

        info!("updating job configuration");
        self.context.config.replace(config);
        self.context.registry.reschedule_all();
        Ok(())
    }

    pub fn config(&self) -> Result<Arc<JobConfig>> {
        match &*self.lifecycle() {
            Lifecycle::NotStarted => Err(AppError::SchedulerNotStarted),
            _ => Ok(self.context.config.current()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running { .. })
    }

    pub fn statuses(&self) -> BTreeMap<JobKind, JobStatus> {
        self.context.registry.snapshot()
    }

    pub fn health(&self) -> JobHealth {
        self.context.registry.health()
    }

    fn ensure_running(&self) -> Result<()> {
        match &*self.lifecycle() {
            Lifecycle::NotStarted => Err(AppError::SchedulerNotStarted),
            Lifecycle::Running { .. } => Ok(()),
            Lifecycle::ShuttingDown { .. } | Lifecycle::Stopped => Err(AppError::SchedulerStopped),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_job_loop(kind: JobKind, context: JobContext, cancel: CancellationToken) {
    info!(job = %kind, "job loop started");

    let mut period = kind.interval(&context.config.current());
    let mut ticker = job_ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job = %kind, "job loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                run_once(kind, context.clone()).await;

                let current = kind.interval(&context.config.current());
                if current != period {
                    info!(job = %kind, interval_secs = current.as_secs(), "job interval changed");
                    period = current;
                    ticker = job_ticker(period);
                }
            }
        }
    }
}

/// Ticks every `period`, starting one period from now. A slow run delays the
/// following tick instead of bunching missed ones together.
fn job_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One invocation. The outcome is recorded even if the body panics.
async fn run_once(kind: JobKind, context: JobContext) {
    let started = Instant::now();
    info!(job = %kind, "job starting");
    context.registry.mark_running(kind);

    let outcome = AssertUnwindSafe(context.executor.execute(kind))
        .catch_unwind()
        .await;

    let (result, is_error) = match outcome {
        Ok(Ok(report)) => (report.message, report.failed),
        Ok(Err(e)) => {
            warn!(job = %kind, error = %e, "job failed");
            (format!("{} failed: {e}", kind.display_name()), true)
        }
        Err(_) => {
            error!(job = %kind, "job panicked");
            (format!("{} panicked", kind.display_name()), true)
        }
    };

    let runtime = started.elapsed();
    info!(job = %kind, %result, runtime_ms = runtime.as_millis() as u64, "job completed");
    context
        .registry
        .record_outcome(kind, result, runtime, is_error);
}
