use super::pipeline::{CopyPipeline, PipelineError, RunReport};
use super::throttle::ParallelismGate;
use super::{BackupType, JobDefinition, JobRecord, JobState, PauseReason};
use crate::utils::config::GlobalConfig;
use crate::utils::log_buffer::{EventSink, JobEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Level-triggered instruction for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// The pipeline's view of its job's pause/stop signal.
#[derive(Clone)]
pub struct RunControl {
    rx: watch::Receiver<RunSignal>,
}

impl RunControl {
    pub fn new(rx: watch::Receiver<RunSignal>) -> Self {
        Self { rx }
    }

    /// Returns immediately while running, parks while paused until the
    /// signal changes, and fails once a stop was requested.
    pub async fn checkpoint(&mut self) -> Result<(), Stopped> {
        loop {
            let signal = *self.rx.borrow_and_update();
            match signal {
                RunSignal::Run => return Ok(()),
                RunSignal::Stop => return Err(Stopped),
                RunSignal::Pause => {
                    // A dropped sender means the run was superseded.
                    if self.rx.changed().await.is_err() {
                        return Err(Stopped);
                    }
                }
            }
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.rx.borrow() == RunSignal::Stop || self.rx.has_changed().is_err()
    }

    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|signal| *signal == RunSignal::Stop).await;
    }
}

/// Everything a run needs besides the job itself.
#[derive(Clone)]
pub struct RunContext {
    pub pipeline: CopyPipeline,
    pub gate: ParallelismGate,
    pub settings: GlobalConfig,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JobError {
    #[error("job {name}: cannot {action} while {from}")]
    InvalidTransition {
        name: String,
        from: JobState,
        action: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub name: String,
    pub backup_type: BackupType,
    pub state: JobState,
    pub progress: f64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub pause_reason: Option<PauseReason>,
}

#[derive(Debug)]
struct JobStatus {
    state: JobState,
    progress: f64,
    last_run_time: Option<DateTime<Utc>>,
    pause_reason: Option<PauseReason>,
}

struct ActiveRun {
    generation: u64,
    signal: watch::Sender<RunSignal>,
    handle: JoinHandle<()>,
}

enum RunFailure {
    Pipeline(PipelineError),
    Panicked(String),
}

/// A registered backup job and its lifecycle.
///
/// Control operations serialize on `run`; the run task only ever takes
/// `status`. Each run is tagged with a generation and results from an older
/// generation are discarded.
pub struct BackupJob {
    definition: JobDefinition,
    status: RwLock<JobStatus>,
    run: Mutex<Option<ActiveRun>>,
    generation: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl BackupJob {
    pub fn new(definition: JobDefinition, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            definition,
            status: RwLock::new(JobStatus {
                state: JobState::Pending,
                progress: 0.0,
                last_run_time: None,
                pause_reason: None,
            }),
            run: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
        })
    }

    /// Rebuilds a persisted job. A job saved while RUNNING has no task any
    /// more, so it comes back PAUSED and waits for an explicit resume.
    pub fn from_record(record: &JobRecord, events: Arc<dyn EventSink>) -> Arc<Self> {
        let state = match record.state {
            JobState::Running => JobState::Paused,
            other => other,
        };
        let pause_reason = (state == JobState::Paused).then_some(PauseReason::User);
        Arc::new(Self {
            definition: record.definition(),
            status: RwLock::new(JobStatus {
                state,
                progress: record.progress.clamp(0.0, 100.0),
                last_run_time: record.last_run_time,
                pause_reason,
            }),
            run: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn state(&self) -> JobState {
        self.status.read().state
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let status = self.status.read();
        JobSnapshot {
            name: self.definition.name().to_string(),
            backup_type: self.definition.backup_type,
            state: status.state,
            progress: status.progress,
            last_run_time: status.last_run_time,
            pause_reason: status.pause_reason,
        }
    }

    pub fn record(&self) -> JobRecord {
        let status = self.status.read();
        JobRecord {
            state: status.state,
            last_run_time: status.last_run_time,
            progress: status.progress,
            ..JobRecord::from(&self.definition)
        }
    }

    /// PENDING | COMPLETED | FAILED -> RUNNING. Starts a fresh run.
    pub fn execute(self: &Arc<Self>, ctx: RunContext) -> Result<(), JobError> {
        let mut run = self.run.lock();
        {
            let mut status = self.status.write();
            if !matches!(
                status.state,
                JobState::Pending | JobState::Completed | JobState::Failed
            ) {
                return Err(self.invalid(status.state, "execute"));
            }
            status.state = JobState::Running;
            status.progress = 0.0;
            status.last_run_time = Some(Utc::now());
            status.pause_reason = None;
            self.emit(&status);
        }
        let previous = run.take();
        *run = Some(self.start_run(ctx, previous));
        drop(run);

        info!("Job {} started", self.name());
        Ok(())
    }

    /// RUNNING -> PAUSED. The run parks before its next file. A user pause
    /// on a job held by admission control takes the pause over, so it is no
    /// longer lifted automatically.
    pub fn pause(&self, reason: PauseReason) -> Result<(), JobError> {
        let run = self.run.lock();
        {
            let mut status = self.status.write();
            if status.state == JobState::Paused
                && reason == PauseReason::User
                && status.pause_reason == Some(PauseReason::Admission)
            {
                status.pause_reason = Some(PauseReason::User);
                info!("Job {} is now held by the user", self.name());
                return Ok(());
            }
            if status.state != JobState::Running {
                return Err(self.invalid(status.state, "pause"));
            }
            status.state = JobState::Paused;
            status.pause_reason = Some(reason);
            self.emit(&status);
        }
        if let Some(active) = run.as_ref() {
            active.signal.send_replace(RunSignal::Pause);
        }
        drop(run);

        info!("Job {} paused ({:?})", self.name(), reason);
        Ok(())
    }

    /// PAUSED -> RUNNING. Wakes the parked run, or starts a new one when the
    /// previous task is gone (e.g. after a restart).
    pub fn resume(self: &Arc<Self>, ctx: RunContext) -> Result<(), JobError> {
        self.resume_from(None, ctx)
    }

    /// Resumes only if the job was paused for `reason`.
    pub fn resume_if_paused_by(self: &Arc<Self>, reason: PauseReason, ctx: RunContext) -> bool {
        self.resume_from(Some(reason), ctx).is_ok()
    }

    fn resume_from(
        self: &Arc<Self>,
        reason: Option<PauseReason>,
        ctx: RunContext,
    ) -> Result<(), JobError> {
        let mut run = self.run.lock();
        let current = self.generation.load(Ordering::SeqCst);
        let attached = run
            .as_ref()
            .map(|active| active.generation == current && !active.handle.is_finished())
            .unwrap_or(false);
        {
            let mut status = self.status.write();
            if status.state != JobState::Paused
                || (reason.is_some() && status.pause_reason != reason)
            {
                return Err(self.invalid(status.state, "resume"));
            }
            status.state = JobState::Running;
            status.pause_reason = None;
            if !attached {
                status.progress = 0.0;
                status.last_run_time = Some(Utc::now());
            }
            self.emit(&status);
        }

        if attached {
            if let Some(active) = run.as_ref() {
                active.signal.send_replace(RunSignal::Run);
            }
        } else {
            debug!("Job {} has no live run, starting a new one", self.name());
            let previous = run.take();
            *run = Some(self.start_run(ctx, previous));
        }
        drop(run);

        info!("Job {} resumed", self.name());
        Ok(())
    }

    /// RUNNING | PAUSED -> PENDING. The run is superseded immediately and
    /// exits at its next file boundary; nothing of it is kept. A later run
    /// waits for it to exit before touching the target.
    pub fn stop(&self) -> Result<(), JobError> {
        let run = self.run.lock();
        {
            let mut status = self.status.write();
            if !status.state.is_active() {
                return Err(self.invalid(status.state, "stop"));
            }
            status.state = JobState::Pending;
            status.progress = 0.0;
            status.pause_reason = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.emit(&status);
        }
        if let Some(active) = run.as_ref() {
            active.signal.send_replace(RunSignal::Stop);
        }
        drop(run);

        info!("Job {} stopped", self.name());
        Ok(())
    }

    fn start_run(self: &Arc<Self>, ctx: RunContext, previous: Option<ActiveRun>) -> ActiveRun {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (signal, rx) = watch::channel(RunSignal::Run);

        let job = self.clone();
        let handle = tokio::spawn(async move {
            // A stopped run may still be writing its current file.
            if let Some(previous) = previous {
                if !previous.handle.is_finished() {
                    debug!("Job {}: waiting for run {} to exit", job.name(), previous.generation);
                }
                let _ = previous.handle.await;
            }
            let runner = job.clone();
            let inner = tokio::spawn(async move { runner.run_once(generation, ctx, rx).await });
            let outcome = match inner.await {
                Ok(result) => result.map_err(RunFailure::Pipeline),
                Err(e) => Err(RunFailure::Panicked(e.to_string())),
            };
            job.finish(generation, outcome);
        });

        ActiveRun {
            generation,
            signal,
            handle,
        }
    }

    async fn run_once(
        self: Arc<Self>,
        generation: u64,
        ctx: RunContext,
        rx: watch::Receiver<RunSignal>,
    ) -> Result<RunReport, PipelineError> {
        let mut control = RunControl::new(rx);

        let _slot = tokio::select! {
            permit = ctx.gate.acquire() => permit,
            _ = control.stopped() => return Err(PipelineError::Canceled),
        };

        let job = self.clone();
        let watcher = control.clone();
        ctx.pipeline
            .run(&self.definition, &ctx.settings, &mut control, move |progress| {
                job.report_progress(generation, progress);
                !watcher.stop_requested()
            })
            .await
    }

    fn report_progress(&self, generation: u64, progress: f64) {
        let mut status = self.status.write();
        if self.generation.load(Ordering::SeqCst) != generation || !status.state.is_active() {
            return;
        }
        let progress = progress.clamp(0.0, 100.0);
        if progress > status.progress {
            status.progress = progress;
        }
    }

    fn finish(&self, generation: u64, outcome: Result<RunReport, RunFailure>) {
        let mut status = self.status.write();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Job {}: discarding result of superseded run {}", self.name(), generation);
            return;
        }
        status.pause_reason = None;

        match outcome {
            Ok(report) => {
                status.state = JobState::Completed;
                status.progress = 100.0;
                info!(
                    "Job {} completed in {} ms ({} files)",
                    self.name(),
                    report.elapsed_ms,
                    report.files_total
                );
            }
            Err(RunFailure::Pipeline(PipelineError::Canceled)) => {
                status.state = JobState::Pending;
                status.progress = 0.0;
                info!("Job {} canceled", self.name());
            }
            Err(RunFailure::Pipeline(e)) => {
                // Progress stays at the last reported value.
                status.state = JobState::Failed;
                warn!("Job {} failed: {}", self.name(), e);
                self.events.record(JobEvent::error(
                    Some(self.name()),
                    format!("{} ({})", e, e.code()),
                ));
            }
            Err(RunFailure::Panicked(message)) => {
                status.state = JobState::Failed;
                status.progress = 0.0;
                error!("Job {} aborted: {}", self.name(), message);
                self.events.record(JobEvent::error(
                    Some(self.name()),
                    format!("execution aborted: {}", message),
                ));
            }
        }
        self.emit(&status);
    }

    /// Called with the status lock held so records keep transition order.
    fn emit(&self, status: &JobStatus) {
        self.events
            .record(JobEvent::status(self.name(), status.state, status.progress));
    }

    fn invalid(&self, from: JobState, action: &'static str) -> JobError {
        JobError::InvalidTransition {
            name: self.name().to_string(),
            from,
            action,
        }
    }
}
