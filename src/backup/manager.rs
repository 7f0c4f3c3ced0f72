use super::admission::{AdmissionEvent, AdmissionMonitor};
use super::job::{BackupJob, JobError, RunContext};
use super::pipeline::CopyPipeline;
use super::throttle::Throttle;
use super::{JobDefinition, PauseReason, ValidationError};
use crate::crypto::Encryptor;
use crate::remote::protocol::{CommandKind, JobStatusDto, RemoteCommand};
use crate::storage::{EventEntry, Storage};
use crate::utils::config::ConfigHandle;
use crate::utils::log_buffer::{EventSink, JobEvent};
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("a job named {0} already exists")]
    Duplicate(String),
    #[error("invalid job: {0}")]
    Invalid(#[from] ValidationError),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("blocked processes are running: {}", .0.join(", "))]
    Blocked(Vec<String>),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Job registry and scheduler. Cheap to clone.
#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: RwLock<Vec<Arc<BackupJob>>>,
    storage: Option<Storage>,
    admission: Arc<AdmissionMonitor>,
    throttle: Arc<Throttle>,
    config: ConfigHandle,
    encryptor: Arc<dyn Encryptor>,
    events: Arc<dyn EventSink>,
    /// Held from registry snapshot to write so saves land in order.
    persist_lock: tokio::sync::Mutex<()>,
}

impl BackupManager {
    /// Builds the manager and starts consuming admission events. Must be
    /// called inside a tokio runtime.
    pub fn new(
        config: ConfigHandle,
        storage: Option<Storage>,
        events: Arc<dyn EventSink>,
        encryptor: Arc<dyn Encryptor>,
        admission: Arc<AdmissionMonitor>,
        admission_events: mpsc::Receiver<AdmissionEvent>,
    ) -> Self {
        let throttle = Arc::new(Throttle::new(config.snapshot().max_parallel_jobs));
        let manager = Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(Vec::new()),
                storage,
                admission,
                throttle,
                config,
                encryptor,
                events,
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        };

        tokio::spawn(Self::process_admission(
            Arc::downgrade(&manager.inner),
            admission_events,
        ));

        manager
    }

    async fn process_admission(inner: Weak<Inner>, mut rx: mpsc::Receiver<AdmissionEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            BackupManager { inner }.on_admission(event);
        }
        debug!("Admission event loop finished");
    }

    fn on_admission(&self, event: AdmissionEvent) {
        let watched: Vec<Arc<BackupJob>> = self
            .inner
            .jobs
            .read()
            .iter()
            .filter(|job| self.inner.admission.is_registered(job.name()))
            .cloned()
            .collect();

        match event {
            AdmissionEvent::Blocked { processes } => {
                self.inner.events.record(JobEvent::error(
                    None,
                    format!("blocked processes running: {}", processes.join(", ")),
                ));
                for job in watched {
                    if job.state() == super::JobState::Running {
                        if let Err(e) = job.pause(PauseReason::Admission) {
                            debug!("{}", e);
                        }
                    }
                }
            }
            AdmissionEvent::Unblocked => {
                let ctx = self.run_context();
                for job in watched {
                    if job.resume_if_paused_by(PauseReason::Admission, ctx.clone()) {
                        info!("Job {} resumed after blocked processes exited", job.name());
                    }
                }
            }
        }
    }

    /// Restores the persisted registry. Returns the number of jobs loaded.
    pub async fn load_jobs(&self) -> Result<usize> {
        let Some(storage) = &self.inner.storage else {
            return Ok(0);
        };
        let records = storage.load_jobs().await?;

        let mut jobs = self.inner.jobs.write();
        let mut loaded = 0;
        for record in &records {
            if jobs.iter().any(|job| job.definition().same_name(&record.name)) {
                warn!("Skipping duplicate persisted job {}", record.name);
                continue;
            }
            jobs.push(BackupJob::from_record(record, self.inner.events.clone()));
            loaded += 1;
        }
        info!("Loaded {} jobs from storage", loaded);
        Ok(loaded)
    }

    pub async fn add(&self, definition: JobDefinition) -> Result<(), ManagerError> {
        definition.validate()?;
        {
            let mut jobs = self.inner.jobs.write();
            if jobs.iter().any(|job| job.definition().same_name(definition.name())) {
                return Err(ManagerError::Duplicate(definition.name().to_string()));
            }
            info!("Adding job {}", definition.name());
            jobs.push(BackupJob::new(definition, self.inner.events.clone()));
        }
        self.persist_logged().await;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<(), ManagerError> {
        let job = {
            let mut jobs = self.inner.jobs.write();
            let index = jobs
                .iter()
                .position(|job| job.definition().same_name(name))
                .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
            jobs.remove(index)
        };

        if job.state().is_active() {
            let _ = job.stop();
        }
        self.inner.admission.unregister(job.name());
        info!("Removed job {}", job.name());
        self.persist_logged().await;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackupJob>> {
        self.inner
            .jobs
            .read()
            .iter()
            .find(|job| job.definition().same_name(name))
            .cloned()
    }

    fn find(&self, name: &str) -> Result<Arc<BackupJob>, ManagerError> {
        self.get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    /// Starts one job. Fails fast while any of its blocked processes runs.
    pub async fn execute(&self, name: &str) -> Result<(), ManagerError> {
        let job = self.find(name)?;
        self.admit(&job).await?;
        job.execute(self.run_context())?;
        Ok(())
    }

    /// Starts every idle job with one config snapshot. Nothing is started
    /// if any job's blocked processes are running.
    pub async fn execute_all(&self) -> Result<(), ManagerError> {
        let jobs: Vec<Arc<BackupJob>> = self.inner.jobs.read().clone();

        let watched: Vec<String> = jobs
            .iter()
            .flat_map(|job| job.definition().blocked_processes.iter().cloned())
            .collect();
        let running = self.inner.admission.blocking_processes(&watched).await;
        if !running.is_empty() {
            return Err(self.blocked(None, running));
        }

        let ctx = self.run_context();
        for job in jobs {
            if job.state().is_active() {
                debug!("Job {} already {}, skipping", job.name(), job.state());
                continue;
            }
            self.inner
                .admission
                .register(job.name(), &job.definition().blocked_processes);
            if let Err(e) = job.execute(ctx.clone()) {
                warn!("{}", e);
            }
        }
        Ok(())
    }

    pub fn pause(&self, name: &str) -> Result<(), ManagerError> {
        self.find(name)?.pause(PauseReason::User)?;
        Ok(())
    }

    /// Resumes a paused job; refused like Execute while blocked processes run.
    pub async fn resume(&self, name: &str) -> Result<(), ManagerError> {
        let job = self.find(name)?;
        self.admit(&job).await?;
        job.resume(self.run_context())?;
        Ok(())
    }

    pub fn stop(&self, name: &str) -> Result<(), ManagerError> {
        self.find(name)?.stop()?;
        Ok(())
    }

    pub fn status(&self) -> Vec<JobStatusDto> {
        self.inner
            .jobs
            .read()
            .iter()
            .map(|job| JobStatusDto::from(&job.snapshot()))
            .collect()
    }

    /// Entry point for every remote surface.
    pub async fn dispatch(&self, command: RemoteCommand) -> Result<(), ManagerError> {
        debug!("Dispatching {} {:?}", command.command, command.job_name);
        let name = command.job_name.trim();
        match command.command {
            CommandKind::Run => self.execute(name).await,
            CommandKind::RunAll => self.execute_all().await,
            CommandKind::Pause => self.pause(name),
            CommandKind::Resume => self.resume(name).await,
            CommandKind::Stop => self.stop(name),
        }
    }

    /// Writes the whole registry to storage.
    pub async fn persist(&self) -> Result<()> {
        let Some(storage) = &self.inner.storage else {
            return Ok(());
        };
        let _ordered = self.inner.persist_lock.lock().await;
        let records: Vec<_> = self.inner.jobs.read().iter().map(|job| job.record()).collect();
        storage.save_jobs(&records).await?;
        debug!("Persisted {} jobs", records.len());
        Ok(())
    }

    /// Most recent stored events, newest first. Empty without storage.
    pub async fn events(&self, job: Option<&str>, limit: i64) -> Result<Vec<EventEntry>> {
        match &self.inner.storage {
            Some(storage) => storage.get_events(job, limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!("Failed to persist job list: {}", e);
            self.inner
                .events
                .record(JobEvent::error(None, format!("failed to persist job list: {}", e)));
        }
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.inner.throttle
    }

    pub fn admission(&self) -> &Arc<AdmissionMonitor> {
        &self.inner.admission
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    async fn admit(&self, job: &BackupJob) -> Result<(), ManagerError> {
        let blocked = &job.definition().blocked_processes;
        let running = self.inner.admission.blocking_processes(blocked).await;
        if !running.is_empty() {
            return Err(self.blocked(Some(job.name()), running));
        }
        self.inner.admission.register(job.name(), blocked);
        Ok(())
    }

    fn blocked(&self, job: Option<&str>, running: Vec<String>) -> ManagerError {
        let error = ManagerError::Blocked(running);
        self.inner.events.record(JobEvent::error(job, error.to_string()));
        error
    }

    fn run_context(&self) -> RunContext {
        RunContext {
            pipeline: CopyPipeline::new(
                self.inner.throttle.clone(),
                self.inner.encryptor.clone(),
                self.inner.events.clone(),
            ),
            gate: self.inner.throttle.gate().clone(),
            settings: self.inner.config.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::admission::tests::ScriptedProbe;
    use crate::backup::{BackupType, JobState};
    use crate::crypto::{EncryptError, StreamCipher};
    use crate::utils::config::Config;
    use crate::utils::log_buffer::LogBuffer;
    use std::path::Path;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Latch {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Latch {
        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    /// Holds every encryption until the latch opens.
    struct Held(Arc<Latch>);

    impl Encryptor for Held {
        fn encrypt(&self, source: &Path, dest: &Path, key: &str) -> Result<Duration, EncryptError> {
            self.0.wait();
            StreamCipher.encrypt(source, dest, key)
        }
    }

    struct Fixture {
        manager: BackupManager,
        probe: Arc<ScriptedProbe>,
        log: LogBuffer,
        dir: tempfile::TempDir,
    }

    async fn fixture_with(encryptor: Arc<dyn Encryptor>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = LogBuffer::new(256);
        let probe = Arc::new(ScriptedProbe::default());
        let (admission, rx) = AdmissionMonitor::new(probe.clone(), Duration::from_millis(10));
        let config = ConfigHandle::new(Config {
            max_parallel_jobs: 4,
            encryption_key: "secret".into(),
            ..Config::default()
        });
        let storage = Storage::in_memory().await.unwrap();
        let manager = BackupManager::new(
            config,
            Some(storage),
            Arc::new(log.clone()),
            encryptor,
            admission,
            rx,
        );
        Fixture {
            manager,
            probe,
            log,
            dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(StreamCipher::new())).await
    }

    fn definition(root: &Path, name: &str, files: &[&str]) -> JobDefinition {
        let src = root.join(format!("{}-src", name));
        std::fs::create_dir_all(&src).unwrap();
        for file in files {
            std::fs::write(src.join(file), vec![b'x'; 512]).unwrap();
        }
        JobDefinition::new(name, src, root.join(format!("{}-dst", name)), BackupType::Full)
            .unwrap()
            .with_encryption(["enc"])
            .with_blocked_processes(["excel"])
    }

    async fn wait_for(manager: &BackupManager, name: &str, state: JobState) {
        for _ in 0..500 {
            if manager.get(name).map(|job| job.state()) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {}", name, state);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_case_insensitively() {
        let f = fixture().await;
        f.manager.add(definition(f.dir.path(), "Job1", &["a.txt"])).await.unwrap();
        let again = definition(f.dir.path(), "job1", &["a.txt"]);
        assert!(matches!(
            f.manager.add(again).await,
            Err(ManagerError::Duplicate(name)) if name == "job1"
        ));
        assert_eq!(f.manager.status().len(), 1);
    }

    #[tokio::test]
    async fn unknown_jobs_are_reported() {
        let f = fixture().await;
        assert!(matches!(
            f.manager.remove("ghost").await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(f.manager.execute("ghost").await, Err(ManagerError::NotFound(_))));
        assert!(matches!(f.manager.pause("ghost"), Err(ManagerError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_refuses_while_blocked_process_runs() {
        let f = fixture().await;
        f.manager
            .add(definition(f.dir.path(), "Job1", &["a.txt", "b.txt"]))
            .await
            .unwrap();
        f.probe.set(&["Excel.exe"]);

        assert!(matches!(f.manager.execute("Job1").await, Err(ManagerError::Blocked(_))));
        assert!(matches!(f.manager.execute_all().await, Err(ManagerError::Blocked(_))));
        assert_eq!(f.manager.get("job1").unwrap().state(), JobState::Pending);

        f.probe.set(&[]);
        f.manager.execute("JOB1").await.unwrap();
        wait_for(&f.manager, "Job1", JobState::Completed).await;
        assert!(f.manager.admission().is_registered("job1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admission_pauses_running_jobs_but_leaves_user_pauses_alone() {
        let latch = Arc::new(Latch::default());
        let f = fixture_with(Arc::new(Held(latch.clone()))).await;
        f.manager.add(definition(f.dir.path(), "A", &["a.enc"])).await.unwrap();
        f.manager.add(definition(f.dir.path(), "B", &["b.enc"])).await.unwrap();

        f.manager.execute("A").await.unwrap();
        f.manager.execute("B").await.unwrap();
        f.manager.pause("A").unwrap();

        f.manager.on_admission(AdmissionEvent::Blocked {
            processes: vec!["excel".into()],
        });
        let b = f.manager.get("B").unwrap().snapshot();
        assert_eq!(b.state, JobState::Paused);
        assert_eq!(b.pause_reason, Some(PauseReason::Admission));
        assert_eq!(
            f.manager.get("A").unwrap().snapshot().pause_reason,
            Some(PauseReason::User)
        );

        f.manager.on_admission(AdmissionEvent::Unblocked);
        assert_eq!(f.manager.get("B").unwrap().state(), JobState::Running);
        latch.release();

        wait_for(&f.manager, "B", JobState::Completed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.get("A").unwrap().state(), JobState::Paused);
        assert!(f
            .log
            .get_logs(None)
            .iter()
            .any(|e| matches!(e, JobEvent::Error { message, .. } if message.contains("excel"))));

        f.manager.resume("a").await.unwrap();
        wait_for(&f.manager, "A", JobState::Completed).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_all_starts_every_idle_job() {
        let f = fixture().await;
        for name in ["A", "B", "C"] {
            f.manager
                .add(definition(f.dir.path(), name, &["1.txt", "2.enc", "3.txt"]))
                .await
                .unwrap();
        }
        f.manager.dispatch(RemoteCommand::run_all()).await.unwrap();
        for name in ["A", "B", "C"] {
            wait_for(&f.manager, name, JobState::Completed).await;
        }
        assert!(f.manager.status().iter().all(|s| s.progress == 100.0));
    }

    #[tokio::test]
    async fn structural_changes_are_persisted() {
        let f = fixture().await;
        f.manager.add(definition(f.dir.path(), "Keep", &["a.txt"])).await.unwrap();
        f.manager.add(definition(f.dir.path(), "Drop", &["a.txt"])).await.unwrap();
        f.manager.remove("drop").await.unwrap();

        let storage = f.manager.inner.storage.clone().unwrap();
        let records = storage.load_jobs().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Keep");
        assert_eq!(records[0].blocked_processes, vec!["excel"]);
    }
}
