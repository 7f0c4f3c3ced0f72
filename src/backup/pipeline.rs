use super::job::RunControl;
use super::scanner::{needs_copy, order_by_priority, DirectoryScanner, SourceFile};
use super::throttle::Throttle;
use super::JobDefinition;
use crate::crypto::Encryptor;
use crate::utils::config::GlobalConfig;
use crate::utils::log_buffer::{EventSink, JobEvent};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("source directory not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("source directory vanished during the run: {}", .0.display())]
    SourceVanished(PathBuf),
    #[error("canceled")]
    Canceled,
    #[error("no file could be copied ({failed} failed)")]
    NoFileSucceeded { failed: usize },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "not found",
            PipelineError::SourceVanished(_) => "source vanished",
            PipelineError::Canceled => "canceled",
            PipelineError::NoFileSucceeded { .. } => "no file copied",
            PipelineError::Io { .. } => "io error",
            PipelineError::Internal(_) => "internal error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub elapsed_ms: u64,
    pub files_total: usize,
    pub files_copied: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub encryption_failures: usize,
}

/// Copies (and optionally encrypts) one job's source tree into its target.
#[derive(Clone)]
pub struct CopyPipeline {
    throttle: Arc<Throttle>,
    encryptor: Arc<dyn Encryptor>,
    events: Arc<dyn EventSink>,
}

struct Transferred {
    transfer_ms: u64,
    encryption: Option<Result<u64, String>>,
}

impl CopyPipeline {
    pub fn new(
        throttle: Arc<Throttle>,
        encryptor: Arc<dyn Encryptor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            throttle,
            encryptor,
            events,
        }
    }

    /// Runs the job once. `on_progress` receives the completed percentage
    /// after each file; returning `false` aborts with [`PipelineError::Canceled`].
    /// Pause and stop are observed through `control` before each file.
    pub async fn run<F>(
        &self,
        job: &JobDefinition,
        settings: &GlobalConfig,
        control: &mut RunControl,
        mut on_progress: F,
    ) -> Result<RunReport, PipelineError>
    where
        F: FnMut(f64) -> bool + Send,
    {
        let started = Instant::now();
        let name = job.name().to_string();

        if !job.source_dir.is_dir() {
            return Err(PipelineError::NotFound(job.source_dir.clone()));
        }

        let source = job.source_dir.clone();
        let scan = tokio::task::spawn_blocking(move || DirectoryScanner::new(&source).scan())
            .await
            .map_err(|e| PipelineError::Internal(e.to_string()))?
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    PipelineError::NotFound(job.source_dir.clone())
                } else {
                    PipelineError::Io {
                        path: job.source_dir.clone(),
                        source: e,
                    }
                }
            })?;

        for (path, message) in &scan.unreadable {
            self.events.record(JobEvent::error(
                Some(&name),
                format!("cannot read {}: {}", path.display(), message),
            ));
        }

        // Mirror the directory structure, including empty directories.
        create_dir(&job.target_dir).await?;
        for relative in &scan.directories {
            create_dir(&job.target_dir.join(relative)).await?;
        }

        let mut files = scan.files;
        order_by_priority(&mut files, &settings.priority_extensions);

        let mut report = RunReport {
            files_total: files.len(),
            ..RunReport::default()
        };
        info!("{}: {} files to process ({})", name, files.len(), job.backup_type);

        if files.is_empty() {
            on_progress(100.0);
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        for (processed, file) in files.iter().enumerate() {
            if control.checkpoint().await.is_err() {
                return Err(PipelineError::Canceled);
            }

            let target = file.target_in(&job.target_dir);
            if !needs_copy(file, &target, job.backup_type) {
                debug!("{}: {} is up to date", name, file.relative.display());
                report.files_skipped += 1;
            } else {
                match self.transfer(job, settings, file, &target).await {
                    Ok(done) => {
                        report.files_copied += 1;
                        let (encryption_ms, error) = match done.encryption {
                            Some(Ok(ms)) => (Some(ms), None),
                            Some(Err(message)) => {
                                report.encryption_failures += 1;
                                self.events.record(JobEvent::error(
                                    Some(&name),
                                    format!("encryption failed for {}: {}", target.display(), message),
                                ));
                                (None, Some(format!("encryption: {}", message)))
                            }
                            None => (None, None),
                        };
                        self.record_file(&name, file, &target, done.transfer_ms, encryption_ms, error);
                    }
                    Err(e) => {
                        report.files_failed += 1;
                        self.record_file(&name, file, &target, 0, None, Some(e.to_string()));
                        if !job.source_dir.is_dir() {
                            return Err(PipelineError::SourceVanished(job.source_dir.clone()));
                        }
                    }
                }
            }

            let progress = (processed + 1) as f64 / report.files_total as f64 * 100.0;
            if !on_progress(progress) {
                return Err(PipelineError::Canceled);
            }
        }

        // A pause that arrived during the last file still holds the run.
        if control.checkpoint().await.is_err() {
            return Err(PipelineError::Canceled);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.files_failed > 0 && report.files_copied == 0 && report.files_skipped == 0 {
            return Err(PipelineError::NoFileSucceeded {
                failed: report.files_failed,
            });
        }

        info!(
            "{}: done in {} ms ({} copied, {} up to date, {} failed)",
            name, report.elapsed_ms, report.files_copied, report.files_skipped, report.files_failed
        );
        Ok(report)
    }

    async fn transfer(
        &self,
        job: &JobDefinition,
        settings: &GlobalConfig,
        file: &SourceFile,
        target: &Path,
    ) -> io::Result<Transferred> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Held for the whole transfer, encryption included.
        let _large = self
            .throttle
            .large_file_guard(file.size, settings.bandwidth_limit_bytes)
            .await;
        let started = Instant::now();
        tokio::fs::copy(&file.path, target).await?;
        let transfer_ms = started.elapsed().as_millis() as u64;

        let encryption = if job.should_encrypt(&file.path) {
            Some(self.encrypt_in_place(target, &settings.encryption_key).await)
        } else {
            None
        };

        Ok(Transferred {
            transfer_ms,
            encryption,
        })
    }

    /// Moves the plain copy aside, encrypts it into the final name and drops
    /// the plain copy only once the encryptor reported success. On failure
    /// the plain copy is put back under the final name.
    async fn encrypt_in_place(&self, target: &Path, key: &str) -> Result<u64, String> {
        let plain = temp_path(target);
        tokio::fs::rename(target, &plain)
            .await
            .map_err(|e| format!("cannot move plain copy aside: {}", e))?;

        let encryptor = self.encryptor.clone();
        let (source, dest, key) = (plain.clone(), target.to_path_buf(), key.to_string());
        let result = tokio::task::spawn_blocking(move || encryptor.encrypt(&source, &dest, &key))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        match result {
            Ok(elapsed) if target.is_file() => {
                if let Err(e) = tokio::fs::remove_file(&plain).await {
                    warn!("Could not remove plain copy {}: {}", plain.display(), e);
                }
                Ok(elapsed.as_millis() as u64)
            }
            outcome => {
                let message = match outcome {
                    Err(message) => message,
                    Ok(_) => "encryptor reported success but produced no file".to_string(),
                };
                let _ = tokio::fs::remove_file(target).await;
                if let Err(e) = tokio::fs::rename(&plain, target).await {
                    return Err(format!("{}; restoring plain copy failed: {}", message, e));
                }
                Err(message)
            }
        }
    }

    fn record_file(
        &self,
        job: &str,
        file: &SourceFile,
        target: &Path,
        transfer_ms: u64,
        encryption_ms: Option<u64>,
        error: Option<String>,
    ) {
        self.events.record(JobEvent::FileTransferred {
            job: job.to_string(),
            source: file.path.clone(),
            target: target.to_path_buf(),
            size: file.size,
            transfer_ms,
            encryption_ms,
            error,
            timestamp: chrono::Utc::now(),
        });
    }
}

async fn create_dir(path: &Path) -> Result<(), PipelineError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".plain-tmp");
    target.with_file_name(name)
}
