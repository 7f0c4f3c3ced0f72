pub mod admission;
pub mod job;
pub mod manager;
pub mod pipeline;
pub mod scanner;
pub mod throttle;

pub use admission::{AdmissionEvent, AdmissionMonitor, ProcessProbe, SystemProcessProbe};
pub use job::{BackupJob, JobError, JobSnapshot, RunContext};
pub use manager::{BackupManager, ManagerError};
pub use pipeline::{CopyPipeline, PipelineError, RunReport};
pub use throttle::{ParallelismGate, Throttle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Full,
    Differential,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    /// RUNNING or PAUSED: a run exists (or must be re-attached on resume).
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Paused)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => f.write_str("FULL"),
            BackupType::Differential => f.write_str("DIFFERENTIAL"),
        }
    }
}

/// Why a job is paused. Only admission pauses are lifted automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    User,
    Admission,
}

/// Immutable definition of a backup job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    name: String,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub backup_type: BackupType,
    pub encrypt_files: bool,
    pub extensions_to_encrypt: Vec<String>,
    pub blocked_processes: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("job name must not be empty")]
    EmptyName,
    #[error("target directory must not be empty")]
    EmptyTarget,
    #[error("source directory does not exist: {0}")]
    SourceMissing(PathBuf),
}

impl JobDefinition {
    /// Validates a new definition. The source directory must exist now.
    pub fn new(
        name: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        backup_type: BackupType,
    ) -> Result<Self, ValidationError> {
        let definition = Self::unchecked(name, source_dir, target_dir, backup_type);
        definition.validate()?;
        Ok(definition)
    }

    fn unchecked(
        name: impl Into<String>,
        source_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        backup_type: BackupType,
    ) -> Self {
        Self {
            name: name.into().trim().to_string(),
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
            backup_type,
            encrypt_files: false,
            extensions_to_encrypt: Vec::new(),
            blocked_processes: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.target_dir.as_os_str().is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        if !self.source_dir.is_dir() {
            return Err(ValidationError::SourceMissing(self.source_dir.clone()));
        }
        Ok(())
    }

    pub fn with_encryption<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.encrypt_files = true;
        self.extensions_to_encrypt = normalize_extensions(extensions);
        self
    }

    pub fn with_blocked_processes<I, S>(mut self, processes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_processes = processes
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.trim().is_empty())
            .collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn same_name(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other.trim())
    }

    /// Whether `path` should be handed to the encryptor after copying.
    pub fn should_encrypt(&self, path: &Path) -> bool {
        self.encrypt_files
            && extension_of(path)
                .map(|ext| self.extensions_to_encrypt.iter().any(|e| *e == ext))
                .unwrap_or(false)
    }
}

/// Lower-cased extension without the leading dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

pub fn normalize_extensions<I, S>(extensions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for ext in extensions {
        let ext = ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase();
        if !ext.is_empty() && !normalized.contains(&ext) {
            normalized.push(ext);
        }
    }
    normalized
}

/// Persisted form of a job, one element of the flat job list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct JobRecord {
    pub name: String,
    pub source_directory: PathBuf,
    pub target_directory: PathBuf,
    #[serde(rename = "Type")]
    pub backup_type: BackupType,
    #[serde(default)]
    pub encrypt_files: bool,
    #[serde(default)]
    pub extensions_to_encrypt: Vec<String>,
    #[serde(default)]
    pub blocked_processes: Vec<String>,
    #[serde(default = "default_state")]
    pub state: JobState,
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: f64,
}

fn default_state() -> JobState {
    JobState::Pending
}

impl JobRecord {
    /// Definitions loaded from storage skip the source-exists check; a
    /// vanished source surfaces as a failed run instead.
    pub fn definition(&self) -> JobDefinition {
        let mut definition = JobDefinition::unchecked(
            self.name.clone(),
            self.source_directory.clone(),
            self.target_directory.clone(),
            self.backup_type,
        );
        definition.encrypt_files = self.encrypt_files;
        definition.extensions_to_encrypt = normalize_extensions(&self.extensions_to_encrypt);
        definition.blocked_processes = self.blocked_processes.clone();
        definition
    }
}

impl From<&JobDefinition> for JobRecord {
    fn from(d: &JobDefinition) -> Self {
        JobRecord {
            name: d.name.clone(),
            source_directory: d.source_dir.clone(),
            target_directory: d.target_dir.clone(),
            backup_type: d.backup_type,
            encrypt_files: d.encrypt_files,
            extensions_to_encrypt: d.extensions_to_encrypt.clone(),
            blocked_processes: d.blocked_processes.clone(),
            state: JobState::Pending,
            last_run_time: None,
            progress: 0.0,
        }
    }
}
