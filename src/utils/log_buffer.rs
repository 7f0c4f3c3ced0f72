use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backup::JobState;

/// Record emitted by jobs, the pipeline and the admission monitor.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Status {
        name: String,
        state: JobState,
        progress: f64,
        timestamp: DateTime<Utc>,
    },
    FileTransferred {
        job: String,
        source: PathBuf,
        target: PathBuf,
        size: u64,
        transfer_ms: u64,
        encryption_ms: Option<u64>,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        job: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn status(name: &str, state: JobState, progress: f64) -> Self {
        JobEvent::Status {
            name: name.to_string(),
            state,
            progress,
            timestamp: Utc::now(),
        }
    }

    pub fn error(job: Option<&str>, message: impl Into<String>) -> Self {
        JobEvent::Error {
            job: job.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn level(&self) -> &'static str {
        match self {
            JobEvent::Status { .. } => "info",
            JobEvent::FileTransferred { error: Some(_), .. } => "warn",
            JobEvent::FileTransferred { .. } => "info",
            JobEvent::Error { .. } => "error",
        }
    }

    pub fn job_name(&self) -> Option<&str> {
        match self {
            JobEvent::Status { name, .. } => Some(name),
            JobEvent::FileTransferred { job, .. } => Some(job),
            JobEvent::Error { job, .. } => job.as_deref(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Status { timestamp, .. }
            | JobEvent::FileTransferred { timestamp, .. }
            | JobEvent::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Destination for job events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: JobEvent);
}

/// Bounded in-memory event log; every event is also mirrored to tracing.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<JobEvent>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<JobEvent> {
        let buffer = self.buffer.lock();
        let skip = limit.map(|n| buffer.len().saturating_sub(n)).unwrap_or(0);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Status records only, oldest first.
    pub fn statuses_for(&self, name: &str) -> Vec<(JobState, f64)> {
        self.buffer
            .lock()
            .iter()
            .filter_map(|event| match event {
                JobEvent::Status { name: n, state, progress, .. } if n == name => {
                    Some((*state, *progress))
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for LogBuffer {
    fn record(&self, event: JobEvent) {
        match &event {
            JobEvent::Status { name, state, progress, .. } => {
                info!(job = %name, state = %state, progress = *progress, "job status");
            }
            JobEvent::FileTransferred { job, source, size, transfer_ms, error: Some(err), .. } => {
                warn!(job = %job, source = %source.display(), size = *size, transfer_ms = *transfer_ms, "file failed: {}", err);
            }
            JobEvent::FileTransferred { job, source, size, transfer_ms, encryption_ms, .. } => {
                tracing::debug!(job = %job, source = %source.display(), size = *size, transfer_ms = *transfer_ms, encryption_ms = ?encryption_ms, "file transferred");
            }
            JobEvent::Error { job, message, .. } => {
                error!(job = ?job, "{}", message);
            }
        }

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }
}

/// Forwards each event to every wrapped sink.
#[derive(Clone, Default)]
pub struct FanOut {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanOut {
    fn record(&self, event: JobEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
