//! Wire format shared by the TCP and WebSocket listeners.
//!
//! Client to server: `{"Command": "run", "JobName": "Backup1"}`.
//! Server to client: a JSON array of [`JobStatusDto`]. On TCP every document
//! is a single line terminated by `\n`.

use crate::backup::{BackupManager, BackupType, JobSnapshot, JobState, ManagerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest command line the server accepts.
pub const MAX_COMMAND_LINE: usize = 64 * 1024;
/// Longest status line the client accepts.
pub const MAX_STATUS_LINE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CommandKind {
    Pause,
    Resume,
    Stop,
    Run,
    RunAll,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::Stop => "stop",
            CommandKind::Run => "run",
            CommandKind::RunAll => "runall",
        }
    }

    pub fn needs_job(&self) -> bool {
        !matches!(self, CommandKind::RunAll)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(CommandKind::Pause),
            "resume" => Ok(CommandKind::Resume),
            "stop" => Ok(CommandKind::Stop),
            "run" => Ok(CommandKind::Run),
            "runall" => Ok(CommandKind::RunAll),
            _ => Err(ProtocolError::UnknownCommand(s.to_string())),
        }
    }
}

impl TryFrom<String> for CommandKind {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    #[serde(rename = "Command")]
    pub command: CommandKind,
    #[serde(rename = "JobName", default)]
    pub job_name: String,
}

impl RemoteCommand {
    pub fn new(command: CommandKind, job_name: impl Into<String>) -> Self {
        Self {
            command,
            job_name: job_name.into(),
        }
    }

    pub fn run_all() -> Self {
        Self::new(CommandKind::RunAll, "")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobStatusDto {
    pub name: String,
    #[serde(rename = "Type")]
    pub backup_type: BackupType,
    pub progress: f64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub state: JobState,
}

impl From<&JobSnapshot> for JobStatusDto {
    fn from(snapshot: &JobSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            backup_type: snapshot.backup_type,
            progress: snapshot.progress,
            last_run_time: snapshot.last_run_time,
            state: snapshot.state,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("command {0} needs a job name")]
    MissingJobName(CommandKind),
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("connection closed")]
    Closed,
}

/// Serializes one document as a single `\n` terminated line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Reads one line of at most `limit` bytes (terminator excluded) into
/// `line`. Returns `false` at end of stream.
pub async fn read_line<R>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
) -> Result<bool, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader).take(limit as u64 + 1).read_line(line).await?;
    if read == 0 {
        return Ok(false);
    }
    if read > limit && !line.ends_with('\n') {
        return Err(ProtocolError::LineTooLong(limit));
    }
    Ok(true)
}

pub fn decode_command(text: &str) -> Result<RemoteCommand, ProtocolError> {
    let command: RemoteCommand = serde_json::from_str(text.trim())?;
    if command.command.needs_job() && command.job_name.trim().is_empty() {
        return Err(ProtocolError::MissingJobName(command.command));
    }
    Ok(command)
}

pub fn decode_status(text: &str) -> Result<Vec<JobStatusDto>, ProtocolError> {
    Ok(serde_json::from_str(text.trim())?)
}

/// What a remote surface needs from the scheduler.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    fn status(&self) -> Vec<JobStatusDto>;

    async fn dispatch(&self, command: RemoteCommand) -> Result<(), ManagerError>;
}

#[async_trait]
impl CommandHandler for BackupManager {
    fn status(&self) -> Vec<JobStatusDto> {
        BackupManager::status(self)
    }

    async fn dispatch(&self, command: RemoteCommand) -> Result<(), ManagerError> {
        BackupManager::dispatch(self, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_case_insensitively() {
        let cmd = decode_command(r#"{"Command":"Pause","JobName":"Backup1"}"#).unwrap();
        assert_eq!(cmd, RemoteCommand::new(CommandKind::Pause, "Backup1"));

        let all = decode_command("{\"Command\":\"runall\"}\n").unwrap();
        assert_eq!(all.command, CommandKind::RunAll);

        let line = encode_line(&RemoteCommand::new(CommandKind::Stop, "x")).unwrap();
        assert_eq!(line, "{\"Command\":\"stop\",\"JobName\":\"x\"}\n");
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(matches!(
            decode_command(r#"{"Command":"format","JobName":"a"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_command(r#"{"Command":"run"}"#),
            Err(ProtocolError::MissingJobName(CommandKind::Run))
        ));
        assert!(decode_command("not json").is_err());
    }

    #[tokio::test]
    async fn overlong_lines_are_refused() {
        let mut line = String::new();
        let mut input = &b"12345\n123456\n"[..];
        assert!(read_line(&mut input, &mut line, 5).await.unwrap());
        assert_eq!(line, "12345\n");
        assert!(matches!(
            read_line(&mut input, &mut line, 5).await,
            Err(ProtocolError::LineTooLong(5))
        ));

        let mut tail = &b"abc"[..];
        assert!(read_line(&mut tail, &mut line, 5).await.unwrap());
        assert_eq!(line, "abc");
        assert!(!read_line(&mut tail, &mut line, 5).await.unwrap());
    }

    #[test]
    fn status_uses_wire_field_names() {
        let dto = JobStatusDto {
            name: "Backup1".into(),
            backup_type: BackupType::Full,
            progress: 12.5,
            last_run_time: None,
            state: JobState::Running,
        };
        let line = encode_line(&vec![dto.clone()]).unwrap();
        assert!(line.ends_with('\n'));
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json[0]["Name"], "Backup1");
        assert_eq!(json[0]["Type"], "FULL");
        assert_eq!(json[0]["State"], "RUNNING");
        assert!(json[0]["LastRunTime"].is_null());
        assert_eq!(decode_status(&line).unwrap(), vec![dto]);
    }
}
