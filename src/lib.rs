//! Backup job service: named directory-to-directory backup jobs with a
//! pausable state machine, optional per-extension encryption, admission
//! control against blocked processes, transfer throttling and a remote
//! control protocol over TCP and WebSocket.

pub mod api;
pub mod backup;
pub mod crypto;
pub mod remote;
pub mod storage;
pub mod utils;
pub mod web;

pub use backup::{BackupManager, BackupType, JobDefinition, JobState};
pub use remote::{CommandKind, JobStatusDto, RemoteClient, RemoteCommand};
