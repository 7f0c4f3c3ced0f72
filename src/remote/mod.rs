pub mod client;
pub mod protocol;
pub mod server;

pub use client::RemoteClient;
pub use protocol::{CommandHandler, CommandKind, JobStatusDto, ProtocolError, RemoteCommand};
pub use server::{RemoteServer, StatusBroadcaster};
