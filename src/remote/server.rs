use super::protocol::{
    decode_command, encode_line, read_line, CommandHandler, JobStatusDto, ProtocolError,
    MAX_COMMAND_LINE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Serialises the status once per tick and fans it out to every client.
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<Arc<str>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers reached.
    pub fn publish(&self, statuses: &[JobStatusDto]) -> usize {
        match serde_json::to_string(statuses) {
            Ok(json) => self.tx.send(Arc::from(json)).unwrap_or(0),
            Err(e) => {
                error!("Failed to serialise status: {}", e);
                0
            }
        }
    }

    pub fn start(&self, handler: Arc<dyn CommandHandler>, every: Duration) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if broadcaster.tx.receiver_count() > 0 {
                    broadcaster.publish(&handler.status());
                }
            }
        })
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the command without waiting for its outcome.
pub fn dispatch_detached(handler: &Arc<dyn CommandHandler>, text: &str, peer: &str) {
    let command = match decode_command(text) {
        Ok(command) => command,
        Err(e) => {
            warn!("Dropping message from {}: {}", peer, e);
            return;
        }
    };
    let handler = handler.clone();
    let peer = peer.to_string();
    tokio::spawn(async move {
        let label = format!("{} {}", command.command, command.job_name);
        if let Err(e) = handler.dispatch(command).await {
            warn!("Command {:?} from {} failed: {}", label.trim(), peer, e);
        }
    });
}

/// Newline-delimited JSON control listener.
pub struct RemoteServer {
    listener: TcpListener,
    handler: Arc<dyn CommandHandler>,
    broadcaster: StatusBroadcaster,
}

impl RemoteServer {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn CommandHandler>,
        broadcaster: StatusBroadcaster,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Remote control listening on tcp://{}", listener.local_addr()?);
        Ok(Self {
            listener,
            handler,
            broadcaster,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Remote client connected: {}", peer);
                    let handler = self.handler.clone();
                    let updates = self.broadcaster.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler, updates).await {
                            debug!("Remote client {} dropped: {}", peer, e);
                        }
                        debug!("Remote client disconnected: {}", peer);
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }
}

async fn handle_client(
    stream: TcpStream,
    handler: Arc<dyn CommandHandler>,
    mut updates: broadcast::Receiver<Arc<str>>,
) -> Result<(), ProtocolError> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (reader, mut writer) = stream.into_split();

    let initial = encode_line(&handler.status())?;
    writer.write_all(initial.as_bytes()).await?;

    let mut commands = tokio::spawn(read_commands(reader, handler, peer.clone()));

    let outcome = loop {
        tokio::select! {
            done = &mut commands => break match done {
                Ok(result) => result,
                Err(e) => Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                ))),
            },
            update = updates.recv() => match update {
                Ok(json) => {
                    if let Err(e) = write_snapshot(&mut writer, &json).await {
                        break Err(e.into());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Client {} skipped {} stale snapshots", peer, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };
    commands.abort();
    outcome
}

async fn write_snapshot(writer: &mut OwnedWriteHalf, json: &str) -> std::io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn read_commands(
    reader: OwnedReadHalf,
    handler: Arc<dyn CommandHandler>,
    peer: String,
) -> Result<(), ProtocolError> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    while read_line(&mut reader, &mut line, MAX_COMMAND_LINE).await? {
        if !line.trim().is_empty() {
            dispatch_detached(&handler, &line, &peer);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupType, JobState, ManagerError};
    use crate::remote::protocol::{CommandKind, RemoteCommand};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<RemoteCommand>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        fn status(&self) -> Vec<JobStatusDto> {
            let state = if self.commands.lock().is_empty() {
                JobState::Pending
            } else {
                JobState::Running
            };
            vec![JobStatusDto {
                name: "Backup1".into(),
                backup_type: BackupType::Full,
                progress: 0.0,
                last_run_time: None,
                state,
            }]
        }

        async fn dispatch(&self, command: RemoteCommand) -> Result<(), ManagerError> {
            self.commands.lock().push(command);
            Ok(())
        }
    }

    async fn start() -> (Arc<Recorder>, SocketAddr) {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn CommandHandler> = recorder.clone();
        let broadcaster = StatusBroadcaster::new();
        broadcaster.start(handler.clone(), Duration::from_millis(20));
        let server = RemoteServer::bind("127.0.0.1:0".parse().unwrap(), handler, broadcaster)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();
        (recorder, addr)
    }

    #[tokio::test]
    async fn client_gets_snapshot_then_commands_reach_handler() {
        let (recorder, addr) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains("\"State\":\"PENDING\""));

        writer.write_all(b"garbage\n").await.unwrap();
        writer
            .write_all(b"{\"Command\":\"run\",\"JobName\":\"Backup1\"}\n")
            .await
            .unwrap();

        let mut saw_running = false;
        for _ in 0..50 {
            let line = lines.next_line().await.unwrap().unwrap();
            if line.contains("RUNNING") {
                saw_running = true;
                break;
            }
        }
        assert!(saw_running);
        assert_eq!(
            recorder.commands.lock().clone(),
            vec![RemoteCommand::new(CommandKind::Run, "Backup1")]
        );
    }

    #[tokio::test]
    async fn disconnect_does_not_affect_other_clients() {
        let (_recorder, addr) = start().await;
        let gone = TcpStream::connect(addr).await.unwrap();
        drop(gone);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], b'[');
    }

    #[tokio::test]
    async fn endless_line_drops_only_that_client() {
        let (recorder, addr) = start().await;
        let mut flood = TcpStream::connect(addr).await.unwrap();
        let chunk = vec![b'x'; 8 * 1024];
        for _ in 0..(MAX_COMMAND_LINE / chunk.len() + 2) {
            if flood.write_all(&chunk).await.is_err() {
                break;
            }
        }

        let mut buf = vec![0u8; 64 * 1024];
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match flood.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "oversized line did not close the connection");
        assert!(recorder.commands.lock().is_empty());

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        assert!(lines.next_line().await.unwrap().unwrap().starts_with('['));
    }
}
