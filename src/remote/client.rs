use super::protocol::{
    decode_status, encode_line, read_line, JobStatusDto, ProtocolError, RemoteCommand,
    MAX_STATUS_LINE,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// TCP controller connection.
pub struct RemoteClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl RemoteClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        })
    }

    pub async fn send(&mut self, command: &RemoteCommand) -> Result<(), ProtocolError> {
        let line = encode_line(command)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next status snapshot pushed by the server.
    pub async fn next_status(&mut self) -> Result<Vec<JobStatusDto>, ProtocolError> {
        loop {
            if !read_line(&mut self.reader, &mut self.line, MAX_STATUS_LINE).await? {
                return Err(ProtocolError::Closed);
            }
            if !self.line.trim().is_empty() {
                return decode_status(&self.line);
            }
        }
    }
}
