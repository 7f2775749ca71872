use super::{
    codec::PogoCodec,
    error::ProtocolError,
    packet::{extract_message, Command, OpCode},
};
use crate::parser::{leading_number, slice_chars};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

/// Serial and firmware reported by the `?` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterIdentity {
    pub serial_number: String,
    pub software_version: String,
}

/// Command/response session with a POGO meter.
///
/// Implementations provide frame level I/O; the commands are default
/// methods on top of [`PogoSession::command_response`].
#[async_trait]
pub trait PogoSession: Send + Sync {
    /// How long to wait for the ETX of a response.
    fn response_timeout(&self) -> Duration;

    async fn send(&self, command: Command) -> Result<(), ProtocolError>;

    /// Next complete frame, STX and checksum still attached.
    async fn receive(&self, timeout: Duration) -> Result<Bytes, ProtocolError>;

    async fn close(&self) -> Result<(), ProtocolError>;

    /// Send `command` and return the verified response body, which starts
    /// with the command character.
    async fn command_response(&self, command: Command) -> Result<String, ProtocolError> {
        let op = command.op;
        self.send(command).await?;
        let frame = self.receive(self.response_timeout()).await?;
        let message = extract_message(&frame)?;
        if !message.starts_with(op.as_char()) {
            return Err(ProtocolError::UnexpectedReply(message));
        }
        debug!(%op, %message, "response");
        Ok(message)
    }

    async fn read_identity(&self) -> Result<MeterIdentity, ProtocolError> {
        let result = self.command_response(Command::new(OpCode::ReadSerial)).await?;
        Ok(MeterIdentity {
            serial_number: slice_chars(&result, 1, 14).to_string(),
            software_version: slice_chars(&result, 15, 20).to_string(),
        })
    }

    async fn read_record_count(&self) -> Result<u32, ProtocolError> {
        let result = self.command_response(Command::new(OpCode::NrRecords)).await?;
        let count = leading_number(slice_chars(&result, 1, 4)).ok_or_else(|| {
            ProtocolError::InvalidPacket(format!("Record count is not a number: {result:?}"))
        })?;
        debug!(count, "number of records");
        Ok(count)
    }

    /// Raw response for the record at `index`.
    async fn read_record(&self, index: u32) -> Result<String, ProtocolError> {
        self.command_response(Command::get_event(index)).await
    }
}

/// Session over any byte transport, usually a serial port.
#[derive(Debug)]
pub struct PogoSessionImpl<T> {
    framed: tokio::sync::Mutex<Framed<T, PogoCodec>>,
    timeout: Duration,
}

impl<T> PogoSessionImpl<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(io: T) -> Self {
        Self::with_timeout(io, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(io: T, timeout: Duration) -> Self {
        Self {
            framed: tokio::sync::Mutex::new(Framed::new(io, PogoCodec)),
            timeout,
        }
    }
}

#[async_trait]
impl<T> PogoSession for PogoSessionImpl<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn response_timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, command: Command) -> Result<(), ProtocolError> {
        let mut framed = self.framed.lock().await;
        framed.send(command).await.map_err(ProtocolError::Io)
    }

    async fn receive(&self, timeout: Duration) -> Result<Bytes, ProtocolError> {
        let mut framed = self.framed.lock().await;
        match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(e))) => Err(ProtocolError::Io(e)),
            Ok(None) => Err(ProtocolError::Transport("Connection closed".into())),
            Err(_) => Err(ProtocolError::Timeout(timeout)),
        }
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        let mut framed = self.framed.lock().await;
        framed.close().await.map_err(ProtocolError::Io)
    }
}
