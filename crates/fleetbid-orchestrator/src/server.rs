//! TCP server devices connect to.
//!
//! One task per accepted connection reads bytes into a [`MessageFramer`]
//! and dispatches each decoded message in arrival order. A second task per
//! connection drains that connection's outbound queue to the socket, so
//! nothing holding the orchestrator lock ever waits on a slow peer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use fleetbid_network::{ConnectionHandle, ConnectionId};
use fleetbid_protocol::{MessageFramer, ProtocolError, WireMessage};

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;

const READ_CHUNK: usize = 8 * 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct DeviceServer {
    listener: TcpListener,
    orchestrator: Orchestrator,
    max_frame_bytes: usize,
    outbound_queue_depth: usize,
}

impl DeviceServer {
    /// Bind the listener. Failure here is fatal to the process.
    pub async fn bind(config: &ServerConfig, orchestrator: Orchestrator) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind device listener on {}: {e}", config.bind_addr))?;
        Ok(Self {
            listener,
            orchestrator,
            max_frame_bytes: config.max_frame_bytes,
            outbound_queue_depth: config.outbound_queue_depth,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "device listener started");

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let connection = self.orchestrator.next_connection_id();
            tracing::debug!(peer = %peer, connection, "device connected");

            let orchestrator = self.orchestrator.clone();
            let max_frame_bytes = self.max_frame_bytes;
            let depth = self.outbound_queue_depth;
            tokio::spawn(async move {
                handle_connection(stream, peer, connection, orchestrator, max_frame_bytes, depth).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection: ConnectionId,
    orchestrator: Orchestrator,
    max_frame_bytes: usize,
    depth: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (handle, outbound) = ConnectionHandle::channel(connection, peer.to_string(), depth);
    let mut writer_task = tokio::spawn(write_loop(writer, outbound, connection));

    match read_loop(&mut reader, &handle, &orchestrator, max_frame_bytes).await {
        Ok(()) => tracing::info!(peer = %peer, connection, "connection closed"),
        Err(e) => tracing::warn!(peer = %peer, connection, error = %e, "connection closed on error"),
    }

    orchestrator.connection_closed(connection).await;

    // The writer ends once every sender is gone; give it a moment to flush.
    drop(handle);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    handle: &ConnectionHandle,
    orchestrator: &Orchestrator,
    max_frame_bytes: usize,
) -> anyhow::Result<()> {
    let mut framer = MessageFramer::new(max_frame_bytes);

    loop {
        let buf = framer.buffer_mut();
        buf.reserve(READ_CHUNK);
        if reader.read_buf(buf).await? == 0 {
            return Ok(());
        }

        loop {
            let wire = match framer.next_message() {
                Ok(Some(wire)) => wire,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(connection = handle.id(), error = %e, "protocol error");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match wire.into_inbound() {
                Ok(message) => {
                    tracing::trace!(connection = handle.id(), kind = %message.kind(), "message received");
                    orchestrator.handle_message(handle, message).await;
                }
                Err(e) => log_rejected(handle.id(), &e),
            }
        }
    }
}

fn log_rejected(connection: ConnectionId, error: &ProtocolError) {
    match error {
        ProtocolError::UnknownType(kind) => {
            tracing::warn!(connection, kind = %kind, "unknown message type dropped")
        }
        other => tracing::warn!(connection, error = %other, "invalid message dropped"),
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<WireMessage>, connection: ConnectionId) {
    while let Some(message) = outbound.recv().await {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(connection, error = %e, "could not encode outbound message");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            tracing::debug!(connection, error = %e, "write failed, dropping outbound queue");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
