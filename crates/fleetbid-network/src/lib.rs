//! fleetbid network layer.
//!
//! Tracks which device sits behind which live connection and delivers
//! outbound messages to devices by identity. The bidding logic only ever
//! talks to a [`BidTransport`], so it is indifferent to whether messages
//! travel over the orchestrator's TCP sockets or some other carrier.

pub mod registry;
pub mod transport;

pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, DeviceEntry, DeviceSnapshot, Registration};
pub use transport::{BidTransport, BroadcastReport};

use fleetbid_protocol::DeviceId;

/// Errors from the network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),

    #[error("connection to device {0} is closed")]
    ConnectionClosed(DeviceId),

    #[error("outbound queue for device {0} is full")]
    QueueFull(DeviceId),
}
