//! Bid transport capability.
//!
//! The bid coordinator addresses devices by id and never holds on to a
//! connection. Every send resolves the device's *current* connection, so a
//! fan-out list built before a device reconnected still reaches the live
//! connection, and one built before a device vanished fails cleanly.

use fleetbid_protocol::{DeviceId, WireMessage};

use crate::registry::ConnectionRegistry;
use crate::NetworkError;

/// Outcome of delivering one message to many devices.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, NetworkError)>,
}

impl BroadcastReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

/// Outbound half of whatever carries messages to devices.
///
/// Inbound traffic is not part of this trait: the carrier decodes messages
/// itself and hands them to the orchestrator's dispatcher.
pub trait BidTransport {
    /// Queue `message` for `device`. Must not block.
    fn send(&self, device: &DeviceId, message: &WireMessage) -> Result<(), NetworkError>;

    /// Whether `device` currently has a live route.
    fn is_reachable(&self, device: &DeviceId) -> bool;

    /// Send to each device independently; one failure never stops the rest.
    fn broadcast(&self, devices: &[DeviceId], message: &WireMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for device in devices {
            match self.send(device, message) {
                Ok(()) => report.delivered.push(device.clone()),
                Err(e) => {
                    tracing::warn!(device_id = %device, error = %e, "send failed, skipping device");
                    report.failed.push((device.clone(), e));
                }
            }
        }
        report
    }
}

/// The socket transport: devices are reached through the connection they
/// registered on.
impl BidTransport for ConnectionRegistry {
    fn send(&self, device: &DeviceId, message: &WireMessage) -> Result<(), NetworkError> {
        let entry = self
            .get(device)
            .ok_or_else(|| NetworkError::UnknownDevice(device.clone()))?;
        if !entry.connection.is_open() {
            return Err(NetworkError::ConnectionClosed(device.clone()));
        }
        entry.connection.deliver(device, message.clone())
    }

    fn is_reachable(&self, device: &DeviceId) -> bool {
        self.get(device).is_some_and(|entry| entry.connection.is_open())
    }
}
