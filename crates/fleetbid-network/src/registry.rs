//! Connection Registry: live connection <-> device identity.
//!
//! Invariants:
//! - at most one device entry per connection;
//! - at most one entry per device id (a re-registration from another
//!   connection replaces the old entry and bumps its generation);
//! - an entry is only removed by the connection that owns it, so a stale
//!   connection closing late cannot evict a device that reconnected.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use fleetbid_protocol::{DeviceId, DeviceMetrics, RegisterParams, WireMessage};

use crate::NetworkError;

/// Process-unique identifier of one accepted connection.
pub type ConnectionId = u64;

/// Sending half of a connection. Cloning shares the same outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: String,
    outbound: mpsc::Sender<WireMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: impl Into<String>, outbound: mpsc::Sender<WireMessage>) -> Self {
        Self {
            id,
            peer: peer.into(),
            outbound,
        }
    }

    /// Create a handle together with the receiver its writer task drains.
    pub fn channel(id: ConnectionId, peer: impl Into<String>, depth: usize) -> (Self, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self::new(id, peer, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a message without waiting. Never blocks the caller.
    pub fn deliver(&self, device: &DeviceId, message: WireMessage) -> Result<(), NetworkError> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::QueueFull(device.clone()),
            TrySendError::Closed(_) => NetworkError::ConnectionClosed(device.clone()),
        })
    }
}

/// A registered device and its last known snapshot.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    pub capabilities: BTreeSet<String>,
    pub has_npu: bool,
    pub metrics: DeviceMetrics,
    /// Bumped on every registration; distinguishes a reconnected device
    /// from its previous incarnation.
    pub generation: u64,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub connection: ConnectionHandle,
}

impl DeviceEntry {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            capabilities: self.capabilities.iter().cloned().collect(),
            has_npu: self.has_npu,
            overloaded: self.metrics.is_overloaded(),
            metrics: self.metrics.clone(),
            generation: self.generation,
            connection: self.connection.id(),
            peer: self.connection.peer().to_string(),
            registered_at: self.registered_at,
            last_seen: self.last_seen,
        }
    }
}

/// Read-only view of a device for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub capabilities: Vec<String>,
    pub has_npu: bool,
    pub overloaded: bool,
    pub metrics: DeviceMetrics,
    pub generation: u64,
    pub connection: ConnectionId,
    pub peer: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// What a registration changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub generation: u64,
    /// Connection that previously held this device id, if it was another one.
    pub replaced_connection: Option<ConnectionId>,
    /// Device id this connection previously registered under, if different.
    pub renamed_from: Option<DeviceId>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    devices: HashMap<DeviceId, DeviceEntry>,
    by_connection: HashMap<ConnectionId, DeviceId>,
    next_generation: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `params.device_id`, owned by `connection`.
    pub fn register(&mut self, connection: ConnectionHandle, params: RegisterParams) -> Registration {
        let conn_id = connection.id();

        let renamed_from = match self.by_connection.get(&conn_id) {
            Some(previous) if *previous != params.device_id => {
                let previous = previous.clone();
                self.devices.remove(&previous);
                Some(previous)
            }
            _ => None,
        };

        let replaced_connection = self
            .devices
            .get(&params.device_id)
            .map(|old| old.connection.id())
            .filter(|old_conn| *old_conn != conn_id);
        if let Some(old_conn) = replaced_connection {
            self.by_connection.remove(&old_conn);
            tracing::warn!(
                device_id = %params.device_id,
                old_connection = old_conn,
                new_connection = conn_id,
                "device re-registered from a new connection, replacing stale entry"
            );
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let now = Utc::now();

        self.by_connection.insert(conn_id, params.device_id.clone());
        self.devices.insert(
            params.device_id.clone(),
            DeviceEntry {
                device_id: params.device_id,
                capabilities: params.capabilities.into_iter().collect(),
                has_npu: params.has_npu,
                metrics: params.metrics,
                generation,
                registered_at: now,
                last_seen: now,
                connection,
            },
        );

        Registration {
            generation,
            replaced_connection,
            renamed_from,
        }
    }

    /// Replace a device's metrics snapshot. Unknown devices are logged and
    /// ignored; returns whether an entry was updated.
    pub fn update_metrics(&mut self, device_id: &DeviceId, metrics: DeviceMetrics) -> bool {
        match self.devices.get_mut(device_id) {
            Some(entry) => {
                entry.metrics = metrics;
                entry.last_seen = Utc::now();
                true
            }
            None => {
                tracing::warn!(device_id = %device_id, "status update for unregistered device dropped");
                false
            }
        }
    }

    /// Record liveness for a device without changing anything else.
    pub fn touch(&mut self, device_id: &DeviceId) -> bool {
        match self.devices.get_mut(device_id) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Drop whatever device `connection` owns. Called once when it closes.
    pub fn remove(&mut self, connection: ConnectionId) -> Option<DeviceId> {
        let device_id = self.by_connection.remove(&connection)?;
        let owned = self
            .devices
            .get(&device_id)
            .is_some_and(|entry| entry.connection.id() == connection);
        if owned {
            self.devices.remove(&device_id);
            Some(device_id)
        } else {
            None
        }
    }

    /// Device ids currently advertising `capability`, in ascending order.
    pub fn list_by_capability(&self, capability: &str) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|entry| entry.supports(capability) && entry.connection.is_open())
            .map(|entry| entry.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    /// The device registered on `connection`, if any.
    pub fn device_on(&self, connection: ConnectionId) -> Option<&DeviceId> {
        self.by_connection.get(&connection)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = self.devices.values().map(DeviceEntry::snapshot).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}
