use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::types::*;
use crate::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct Inner {
    devices: HashMap<DeviceIdentity, DeviceStatus>,
    version: u64,
}

/// Authoritative per-device status, fed by the TCP broadcast and HTTP polls.
///
/// Every apply runs under one lock and publishes its changes before the lock
/// is released, so subscribers see changes in application order.
pub struct DeviceTable {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<DeviceChange>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::with_capacity(CHANGE_CHANNEL_CAPACITY)
    }

    /// `capacity` bounds how many changes a slow subscriber may fall behind
    /// before it starts losing the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
                version: 0,
            }),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, change: DeviceChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }

    /// Overwrite the reported fields of one device from a broadcast frame.
    /// The control index, which frames never carry, is preserved.
    pub fn apply_tcp_update(&self, identity: DeviceIdentity, report: &StatusReport) -> DeviceChange {
        let mut inner = self.lock();
        inner.version += 1;
        let version = inner.version;

        let previous = inner.devices.get(&identity).cloned();
        let current = DeviceStatus {
            report: *report,
            control_index: previous.as_ref().and_then(|s| s.control_index),
            last_source: Source::Tcp,
            last_updated: Utc::now(),
            version,
        };
        if previous.is_none() {
            debug!(device = %identity, "first sighting via TCP");
        }
        inner.devices.insert(identity, current.clone());

        let change = DeviceChange {
            identity,
            previous,
            current,
        };
        self.publish(change.clone());
        change
    }

    /// Apply one AC-list snapshot atomically. Devices not in the snapshot
    /// are left as they are.
    pub fn apply_http_snapshot(&self, units: &[UnitSnapshot]) -> Vec<DeviceChange> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut applied = Vec::with_capacity(units.len());

        for unit in units {
            inner.version += 1;
            let current = DeviceStatus {
                report: unit.report,
                control_index: Some(unit.control_index),
                last_source: Source::Http,
                last_updated: now,
                version: inner.version,
            };
            let previous = inner.devices.insert(unit.identity, current.clone());
            applied.push(DeviceChange {
                identity: unit.identity,
                previous,
                current,
            });
        }
        trace!(devices = applied.len(), "applied HTTP snapshot");

        for change in &applied {
            self.publish(change.clone());
        }
        applied
    }

    pub fn get(&self, identity: DeviceIdentity) -> Result<DeviceStatus> {
        self.lock()
            .devices
            .get(&identity)
            .cloned()
            .ok_or(Error::UnknownDevice(identity))
    }

    pub fn control_index(&self, identity: DeviceIdentity) -> Option<u32> {
        self.lock()
            .devices
            .get(&identity)
            .and_then(|s| s.control_index)
    }

    /// All devices, ordered by identity.
    pub fn devices(&self) -> Vec<(DeviceIdentity, DeviceStatus)> {
        let mut all: Vec<_> = self
            .lock()
            .devices
            .iter()
            .map(|(id, status)| (*id, status.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices whose last update is older than `max_age`.
    pub fn stale(&self, max_age: Duration) -> Vec<DeviceIdentity> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - max_age;
        let mut ids: Vec<_> = self
            .lock()
            .devices
            .iter()
            .filter(|(_, s)| s.last_updated < cutoff)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChange> {
        self.changes.subscribe()
    }
}
