use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::buffer::now_ms;

const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Initializing,
    Recording,
    Restarting,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub status: CameraStatus,
    pub last_update_ms: u64,
}

pub type StatusTable = HashMap<String, StatusEntry>;

/// Last-write-wins status table plus a one-to-many push channel. Every
/// change broadcasts the full table; lagging or dropped observers never
/// affect the others.
pub struct StatusBroadcaster {
    cameras: Arc<RwLock<StatusTable>>,
    tx: broadcast::Sender<StatusTable>,
}

impl StatusBroadcaster {
    pub fn new(camera_ids: &[String]) -> Self {
        let mut cameras = HashMap::new();
        let now = now_ms();
        for id in camera_ids {
            cameras.insert(
                id.clone(),
                StatusEntry {
                    status: CameraStatus::Initializing,
                    last_update_ms: now,
                },
            );
        }
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            cameras: Arc::new(RwLock::new(cameras)),
            tx,
        }
    }

    pub fn set(&self, camera_id: &str, status: CameraStatus) {
        self.set_at(camera_id, status, now_ms());
    }

    fn set_at(&self, camera_id: &str, status: CameraStatus, at_ms: u64) {
        let snapshot = {
            let mut cameras = match self.cameras.write() {
                Ok(c) => c,
                Err(e) => e.into_inner(),
            };
            cameras.insert(
                camera_id.to_string(),
                StatusEntry {
                    status,
                    last_update_ms: at_ms,
                },
            );
            cameras.clone()
        };
        tracing::debug!(camera = %camera_id, status = ?status, "status changed");
        // No receivers is fine.
        let _ = self.tx.send(snapshot);
    }

    pub fn snapshot(&self) -> StatusTable {
        match self.cameras.read() {
            Ok(c) => c.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    /// Current table plus a receiver for subsequent changes, so a new
    /// observer never starts blind.
    pub fn subscribe(&self) -> (StatusTable, broadcast::Receiver<StatusTable>) {
        let rx = self.tx.subscribe();
        (self.snapshot(), rx)
    }

    /// Atomically claim a stalled camera for restart: if its last update is
    /// older than `stall_ms`, rewrite it to `Restarting` (resetting the
    /// stall clock) and return true. A second caller before the restart
    /// finishes sees a fresh timestamp and gets false.
    pub fn claim_stalled(&self, camera_id: &str, stall_ms: u64, now: u64) -> bool {
        let claimed = {
            let mut cameras = match self.cameras.write() {
                Ok(c) => c,
                Err(e) => e.into_inner(),
            };
            match cameras.get_mut(camera_id) {
                Some(entry) if now.saturating_sub(entry.last_update_ms) > stall_ms => {
                    entry.status = CameraStatus::Restarting;
                    entry.last_update_ms = now;
                    true
                }
                _ => false,
            }
        };
        if claimed {
            let _ = self.tx.send(self.snapshot());
        }
        claimed
    }

    pub fn camera_ids(&self) -> Vec<String> {
        match self.cameras.read() {
            Ok(c) => c.keys().cloned().collect(),
            Err(e) => e.into_inner().keys().cloned().collect(),
        }
    }
}

impl Clone for StatusBroadcaster {
    fn clone(&self) -> Self {
        Self {
            cameras: Arc::clone(&self.cameras),
            tx: self.tx.clone(),
        }
    }
}
