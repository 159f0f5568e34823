use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::process::Child;
use tokio::sync::Mutex;

/// Mutable runtime state for one camera. The live child handle doubles as
/// the intent flag: a registered handle means the stream is supposed to be
/// running, so an exit with the handle still present triggers a restart,
/// while clearing it first marks the shutdown as deliberate.
#[derive(Default)]
pub struct CameraRuntime {
    pub live: Option<Child>,
    pub manual: Option<Child>,
    pub manual_recording: bool,
    pub event_recording: bool,
}

/// Process handle table keyed by camera id. Entries are created lazily and
/// live for the process lifetime; each entry is its own lock so cameras
/// never contend with each other.
pub struct Registry {
    cameras: Arc<RwLock<HashMap<String, Arc<Mutex<CameraRuntime>>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            cameras: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn entry(&self, camera_id: &str) -> Arc<Mutex<CameraRuntime>> {
        {
            let cameras = match self.cameras.read() {
                Ok(c) => c,
                Err(e) => e.into_inner(),
            };
            if let Some(entry) = cameras.get(camera_id) {
                return Arc::clone(entry);
            }
        }
        let mut cameras = match self.cameras.write() {
            Ok(c) => c,
            Err(e) => e.into_inner(),
        };
        Arc::clone(
            cameras
                .entry(camera_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CameraRuntime::default()))),
        )
    }

    pub async fn register_live(&self, camera_id: &str, child: Child) {
        let entry = self.entry(camera_id);
        let mut state = entry.lock().await;
        state.live = Some(child);
    }

    /// Take the live handle out of the table. Used both by the intentional
    /// stop path (clear before kill, suppressing restart) and by the
    /// supervisor when reaping an exited child.
    pub async fn take_live(&self, camera_id: &str) -> Option<Child> {
        let entry = self.entry(camera_id);
        let child = entry.lock().await.live.take();
        child
    }

    /// Forced kill that leaves the handle registered, so the ordinary
    /// restart path runs when the exit is observed.
    pub async fn kill_live(&self, camera_id: &str) -> bool {
        let entry = self.entry(camera_id);
        let mut state = entry.lock().await;
        match state.live.as_mut() {
            Some(child) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(camera = %camera_id, error = %e, "failed to kill live process");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    /// Claim the event-recording slot. Returns false if a recording from
    /// this trigger source is already active.
    pub async fn begin_event_recording(&self, camera_id: &str) -> bool {
        let entry = self.entry(camera_id);
        let mut state = entry.lock().await;
        if state.event_recording {
            return false;
        }
        state.event_recording = true;
        true
    }

    pub async fn end_event_recording(&self, camera_id: &str) {
        let entry = self.entry(camera_id);
        entry.lock().await.event_recording = false;
    }

    /// Claim the manual-recording slot and register its child in one step.
    pub async fn begin_manual_recording(&self, camera_id: &str, child: Child) -> Result<(), Child> {
        let entry = self.entry(camera_id);
        let mut state = entry.lock().await;
        if state.manual_recording {
            return Err(child);
        }
        state.manual_recording = true;
        state.manual = Some(child);
        Ok(())
    }

    pub async fn manual_recording(&self, camera_id: &str) -> bool {
        let entry = self.entry(camera_id);
        let recording = entry.lock().await.manual_recording;
        recording
    }

    pub async fn end_manual_recording(&self, camera_id: &str) -> Option<Child> {
        let entry = self.entry(camera_id);
        let mut state = entry.lock().await;
        state.manual_recording = false;
        state.manual.take()
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            cameras: Arc::clone(&self.cameras),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_entry() {
        let registry = Registry::new();
        assert!(registry.take_live("cam1").await.is_none());
        let entry = registry.entry("cam1");
        entry.lock().await.event_recording = true;
        assert!(!registry.begin_event_recording("cam1").await);
    }

    #[tokio::test]
    async fn test_event_recording_claim_is_exclusive() {
        let registry = Registry::new();
        assert!(registry.begin_event_recording("cam1").await);
        assert!(!registry.begin_event_recording("cam1").await);
        registry.end_event_recording("cam1").await;
        assert!(registry.begin_event_recording("cam1").await);
    }

    #[tokio::test]
    async fn test_manual_and_event_flags_independent() {
        let registry = Registry::new();
        assert!(registry.begin_event_recording("cam1").await);
        // A manual recording may coexist with an event recording.
        assert!(!registry.manual_recording("cam1").await);
        let entry = registry.entry("cam1");
        entry.lock().await.manual_recording = true;
        assert!(registry.manual_recording("cam1").await);
        assert!(!registry.begin_event_recording("cam1").await);
    }

    #[tokio::test]
    async fn test_cameras_isolated() {
        let registry = Registry::new();
        assert!(registry.begin_event_recording("cam1").await);
        assert!(registry.begin_event_recording("cam2").await);
    }

    #[tokio::test]
    async fn test_kill_live_without_handle() {
        let registry = Registry::new();
        assert!(!registry.kill_live("cam1").await);
    }
}
