use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::buffer::{now_ms, PrerollBuffer, Segment};
use crate::config::{CameraConfig, RecorderConfig};
use crate::registry::Registry;

use super::finalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new recording was started for this trigger.
    Started,
    /// A recording from the same trigger source is already active; the
    /// trigger is acknowledged and ignored.
    AlreadyRecording,
    UnknownCamera,
}

#[derive(Debug, Error)]
pub enum ManualError {
    #[error("unknown camera")]
    UnknownCamera,
    #[error("already recording")]
    AlreadyRecording,
    #[error("not recording")]
    NotRecording,
    #[error("failed to spawn transcoder: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Turns external triggers and operator commands into recordings. Event
/// triggers are served from the pre-roll buffer via the finalizer; manual
/// recordings run their own one-shot transcoder writing a container file
/// directly.
pub struct TriggerHandler {
    cameras: Arc<HashMap<String, CameraConfig>>,
    buffers: Arc<HashMap<String, Arc<RwLock<PrerollBuffer>>>>,
    registry: Registry,
    recorder: RecorderConfig,
}

impl TriggerHandler {
    pub fn new(
        cameras: Vec<CameraConfig>,
        buffers: Arc<HashMap<String, Arc<RwLock<PrerollBuffer>>>>,
        registry: Registry,
        recorder: RecorderConfig,
    ) -> Self {
        let cameras = cameras.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            cameras: Arc::new(cameras),
            buffers,
            registry,
            recorder,
        }
    }

    fn recordings_dir(&self, camera_id: &str) -> PathBuf {
        self.recorder.data_dir.join(camera_id).join("recordings")
    }

    pub fn segments_snapshot(&self, camera_id: &str) -> Option<Vec<Segment>> {
        let buffer = self.buffers.get(camera_id)?;
        Some(match buffer.read() {
            Ok(buf) => buf.snapshot(),
            Err(e) => e.into_inner().snapshot(),
        })
    }

    /// External trigger entry point. The pre-roll snapshot is taken the
    /// moment the trigger is accepted; the rest runs as a background task
    /// whose outcome is logged, never awaited by the caller.
    pub async fn handle_trigger(
        &self,
        camera_id: &str,
        label: &str,
        timestamp_ms: u64,
    ) -> TriggerOutcome {
        let Some(preroll) = self.segments_snapshot(camera_id) else {
            return TriggerOutcome::UnknownCamera;
        };

        if !self.registry.begin_event_recording(camera_id).await {
            tracing::info!(camera = %camera_id, label = %label, "trigger ignored, already recording");
            return TriggerOutcome::AlreadyRecording;
        }

        tracing::info!(camera = %camera_id, label = %label, timestamp_ms, "event recording started");

        let camera_id = camera_id.to_string();
        let label = label.to_string();
        let buffer = self.buffers.get(&camera_id).map(Arc::clone);
        let registry = self.registry.clone();
        let recordings_dir = self.recordings_dir(&camera_id);
        let record_window = Duration::from_secs(self.recorder.event_record_secs);

        tokio::spawn(async move {
            run_event_recording(
                camera_id,
                label,
                timestamp_ms,
                preroll,
                buffer,
                recordings_dir,
                record_window,
                registry,
            )
            .await;
        });

        TriggerOutcome::Started
    }

    /// Operator-initiated recording: a one-shot transcoder writing straight
    /// to a container file, independent of the live segment buffer.
    pub async fn start_manual(&self, camera_id: &str) -> Result<PathBuf, ManualError> {
        let camera = self
            .cameras
            .get(camera_id)
            .ok_or(ManualError::UnknownCamera)?;

        if self.registry.manual_recording(camera_id).await {
            return Err(ManualError::AlreadyRecording);
        }

        let recordings_dir = self.recordings_dir(camera_id);
        tokio::fs::create_dir_all(&recordings_dir).await?;
        let output = recordings_dir.join(format!("manual_{}.mp4", now_ms()));

        let child = spawn_manual(&camera.url, &output)?;

        match self.registry.begin_manual_recording(camera_id, child).await {
            Ok(()) => {
                tracing::info!(camera = %camera_id, output = %output.display(), "manual recording started");
                Ok(output)
            }
            Err(mut child) => {
                // Lost the race to another start request.
                let _ = child.start_kill();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Err(ManualError::AlreadyRecording)
            }
        }
    }

    /// Graceful close so the transcoder finalizes the container instead of
    /// leaving it truncated.
    pub async fn stop_manual(&self, camera_id: &str) -> Result<(), ManualError> {
        if !self.cameras.contains_key(camera_id) {
            return Err(ManualError::UnknownCamera);
        }

        let Some(mut child) = self.registry.end_manual_recording(camera_id).await else {
            return Err(ManualError::NotRecording);
        };

        tracing::info!(camera = %camera_id, "stopping manual recording");
        let camera_id = camera_id.to_string();
        tokio::spawn(async move {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(b"q\n").await {
                    tracing::warn!(camera = %camera_id, error = %e, "failed to signal transcoder, killing");
                    let _ = child.start_kill();
                }
            } else {
                let _ = child.start_kill();
            }
            match child.wait().await {
                Ok(exit) => {
                    tracing::info!(camera = %camera_id, exit = %exit, "manual recording closed");
                }
                Err(e) => {
                    tracing::warn!(camera = %camera_id, error = %e, "failed to reap manual recording");
                }
            }
        });

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_event_recording(
    camera_id: String,
    label: String,
    timestamp_ms: u64,
    preroll: Vec<Segment>,
    buffer: Option<Arc<RwLock<PrerollBuffer>>>,
    recordings_dir: PathBuf,
    record_window: Duration,
    registry: Registry,
) {
    // Let the live stream produce the post-trigger portion.
    tokio::time::sleep(record_window).await;

    let mut segments = preroll;
    if let Some(buffer) = buffer {
        let tail = match buffer.read() {
            Ok(buf) => buf.snapshot(),
            Err(e) => e.into_inner().snapshot(),
        };
        segments.extend(tail);
    }
    let segments = finalize::dedup_segments(segments);

    let result = async {
        tokio::fs::create_dir_all(&recordings_dir).await?;
        let (recording, thumbnail) =
            finalize::recording_paths(&recordings_dir, &label, timestamp_ms);
        finalize::finalize_recording(&camera_id, segments, timestamp_ms, &recording, &thumbnail)
            .await?;
        Ok::<_, finalize::FinalizeError>(recording)
    }
    .await;

    match result {
        Ok(recording) => {
            tracing::info!(
                camera = %camera_id,
                label = %label,
                recording = %recording.display(),
                "event recording finalized"
            );
        }
        Err(e) => {
            // A failed finalize is a recording outcome, not a stream fault;
            // the live stream's status is left alone.
            tracing::error!(camera = %camera_id, label = %label, error = %e, "event recording failed");
        }
    }

    registry.end_event_recording(&camera_id).await;
}

fn spawn_manual(url: &str, output: &std::path::Path) -> Result<Child, std::io::Error> {
    Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-rtsp_transport",
            "tcp",
            "-i",
            url,
            "-c:v",
            "copy",
            "-an",
            "-movflags",
            "+faststart",
            "-y",
        ])
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> TriggerHandler {
        let cameras = vec![CameraConfig {
            id: "cam1".to_string(),
            name: "Front Door".to_string(),
            url: "rtsp://10.0.0.5/stream".to_string(),
        }];
        let mut buffers = HashMap::new();
        buffers.insert(
            "cam1".to_string(),
            PrerollBuffer::new("cam1".to_string(), 10),
        );
        let recorder = RecorderConfig {
            data_dir: std::env::temp_dir().join("camward-test"),
            // Keep the background task parked so the flag stays claimed for
            // the duration of the test.
            event_record_secs: 600,
            ..RecorderConfig::default()
        };
        TriggerHandler::new(cameras, Arc::new(buffers), Registry::new(), recorder)
    }

    fn push_segment(h: &TriggerHandler, name: &str, t: u64) {
        let buffer = h.buffers.get("cam1").unwrap();
        buffer
            .write()
            .unwrap()
            .push(Segment::new(PathBuf::from(format!("/live/{name}")), t));
    }

    #[tokio::test]
    async fn test_trigger_starts_once() {
        let h = handler();
        push_segment(&h, "seg0.ts", 1_000);

        assert_eq!(
            h.handle_trigger("cam1", "motion", 1_500).await,
            TriggerOutcome::Started
        );
        // Second trigger while the first is active: acknowledged, ignored.
        assert_eq!(
            h.handle_trigger("cam1", "motion", 2_000).await,
            TriggerOutcome::AlreadyRecording
        );
    }

    #[tokio::test]
    async fn test_trigger_unknown_camera() {
        let h = handler();
        assert_eq!(
            h.handle_trigger("nope", "motion", 1_000).await,
            TriggerOutcome::UnknownCamera
        );
    }

    #[tokio::test]
    async fn test_trigger_allowed_again_after_completion() {
        let h = handler();
        push_segment(&h, "seg0.ts", 1_000);

        assert_eq!(
            h.handle_trigger("cam1", "motion", 1_500).await,
            TriggerOutcome::Started
        );
        h.registry.end_event_recording("cam1").await;
        assert_eq!(
            h.handle_trigger("cam1", "motion", 9_000).await,
            TriggerOutcome::Started
        );
    }

    #[tokio::test]
    async fn test_failed_event_recording_frees_slot_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        assert!(registry.begin_event_recording("cam1").await);

        // Every pre-roll file is already gone from disk, so the finalize
        // fails; the event slot comes back and nothing else is touched.
        run_event_recording(
            "cam1".to_string(),
            "motion".to_string(),
            1_500,
            vec![Segment::new(PathBuf::from("/live/gone.ts"), 1_000)],
            None,
            dir.path().join("recordings"),
            Duration::ZERO,
            registry.clone(),
        )
        .await;

        assert!(registry.begin_event_recording("cam1").await);
    }

    #[tokio::test]
    async fn test_manual_stop_without_start() {
        let h = handler();
        assert!(matches!(
            h.stop_manual("cam1").await,
            Err(ManualError::NotRecording)
        ));
        assert!(matches!(
            h.stop_manual("nope").await,
            Err(ManualError::UnknownCamera)
        ));
    }

    #[tokio::test]
    async fn test_manual_start_unknown_camera() {
        let h = handler();
        assert!(matches!(
            h.start_manual("nope").await,
            Err(ManualError::UnknownCamera)
        ));
    }

    #[tokio::test]
    async fn test_segments_snapshot_ordered() {
        let h = handler();
        push_segment(&h, "a.ts", 100);
        push_segment(&h, "b.ts", 200);
        let snap = h.segments_snapshot("cam1").unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].filename, "a.ts");
        assert!(h.segments_snapshot("nope").is_none());
    }
}
