use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::buffer::{now_ms, PrerollBuffer, Segment};
use crate::config::{CameraConfig, RecorderConfig};
use crate::registry::Registry;
use crate::status::{CameraStatus, StatusBroadcaster};

const SEGMENT_OPEN_PREFIX: &str = "Opening '";
const SEGMENT_OPEN_SUFFIX: &str = "' for writing";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
}

/// Keeps exactly one live transcoder process running for one camera,
/// restarting on any exit that was not an intentional stop. Segment
/// existence is learned solely from the transcoder's diagnostic stream;
/// the live directory is never polled.
pub struct StreamSupervisor {
    camera: CameraConfig,
    recorder: RecorderConfig,
    live_window: usize,
    buffer: Arc<RwLock<PrerollBuffer>>,
    registry: Registry,
    status: StatusBroadcaster,
}

impl StreamSupervisor {
    pub fn new(
        camera: CameraConfig,
        recorder: RecorderConfig,
        live_window: usize,
        buffer: Arc<RwLock<PrerollBuffer>>,
        registry: Registry,
        status: StatusBroadcaster,
    ) -> Self {
        Self {
            camera,
            recorder,
            live_window,
            buffer,
            registry,
            status,
        }
    }

    fn live_dir(&self) -> PathBuf {
        self.recorder
            .data_dir
            .join(&self.camera.id)
            .join("live")
    }

    pub async fn run(self) {
        let camera_id = self.camera.id.clone();
        let backoff = Duration::from_secs(self.recorder.restart_backoff_secs);

        loop {
            tracing::info!(camera = %camera_id, url = %self.camera.url, "starting live stream");

            if let Err(e) = prepare_live_dir(&self.live_dir()).await {
                tracing::error!(camera = %camera_id, error = %e, "failed to prepare live directory");
                self.status.set(&camera_id, CameraStatus::Error);
                tokio::time::sleep(backoff).await;
                continue;
            }

            // Prior descriptors point at files the cleanup just removed.
            if let Ok(mut buf) = self.buffer.write() {
                if !buf.is_empty() {
                    tracing::debug!(
                        camera = %camera_id,
                        discarded = buf.len(),
                        "discarding stale segment descriptors"
                    );
                }
                buf.clear();
            }

            let mut child = match self.spawn_live() {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(camera = %camera_id, error = %e, "failed to spawn transcoder");
                    self.status.set(&camera_id, CameraStatus::Error);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            let stderr = match child.stderr.take() {
                Some(s) => s,
                None => {
                    tracing::error!(camera = %camera_id, "transcoder stderr not captured");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            // Not yet confirmed healthy until the first segment shows up.
            self.status.set(&camera_id, CameraStatus::Restarting);
            self.registry.register_live(&camera_id, child).await;

            let mut lines = BufReader::new(stderr).lines();
            let mut first_segment = true;

            while let Ok(Some(line)) = lines.next_line().await {
                let Some(filename) = parse_segment_open(&line) else {
                    continue;
                };
                let segment = Segment::observed_now(self.live_dir().join(&filename));
                if let Ok(mut buf) = self.buffer.write() {
                    buf.push(segment);
                }
                if first_segment {
                    first_segment = false;
                    tracing::info!(camera = %camera_id, "live stream healthy");
                }
                // Every segment refreshes the status timestamp; the
                // watchdog reads it as proof of progress.
                self.status.set(&camera_id, CameraStatus::Recording);
            }

            // Stderr EOF: the transcoder exited or was killed. A cleared
            // handle means the stop was deliberate.
            match self.registry.take_live(&camera_id).await {
                None => {
                    tracing::info!(camera = %camera_id, "live stream stopped");
                    return;
                }
                Some(mut child) => {
                    match child.wait().await {
                        Ok(exit) => {
                            tracing::warn!(
                                camera = %camera_id,
                                exit = %exit,
                                "transcoder exited unexpectedly"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(camera = %camera_id, error = %e, "failed to reap transcoder");
                        }
                    }
                    self.status.set(&camera_id, CameraStatus::Error);
                    tracing::info!(
                        camera = %camera_id,
                        backoff_secs = self.recorder.restart_backoff_secs,
                        "restarting live stream after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn spawn_live(&self) -> Result<Child, StreamError> {
        let live_dir = self.live_dir();
        let segment_pattern = live_dir.join(segment_pattern(now_ms()));
        let playlist = live_dir.join("live.m3u8");
        let delete_threshold = hls_delete_threshold(
            self.live_window as u64,
            self.recorder.event_record_secs,
            self.recorder.segment_secs,
        );

        // -loglevel info so segment opens appear on stderr.
        Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "info",
                "-rtsp_transport",
                "tcp",
                "-i",
                &self.camera.url,
                "-c:v",
                "copy",
                "-an",
                "-f",
                "hls",
                "-hls_time",
                &self.recorder.segment_secs.to_string(),
                "-hls_list_size",
                &self.live_window.to_string(),
                "-hls_flags",
                "delete_segments",
                "-hls_delete_threshold",
                &delete_threshold.to_string(),
                "-hls_segment_filename",
            ])
            .arg(&segment_pattern)
            .arg(&playlist)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StreamError::FfmpegNotFound
                } else {
                    StreamError::Io(e)
                }
            })
    }
}

/// Segment filename pattern for one transcoder spawn. The stamp keeps a
/// respawn's numbering, which restarts at zero, from producing filenames
/// that collide with descriptors captured before the restart.
fn segment_pattern(spawn_ms: u64) -> String {
    format!("live{spawn_ms}_%05d.ts")
}

/// How many segments the transcoder keeps on disk after they drop out of
/// the playlist. The on-disk window has to outlive the pre-roll plus the
/// post-trigger record window, or a delayed finalize loses its selected
/// segments to the transcoder's own rotation before concatenation; the
/// retention sweep stays the outer backstop.
fn hls_delete_threshold(live_window: u64, event_record_secs: u64, segment_secs: u64) -> u64 {
    let record_segments = event_record_secs.div_ceil(segment_secs.max(1));
    live_window + record_segments + 1
}

/// Extract the segment filename from a "segment opened for writing" line on
/// the transcoder's diagnostic stream. Playlist and temp-file opens are not
/// segments.
pub fn parse_segment_open(line: &str) -> Option<String> {
    let start = line.find(SEGMENT_OPEN_PREFIX)? + SEGMENT_OPEN_PREFIX.len();
    let rest = &line[start..];
    let end = rest.find(SEGMENT_OPEN_SUFFIX)?;
    let path = Path::new(&rest[..end]);
    if path.extension().and_then(|e| e.to_str()) != Some("ts") {
        return None;
    }
    path.file_name()
        .and_then(|f| f.to_str())
        .map(|f| f.to_string())
}

/// Create the live directory and drop artifacts left over from a previous
/// run, so old segments are never replayed after a restart.
async fn prepare_live_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_live_artifact(&path) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale artifact");
            }
        }
    }
    Ok(())
}

fn is_live_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ts") | Some("m3u8") | Some("tmp")
    )
}

/// Safety net against disk growth from files the transcoder's own rolling
/// window no longer tracks.
pub async fn retention_sweep(
    camera_id: String,
    live_dir: PathBuf,
    interval_secs: u64,
    retention_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match sweep_once(&live_dir, retention_secs).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(camera = %camera_id, removed, "removed orphaned live segments");
            }
            Err(e) => {
                tracing::warn!(camera = %camera_id, error = %e, "retention sweep failed");
            }
        }
    }
}

async fn sweep_once(live_dir: &Path, retention_secs: u64) -> std::io::Result<usize> {
    let retention = Duration::from_secs(retention_secs);
    let now = SystemTime::now();
    let mut removed = 0;

    let mut entries = tokio::fs::read_dir(live_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ts") {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= retention {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove old segment");
                }
            }
        }
    }
    Ok(removed)
}
