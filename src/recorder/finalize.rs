use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use crate::buffer::Segment;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no buffered segments to finalize")]
    NoSegments,
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("ffmpeg failed with {status}: {stderr}")]
    FfmpegFailed {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Index of the segment whose start time is the largest value still at or
/// before the event instant; falls back to the most recent segment when the
/// event predates everything buffered. Biases the recording toward the
/// moment leading up to the event.
pub fn best_match(segments: &[Segment], event_ms: u64) -> Result<usize, FinalizeError> {
    if segments.is_empty() {
        return Err(FinalizeError::NoSegments);
    }
    let at_or_before = segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.start_time_ms <= event_ms)
        .max_by_key(|(_, s)| s.start_time_ms)
        .map(|(i, _)| i);
    Ok(at_or_before.unwrap_or(segments.len() - 1))
}

/// Segments to include in an event recording: from the best match through
/// the most recent.
pub fn select_from_event(
    segments: &[Segment],
    event_ms: u64,
) -> Result<Vec<Segment>, FinalizeError> {
    let start = best_match(segments, event_ms)?;
    Ok(segments[start..].to_vec())
}

/// Drop repeated filenames, keeping the first occurrence in order, so an
/// overlapping request never double-counts a segment.
pub fn dedup_segments(segments: Vec<Segment>) -> Vec<Segment> {
    let mut seen = std::collections::HashSet::new();
    segments
        .into_iter()
        .filter(|s| seen.insert(s.filename.clone()))
        .collect()
}

/// Drop segments whose files the transcoder's rotation has already
/// unlinked, so one lost file does not sink the rest of the recording.
pub async fn retain_existing(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        match tokio::fs::try_exists(&seg.path).await {
            Ok(true) => out.push(seg),
            _ => {
                tracing::warn!(filename = %seg.filename, "segment no longer on disk, skipping");
            }
        }
    }
    out
}

fn manifest_contents(segments: &[Segment]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for seg in segments {
        out.push_str(&format!("file '{}'\n", seg.path.display()));
    }
    out
}

/// Durable output paths for a trigger. The label is flattened to a safe
/// character set before it becomes part of a filename.
pub fn recording_paths(recordings_dir: &Path, label: &str, timestamp_ms: u64) -> (PathBuf, PathBuf) {
    let safe: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let base = format!("{safe}_{timestamp_ms}");
    (
        recordings_dir.join(format!("{base}.mp4")),
        recordings_dir.join(format!("{base}.jpg")),
    )
}

/// Splice the given segments into one container file with a stream copy.
/// The temporary manifest is removed whether or not the transcoder
/// succeeds.
pub async fn concat_segments(segments: &[Segment], output: &Path) -> Result<(), FinalizeError> {
    if segments.is_empty() {
        return Err(FinalizeError::NoSegments);
    }

    let manifest_path = output.with_extension("concat.txt");
    tokio::fs::write(&manifest_path, manifest_contents(segments)).await?;

    let result = run_ffmpeg(&[
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
        &manifest_path.to_string_lossy(),
        "-c",
        "copy",
        "-y",
        &output.to_string_lossy(),
    ])
    .await;

    if let Err(e) = tokio::fs::remove_file(&manifest_path).await {
        tracing::warn!(path = %manifest_path.display(), error = %e, "failed to remove concat manifest");
    }

    result
}

/// One frame near the 1-second mark of the finished recording, skipping any
/// leading black frames. A missing thumbnail never invalidates the
/// recording.
pub async fn write_thumbnail(recording: &Path, thumbnail: &Path) -> Result<(), FinalizeError> {
    run_ffmpeg(&[
        "-hide_banner",
        "-loglevel",
        "error",
        "-ss",
        "1",
        "-i",
        &recording.to_string_lossy(),
        "-frames:v",
        "1",
        "-q:v",
        "2",
        "-y",
        &thumbnail.to_string_lossy(),
    ])
    .await
}

async fn run_ffmpeg(args: &[&str]) -> Result<(), FinalizeError> {
    let output = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FinalizeError::FfmpegNotFound
            } else {
                FinalizeError::Io(e)
            }
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(FinalizeError::FfmpegFailed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Turn selected segments into a durable recording plus thumbnail. Only the
/// concatenation decides success; a thumbnail failure is logged and the
/// recording stands.
pub async fn finalize_recording(
    camera_id: &str,
    segments: Vec<Segment>,
    event_ms: u64,
    recording: &Path,
    thumbnail: &Path,
) -> Result<(), FinalizeError> {
    let selected = select_from_event(&segments, event_ms)?;
    let selected = dedup_segments(selected);
    let selected = retain_existing(selected).await;
    if selected.is_empty() {
        return Err(FinalizeError::NoSegments);
    }

    tracing::debug!(
        camera = %camera_id,
        segments = selected.len(),
        output = %recording.display(),
        "concatenating recording"
    );
    concat_segments(&selected, recording).await?;

    if let Err(e) = write_thumbnail(recording, thumbnail).await {
        tracing::warn!(
            camera = %camera_id,
            recording = %recording.display(),
            error = %e,
            "thumbnail generation failed"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(name: &str, t: u64) -> Segment {
        Segment::new(PathBuf::from(format!("/live/{name}")), t)
    }

    #[test]
    fn test_best_match_at_or_before_event() {
        let segments = vec![seg("a.ts", 100), seg("b.ts", 200), seg("c.ts", 300)];
        assert_eq!(best_match(&segments, 250).unwrap(), 1);
        assert_eq!(best_match(&segments, 200).unwrap(), 1);
        assert_eq!(best_match(&segments, 300).unwrap(), 2);
        assert_eq!(best_match(&segments, 5000).unwrap(), 2);
    }

    #[test]
    fn test_best_match_falls_back_to_most_recent() {
        let segments = vec![seg("a.ts", 100), seg("b.ts", 200)];
        // Event predates every buffered segment.
        assert_eq!(best_match(&segments, 50).unwrap(), 1);
    }

    #[test]
    fn test_best_match_empty_buffer_errors() {
        assert!(matches!(
            best_match(&[], 100),
            Err(FinalizeError::NoSegments)
        ));
    }

    #[test]
    fn test_select_from_event_scenario() {
        // seg0..seg9, 6s apart; trigger at seg6's capture time.
        let segments: Vec<_> = (0..10)
            .map(|i| seg(&format!("seg{i}.ts"), 1_000 + i * 6_000))
            .collect();
        let selected = select_from_event(&segments, 1_000 + 6 * 6_000).unwrap();
        let names: Vec<_> = selected.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(names, ["seg6.ts", "seg7.ts", "seg8.ts", "seg9.ts"]);
    }

    #[test]
    fn test_dedup_preserves_first_occurrence() {
        let deduped = dedup_segments(vec![seg("a.ts", 100), seg("a.ts", 100), seg("b.ts", 200)]);
        let names: Vec<_> = deduped.iter().map(|s| s.filename.as_str()).collect();
        assert_eq!(names, ["a.ts", "b.ts"]);
    }

    #[test]
    fn test_manifest_contents() {
        let manifest = manifest_contents(&[seg("a.ts", 100), seg("b.ts", 200)]);
        assert_eq!(
            manifest,
            "ffconcat version 1.0\nfile '/live/a.ts'\nfile '/live/b.ts'\n"
        );
    }

    #[test]
    fn test_recording_paths_sanitize_label() {
        let dir = PathBuf::from("/data/cam1/recordings");
        let (mp4, jpg) = recording_paths(&dir, "front door/motion!", 1234);
        assert_eq!(
            mp4,
            PathBuf::from("/data/cam1/recordings/front_door_motion__1234.mp4")
        );
        assert_eq!(
            jpg,
            PathBuf::from("/data/cam1/recordings/front_door_motion__1234.jpg")
        );
    }

    #[tokio::test]
    async fn test_retain_existing_skips_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let on_disk = dir.path().join("a.ts");
        std::fs::write(&on_disk, b"x").unwrap();

        let kept = retain_existing(vec![
            Segment::new(on_disk.clone(), 100),
            Segment::new(dir.path().join("rotated.ts"), 200),
        ])
        .await;

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].filename, "a.ts");
    }

    #[tokio::test]
    async fn test_finalize_all_segments_rotated_errors() {
        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("out.mp4");
        let thumbnail = dir.path().join("out.jpg");
        // Every selected segment is gone from disk: fail before invoking
        // the transcoder rather than concatenating nothing.
        let result = finalize_recording(
            "cam1",
            vec![seg("gone-a.ts", 100), seg("gone-b.ts", 200)],
            150,
            &recording,
            &thumbnail,
        )
        .await;
        assert!(matches!(result, Err(FinalizeError::NoSegments)));
        assert!(!recording.exists());
    }

    #[tokio::test]
    async fn test_concat_cleans_up_manifest_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        // Inputs that do not exist: the transcoder run fails either way.
        let segments = vec![seg("missing-a.ts", 100), seg("missing-b.ts", 200)];

        let result = concat_segments(&segments, &output).await;
        assert!(result.is_err());
        assert!(!output.with_extension("concat.txt").exists());
    }

    #[tokio::test]
    async fn test_concat_empty_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        assert!(matches!(
            concat_segments(&[], &output).await,
            Err(FinalizeError::NoSegments)
        ));
    }
}
