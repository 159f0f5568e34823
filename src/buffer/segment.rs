use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Descriptor for one live segment observed on the transcoder's diagnostic
/// stream. The file itself belongs to the transcoder's rolling window; only
/// the descriptor lives in the buffer.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub filename: String,
    pub path: PathBuf,
    /// Wall-clock capture instant, milliseconds since the unix epoch.
    pub start_time_ms: u64,
}

impl Segment {
    pub fn new(path: PathBuf, start_time_ms: u64) -> Self {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            filename,
            path,
            start_time_ms,
        }
    }

    /// Descriptor stamped with the current wall clock.
    pub fn observed_now(path: PathBuf) -> Self {
        Self::new(path, now_ms())
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
