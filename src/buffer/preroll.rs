use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use super::Segment;

/// Bounded FIFO of recent live segments for one camera, used for pre-roll
/// lookups. Written only by that camera's supervisor task; everyone else
/// reads cloned snapshots.
pub struct PrerollBuffer {
    segments: VecDeque<Segment>,
    capacity: usize,
    camera_id: String,
}

impl PrerollBuffer {
    pub fn new(camera_id: String, capacity: usize) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self {
            segments: VecDeque::with_capacity(capacity),
            capacity,
            camera_id,
        }))
    }

    pub fn push(&mut self, segment: Segment) {
        if self
            .segments
            .iter()
            .any(|s| s.filename == segment.filename)
        {
            tracing::debug!(
                camera = %self.camera_id,
                filename = %segment.filename,
                "ignoring duplicate segment"
            );
            return;
        }

        tracing::trace!(
            camera = %self.camera_id,
            filename = %segment.filename,
            start_time_ms = segment.start_time_ms,
            "buffering segment"
        );

        self.segments.push_back(segment);
        while self.segments.len() > self.capacity {
            if let Some(old) = self.segments.pop_front() {
                tracing::trace!(
                    camera = %self.camera_id,
                    filename = %old.filename,
                    "evicted oldest segment"
                );
            }
        }
    }

    /// All prior segments are stale after a transcoder restart with a wiped
    /// live directory.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn seg(name: &str, t: u64) -> Segment {
        Segment::new(PathBuf::from(format!("/live/{name}")), t)
    }

    fn buffer(capacity: usize) -> PrerollBuffer {
        PrerollBuffer {
            segments: VecDeque::new(),
            capacity,
            camera_id: "cam1".to_string(),
        }
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut buf = buffer(3);
        for i in 0..10 {
            buf.push(seg(&format!("seg{i}.ts"), i * 1000));
            assert!(buf.len() <= 3);
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        // Most recent three, in emission order.
        assert_eq!(snap[0].filename, "seg7.ts");
        assert_eq!(snap[1].filename, "seg8.ts");
        assert_eq!(snap[2].filename, "seg9.ts");
    }

    #[test]
    fn test_emission_order_preserved() {
        let mut buf = buffer(10);
        buf.push(seg("a.ts", 100));
        buf.push(seg("b.ts", 200));
        buf.push(seg("c.ts", 300));
        let names: Vec<_> = buf.snapshot().iter().map(|s| s.filename.clone()).collect();
        assert_eq!(names, ["a.ts", "b.ts", "c.ts"]);
    }

    #[test]
    fn test_duplicate_filename_ignored() {
        let mut buf = buffer(10);
        buf.push(seg("a.ts", 100));
        buf.push(seg("a.ts", 150));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.snapshot()[0].start_time_ms, 100);
    }

    #[test]
    fn test_clear() {
        let mut buf = buffer(5);
        buf.push(seg("a.ts", 100));
        buf.clear();
        assert!(buf.is_empty());
        // A filename seen before the clear is valid again.
        buf.push(seg("a.ts", 500));
        assert_eq!(buf.len(), 1);
    }
}
