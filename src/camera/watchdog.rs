use std::time::Duration;

use crate::buffer::now_ms;
use crate::registry::Registry;
use crate::status::StatusBroadcaster;

/// Liveness check for transcoders that are running but silent. A camera
/// whose status has not moved within the stall threshold gets its live
/// process killed, which funnels into the ordinary restart path. Claiming
/// the stall rewrites the status timestamp, so a later tick cannot kill the
/// same stall twice.
pub async fn run(
    status: StatusBroadcaster,
    registry: Registry,
    interval_secs: u64,
    stall_secs: u64,
) {
    let stall_ms = stall_secs * 1_000;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now = now_ms();
        for camera_id in status.camera_ids() {
            if !status.claim_stalled(&camera_id, stall_ms, now) {
                continue;
            }
            tracing::warn!(
                camera = %camera_id,
                stall_secs,
                "no stream progress within stall threshold, killing live process"
            );
            if !registry.kill_live(&camera_id).await {
                tracing::debug!(camera = %camera_id, "stalled camera had no live process");
            }
        }
    }
}
