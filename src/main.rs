use std::collections::HashMap;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod api;
mod buffer;
mod camera;
mod config;
mod recorder;
mod registry;
mod status;

use buffer::PrerollBuffer;
use camera::StreamSupervisor;
use config::Config;
use recorder::TriggerHandler;
use registry::Registry;
use status::StatusBroadcaster;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("camward=debug".parse()?))
        .init();

    let config = Config::load()?;
    tracing::info!("loaded {} camera(s)", config.cameras.len());

    let camera_ids: Vec<String> = config.cameras.iter().map(|c| c.id.clone()).collect();
    let registry = Registry::new();
    let status = StatusBroadcaster::new(&camera_ids);

    let mut buffers = HashMap::new();
    for cam in &config.cameras {
        buffers.insert(
            cam.id.clone(),
            PrerollBuffer::new(cam.id.clone(), config.buffer.preroll_segments),
        );
    }
    let buffers = Arc::new(buffers);

    for cam in &config.cameras {
        let supervisor = StreamSupervisor::new(
            cam.clone(),
            config.recorder.clone(),
            config.buffer.preroll_segments,
            Arc::clone(&buffers[&cam.id]),
            registry.clone(),
            status.clone(),
        );
        tokio::spawn(supervisor.run());

        tokio::spawn(camera::retention_sweep(
            cam.id.clone(),
            config.recorder.data_dir.join(&cam.id).join("live"),
            config.recorder.sweep_interval_secs,
            config.recorder.retention_secs,
        ));
    }

    tokio::spawn(camera::watchdog::run(
        status.clone(),
        registry.clone(),
        config.recorder.watchdog_interval_secs,
        config.recorder.stall_secs,
    ));

    let trigger = Arc::new(TriggerHandler::new(
        config.cameras.clone(),
        Arc::clone(&buffers),
        registry.clone(),
        config.recorder.clone(),
    ));

    let state = api::AppState {
        cameras: Arc::new(config.cameras.clone()),
        trigger: Arc::clone(&trigger),
        status: status.clone(),
    };

    let server = tokio::spawn(api::start_server(state, config.http.port));

    tokio::select! {
        result = server => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for id in &camera_ids {
        // Clearing the handle first marks the stop as intentional, so the
        // supervisor does not schedule a restart.
        if let Some(mut child) = registry.take_live(id).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(mut child) = registry.end_manual_recording(id).await {
            // Same graceful close the stop endpoint uses, so the container
            // is not left truncated.
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(b"q\n").await;
            } else {
                let _ = child.start_kill();
            }
            let _ = child.wait().await;
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}
