pub mod commands;
pub mod config;
pub mod error;
pub mod monitor;
pub mod state;

use commands::{
    app_info::app_info,
    health::health,
    monitor::{monitor_status, start_monitor, stop_monitor},
};
use config::MonitorArgs;
use error::AppError;
use monitor::surface::{frame_channel, write_frames_jsonl, FRAME_CHANNEL_CAPACITY};
use state::AppState;

/// Streams dashboard frames to stdout as JSON lines until ctrl-c or stdout closes.
pub async fn run(args: MonitorArgs) -> Result<(), AppError> {
    let state = AppState::new();
    let (frames, frame_rx) = frame_channel(FRAME_CHANNEL_CAPACITY);
    let mut writer = tokio::spawn(write_frames_jsonl(frame_rx, tokio::io::stdout()));

    let info = app_info();
    let session = start_monitor(&state, frames, args).await?;
    tracing::info!(
        product = %info.product_name,
        version = %info.version,
        base_url = %session.base_url,
        topic = %session.topic,
        batch_size = session.event_batch_size,
        "experiment monitor running"
    );

    let writer_outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutdown requested");
            None
        }
        written = &mut writer => Some(written),
    };

    let stopped = stop_monitor(&state).await?;
    let last_status = monitor_status(&state).await?;
    let health = health(&state).await;

    let written = match writer_outcome {
        Some(written) => written,
        None => writer.await,
    }??;

    tracing::info!(
        stopped = stopped.stopped,
        frames = written,
        last_event_id = ?last_status.last_event_id,
        uptime_ms = health.uptime_ms as u64,
        "experiment monitor shut down"
    );
    Ok(())
}
