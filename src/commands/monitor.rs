use crate::config::MonitorArgs;
use crate::error::AppError;
use crate::monitor::pipeline::run_monitor;
use crate::monitor::surface::FrameEmitter;
use crate::monitor::types::{MonitorSession, MonitorStatusSnapshot, MonitorStopResult};
use crate::state::{AppState, MonitorHandle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Starts a monitoring run, replacing any run that is already active.
pub async fn start_monitor(
    state: &AppState,
    frames: FrameEmitter,
    args: MonitorArgs,
) -> Result<MonitorSession, AppError> {
    let config = args.normalize()?;

    let existing_handle = {
        let mut monitor_slot = state.monitor.lock().await;
        monitor_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let status_store = Arc::clone(&state.monitor_status);
    let runtime_config = config.clone();

    let join_handle = tokio::spawn(async move {
        run_monitor(runtime_config, frames, status_store, task_token).await;
    });

    {
        let mut monitor_slot = state.monitor.lock().await;
        *monitor_slot = Some(MonitorHandle {
            cancellation_token,
            join_handle,
        });
    }

    tracing::info!(base_url = %config.base_url, topic = %config.topic, "monitor started");
    Ok(MonitorSession::from_config(&config))
}

pub async fn stop_monitor(state: &AppState) -> Result<MonitorStopResult, AppError> {
    let existing_handle = {
        let mut monitor_slot = state.monitor.lock().await;
        monitor_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    {
        let last_event_id = state.monitor_status.read().await.last_event_id;
        let mut writable = state.monitor_status.write().await;
        *writable = MonitorStatusSnapshot {
            last_event_id,
            ..MonitorStatusSnapshot::connecting(Some("monitor stopped by command".to_string()))
        };
    }

    Ok(MonitorStopResult { stopped })
}

pub async fn monitor_status(state: &AppState) -> Result<MonitorStatusSnapshot, AppError> {
    let snapshot = state.monitor_status.read().await.clone();
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::surface::frame_channel;
    use crate::monitor::types::SyncState;

    #[tokio::test]
    async fn stop_without_running_monitor_reports_nothing_stopped() {
        let state = AppState::new();

        let result = stop_monitor(&state).await.expect("stop should succeed");
        let status = monitor_status(&state).await.expect("status should be readable");

        assert!(!result.stopped);
        assert_eq!(status.state, SyncState::Connecting);
        assert_eq!(status.reason.as_deref(), Some("monitor stopped by command"));
    }

    #[tokio::test]
    async fn invalid_arguments_never_spawn_a_run() {
        let state = AppState::new();
        let (frames, _frame_rx) = frame_channel(8);
        let args = MonitorArgs {
            event_batch_size: Some(0),
            ..MonitorArgs::default()
        };

        let error = start_monitor(&state, frames, args)
            .await
            .expect_err("zero batch size must be rejected");

        assert!(matches!(error, AppError::InvalidArgument(_)));
        assert!(state.monitor.lock().await.is_none());
    }

    #[tokio::test]
    async fn start_then_stop_joins_the_run() {
        let state = AppState::new();
        let (frames, _frame_rx) = frame_channel(64);
        let args = MonitorArgs {
            base_url: Some("http://127.0.0.1:9/".to_string()),
            reconnect_delay_ms: Some(100),
            history_retry_delay_ms: Some(100),
            ..MonitorArgs::default()
        };

        let session = start_monitor(&state, frames, args)
            .await
            .expect("start should succeed");
        assert!(session.running);
        assert_eq!(session.base_url, "http://127.0.0.1:9/");

        let result = stop_monitor(&state).await.expect("stop should succeed");
        assert!(result.stopped);
        assert!(state.monitor.lock().await.is_none());
    }
}
