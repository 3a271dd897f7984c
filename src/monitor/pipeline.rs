use crate::config::MonitorConfig;
use crate::monitor::backend::HttpHistory;
use crate::monitor::dashboard::Dashboard;
use crate::monitor::dispatcher::EventDispatcher;
use crate::monitor::subscriber::{live_channel, run_live_subscriber, SubscriberTelemetry};
use crate::monitor::surface::FrameEmitter;
use crate::monitor::synchronizer::{EventSynchronizer, SessionEnd};
use crate::monitor::types::{MonitorStatusSnapshot, SyncState, UiFrame};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const STATUS_HEARTBEAT_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;

pub type StatusStore = Arc<RwLock<MonitorStatusSnapshot>>;

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<SyncState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

#[derive(Clone)]
struct StatusContext {
    status_store: StatusStore,
    frames: FrameEmitter,
    telemetry: Arc<SubscriberTelemetry>,
    throttle: Arc<Mutex<StatusPublishThrottle>>,
}

/// Owns one monitoring run until `cancel_token` fires.
pub async fn run_monitor(
    config: MonitorConfig,
    frames: FrameEmitter,
    status_store: StatusStore,
    cancel_token: CancellationToken,
) {
    let telemetry = Arc::new(SubscriberTelemetry::default());
    let status = StatusContext {
        status_store,
        frames: frames.clone(),
        telemetry: Arc::clone(&telemetry),
        throttle: Arc::new(Mutex::new(StatusPublishThrottle::default())),
    };

    publish_status(
        &status,
        MonitorStatusSnapshot::connecting(Some("opening push channel".to_string())),
    )
    .await;

    let (live_tx, mut live_rx) = live_channel(config.live_channel_capacity);
    let subscriber_handle = tokio::spawn(run_live_subscriber(
        config.clone(),
        live_tx,
        Arc::clone(&telemetry),
        cancel_token.clone(),
    ));

    let mut synchronizer = EventSynchronizer::from_config(&config);
    let status_handle = tokio::spawn(run_status_publisher(
        synchronizer.subscribe_status(),
        status.clone(),
        cancel_token.clone(),
    ));

    let history = HttpHistory::new(Client::new(), config.base_url.clone());
    let mut dispatcher = EventDispatcher::new(Dashboard::from_config(frames, &config));
    let retry_delay_ms = config.history_retry_delay.as_millis();

    loop {
        let end = synchronizer
            .run_session(&history, &mut live_rx, &mut dispatcher, &cancel_token)
            .await;

        let retry_reason = match end {
            SessionEnd::Closed => break,
            SessionEnd::Reconnected | SessionEnd::Disconnected { .. } => continue,
            SessionEnd::HistoryFailed(error) => {
                format!("history unavailable ({error}); retrying in {retry_delay_ms} ms")
            }
            SessionEnd::Resync { reason } => {
                format!("resynchronizing after {reason}; retrying in {retry_delay_ms} ms")
            }
        };

        let mut snapshot = MonitorStatusSnapshot::connecting(Some(retry_reason));
        snapshot.last_event_id = synchronizer.last_dispatched_id();
        snapshot.malformed_payloads = telemetry.malformed();
        publish_status_throttled(&status, snapshot).await;

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(config.history_retry_delay) => {}
        }
    }

    cancel_token.cancel();
    // A subscriber blocked on a full channel must see it close.
    drop(live_rx);
    let _ = subscriber_handle.await;
    let _ = status_handle.await;

    tracing::info!(
        dispatched = dispatcher.dispatched(),
        handler_failures = dispatcher.handler_failures(),
        received = telemetry.received(),
        malformed = telemetry.malformed(),
        connections = telemetry.connections(),
        frames_dropped = status.frames.dropped(),
        "monitor stopped"
    );
}

async fn run_status_publisher(
    mut status_rx: watch::Receiver<MonitorStatusSnapshot>,
    status: StatusContext,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = current_status(&status_rx, &status.telemetry);
                publish_status_throttled(&status, snapshot).await;
            }
            _ = ticker.tick() => {
                let snapshot = current_status(&status_rx, &status.telemetry);
                publish_status(&status, snapshot).await;
            }
        }
    }
}

fn current_status(
    status_rx: &watch::Receiver<MonitorStatusSnapshot>,
    telemetry: &SubscriberTelemetry,
) -> MonitorStatusSnapshot {
    let mut snapshot = status_rx.borrow().clone();
    snapshot.malformed_payloads = telemetry.malformed();
    snapshot
}

async fn publish_status(status: &StatusContext, snapshot: MonitorStatusSnapshot) {
    {
        let mut writable = status.status_store.write().await;
        *writable = snapshot.clone();
    }

    if let Err(error) = status.frames.publish(UiFrame::Status(snapshot)).await {
        tracing::warn!(%error, "failed to emit monitor status frame");
    }
}

fn allow_status_publish(
    throttle: &Arc<Mutex<StatusPublishThrottle>>,
    state: SyncState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();

    if state == SyncState::Connecting
        && writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

async fn publish_status_throttled(status: &StatusContext, snapshot: MonitorStatusSnapshot) {
    if !allow_status_publish(&status.throttle, snapshot.state, &snapshot.reason) {
        return;
    }
    publish_status(status, snapshot).await;
}
