use crate::monitor::pipeline::StatusStore;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub sync: String,
    pub last_event_id: Option<u64>,
}

pub async fn build_health_response(started_at: Instant, status: &StatusStore) -> HealthResponse {
    let readable = status.read().await;

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        sync: readable.label.clone(),
        last_event_id: readable.last_event_id,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    build_health_response(state.started_at, &state.monitor_status).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::types::MonitorStatusSnapshot;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn health_reports_ok_status_and_sync_label() {
        let mut snapshot = MonitorStatusSnapshot::connecting(None);
        snapshot.last_event_id = Some(12);
        let store: StatusStore = Arc::new(RwLock::new(snapshot));

        let response = build_health_response(Instant::now(), &store).await;

        assert_eq!(response.status, "ok");
        assert_eq!(response.sync, "connecting");
        assert_eq!(response.last_event_id, Some(12));
        assert!(response.uptime_ms <= 1_000);
    }
}
