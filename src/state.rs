use crate::monitor::pipeline::StatusStore;
use crate::monitor::types::MonitorStatusSnapshot;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct MonitorHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub monitor: Mutex<Option<MonitorHandle>>,
    pub monitor_status: StatusStore,
}

impl AppState {
    pub fn new() -> Self {
        let monitor_status = MonitorStatusSnapshot::connecting(Some("monitor idle".to_string()));

        Self {
            started_at: Instant::now(),
            monitor: Mutex::new(None),
            monitor_status: Arc::new(RwLock::new(monitor_status)),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
