use crate::config::{GapPolicy, MonitorConfig, PushTransport, ReconnectPolicy};
use crate::error::AppError;
use serde::{Deserialize, Deserializer, Serialize};
use simd_json::OwnedValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Connecting,
    Buffering,
    DownloadingHistory,
    Replaying,
    RealTime,
}

impl SyncState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Buffering => "waiting",
            Self::DownloadingHistory => "syncing",
            Self::Replaying => "replaying",
            Self::RealTime => "real-time",
        }
    }

    /// True while live events must be held back instead of dispatched.
    pub fn holds_live_events(self) -> bool {
        !matches!(self, Self::RealTime)
    }
}

/// One immutable progress fact emitted by the experiment backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: u64,
    #[serde(default)]
    pub worker_name: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "ExecutionStartedEvent")]
    ExecutionStarted(ExecutionStarted),
    #[serde(rename = "ExecutionEndedEvent")]
    ExecutionEnded(ExecutionEnded),
    #[serde(rename = "ExperimentStartedEvent")]
    ExperimentStarted(ExperimentStarted),
    #[serde(rename = "ExperimentEndedEvent")]
    ExperimentEnded(ExperimentEnded),
    #[serde(rename = "InstanceProcessingStartedEvent")]
    InstanceProcessingStarted(InstanceProcessingStarted),
    #[serde(rename = "InstanceProcessingEndedEvent")]
    InstanceProcessingEnded(InstanceProcessingEnded),
    #[serde(rename = "AlgorithmProcessingStartedEvent")]
    AlgorithmProcessingStarted(AlgorithmProcessing),
    #[serde(rename = "AlgorithmProcessingEndedEvent")]
    AlgorithmProcessingEnded(AlgorithmProcessing),
    #[serde(rename = "SolutionGeneratedEvent")]
    SolutionGenerated(SolutionGenerated),
    #[serde(rename = "ErrorEvent")]
    Error(ErrorReported),
    #[serde(rename = "PingEvent")]
    Ping(Ping),
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted(_) => "ExecutionStartedEvent",
            Self::ExecutionEnded(_) => "ExecutionEndedEvent",
            Self::ExperimentStarted(_) => "ExperimentStartedEvent",
            Self::ExperimentEnded(_) => "ExperimentEndedEvent",
            Self::InstanceProcessingStarted(_) => "InstanceProcessingStartedEvent",
            Self::InstanceProcessingEnded(_) => "InstanceProcessingEndedEvent",
            Self::AlgorithmProcessingStarted(_) => "AlgorithmProcessingStartedEvent",
            Self::AlgorithmProcessingEnded(_) => "AlgorithmProcessingEndedEvent",
            Self::SolutionGenerated(_) => "SolutionGeneratedEvent",
            Self::Error(_) => "ErrorEvent",
            Self::Ping(_) => "PingEvent",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStarted {
    #[serde(default)]
    pub experiment_names: Vec<String>,
    #[serde(default)]
    pub maximizing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEnded {
    #[serde(default)]
    pub execution_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStarted {
    pub experiment_name: String,
    #[serde(default)]
    pub instance_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentEnded {
    pub experiment_name: String,
    /// Nanoseconds.
    #[serde(default)]
    pub execution_time: u64,
    #[serde(default)]
    pub experiment_start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProcessingStarted {
    pub experiment_name: String,
    pub instance_name: String,
    #[serde(default)]
    pub algorithms: Vec<OwnedValue>,
    #[serde(default)]
    pub repetitions: u32,
    #[serde(default)]
    pub reference_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProcessingEnded {
    pub experiment_name: String,
    pub instance_name: String,
    #[serde(default)]
    pub execution_time: u64,
    #[serde(default)]
    pub experiment_start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmProcessing {
    pub experiment_name: String,
    pub instance_name: String,
    #[serde(default)]
    pub algorithm: Option<OwnedValue>,
    #[serde(default)]
    pub repetitions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionGenerated {
    pub experiment_name: String,
    pub instance_name: String,
    pub algorithm_name: String,
    #[serde(deserialize_with = "deserialize_iteration")]
    pub iteration: u64,
    pub score: f64,
    #[serde(default)]
    pub execution_time: u64,
    #[serde(default)]
    pub time_to_best: u64,
    #[serde(default)]
    pub algorithm: Option<OwnedValue>,
    #[serde(default)]
    pub solution: Option<OwnedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReported {
    #[serde(default)]
    pub throwable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IterationWire {
    Number(u64),
    Text(String),
}

// Some backends serialize the iteration counter as a string.
fn deserialize_iteration<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match IterationWire::deserialize(deserializer)? {
        IterationWire::Number(value) => Ok(value),
        IterationWire::Text(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|error| serde::de::Error::custom(format!("invalid iteration '{raw}': {error}"))),
    }
}

pub fn parse_event_payload(payload: &mut [u8]) -> Result<Event, AppError> {
    let event: Event = simd_json::serde::from_slice(payload)?;
    Ok(event)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatusSnapshot {
    pub state: SyncState,
    pub label: String,
    pub last_event_id: Option<u64>,
    pub latest_known_id: Option<u64>,
    pub buffered_events: usize,
    pub malformed_payloads: u64,
    pub reason: Option<String>,
}

impl MonitorStatusSnapshot {
    pub fn connecting(reason: Option<String>) -> Self {
        Self {
            state: SyncState::Connecting,
            label: SyncState::Connecting.label().to_string(),
            last_event_id: None,
            latest_known_id: None,
            buffered_events: 0,
            malformed_payloads: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSession {
    pub running: bool,
    pub base_url: String,
    pub topic: String,
    pub transport: PushTransport,
    pub event_batch_size: u64,
    pub gap_policy: GapPolicy,
    pub reconnect_policy: ReconnectPolicy,
}

impl MonitorSession {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            running: true,
            base_url: config.base_url.to_string(),
            topic: config.topic.clone(),
            transport: config.transport,
            event_batch_size: config.event_batch_size,
            gap_policy: config.gap_policy,
            reconnect_policy: config.reconnect_policy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Convergence,
    CurrentValue,
}

/// Typed series key: one series per algorithm inside an instance chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AlgorithmKey(pub String);

impl AlgorithmKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AlgorithmKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SeriesId {
    pub chart: ChartKind,
    pub instance_name: String,
    pub algorithm: AlgorithmKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiSeriesPoint {
    pub series: SeriesId,
    pub x: f64,
    pub y: f64,
    pub redraw: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UiProgress {
    pub iteration_pct: u8,
    pub algorithm_pct: u8,
    pub instance_pct: u8,
    pub redraw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiInstanceCharts {
    pub instance_name: String,
    pub title: String,
    pub reference_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiBestSolution {
    pub instance_name: String,
    pub algorithm_name: String,
    pub iteration: u64,
    pub score: f64,
    pub solution: Option<OwnedValue>,
}

/// Render instruction handed to the charting surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum UiFrame {
    Status(MonitorStatusSnapshot),
    ProgressReset,
    Progress(UiProgress),
    Experiment { label: String },
    ChartsOpened(UiInstanceCharts),
    ChartsEvicted { instance_name: String },
    SeriesPoint(UiSeriesPoint),
    BestSolution(UiBestSolution),
    Redraw,
    ExecutionFinished { execution_time: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_solution_generated_payload() {
        let mut payload = br#"{"type":"SolutionGeneratedEvent","eventId":42,"workerName":"worker-1","experimentName":"exp","instanceName":"a.txt","algorithmName":"GRASP","iteration":7,"score":12.5,"executionTime":1000,"timeToBest":500}"#.to_vec();
        let event = parse_event_payload(&mut payload).expect("payload should parse");

        assert_eq!(event.event_id, 42);
        assert_eq!(event.worker_name, "worker-1");
        assert_eq!(event.type_name(), "SolutionGeneratedEvent");
        match event.kind {
            EventKind::SolutionGenerated(solution) => {
                assert_eq!(solution.algorithm_name, "GRASP");
                assert_eq!(solution.iteration, 7);
                assert_eq!(solution.score, 12.5);
                assert!(solution.solution.is_none());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn accepts_iteration_serialized_as_string() {
        let mut payload = br#"{"type":"SolutionGeneratedEvent","eventId":3,"workerName":"w","experimentName":"exp","instanceName":"i","algorithmName":"VNS","iteration":"11","score":4}"#.to_vec();
        let event = parse_event_payload(&mut payload).expect("payload should parse");
        let EventKind::SolutionGenerated(solution) = event.kind else {
            panic!("expected solution event");
        };
        assert_eq!(solution.iteration, 11);
        assert_eq!(solution.score, 4.0);
    }

    #[test]
    fn parses_instance_started_with_algorithm_descriptors() {
        let mut payload = br#"{"type":"InstanceProcessingStartedEvent","eventId":2,"workerName":"main","experimentName":"exp","instanceName":"graph.txt","algorithms":[{"name":"a"},{"name":"b"}],"repetitions":5,"referenceValue":100.0}"#.to_vec();
        let event = parse_event_payload(&mut payload).expect("payload should parse");
        let EventKind::InstanceProcessingStarted(started) = event.kind else {
            panic!("expected instance started event");
        };
        assert_eq!(started.algorithms.len(), 2);
        assert_eq!(started.repetitions, 5);
        assert_eq!(started.reference_value, Some(100.0));
    }

    #[test]
    fn unknown_event_type_maps_to_unknown_kind() {
        let mut payload =
            br#"{"type":"SomethingNewEvent","eventId":9,"workerName":"main","extra":1}"#.to_vec();
        let event = parse_event_payload(&mut payload).expect("unknown types should still parse");
        assert_eq!(event.event_id, 9);
        assert_eq!(event.kind, EventKind::Unknown);
    }

    #[test]
    fn rejects_payload_without_event_id() {
        let mut payload = br#"{"type":"PingEvent","workerName":"main","message":"hi"}"#.to_vec();
        assert!(parse_event_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_non_json_payload() {
        let mut payload = b"not json at all".to_vec();
        assert!(parse_event_payload(&mut payload).is_err());
    }

    #[test]
    fn sync_state_labels_match_status_indicator() {
        assert_eq!(SyncState::Connecting.label(), "connecting");
        assert_eq!(SyncState::DownloadingHistory.label(), "syncing");
        assert_eq!(SyncState::Replaying.label(), "replaying");
        assert_eq!(SyncState::RealTime.label(), "real-time");
        assert!(SyncState::Replaying.holds_live_events());
        assert!(!SyncState::RealTime.holds_live_events());
    }
}
