use crate::config::MonitorConfig;
use crate::error::AppError;
use crate::monitor::dispatcher::{EventHandlers, HandlerResult};
use crate::monitor::surface::ChartSurface;
use crate::monitor::types::{
    AlgorithmKey, ChartKind, ErrorReported, Event, ExecutionEnded, ExecutionStarted,
    ExperimentEnded, ExperimentStarted, InstanceProcessingEnded, InstanceProcessingStarted, Ping,
    SeriesId, SolutionGenerated, UiBestSolution, UiFrame, UiInstanceCharts, UiProgress,
    UiSeriesPoint,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

const IDLE_EXPERIMENT_LABEL: &str = "[Waiting]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub instances_total: u64,
    pub instances_done: u64,
    pub algorithms_total: u64,
    pub algorithms_done: u64,
    pub repetitions_total: u64,
    pub repetitions_done: u64,
}

impl ProgressCounters {
    fn snapshot(&self, redraw: bool) -> UiProgress {
        UiProgress {
            iteration_pct: percent(self.repetitions_done, self.repetitions_total),
            algorithm_pct: percent(self.algorithms_done, self.algorithms_total),
            instance_pct: percent(self.instances_done, self.instances_total),
            redraw,
        }
    }

    fn record_solution(&mut self) {
        if self.repetitions_done >= self.repetitions_total {
            self.repetitions_done = 0;
            self.algorithms_done += 1;
        }
        self.repetitions_done += 1;
    }
}

fn percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesAccumulator {
    best_so_far: f64,
    points: u64,
}

impl SeriesAccumulator {
    fn new(first_score: f64) -> Self {
        Self {
            best_so_far: first_score,
            points: 0,
        }
    }

    fn record(&mut self, score: f64, maximizing: bool) -> f64 {
        if is_better(score, self.best_so_far, maximizing) {
            self.best_so_far = score;
        }
        self.points += 1;
        self.best_so_far
    }

    pub fn best_so_far(&self) -> f64 {
        self.best_so_far
    }

    pub fn points(&self) -> u64 {
        self.points
    }
}

fn is_better(candidate: f64, incumbent: f64, maximizing: bool) -> bool {
    if maximizing {
        candidate > incumbent
    } else {
        candidate < incumbent
    }
}

/// Chart state scoped to one instance, from its start event to its end event.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceCharts {
    instance_name: String,
    series: BTreeMap<AlgorithmKey, SeriesAccumulator>,
    best_score: Option<f64>,
}

impl InstanceCharts {
    fn open(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            series: BTreeMap::new(),
            best_score: None,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn series(&self, algorithm: &AlgorithmKey) -> Option<&SeriesAccumulator> {
        self.series.get(algorithm)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    fn series_id(&self, chart: ChartKind, algorithm: &AlgorithmKey) -> SeriesId {
        SeriesId {
            chart,
            instance_name: self.instance_name.clone(),
            algorithm: algorithm.clone(),
        }
    }
}

/// "graph.txt" is shown as "graph".
fn chart_title(instance_name: &str) -> &str {
    match instance_name.find('.') {
        Some(index) if index + 1 < instance_name.len() => &instance_name[..index],
        _ => instance_name,
    }
}

#[derive(Debug)]
pub struct Dashboard<S> {
    surface: S,
    redraw_cooldown: Duration,
    max_charts: usize,
    last_redraw: Option<Instant>,
    maximizing: bool,
    progress: ProgressCounters,
    experiment_label: String,
    open_charts: VecDeque<String>,
    active: Option<InstanceCharts>,
    last_event_id: Option<u64>,
    events_seen: u64,
    execution_finished: bool,
}

impl<S: ChartSurface> Dashboard<S> {
    pub fn new(surface: S, redraw_cooldown: Duration, max_charts: usize) -> Self {
        Self {
            surface,
            redraw_cooldown,
            max_charts: max_charts.max(1),
            last_redraw: None,
            maximizing: false,
            progress: ProgressCounters::default(),
            experiment_label: String::new(),
            open_charts: VecDeque::new(),
            active: None,
            last_event_id: None,
            events_seen: 0,
            execution_finished: false,
        }
    }

    pub fn from_config(surface: S, config: &MonitorConfig) -> Self {
        Self::new(surface, config.redraw_cooldown, config.max_charts)
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn progress(&self) -> ProgressCounters {
        self.progress
    }

    pub fn experiment_label(&self) -> &str {
        &self.experiment_label
    }

    pub fn open_charts(&self) -> impl Iterator<Item = &str> {
        self.open_charts.iter().map(String::as_str)
    }

    pub fn active_instance(&self) -> Option<&InstanceCharts> {
        self.active.as_ref()
    }

    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    pub fn execution_finished(&self) -> bool {
        self.execution_finished
    }

    fn take_redraw(&mut self, now: Instant) -> bool {
        let due = self
            .last_redraw
            .map(|last| now.duration_since(last) >= self.redraw_cooldown)
            .unwrap_or(true);
        if due {
            self.last_redraw = Some(now);
        }
        due
    }

    fn emit_progress(&mut self, redraw: bool) -> HandlerResult {
        let snapshot = self.progress.snapshot(redraw);
        self.surface.emit(UiFrame::Progress(snapshot))
    }

    fn evict_extra_charts(&mut self) -> HandlerResult {
        while self.open_charts.len() > self.max_charts {
            let Some(instance_name) = self.open_charts.pop_back() else {
                break;
            };
            tracing::debug!(instance = %instance_name, "evicting oldest instance charts");
            self.surface.emit(UiFrame::ChartsEvicted { instance_name })?;
        }
        Ok(())
    }
}

impl<S: ChartSurface> EventHandlers for Dashboard<S> {
    fn on_execution_started(&mut self, _event: &Event, data: &ExecutionStarted) -> HandlerResult {
        self.maximizing = data.maximizing;
        self.execution_finished = false;
        self.progress = ProgressCounters::default();
        tracing::info!(
            experiments = data.experiment_names.len(),
            maximizing = data.maximizing,
            "execution started"
        );
        self.surface.emit(UiFrame::ProgressReset)
    }

    fn on_execution_ended(&mut self, _event: &Event, data: &ExecutionEnded) -> HandlerResult {
        self.execution_finished = true;
        tracing::info!(execution_time = data.execution_time, "execution finished");
        self.surface.emit(UiFrame::ExecutionFinished {
            execution_time: data.execution_time,
        })
    }

    fn on_experiment_started(&mut self, _event: &Event, data: &ExperimentStarted) -> HandlerResult {
        self.progress.instances_total = data.instance_names.len() as u64;
        self.progress.instances_done = 0;
        self.experiment_label = data.experiment_name.clone();
        self.surface.emit(UiFrame::Experiment {
            label: self.experiment_label.clone(),
        })
    }

    fn on_experiment_ended(&mut self, _event: &Event, _data: &ExperimentEnded) -> HandlerResult {
        self.experiment_label = IDLE_EXPERIMENT_LABEL.to_string();
        self.surface.emit(UiFrame::Experiment {
            label: self.experiment_label.clone(),
        })
    }

    fn on_instance_started(
        &mut self,
        _event: &Event,
        data: &InstanceProcessingStarted,
    ) -> HandlerResult {
        self.progress.algorithms_total = data.algorithms.len() as u64;
        self.progress.algorithms_done = 0;
        self.progress.repetitions_total = u64::from(data.repetitions);
        self.progress.repetitions_done = 0;
        self.emit_progress(false)?;

        self.active = Some(InstanceCharts::open(&data.instance_name));
        self.open_charts.push_front(data.instance_name.clone());
        self.surface.emit(UiFrame::ChartsOpened(UiInstanceCharts {
            instance_name: data.instance_name.clone(),
            title: chart_title(&data.instance_name).to_string(),
            reference_value: data.reference_value,
        }))
    }

    fn on_instance_ended(&mut self, _event: &Event, data: &InstanceProcessingEnded) -> HandlerResult {
        self.surface.emit(UiFrame::Redraw)?;
        self.evict_extra_charts()?;

        self.progress.instances_done += 1;
        self.progress.algorithms_done = self.progress.algorithms_total;
        self.progress.repetitions_done = self.progress.repetitions_total;
        self.emit_progress(true)?;

        match self.active.take() {
            Some(charts) if charts.instance_name != data.instance_name => {
                tracing::warn!(
                    open = %charts.instance_name,
                    ended = %data.instance_name,
                    "instance end does not match the open chart context"
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn on_solution_generated(&mut self, _event: &Event, data: &SolutionGenerated) -> HandlerResult {
        self.progress.record_solution();
        let redraw = self.take_redraw(Instant::now());
        self.emit_progress(redraw)?;

        let maximizing = self.maximizing;
        let Some(charts) = self.active.as_mut() else {
            return Err(AppError::Handler(format!(
                "solution for instance '{}' arrived outside an open instance",
                data.instance_name
            )));
        };

        let algorithm = AlgorithmKey::from(data.algorithm_name.as_str());
        let best_so_far = charts
            .series
            .entry(algorithm.clone())
            .or_insert_with(|| SeriesAccumulator::new(data.score))
            .record(data.score, maximizing);

        let improved = charts
            .best_score
            .map(|best| is_better(data.score, best, maximizing))
            .unwrap_or(true);
        if improved {
            charts.best_score = Some(data.score);
        }

        let convergence = UiSeriesPoint {
            series: charts.series_id(ChartKind::Convergence, &algorithm),
            x: self.progress.repetitions_done as f64,
            y: best_so_far,
            redraw,
        };
        let current_value = UiSeriesPoint {
            series: charts.series_id(ChartKind::CurrentValue, &algorithm),
            x: data.iteration as f64,
            y: data.score,
            redraw,
        };

        self.surface.emit(UiFrame::SeriesPoint(convergence))?;
        self.surface.emit(UiFrame::SeriesPoint(current_value))?;
        if improved {
            self.surface.emit(UiFrame::BestSolution(UiBestSolution {
                instance_name: data.instance_name.clone(),
                algorithm_name: data.algorithm_name.clone(),
                iteration: data.iteration,
                score: data.score,
                solution: data.solution.clone(),
            }))?;
        }
        Ok(())
    }

    fn on_error(&mut self, event: &Event, data: &ErrorReported) -> HandlerResult {
        tracing::warn!(
            event_id = event.event_id,
            worker = %event.worker_name,
            throwable = %data.throwable,
            "experiment reported an error"
        );
        Ok(())
    }

    fn on_ping(&mut self, event: &Event, data: &Ping) -> HandlerResult {
        tracing::debug!(event_id = event.event_id, message = %data.message, "ping");
        Ok(())
    }

    fn on_any_event(&mut self, event: &Event) -> HandlerResult {
        self.last_event_id = Some(event.event_id);
        self.events_seen += 1;
        Ok(())
    }

    fn on_replay_complete(&mut self) {
        self.last_redraw = Some(Instant::now());
        if let Err(error) = self.surface.emit(UiFrame::Redraw) {
            tracing::warn!(%error, "failed to request redraw after replay");
        }
    }

    fn on_session_reset(&mut self) {
        let evicted: Vec<String> = self.open_charts.drain(..).collect();
        for instance_name in evicted {
            if let Err(error) = self.surface.emit(UiFrame::ChartsEvicted { instance_name }) {
                tracing::warn!(%error, "failed to evict charts on reset");
            }
        }
        if let Err(error) = self.surface.emit(UiFrame::ProgressReset) {
            tracing::warn!(%error, "failed to reset progress gauge");
        }

        self.last_redraw = None;
        self.maximizing = false;
        self.progress = ProgressCounters::default();
        self.experiment_label.clear();
        self.active = None;
        self.last_event_id = None;
        self.events_seen = 0;
        self.execution_finished = false;
    }
}
