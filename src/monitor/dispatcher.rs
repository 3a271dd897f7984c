use crate::error::AppError;
use crate::monitor::types::{
    AlgorithmProcessing, ErrorReported, Event, EventKind, ExecutionEnded, ExecutionStarted,
    ExperimentEnded, ExperimentStarted, InstanceProcessingEnded, InstanceProcessingStarted, Ping,
    SolutionGenerated,
};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub type HandlerResult = Result<(), AppError>;

/// Per-kind reactions to synchronized events. Every method defaults to a no-op.
pub trait EventHandlers {
    fn on_execution_started(&mut self, _event: &Event, _data: &ExecutionStarted) -> HandlerResult {
        Ok(())
    }

    fn on_execution_ended(&mut self, _event: &Event, _data: &ExecutionEnded) -> HandlerResult {
        Ok(())
    }

    fn on_experiment_started(&mut self, _event: &Event, _data: &ExperimentStarted) -> HandlerResult {
        Ok(())
    }

    fn on_experiment_ended(&mut self, _event: &Event, _data: &ExperimentEnded) -> HandlerResult {
        Ok(())
    }

    fn on_instance_started(
        &mut self,
        _event: &Event,
        _data: &InstanceProcessingStarted,
    ) -> HandlerResult {
        Ok(())
    }

    fn on_instance_ended(&mut self, _event: &Event, _data: &InstanceProcessingEnded) -> HandlerResult {
        Ok(())
    }

    fn on_algorithm_started(&mut self, _event: &Event, _data: &AlgorithmProcessing) -> HandlerResult {
        Ok(())
    }

    fn on_algorithm_ended(&mut self, _event: &Event, _data: &AlgorithmProcessing) -> HandlerResult {
        Ok(())
    }

    fn on_solution_generated(&mut self, _event: &Event, _data: &SolutionGenerated) -> HandlerResult {
        Ok(())
    }

    fn on_error(&mut self, _event: &Event, _data: &ErrorReported) -> HandlerResult {
        Ok(())
    }

    fn on_ping(&mut self, _event: &Event, _data: &Ping) -> HandlerResult {
        Ok(())
    }

    /// Runs after the typed handler for every event, even when that handler failed.
    fn on_any_event(&mut self, _event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The replay backlog has been drained; charts should be redrawn once.
    fn on_replay_complete(&mut self) {}

    /// Session state is stale and everything derived from it must go.
    fn on_session_reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub routed: bool,
    pub failures: u8,
}

#[derive(Debug)]
pub struct EventDispatcher<H> {
    handlers: H,
    dispatched: u64,
    handler_failures: u64,
}

impl<H: EventHandlers> EventDispatcher<H> {
    pub fn new(handlers: H) -> Self {
        Self {
            handlers,
            dispatched: 0,
            handler_failures: 0,
        }
    }

    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures
    }

    /// Routes the event to its typed handler, then to the catch-all observer.
    /// A failing or panicking handler never stops the caller's drain loop.
    pub fn dispatch(&mut self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::default();

        let typed = isolate(|| route(&mut self.handlers, event));
        match typed {
            HandlerOutcome::Ok(routed) => report.routed = routed,
            HandlerOutcome::Failed(reason) => {
                report.routed = true;
                report.failures += 1;
                tracing::warn!(
                    event_id = event.event_id,
                    kind = event.type_name(),
                    reason = %reason,
                    "event handler failed"
                );
            }
        }

        if let HandlerOutcome::Failed(reason) =
            isolate(|| self.handlers.on_any_event(event).map(|_| true))
        {
            report.failures += 1;
            tracing::warn!(
                event_id = event.event_id,
                reason = %reason,
                "catch-all event observer failed"
            );
        }

        self.dispatched = self.dispatched.saturating_add(1);
        self.handler_failures = self
            .handler_failures
            .saturating_add(u64::from(report.failures));
        report
    }

    pub fn finish_replay(&mut self) {
        if let HandlerOutcome::Failed(reason) = isolate(|| {
            self.handlers.on_replay_complete();
            Ok(true)
        }) {
            tracing::warn!(reason = %reason, "replay completion handler failed");
        }
    }

    pub fn reset(&mut self) {
        self.dispatched = 0;
        self.handler_failures = 0;
        self.handlers.on_session_reset();
    }
}

fn route<H: EventHandlers>(handlers: &mut H, event: &Event) -> Result<bool, AppError> {
    match &event.kind {
        EventKind::ExecutionStarted(data) => handlers.on_execution_started(event, data)?,
        EventKind::ExecutionEnded(data) => handlers.on_execution_ended(event, data)?,
        EventKind::ExperimentStarted(data) => handlers.on_experiment_started(event, data)?,
        EventKind::ExperimentEnded(data) => handlers.on_experiment_ended(event, data)?,
        EventKind::InstanceProcessingStarted(data) => handlers.on_instance_started(event, data)?,
        EventKind::InstanceProcessingEnded(data) => handlers.on_instance_ended(event, data)?,
        EventKind::AlgorithmProcessingStarted(data) => handlers.on_algorithm_started(event, data)?,
        EventKind::AlgorithmProcessingEnded(data) => handlers.on_algorithm_ended(event, data)?,
        EventKind::SolutionGenerated(data) => handlers.on_solution_generated(event, data)?,
        EventKind::Error(data) => handlers.on_error(event, data)?,
        EventKind::Ping(data) => handlers.on_ping(event, data)?,
        EventKind::Unknown => return Ok(false),
    }
    Ok(true)
}

enum HandlerOutcome {
    Ok(bool),
    Failed(String),
}

fn isolate(call: impl FnOnce() -> Result<bool, AppError>) -> HandlerOutcome {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(routed)) => HandlerOutcome::Ok(routed),
        Ok(Err(error)) => HandlerOutcome::Failed(error.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            HandlerOutcome::Failed(format!("panic: {message}"))
        }
    }
}
