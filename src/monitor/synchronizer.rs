use crate::config::{GapPolicy, MonitorConfig, ReconnectPolicy};
use crate::error::AppError;
use crate::monitor::backend::HistorySource;
use crate::monitor::dispatcher::{EventDispatcher, EventHandlers};
use crate::monitor::subscriber::{LiveReceiver, LiveSignal};
use crate::monitor::types::{Event, MonitorStatusSnapshot, SyncState};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Dispatch,
    Duplicate { current: u64, last: u64 },
    Gap { expected: u64, found: u64 },
}

/// Why a synchronization session stopped. Every variant except `Closed` is restartable.
#[derive(Debug)]
pub enum SessionEnd {
    /// The push channel came back after an outage; session state is stale.
    Reconnected,
    Disconnected { reason: String },
    HistoryFailed(AppError),
    /// An ordering gap could not be repaired; the session was reset.
    Resync { reason: String },
    Closed,
}

/// Walks `[from, end)` in pages of at most `batch_size` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    cursor: u64,
    end: u64,
    batch_size: u64,
    exhausted: bool,
}

impl PageCursor {
    pub fn new(from: u64, end: u64, batch_size: u64) -> Self {
        Self {
            cursor: from,
            end,
            batch_size: batch_size.max(1),
            exhausted: from >= end,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn next_range(&self) -> Option<(u64, u64)> {
        if self.exhausted {
            return None;
        }
        let to = self.end.min(self.cursor.saturating_add(self.batch_size));
        Some((self.cursor, to))
    }

    /// Moves past a received page. A page shorter than requested means history ran out.
    pub fn advance(&mut self, requested: u64, received: usize) {
        let received = received as u64;
        self.cursor = self.cursor.saturating_add(received);
        if received < requested || self.cursor >= self.end {
            self.exhausted = true;
        }
    }
}

struct SessionIo<'a, H, D> {
    history: &'a H,
    live_rx: &'a mut LiveReceiver,
    dispatcher: &'a mut EventDispatcher<D>,
    cancel_token: &'a CancellationToken,
}

#[derive(Debug)]
pub struct EventSynchronizer {
    state: SyncState,
    last_dispatched_id: Option<u64>,
    latest_known_id: Option<u64>,
    live_buffer: VecDeque<Event>,
    queue: VecDeque<Event>,
    connected: bool,
    pending_reconnect: bool,
    duplicates_dropped: u64,
    batch_size: u64,
    gap_policy: GapPolicy,
    reconnect_policy: ReconnectPolicy,
    status_tx: watch::Sender<MonitorStatusSnapshot>,
}

impl EventSynchronizer {
    pub fn new(batch_size: u64, gap_policy: GapPolicy, reconnect_policy: ReconnectPolicy) -> Self {
        let (status_tx, _) = watch::channel(MonitorStatusSnapshot::connecting(None));
        Self {
            state: SyncState::Connecting,
            last_dispatched_id: None,
            latest_known_id: None,
            live_buffer: VecDeque::new(),
            queue: VecDeque::new(),
            connected: false,
            pending_reconnect: false,
            duplicates_dropped: 0,
            batch_size: batch_size.max(1),
            gap_policy,
            reconnect_policy,
            status_tx,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.event_batch_size,
            config.gap_policy,
            config.reconnect_policy,
        )
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn last_dispatched_id(&self) -> Option<u64> {
        self.last_dispatched_id
    }

    pub fn latest_known_id(&self) -> Option<u64> {
        self.latest_known_id
    }

    pub fn buffered_len(&self) -> usize {
        self.live_buffer.len() + self.queue.len()
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MonitorStatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Drops every piece of session state. The push connection itself is kept.
    pub fn reset(&mut self) {
        self.last_dispatched_id = None;
        self.latest_known_id = None;
        self.live_buffer.clear();
        self.queue.clear();
        self.duplicates_dropped = 0;
        self.set_state(SyncState::Connecting, Some("session reset".to_string()));
    }

    pub fn on_connected(&mut self) {
        self.connected = true;
        if self.state == SyncState::Connecting {
            self.set_state(SyncState::Buffering, Some("reading latest event id".to_string()));
        }
    }

    pub fn on_disconnected(&mut self, reason: String) {
        self.connected = false;
        self.set_state(SyncState::Connecting, Some(reason));
    }

    /// Captures the history snapshot bound and opens the download window.
    pub fn begin_download(&mut self, latest_id: Option<u64>) -> PageCursor {
        self.latest_known_id = latest_id;
        let start = self.next_expected_id();
        let end = latest_id.map_or(start, |id| id.saturating_add(1));
        self.set_state(
            SyncState::DownloadingHistory,
            Some(format!("downloading history from {start}")),
        );
        PageCursor::new(start, end, self.batch_size)
    }

    /// Live entry point. Returns the event when it may be dispatched right away.
    pub fn on_live_event(&mut self, event: Event) -> Option<Event> {
        if !self.state.holds_live_events() && self.live_buffer.is_empty() {
            return Some(event);
        }
        self.hold_live(event);
        None
    }

    /// Queues `downloaded ++ live_buffer` for replay.
    pub fn finish_download(&mut self, downloaded: Vec<Event>) {
        self.queue.extend(downloaded);
        self.queue.extend(self.live_buffer.drain(..));
        let queued = self.queue.len();
        self.set_state(
            SyncState::Replaying,
            Some(format!("replaying {queued} events")),
        );
    }

    pub fn next_replay(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn complete_replay(&mut self) {
        self.set_state(SyncState::RealTime, None);
    }

    pub fn admit(&mut self, event: &Event) -> AdmitOutcome {
        if let Some(last) = self.last_dispatched_id {
            if event.event_id <= last {
                return AdmitOutcome::Duplicate {
                    current: event.event_id,
                    last,
                };
            }
        }

        let expected = self.next_expected_id();
        if event.event_id != expected {
            return AdmitOutcome::Gap {
                expected,
                found: event.event_id,
            };
        }

        self.last_dispatched_id = Some(event.event_id);
        let buffered_events = self.buffered_len();
        // Picked up by the next change or heartbeat.
        self.status_tx.send_if_modified(|status| {
            status.last_event_id = Some(event.event_id);
            status.buffered_events = buffered_events;
            false
        });
        AdmitOutcome::Dispatch
    }

    fn next_expected_id(&self) -> u64 {
        self.last_dispatched_id.map_or(0, |id| id.saturating_add(1))
    }

    fn hold_live(&mut self, event: Event) {
        if self.state == SyncState::Replaying {
            self.queue.push_back(event);
        } else {
            self.live_buffer.push_back(event);
        }
    }

    fn set_state(&mut self, state: SyncState, reason: Option<String>) {
        if self.state != state {
            tracing::info!(from = ?self.state, to = ?state, "sync state changed");
        }
        self.state = state;
        self.publish(reason);
    }

    fn publish(&self, reason: Option<String>) {
        let malformed_payloads = self.status_tx.borrow().malformed_payloads;
        self.status_tx.send_replace(MonitorStatusSnapshot {
            state: self.state,
            label: self.state.label().to_string(),
            last_event_id: self.last_dispatched_id,
            latest_known_id: self.latest_known_id,
            buffered_events: self.buffered_len(),
            malformed_payloads,
            reason,
        });
    }

    fn apply_reconnect<D: EventHandlers>(&mut self, dispatcher: &mut EventDispatcher<D>) {
        match self.reconnect_policy {
            ReconnectPolicy::Reset => {
                tracing::info!("push channel reconnected; discarding session state");
                self.reset();
                dispatcher.reset();
            }
            ReconnectPolicy::Resume => {
                tracing::info!(
                    last_dispatched_id = ?self.last_dispatched_id,
                    "push channel reconnected; resuming after last dispatched event"
                );
                self.live_buffer.clear();
                self.queue.clear();
                self.latest_known_id = None;
            }
        }
    }

    /// Runs one synchronization session: wait for the push channel, download history up to
    /// the latest id, replay it together with buffered live events, then stream in real time.
    pub async fn run_session<H, D>(
        &mut self,
        history: &H,
        live_rx: &mut LiveReceiver,
        dispatcher: &mut EventDispatcher<D>,
        cancel_token: &CancellationToken,
    ) -> SessionEnd
    where
        H: HistorySource,
        D: EventHandlers,
    {
        let mut io = SessionIo {
            history,
            live_rx,
            dispatcher,
            cancel_token,
        };
        let end = match self.drive(&mut io).await {
            Ok(never) => match never {},
            Err(end) => end,
        };

        match &end {
            SessionEnd::HistoryFailed(error) => {
                tracing::error!(%error, "history download aborted; synchronization will restart");
                self.queue.clear();
                self.latest_known_id = None;
                self.set_state(
                    SyncState::Connecting,
                    Some(format!("history unavailable: {error}")),
                );
            }
            SessionEnd::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "push channel lost");
                self.on_disconnected(reason.clone());
            }
            SessionEnd::Resync { reason } => {
                tracing::warn!(reason = %reason, "resynchronizing from scratch");
                self.reset();
                io.dispatcher.reset();
            }
            SessionEnd::Reconnected => {
                tracing::debug!("session interrupted by push channel reconnect");
            }
            SessionEnd::Closed => {}
        }
        end
    }

    async fn drive<H, D>(&mut self, io: &mut SessionIo<'_, H, D>) -> Result<Infallible, SessionEnd>
    where
        H: HistorySource,
        D: EventHandlers,
    {
        self.await_connection(io).await?;
        if std::mem::take(&mut self.pending_reconnect) {
            self.apply_reconnect(io.dispatcher);
        }
        self.on_connected();
        if self.state != SyncState::Buffering {
            self.set_state(SyncState::Buffering, Some("reading latest event id".to_string()));
        }

        let latest_id = self
            .await_buffering(io.history.last_event(), io.live_rx, io.cancel_token)
            .await?
            .map_err(SessionEnd::HistoryFailed)?
            .map(|event| event.event_id);

        if let Some(last) = self.last_dispatched_id {
            if latest_id.map_or(true, |latest| latest < last) {
                tracing::warn!(
                    last_dispatched_id = last,
                    latest_id = ?latest_id,
                    "backend history is behind this session; starting over"
                );
                self.last_dispatched_id = None;
                io.dispatcher.reset();
            }
        }

        let mut cursor = self.begin_download(latest_id);
        let mut downloaded = Vec::new();
        while let Some((from, to)) = cursor.next_range() {
            let page = self
                .await_buffering(io.history.fetch_range(from, to), io.live_rx, io.cancel_token)
                .await?
                .map_err(SessionEnd::HistoryFailed)?;
            tracing::debug!(from, to, received = page.len(), "history page downloaded");
            cursor.advance(to - from, page.len());
            downloaded.extend(page);
            self.publish(Some(format!(
                "downloaded up to {} of {}",
                cursor.cursor(),
                latest_id.map_or(0, |id| id.saturating_add(1))
            )));
        }

        self.finish_download(downloaded);
        self.replay(io).await?;
        io.dispatcher.finish_replay();
        self.complete_replay();
        self.stream_live(io).await
    }

    async fn await_connection<H, D>(&mut self, io: &mut SessionIo<'_, H, D>) -> Result<(), SessionEnd> {
        if !self.connected && self.state != SyncState::Connecting {
            self.set_state(
                SyncState::Connecting,
                Some("waiting for push channel".to_string()),
            );
        }

        while !self.connected {
            let signal = tokio::select! {
                biased;
                _ = io.cancel_token.cancelled() => return Err(SessionEnd::Closed),
                signal = io.live_rx.recv() => signal,
            };
            match signal {
                None => return Err(SessionEnd::Closed),
                Some(LiveSignal::Connected { reconnect }) => {
                    self.connected = true;
                    self.pending_reconnect |= reconnect;
                }
                Some(LiveSignal::Event(event)) => self.hold_live(event),
                Some(LiveSignal::Disconnected { .. }) => {}
            }
        }
        Ok(())
    }

    /// Awaits a history request while buffering live pushes. A reconnect or disconnect noticed
    /// meanwhile lets the request finish and then discards its result.
    async fn await_buffering<F: Future>(
        &mut self,
        request: F,
        live_rx: &mut LiveReceiver,
        cancel_token: &CancellationToken,
    ) -> Result<F::Output, SessionEnd> {
        tokio::pin!(request);
        let mut interrupted: Option<SessionEnd> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Err(SessionEnd::Closed),
                output = &mut request => {
                    return match interrupted {
                        Some(end) => Err(end),
                        None => Ok(output),
                    };
                }
                signal = live_rx.recv(), if interrupted.is_none() => {
                    match self.on_signal(signal) {
                        Ok(Some(event)) => self.hold_live(event),
                        Ok(None) => {}
                        Err(end) => interrupted = Some(end),
                    }
                }
            }
        }
    }

    fn on_signal(&mut self, signal: Option<LiveSignal>) -> Result<Option<Event>, SessionEnd> {
        match signal {
            None => Err(SessionEnd::Closed),
            Some(LiveSignal::Event(event)) => Ok(Some(event)),
            Some(LiveSignal::Connected { reconnect: true }) => {
                self.pending_reconnect = true;
                Err(SessionEnd::Reconnected)
            }
            Some(LiveSignal::Connected { reconnect: false }) => Ok(None),
            Some(LiveSignal::Disconnected { reason }) => {
                self.connected = false;
                Err(SessionEnd::Disconnected { reason })
            }
        }
    }

    fn drain_ready_signals(&mut self, live_rx: &mut LiveReceiver) -> Result<(), SessionEnd> {
        loop {
            match live_rx.try_recv() {
                Ok(signal) => {
                    if let Some(event) = self.on_signal(Some(signal))? {
                        self.hold_live(event);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(SessionEnd::Closed),
            }
        }
    }

    // One event per scheduler turn; pushes that arrive meanwhile join the back of the queue.
    async fn replay<H, D>(&mut self, io: &mut SessionIo<'_, H, D>) -> Result<(), SessionEnd>
    where
        H: HistorySource,
        D: EventHandlers,
    {
        while let Some(event) = self.next_replay() {
            self.deliver(event, io).await?;
            tokio::task::yield_now().await;
            if io.cancel_token.is_cancelled() {
                return Err(SessionEnd::Closed);
            }
            self.drain_ready_signals(io.live_rx)?;
        }
        tracing::info!(
            last_dispatched_id = ?self.last_dispatched_id,
            duplicates_dropped = self.duplicates_dropped,
            "replay complete"
        );
        Ok(())
    }

    async fn stream_live<H, D>(
        &mut self,
        io: &mut SessionIo<'_, H, D>,
    ) -> Result<Infallible, SessionEnd>
    where
        H: HistorySource,
        D: EventHandlers,
    {
        loop {
            let signal = tokio::select! {
                biased;
                _ = io.cancel_token.cancelled() => return Err(SessionEnd::Closed),
                signal = io.live_rx.recv() => signal,
            };

            if let Some(event) = self.on_signal(signal)? {
                if let Some(ready) = self.on_live_event(event) {
                    self.deliver(ready, io).await?;
                }
            }
            // Pushes held back while a gap was being repaired.
            while let Some(held) = self.live_buffer.pop_front() {
                self.deliver(held, io).await?;
            }
        }
    }

    async fn deliver<H, D>(&mut self, event: Event, io: &mut SessionIo<'_, H, D>) -> Result<(), SessionEnd>
    where
        H: HistorySource,
        D: EventHandlers,
    {
        match self.admit(&event) {
            AdmitOutcome::Dispatch => {
                io.dispatcher.dispatch(&event);
                Ok(())
            }
            AdmitOutcome::Duplicate { current, last } => {
                self.duplicates_dropped = self.duplicates_dropped.saturating_add(1);
                tracing::debug!(current, last, "skipping already dispatched event");
                Ok(())
            }
            AdmitOutcome::Gap { expected, found } => {
                tracing::warn!(expected, found, policy = ?self.gap_policy, "event id gap detected");
                if self.gap_policy == GapPolicy::Resync {
                    return Err(SessionEnd::Resync {
                        reason: format!("expected event {expected}, received {found}"),
                    });
                }

                self.fill_gap(expected, found, io).await?;
                match self.admit(&event) {
                    AdmitOutcome::Dispatch => {
                        io.dispatcher.dispatch(&event);
                        Ok(())
                    }
                    _ => Err(SessionEnd::Resync {
                        reason: format!("refetch did not close the gap before event {found}"),
                    }),
                }
            }
        }
    }

    async fn fill_gap<H, D>(
        &mut self,
        expected: u64,
        found: u64,
        io: &mut SessionIo<'_, H, D>,
    ) -> Result<(), SessionEnd>
    where
        H: HistorySource,
        D: EventHandlers,
    {
        let mut cursor = PageCursor::new(expected, found, self.batch_size);
        while let Some((from, to)) = cursor.next_range() {
            let page = match self
                .await_buffering(io.history.fetch_range(from, to), io.live_rx, io.cancel_token)
                .await?
            {
                Ok(page) => page,
                Err(error) => {
                    return Err(SessionEnd::Resync {
                        reason: format!("gap refetch [{from}, {to}) failed: {error}"),
                    })
                }
            };
            tracing::debug!(from, to, received = page.len(), "gap refetch page downloaded");
            cursor.advance(to - from, page.len());

            for event in page {
                match self.admit(&event) {
                    AdmitOutcome::Dispatch => {
                        io.dispatcher.dispatch(&event);
                    }
                    AdmitOutcome::Duplicate { .. } => {}
                    AdmitOutcome::Gap { expected, found } => {
                        return Err(SessionEnd::Resync {
                            reason: format!(
                                "gap refetch skipped from {expected} to {found}"
                            ),
                        })
                    }
                }
            }
        }
        Ok(())
    }
}
