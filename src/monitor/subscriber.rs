use crate::config::{MonitorConfig, PushTransport};
use crate::error::AppError;
use crate::monitor::backend::{connect_event_stream, EventWsStream};
use crate::monitor::stomp::{self, SUBSCRIPTION_ID};
use crate::monitor::types::{parse_event_payload, Event};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const STOMP_HANDSHAKE_FRAME_LIMIT: usize = 16;
const PUSH_CLOSE_TIMEOUT_MS: u64 = 1_000;

/// What the push side reports to the synchronizer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveSignal {
    /// The topic subscription is active. `reconnect` is set when an earlier
    /// connection already existed, which means every piece of session state is stale.
    Connected { reconnect: bool },
    Event(Event),
    Disconnected { reason: String },
}

pub type LiveSender = mpsc::Sender<LiveSignal>;
pub type LiveReceiver = mpsc::Receiver<LiveSignal>;

pub fn live_channel(capacity: usize) -> (LiveSender, LiveReceiver) {
    mpsc::channel(capacity)
}

#[derive(Debug, Default)]
pub struct SubscriberTelemetry {
    received: AtomicU64,
    malformed: AtomicU64,
    connections: AtomicU64,
}

impl SubscriberTelemetry {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamDirective {
    Continue,
    Reconnect,
    Closed,
}

/// Keeps the push channel open until cancelled, reconnecting after a fixed delay.
pub async fn run_live_subscriber(
    config: MonitorConfig,
    live_tx: LiveSender,
    telemetry: Arc<SubscriberTelemetry>,
    cancel_token: CancellationToken,
) {
    let mut established_before = false;

    while !cancel_token.is_cancelled() {
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            connected = connect_event_stream(&config) => connected,
        };

        match connected {
            Ok(mut websocket_stream) => {
                let subscribed = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    subscribed = open_subscription(&mut websocket_stream, &config) => subscribed,
                };
                match subscribed {
                    Ok(()) => {
                        telemetry.connections.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            reconnect = established_before,
                            topic = %config.topic,
                            "push channel subscribed"
                        );
                        let signal = LiveSignal::Connected {
                            reconnect: established_before,
                        };
                        established_before = true;
                        if !forward(&live_tx, signal, &cancel_token).await {
                            close_push_channel(&mut websocket_stream, config.transport).await;
                            return;
                        }

                        let reason = loop {
                            let frame = tokio::select! {
                                _ = cancel_token.cancelled() => {
                                    close_push_channel(&mut websocket_stream, config.transport).await;
                                    return;
                                }
                                next_message = websocket_stream.next() => next_message,
                            };

                            let Some(frame_result) = frame else {
                                break "push channel ended".to_string();
                            };

                            match frame_result {
                                Ok(message) => {
                                    match handle_message(
                                        message,
                                        &config,
                                        &live_tx,
                                        &telemetry,
                                        &cancel_token,
                                    )
                                    .await
                                    {
                                        StreamDirective::Continue => {}
                                        StreamDirective::Reconnect => {
                                            break "push channel closed by backend".to_string();
                                        }
                                        StreamDirective::Closed => {
                                            close_push_channel(
                                                &mut websocket_stream,
                                                config.transport,
                                            )
                                            .await;
                                            return;
                                        }
                                    }
                                }
                                Err(error) => {
                                    tracing::warn!(%error, "push channel frame error");
                                    break format!("websocket frame error: {error}");
                                }
                            }
                        };

                        if !forward(&live_tx, LiveSignal::Disconnected { reason }, &cancel_token).await
                        {
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "push channel subscription failed");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "push channel connect failed");
            }
        }

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

/// Hands one signal to the synchronizer. `false` once cancelled or once the receiver is gone.
async fn forward(
    live_tx: &LiveSender,
    signal: LiveSignal,
    cancel_token: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => false,
        sent = live_tx.send(signal) => sent.is_ok(),
    }
}

async fn close_push_channel(websocket_stream: &mut EventWsStream, transport: PushTransport) {
    let closing = async {
        if transport == PushTransport::Stomp {
            let _ = websocket_stream
                .send(Message::Text(stomp::disconnect_frame()))
                .await;
        }
        let _ = websocket_stream.close(None).await;
    };
    if tokio::time::timeout(Duration::from_millis(PUSH_CLOSE_TIMEOUT_MS), closing)
        .await
        .is_err()
    {
        tracing::debug!("push channel close timed out");
    }
}

async fn open_subscription(
    websocket_stream: &mut EventWsStream,
    config: &MonitorConfig,
) -> Result<(), AppError> {
    if config.transport == PushTransport::Raw {
        return Ok(());
    }

    let host = config.base_url.host_str().unwrap_or("localhost");
    websocket_stream
        .send(Message::Text(stomp::connect_frame(host)))
        .await?;

    let mut frames_seen = 0_usize;
    loop {
        let Some(frame_result) = websocket_stream.next().await else {
            return Err(AppError::Protocol(
                "push channel closed during stomp handshake".to_string(),
            ));
        };
        let raw = match frame_result? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|error| AppError::Protocol(format!("non utf-8 stomp frame: {error}")))?,
            Message::Close(_) => {
                return Err(AppError::Protocol(
                    "push channel closed during stomp handshake".to_string(),
                ))
            }
            _ => continue,
        };

        frames_seen += 1;
        if frames_seen > STOMP_HANDSHAKE_FRAME_LIMIT {
            return Err(AppError::Protocol(
                "stomp broker never acknowledged CONNECT".to_string(),
            ));
        }

        let Some(frame) = stomp::parse_frame(&raw)? else {
            continue;
        };
        match frame.command.as_str() {
            "CONNECTED" => break,
            "ERROR" => {
                return Err(AppError::Protocol(format!(
                    "stomp broker rejected CONNECT: {}",
                    frame.header("message").unwrap_or("no message")
                )))
            }
            other => {
                tracing::debug!(command = other, "ignoring frame before CONNECTED");
            }
        }
    }

    websocket_stream
        .send(Message::Text(stomp::subscribe_frame(
            SUBSCRIPTION_ID,
            &config.topic,
        )))
        .await?;
    Ok(())
}

async fn handle_message(
    message: Message,
    config: &MonitorConfig,
    live_tx: &LiveSender,
    telemetry: &SubscriberTelemetry,
    cancel_token: &CancellationToken,
) -> StreamDirective {
    let mut payload = match message {
        Message::Text(text_payload) => text_payload.into_bytes(),
        Message::Binary(binary_payload) => binary_payload,
        Message::Close(_) => return StreamDirective::Reconnect,
        _ => return StreamDirective::Continue,
    };

    if config.transport == PushTransport::Stomp {
        match unwrap_stomp_body(&payload) {
            StompPayload::Body(body) => payload = body,
            StompPayload::Skip => return StreamDirective::Continue,
            StompPayload::BrokerError(reason) => {
                tracing::warn!(reason = %reason, "stomp broker reported an error");
                return StreamDirective::Reconnect;
            }
            StompPayload::Malformed(reason) => {
                telemetry.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(reason = %reason, "dropping malformed stomp frame");
                return StreamDirective::Continue;
            }
        }
    }

    let Some(event) = decode_live_payload(&mut payload, telemetry) else {
        return StreamDirective::Continue;
    };

    if !forward(live_tx, LiveSignal::Event(event), cancel_token).await {
        return StreamDirective::Closed;
    }
    StreamDirective::Continue
}

#[derive(Debug, PartialEq)]
enum StompPayload {
    Body(Vec<u8>),
    Skip,
    BrokerError(String),
    Malformed(String),
}

fn unwrap_stomp_body(raw: &[u8]) -> StompPayload {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(error) => return StompPayload::Malformed(format!("non utf-8 stomp frame: {error}")),
    };
    match stomp::parse_frame(text) {
        Ok(Some(frame)) => match frame.command.as_str() {
            "MESSAGE" => StompPayload::Body(frame.body.into_bytes()),
            "ERROR" => StompPayload::BrokerError(
                frame
                    .header("message")
                    .map(str::to_string)
                    .unwrap_or(frame.body),
            ),
            _ => StompPayload::Skip,
        },
        Ok(None) => StompPayload::Skip,
        Err(error) => StompPayload::Malformed(error.to_string()),
    }
}

/// Malformed payloads are counted and dropped; the stream keeps going.
fn decode_live_payload(payload: &mut [u8], telemetry: &SubscriberTelemetry) -> Option<Event> {
    match parse_event_payload(payload) {
        Ok(event) => {
            telemetry.received.fetch_add(1, Ordering::Relaxed);
            Some(event)
        }
        Err(error) => {
            telemetry.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%error, "dropping malformed event payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorArgs;

    fn config(transport: PushTransport) -> MonitorConfig {
        MonitorArgs {
            transport: Some(transport),
            ..MonitorArgs::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    fn ping_json(id: u64) -> String {
        format!(r#"{{"type":"PingEvent","eventId":{id},"workerName":"main","message":"hi"}}"#)
    }

    #[tokio::test]
    async fn forwards_raw_json_events() {
        let (tx, mut rx) = live_channel(16);
        let telemetry = SubscriberTelemetry::default();

        let directive = handle_message(
            Message::Text(ping_json(4)),
            &config(PushTransport::Raw),
            &tx,
            &telemetry,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(directive, StreamDirective::Continue);
        let Some(LiveSignal::Event(event)) = rx.recv().await else {
            panic!("expected forwarded event");
        };
        assert_eq!(event.event_id, 4);
        assert_eq!(telemetry.received(), 1);
    }

    #[tokio::test]
    async fn unwraps_stomp_message_frames() {
        let (tx, mut rx) = live_channel(16);
        let telemetry = SubscriberTelemetry::default();
        let frame = format!(
            "MESSAGE\ndestination:/topic/events\nsubscription:sub-0\n\n{}\0",
            ping_json(7)
        );

        let directive = handle_message(
            Message::Text(frame),
            &config(PushTransport::Stomp),
            &tx,
            &telemetry,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(directive, StreamDirective::Continue);
        let Some(LiveSignal::Event(event)) = rx.recv().await else {
            panic!("expected forwarded event");
        };
        assert_eq!(event.event_id, 7);
    }

    #[tokio::test]
    async fn drops_malformed_payload_and_keeps_streaming() {
        let (tx, mut rx) = live_channel(16);
        let telemetry = SubscriberTelemetry::default();
        let raw = config(PushTransport::Raw);
        let token = CancellationToken::new();

        let directive =
            handle_message(Message::Text("{broken".to_string()), &raw, &tx, &telemetry, &token)
            .await;
        assert_eq!(directive, StreamDirective::Continue);

        let directive =
            handle_message(Message::Text(ping_json(0)), &raw, &tx, &telemetry, &token).await;
        assert_eq!(directive, StreamDirective::Continue);

        assert_eq!(telemetry.malformed(), 1);
        let Some(LiveSignal::Event(event)) = rx.recv().await else {
            panic!("expected the valid event after the malformed one");
        };
        assert_eq!(event.event_id, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broker_error_frame_requests_reconnect() {
        let (tx, _rx) = live_channel(16);
        let telemetry = SubscriberTelemetry::default();

        let directive = handle_message(
            Message::Text("ERROR\nmessage:session expired\n\n\0".to_string()),
            &config(PushTransport::Stomp),
            &tx,
            &telemetry,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(directive, StreamDirective::Reconnect);
    }

    #[tokio::test]
    async fn close_frame_requests_reconnect() {
        let (tx, _rx) = live_channel(16);
        let telemetry = SubscriberTelemetry::default();
        let directive = handle_message(
            Message::Close(None),
            &config(PushTransport::Raw),
            &tx,
            &telemetry,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(directive, StreamDirective::Reconnect);
    }

    #[tokio::test]
    async fn reports_closed_when_synchronizer_is_gone() {
        let (tx, rx) = live_channel(16);
        drop(rx);
        let telemetry = SubscriberTelemetry::default();

        let directive = handle_message(
            Message::Text(ping_json(1)),
            &config(PushTransport::Raw),
            &tx,
            &telemetry,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(directive, StreamDirective::Closed);
    }

    async fn local_push_server() -> (tokio::net::TcpListener, MonitorArgs) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("listener has an address");
        let args = MonitorArgs {
            base_url: Some(format!("http://{address}/")),
            reconnect_delay_ms: Some(100),
            ..MonitorArgs::default()
        };
        (listener, args)
    }

    #[tokio::test]
    async fn cancel_completes_while_live_channel_is_full() {
        let (listener, args) = local_push_server().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("client should connect");
            let mut websocket = tokio_tungstenite::accept_async(socket)
                .await
                .expect("websocket handshake should succeed");
            for id in 0..64 {
                if websocket.send(Message::Text(ping_json(id))).await.is_err() {
                    return;
                }
            }
            while let Some(Ok(_)) = websocket.next().await {}
        });

        let config = MonitorArgs {
            transport: Some(PushTransport::Raw),
            ..args
        }
        .normalize()
        .expect("test config should be valid");
        let (live_tx, mut live_rx) = live_channel(1);
        let cancel_token = CancellationToken::new();
        let subscriber = tokio::spawn(run_live_subscriber(
            config,
            live_tx,
            Arc::new(SubscriberTelemetry::default()),
            cancel_token.clone(),
        ));

        let first = tokio::time::timeout(Duration::from_secs(5), live_rx.recv())
            .await
            .expect("subscriber should connect");
        assert_eq!(first, Some(LiveSignal::Connected { reconnect: false }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), subscriber)
            .await
            .expect("subscriber should stop while its channel is full")
            .expect("subscriber task should not panic");
        server.abort();
    }

    #[tokio::test]
    async fn cancel_sends_stomp_disconnect_before_closing() {
        let (listener, args) = local_push_server().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("client should connect");
            let mut websocket = tokio_tungstenite::accept_async(socket)
                .await
                .expect("websocket handshake should succeed");
            let mut received = Vec::new();
            while let Some(Ok(message)) = websocket.next().await {
                match message {
                    Message::Text(text) => {
                        if text.starts_with("CONNECT\n") {
                            let _ = websocket
                                .send(Message::Text("CONNECTED\nversion:1.2\n\n\0".to_string()))
                                .await;
                        }
                        received.push(text);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let config = MonitorArgs {
            transport: Some(PushTransport::Stomp),
            ..args
        }
        .normalize()
        .expect("test config should be valid");
        let (live_tx, mut live_rx) = live_channel(16);
        let cancel_token = CancellationToken::new();
        let subscriber = tokio::spawn(run_live_subscriber(
            config,
            live_tx,
            Arc::new(SubscriberTelemetry::default()),
            cancel_token.clone(),
        ));

        let first = tokio::time::timeout(Duration::from_secs(5), live_rx.recv())
            .await
            .expect("subscriber should connect");
        assert_eq!(first, Some(LiveSignal::Connected { reconnect: false }));

        cancel_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), subscriber)
            .await
            .expect("subscriber should stop after cancel")
            .expect("subscriber task should not panic");

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should see the close")
            .expect("server task should not panic");
        let commands: Vec<&str> = received
            .iter()
            .filter_map(|frame| frame.lines().next())
            .collect();
        assert_eq!(commands, vec!["CONNECT", "SUBSCRIBE", "DISCONNECT"]);
    }

    #[test]
    fn stomp_receipts_are_skipped() {
        assert_eq!(
            unwrap_stomp_body(b"RECEIPT\nreceipt-id:1\n\n\0"),
            StompPayload::Skip
        );
    }
}
