use crate::config::MonitorConfig;
use crate::error::AppError;
use crate::monitor::types::Event;
use reqwest::{Client, StatusCode};
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type EventWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pull side of the synchronization: the latest known event and half-open id ranges.
pub trait HistorySource {
    /// The most recently emitted event, or `None` when the backend has not emitted any.
    fn last_event(&self) -> impl Future<Output = Result<Option<Event>, AppError>>;

    /// Events with `from <= eventId < to`, in order. A short page means the range ran out.
    fn fetch_range(&self, from: u64, to: u64) -> impl Future<Output = Result<Vec<Event>, AppError>>;
}

#[derive(Debug, Clone)]
pub struct HttpHistory {
    client: Client,
    base_url: Url,
}

impl HttpHistory {
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

impl HistorySource for HttpHistory {
    async fn last_event(&self) -> Result<Option<Event>, AppError> {
        let endpoint = last_event_endpoint(&self.base_url)?;
        let response = self.client.get(endpoint).send().await?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT
        ) {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let mut owned_body = body.to_vec();
        let event: Option<Event> = simd_json::serde::from_slice(owned_body.as_mut_slice())?;
        Ok(event)
    }

    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<Event>, AppError> {
        if to < from {
            return Err(AppError::InvalidArgument(format!(
                "history range end {to} precedes start {from}"
            )));
        }
        let endpoint = events_endpoint(&self.base_url, from, to)?;
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| AppError::HistoryUnavailable {
                from,
                to,
                reason: error.to_string(),
            })?;
        let payload = response.json::<Vec<Event>>().await?;
        Ok(payload)
    }
}

fn last_event_endpoint(base_url: &Url) -> Result<Url, AppError> {
    Ok(base_url.join("lastevent")?)
}

fn events_endpoint(base_url: &Url, from: u64, to: u64) -> Result<Url, AppError> {
    let mut endpoint = base_url.join("events")?;
    endpoint
        .query_pairs_mut()
        .append_pair("from", &from.to_string())
        .append_pair("to", &to.to_string());
    Ok(endpoint)
}

pub fn websocket_endpoint(base_url: &Url, websocket_path: &str) -> Result<Url, AppError> {
    let mut endpoint = base_url.join(websocket_path)?;
    let scheme = match base_url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|_| AppError::InvalidArgument(format!("cannot derive {scheme} url")))?;
    Ok(endpoint)
}

pub async fn connect_event_stream(config: &MonitorConfig) -> Result<EventWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let request = websocket_endpoint(&config.base_url, &config.websocket_path)?;
    let (stream, _) = connect_async_with_config(request.as_str(), Some(ws_config), true).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://localhost:8080/").expect("static url should parse")
    }

    #[test]
    fn last_event_endpoint_is_relative_to_base() {
        let nested = Url::parse("http://lab.example/api/").expect("static url should parse");
        let endpoint = last_event_endpoint(&nested).expect("endpoint should build");
        assert_eq!(endpoint.as_str(), "http://lab.example/api/lastevent");
    }

    #[test]
    fn events_endpoint_carries_half_open_bounds() {
        let endpoint = events_endpoint(&base(), 1_000, 2_000).expect("endpoint should build");
        assert_eq!(endpoint.path(), "/events");
        assert_eq!(endpoint.query(), Some("from=1000&to=2000"));
    }

    #[test]
    fn websocket_endpoint_switches_scheme() {
        let endpoint = websocket_endpoint(&base(), "/websocket").expect("endpoint should build");
        assert_eq!(endpoint.as_str(), "ws://localhost:8080/websocket");

        let secure = Url::parse("https://lab.example/").expect("static url should parse");
        let endpoint = websocket_endpoint(&secure, "/websocket").expect("endpoint should build");
        assert_eq!(endpoint.as_str(), "wss://lab.example/websocket");
    }
}
