//! Just enough STOMP 1.2 to subscribe to one topic and read `MESSAGE` frames.

use crate::error::AppError;

pub const SUBSCRIPTION_ID: &str = "sub-0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn connect_frame(host: &str) -> String {
    format!("CONNECT\naccept-version:1.2\nhost:{host}\nheart-beat:0,0\n\n\0")
}

pub fn subscribe_frame(subscription_id: &str, destination: &str) -> String {
    format!("SUBSCRIBE\nid:{subscription_id}\ndestination:{destination}\nack:auto\n\n\0")
}

pub fn disconnect_frame() -> String {
    "DISCONNECT\n\n\0".to_string()
}

/// Parses one frame. Returns `Ok(None)` for heart-beat EOLs.
pub fn parse_frame(raw: &str) -> Result<Option<StompFrame>, AppError> {
    let trimmed = raw.trim_start_matches(['\r', '\n']);
    if trimmed.is_empty() || trimmed == "\0" {
        return Ok(None);
    }

    let (head, body) = match trimmed.find("\n\n") {
        Some(index) => (&trimmed[..index], &trimmed[index + 2..]),
        None => match trimmed.find("\r\n\r\n") {
            Some(index) => (&trimmed[..index], &trimmed[index + 4..]),
            None => {
                return Err(AppError::Protocol(
                    "stomp frame is missing the header terminator".to_string(),
                ))
            }
        },
    };

    let mut lines = head.lines();
    let command = lines
        .next()
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| AppError::Protocol("stomp frame has no command".to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let Some((key, value)) = line.split_once(':') else {
            return Err(AppError::Protocol(format!(
                "malformed stomp header line '{line}'"
            )));
        };
        headers.push((unescape_header(key), unescape_header(value)));
    }

    let body = match body.find('\0') {
        Some(end) => &body[..end],
        None => body,
    };

    Ok(Some(StompFrame {
        command,
        headers,
        body: body.to_string(),
    }))
}

fn unescape_header(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }
    let mut decoded = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            decoded.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => decoded.push('\n'),
            Some('r') => decoded.push('\r'),
            Some('c') => decoded.push(':'),
            Some('\\') => decoded.push('\\'),
            Some(other) => {
                decoded.push('\\');
                decoded.push(other);
            }
            None => decoded.push('\\'),
        }
    }
    decoded
}
