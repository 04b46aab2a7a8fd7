//! Minimal STOMP frame codec for the notification channel
//!
//! The backend speaks a small STOMP 1.1/1.2 subset over websocket text
//! messages. A frame is a command line, header lines (`name:value`), a
//! blank line, an optional JSON body, and a NUL terminator. A text message
//! consisting of a single newline is a server heartbeat, not a frame.

use serde_json::Value;

use crate::errors::{Error, Result};

/// One outgoing or raw incoming STOMP frame. Header order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Frame {
    pub fn new(command: &str, headers: Vec<(String, String)>, body: Option<Value>) -> Self {
        Self {
            command: command.to_string(),
            headers,
            body,
        }
    }

    /// First header with the given name, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to the websocket text representation.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        if let Some(body) = &self.body {
            out.push_str(&body.to_string());
        }
        out.push('\0');
        out
    }

    /// Parse a websocket text message.
    ///
    /// Returns `Ok(None)` for the heartbeat sentinel (a lone newline). An
    /// empty message is a protocol violation by the server.
    pub fn decode(text: &str) -> Result<Option<Frame>> {
        if text.is_empty() {
            return Err(Error::Parse("empty stomp message".to_string()));
        }
        if text == "\n" || text == "\r\n" {
            return Ok(None);
        }

        let mut rest = text;
        let command = take_line(&mut rest).to_string();

        let mut headers = Vec::new();
        loop {
            let line = take_line(&mut rest);
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                Error::Parse(format!("malformed stomp header line: {:?}", line))
            })?;
            headers.push((name.to_string(), value.to_string()));
        }

        let raw_body = rest.trim_end_matches('\0').trim();
        let body = if raw_body.is_empty() {
            None
        } else {
            Some(serde_json::from_str(raw_body).map_err(|e| {
                Error::Parse(format!("stomp body is not valid JSON: {}", e))
            })?)
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

/// Consume up to the next newline (exclusive), tolerating `\r\n`.
fn take_line<'a>(rest: &mut &'a str) -> &'a str {
    let line = match rest.find('\n') {
        Some(idx) => {
            let line = &rest[..idx];
            *rest = &rest[idx + 1..];
            line
        }
        None => {
            let line = *rest;
            *rest = "";
            line
        }
    };
    line.strip_suffix('\r').unwrap_or(line)
}

/// A server frame narrowed to the commands the backend actually sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Connected {
        version: String,
        heart_beat: Option<(u32, u32)>,
        session: Option<String>,
        server: Option<String>,
    },
    Message {
        destination: String,
        message_id: String,
        subscription: String,
        ack: Option<String>,
        content_type: Option<String>,
        content_length: Option<usize>,
        body: Option<Value>,
    },
    Receipt {
        receipt_id: String,
    },
    Error {
        message: Option<String>,
        content_type: Option<String>,
        content_length: Option<usize>,
        body: Option<Value>,
    },
}

/// Classify a raw frame by its STOMP command. An unknown command is a
/// protocol violation; a known command missing a mandatory header is a
/// parse failure.
pub fn decode_server_frame(frame: Frame) -> Result<ServerFrame> {
    fn required(frame: &Frame, name: &str) -> Result<String> {
        frame
            .header(name)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Parse(format!(
                    "{} frame is missing the {} header",
                    frame.command, name
                ))
            })
    }

    fn optional(frame: &Frame, name: &str) -> Option<String> {
        frame.header(name).map(str::to_string)
    }

    match frame.command.as_str() {
        "CONNECTED" => {
            let heart_beat = match frame.header("heart-beat") {
                Some(value) => Some(parse_heart_beat(value)?),
                None => None,
            };
            Ok(ServerFrame::Connected {
                version: required(&frame, "version")?,
                heart_beat,
                session: optional(&frame, "session"),
                server: optional(&frame, "server"),
            })
        }
        "MESSAGE" => Ok(ServerFrame::Message {
            destination: required(&frame, "destination")?,
            message_id: required(&frame, "message-id")?,
            subscription: required(&frame, "subscription")?,
            ack: optional(&frame, "ack"),
            content_type: optional(&frame, "content-type"),
            content_length: parse_content_length(&frame)?,
            body: frame.body,
        }),
        "RECEIPT" => Ok(ServerFrame::Receipt {
            receipt_id: required(&frame, "receipt-id")?,
        }),
        "ERROR" => Ok(ServerFrame::Error {
            message: optional(&frame, "message"),
            content_type: optional(&frame, "content-type"),
            content_length: parse_content_length(&frame)?,
            body: frame.body,
        }),
        other => Err(Error::Protocol(format!(
            "unexpected stomp command: {}",
            other
        ))),
    }
}

fn parse_content_length(frame: &Frame) -> Result<Option<usize>> {
    match frame.header("content-length") {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Parse(format!("malformed content-length header: {:?}", value))),
    }
}

fn parse_heart_beat(value: &str) -> Result<(u32, u32)> {
    let (sx, sy) = value
        .split_once(',')
        .ok_or_else(|| Error::Parse(format!("malformed heart-beat header: {:?}", value)))?;
    let x = sx
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("malformed heart-beat header: {:?}", value)))?;
    let y = sy
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("malformed heart-beat header: {:?}", value)))?;
    Ok((x, y))
}
