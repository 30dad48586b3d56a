//! Server-Sent Events line parser for runtime responses.
//!
//! Turns a byte stream into a `Stream<Item = SseEvent>`. Lines are split on
//! raw bytes so multi-byte characters that straddle network chunks survive.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

use crate::error::RuntimeError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, RuntimeError>> + Send {
    parse_sse_bytes(response.bytes_stream().map(|r| r.map_err(RuntimeError::from)))
}

/// Parse any byte stream as SSE.
pub fn parse_sse_bytes<S>(bytes: S) -> impl Stream<Item = Result<SseEvent, RuntimeError>> + Send
where
    S: Stream<Item = Result<Bytes, RuntimeError>> + Send + 'static,
{
    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(bytes),
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..newline_pos]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    state.apply_line(line);
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        // Stream ended. Flush a final unterminated line and event.
                        state.finished = true;
                        if !state.buffer.is_empty() {
                            let rest = std::mem::take(&mut state.buffer);
                            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
                            state.apply_line(&line);
                        }
                        return state.take_event().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

struct SseState {
    byte_stream: ByteStream,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    finished: bool,
}

impl SseState {
    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.current_event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.current_data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.current_id = Some(value.trim_start().to_string());
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}
