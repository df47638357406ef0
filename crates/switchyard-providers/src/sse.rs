//! Generic SSE (Server-Sent Events) parser.
//!
//! Converts a response body into a `Stream<Item = SseEvent>`.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

use switchyard_core::error::BackendError;
use switchyard_core::protocol::LineBuffer;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a byte stream as SSE events.
pub fn parse_sse_stream<S>(bytes: S) -> impl Stream<Item = Result<SseEvent, BackendError>> + Send
where
    S: Stream<Item = Result<Bytes, BackendError>> + Send + 'static,
{
    futures::stream::unfold(
        SseState {
            bytes: Box::pin(bytes),
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            current_event: None,
            current_data: Vec::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }
                    if line.starts_with(':') {
                        continue;
                    }
                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    // Ignore id/retry and unknown fields
                    continue;
                }

                if state.finished {
                    return state.dispatch().map(|event| (Ok(event), state));
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.pending.extend(state.lines.push(&chunk)),
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.clear();
                        state.current_data.clear();
                        return Some((Err(e), state));
                    }
                    None => {
                        state.finished = true;
                        state.pending.extend(state.lines.finish());
                    }
                }
            }
        },
    )
}

struct SseState {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>,
    lines: LineBuffer,
    pending: VecDeque<String>,
    current_event: Option<String>,
    current_data: Vec<String>,
    finished: bool,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let data = self.current_data.join("\n");
        self.current_data.clear();
        Some(SseEvent {
            event: self.current_event.take(),
            data,
        })
    }
}
