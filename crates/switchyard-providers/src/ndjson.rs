//! NDJSON event stream reader.
//!
//! Converts a response body into a stream of protocol events. Malformed lines
//! are logged and skipped; a transport error ends the stream.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

use switchyard_core::error::BackendError;
use switchyard_core::protocol::{LineBuffer, decode_line};

use crate::EventStream;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

struct NdjsonState {
    bytes: ByteStream,
    lines: LineBuffer,
    pending: VecDeque<String>,
    finished: bool,
}

/// Parse a byte stream as newline-delimited protocol events.
pub fn parse_ndjson_stream<S>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, BackendError>> + Send + 'static,
{
    let stream = futures::stream::unfold(
        NdjsonState {
            bytes: Box::pin(bytes),
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    match decode_line(&line) {
                        Some(event) => return Some((Ok(event), state)),
                        None => continue,
                    }
                }

                if state.finished {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.pending.extend(state.lines.push(&chunk)),
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                    None => {
                        state.finished = true;
                        state.pending.extend(state.lines.finish());
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::protocol::StreamEvent;
    use switchyard_core::types::StopReason;

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, BackendError>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let body = chunks(&[
            "{\"messageStart\":{\"role\":\"assis",
            "tant\"}}\n{\"contentBlockDelta\":{\"delta\":{\"text\":\"Hi\"},\"contentBlockIndex\":0}}\n",
            "{\"messageStop\":{\"stopReason\":\"end_turn\"}}",
        ]);
        let events: Vec<_> = parse_ndjson_stream(futures::stream::iter(body))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            StreamEvent::MessageStop {
                stop_reason: StopReason::EndTurn
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_line_skipped() {
        let body = chunks(&["garbage\n{\"messageStop\":{\"stopReason\":\"end_turn\"}}\n"]);
        let events: Vec<_> = parse_ndjson_stream(futures::stream::iter(body))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let body = vec![
            Ok(Bytes::from("{\"messageStart\":{\"role\":\"assistant\"}}\n")),
            Err(BackendError::unavailable("connection reset")),
            Ok(Bytes::from("{\"messageStop\":{\"stopReason\":\"end_turn\"}}\n")),
        ];
        let events: Vec<_> = parse_ndjson_stream(futures::stream::iter(body))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());
    }
}
