//! Inference backend abstraction.
//!
//! Each backend implements [`ConverseProvider`], offering a buffered
//! [`ConverseProvider::converse`] call and a streamed
//! [`ConverseProvider::converse_stream`] call that yields protocol events.
//! Backends are built once from config by [`registry::ProviderRegistry`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::warn;

use switchyard_core::error::BackendError;
use switchyard_core::protocol::{MessageAssembler, StreamEvent};
use switchyard_core::types::{Message, StopReason, TokenUsage, ToolSpec};

pub mod anthropic;
pub mod converse;
pub mod mock;
pub mod ndjson;
pub mod registry;
pub mod sse;
mod wire;

/// Single-pass stream of protocol events from one inference call.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, BackendError>> + Send>>;

/// Generation limits for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Extended-thinking budget. `None` disables reasoning output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget_tokens: Option<u32>,
}

/// A request to an inference backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ConverseInput {
    /// Backend model identifier.
    pub model_id: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    /// Place a cache marker after the system prompt.
    pub cache_system: bool,
    pub tools: Vec<ToolSpec>,
    /// Place a cache marker after the tool list.
    pub cache_tools: bool,
    pub inference: InferenceConfig,
    /// Inline guardrail configuration, passed through as-is.
    pub guardrail: Option<serde_json::Value>,
}

/// Result of a buffered inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConverseOutput {
    pub message: Message,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    pub trace: Option<serde_json::Value>,
}

/// The inference backend trait.
#[async_trait]
pub trait ConverseProvider: Send + Sync {
    /// Provider identifier from config.
    fn id(&self) -> &str;

    /// Run one inference call and return the complete message.
    async fn converse(&self, input: &ConverseInput) -> Result<ConverseOutput, BackendError>;

    /// Run one inference call and stream its events.
    async fn converse_stream(&self, input: &ConverseInput) -> Result<EventStream, BackendError>;
}

/// Map a transport failure to the backend taxonomy.
pub(crate) fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::timeout(e.to_string())
    } else if e.is_connect() {
        BackendError::unavailable(e.to_string())
    } else {
        BackendError::other(e.to_string())
    }
}

/// Drain an event stream into a buffered output.
pub async fn collect_stream(mut stream: EventStream) -> Result<ConverseOutput, BackendError> {
    let mut assembler = MessageAssembler::new();
    while let Some(event) = stream.next().await {
        if let Err(e) = assembler.apply(&event?) {
            warn!(%e, "Skipping stream event");
        }
    }
    let assembled = assembler.finish();
    let stop_reason = assembled
        .stop_reason
        .ok_or_else(|| BackendError::other("stream ended before messageStop"))?;
    Ok(ConverseOutput {
        message: assembled.message,
        stop_reason,
        usage: assembled.usage.unwrap_or_default(),
        trace: assembled.trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::error::BackendStatus;
    use switchyard_core::types::Role;

    #[tokio::test]
    async fn test_collect_stream() {
        let events = vec![
            Ok(StreamEvent::MessageStart {
                role: Role::Assistant,
            }),
            Ok(StreamEvent::text_delta(0, "Hi")),
            Ok(StreamEvent::MessageStop {
                stop_reason: StopReason::EndTurn,
            }),
        ];
        let stream: EventStream = Box::pin(futures::stream::iter(events));
        let out = collect_stream(stream).await.unwrap();
        assert_eq!(out.message.text(), "Hi");
        assert_eq!(out.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_collect_stream_without_stop_fails() {
        let events = vec![Ok(StreamEvent::text_delta(0, "Hi"))];
        let stream: EventStream = Box::pin(futures::stream::iter(events));
        let err = collect_stream(stream).await.unwrap_err();
        assert_eq!(err.status, BackendStatus::Error);
    }
}
