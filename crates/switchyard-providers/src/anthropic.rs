//! Anthropic Messages API backend.
//!
//! Streams `POST /v1/messages` over SSE and translates Anthropic's events into
//! protocol events, so the rest of the system sees the same stream shape as
//! from a Converse backend.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use switchyard_core::config::ProviderConfig;
use switchyard_core::error::{BackendError, BackendStatus};
use switchyard_core::protocol::{BlockDelta, BlockStart, ReasoningDelta, StreamEvent, ToolUseDelta};
use switchyard_core::types::{
    ContentBlock, Message, Role, StopReason, TokenUsage, ToolResultContent, ToolResultStatus,
};

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{
    ConverseInput, ConverseOutput, ConverseProvider, EventStream, collect_stream, transport_error,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: Option<&str>,
        api_key: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: id.into(),
            base_url: base_url
                .unwrap_or(ANTHROPIC_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' has no API key", config.id))?;
        Self::new(
            config.id.clone(),
            config.base_url.as_deref(),
            api_key,
            Duration::from_secs(config.timeout_secs()),
        )
    }
}

// --- Request encoding ---

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
    stream: bool,
}

fn image_media_type(format: &str) -> String {
    match format {
        "jpg" | "jpeg" => "image/jpeg".into(),
        other => format!("image/{other}"),
    }
}

fn encode_block(block: &ContentBlock) -> Option<Value> {
    let value = match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Image { format, source } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image_media_type(format),
                "data": source.to_base64(),
            }
        }),
        ContentBlock::Document {
            name,
            format,
            source,
        } => {
            let source = if format == "pdf" {
                json!({ "type": "base64", "media_type": "application/pdf", "data": source.to_base64() })
            } else {
                let bytes = source.to_bytes().unwrap_or_default();
                json!({
                    "type": "text",
                    "media_type": "text/plain",
                    "data": String::from_utf8_lossy(&bytes),
                })
            };
            json!({ "type": "document", "title": name, "source": source })
        }
        ContentBlock::Reasoning { text, signature } => {
            json!({ "type": "thinking", "thinking": text, "signature": signature })
        }
        ContentBlock::ToolUse {
            tool_use_id,
            name,
            input,
        } => json!({ "type": "tool_use", "id": tool_use_id, "name": name, "input": input }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            status,
        } => {
            let content: Vec<Value> = content
                .iter()
                .map(|c| match c {
                    ToolResultContent::Text(text) => json!({ "type": "text", "text": text }),
                    ToolResultContent::Json(value) => {
                        json!({ "type": "text", "text": value.to_string() })
                    }
                })
                .collect();
            json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": *status == ToolResultStatus::Error,
            })
        }
        ContentBlock::CachePoint => return None,
    };
    Some(value)
}

fn cache_control() -> Value {
    json!({ "type": "ephemeral" })
}

/// Encode a message. Cache markers become `cache_control` on the block
/// that precedes them.
fn encode_message(message: &Message) -> Value {
    let mut content: Vec<Value> = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::CachePoint => {
                if let Some(last) = content.last_mut() {
                    last["cache_control"] = cache_control();
                }
            }
            other => content.extend(encode_block(other)),
        }
    }
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    json!({ "role": role, "content": content })
}

fn build_request(input: &ConverseInput) -> MessagesRequest {
    let mut system = Vec::new();
    if let Some(prompt) = &input.system {
        let mut block = json!({ "type": "text", "text": prompt });
        if input.cache_system {
            block["cache_control"] = cache_control();
        }
        system.push(block);
    }

    let mut tools: Vec<Value> = input
        .tools
        .iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.input_schema }))
        .collect();
    if input.cache_tools {
        if let Some(last) = tools.last_mut() {
            last["cache_control"] = cache_control();
        }
    }

    let (temperature, thinking) = match input.inference.thinking_budget_tokens {
        Some(budget) => (None, Some(json!({ "type": "enabled", "budget_tokens": budget }))),
        None => (input.inference.temperature, None),
    };

    MessagesRequest {
        model: input.model_id.clone(),
        max_tokens: input.inference.max_tokens,
        messages: input.messages.iter().map(encode_message).collect(),
        system,
        tools,
        temperature,
        thinking,
        stream: true,
    }
}

// --- Stream translation ---

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    RedactedThinking {},
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeltaBody {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: DeltaBody,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Unknown,
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "refusal" => StopReason::ContentFiltered,
        _ => StopReason::EndTurn,
    }
}

fn map_error(error: ErrorBody) -> BackendError {
    let status = match error.kind.as_str() {
        "overloaded_error" => BackendStatus::Unavailable,
        "rate_limit_error" => BackendStatus::RateLimited,
        "timeout_error" => BackendStatus::Timeout,
        _ => BackendStatus::Error,
    };
    BackendError::new(status, format!("{}: {}", error.kind, error.message))
}

/// Stateful mapping from Anthropic SSE events to protocol events.
#[derive(Debug, Default)]
struct Translator {
    usage: TokenUsage,
}

impl Translator {
    fn translate(&mut self, sse: &SseEvent) -> Result<Vec<StreamEvent>, BackendError> {
        let event: AnthropicEvent = match serde_json::from_str(&sse.data) {
            Ok(e) => e,
            Err(e) => {
                trace!(%e, data = %sse.data, "Failed to parse Anthropic event");
                return Ok(Vec::new());
            }
        };

        let events = match event {
            AnthropicEvent::MessageStart { message } => {
                let u = message.usage;
                self.usage.input_tokens = u.input_tokens.unwrap_or(0);
                self.usage.output_tokens = u.output_tokens.unwrap_or(0);
                self.usage.cache_read_input_tokens = u.cache_read_input_tokens.unwrap_or(0);
                self.usage.cache_write_input_tokens = u.cache_creation_input_tokens.unwrap_or(0);
                vec![StreamEvent::MessageStart {
                    role: Role::Assistant,
                }]
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let (start, initial) = match content_block {
                    StartBlock::Text { text } => {
                        (BlockStart::Text {}, Some(BlockDelta::Text(text)))
                    }
                    StartBlock::Thinking { thinking } => (
                        BlockStart::ReasoningContent {},
                        Some(BlockDelta::ReasoningContent(ReasoningDelta {
                            text: Some(thinking),
                            signature: None,
                        })),
                    ),
                    StartBlock::RedactedThinking {} => (BlockStart::ReasoningContent {}, None),
                    StartBlock::ToolUse { id, name } => (
                        BlockStart::ToolUse {
                            tool_use_id: id,
                            name,
                        },
                        None,
                    ),
                    StartBlock::Other => (BlockStart::Text {}, None),
                };
                let mut out = vec![StreamEvent::ContentBlockStart {
                    start,
                    content_block_index: index,
                }];
                let has_content = match &initial {
                    Some(BlockDelta::Text(t)) => !t.is_empty(),
                    Some(BlockDelta::ReasoningContent(r)) => {
                        r.text.as_deref().is_some_and(|t| !t.is_empty())
                    }
                    _ => false,
                };
                if let Some(delta) = initial.filter(|_| has_content) {
                    out.push(StreamEvent::ContentBlockDelta {
                        delta,
                        content_block_index: index,
                    });
                }
                out
            }
            AnthropicEvent::ContentBlockDelta { index, delta } => {
                let delta = match delta {
                    DeltaBody::TextDelta { text } => BlockDelta::Text(text),
                    DeltaBody::ThinkingDelta { thinking } => {
                        BlockDelta::ReasoningContent(ReasoningDelta {
                            text: Some(thinking),
                            signature: None,
                        })
                    }
                    DeltaBody::SignatureDelta { signature } => {
                        BlockDelta::ReasoningContent(ReasoningDelta {
                            text: None,
                            signature: Some(signature),
                        })
                    }
                    DeltaBody::InputJsonDelta { partial_json } => {
                        BlockDelta::ToolUse(ToolUseDelta {
                            input: partial_json,
                        })
                    }
                    DeltaBody::Other => return Ok(Vec::new()),
                };
                vec![StreamEvent::ContentBlockDelta {
                    delta,
                    content_block_index: index,
                }]
            }
            AnthropicEvent::ContentBlockStop { index } => vec![StreamEvent::ContentBlockStop {
                content_block_index: index,
            }],
            AnthropicEvent::MessageDelta { delta, usage } => {
                if let Some(output) = usage.and_then(|u| u.output_tokens) {
                    self.usage.output_tokens = output;
                }
                match delta.stop_reason {
                    Some(reason) => vec![StreamEvent::MessageStop {
                        stop_reason: map_stop_reason(&reason),
                    }],
                    None => Vec::new(),
                }
            }
            AnthropicEvent::MessageStop => vec![StreamEvent::Metadata {
                usage: self.usage,
                metrics: None,
                trace: None,
            }],
            AnthropicEvent::Error { error } => return Err(map_error(error)),
            AnthropicEvent::Unknown => Vec::new(),
        };
        Ok(events)
    }
}

type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent, BackendError>> + Send>>;

struct TranslateState {
    sse: SseStream,
    translator: Translator,
    pending: VecDeque<StreamEvent>,
    failed: bool,
}

fn translate_stream(sse: SseStream) -> EventStream {
    let stream = futures::stream::unfold(
        TranslateState {
            sse,
            translator: Translator::default(),
            pending: VecDeque::new(),
            failed: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.failed {
                    return None;
                }
                match state.sse.next().await {
                    Some(Ok(sse_event)) => match state.translator.translate(&sse_event) {
                        Ok(events) => state.pending.extend(events),
                        Err(e) => {
                            state.failed = true;
                            return Some((Err(e), state));
                        }
                    },
                    Some(Err(e)) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                    None => return None,
                }
            }
        },
    );
    Box::pin(stream)
}

#[async_trait]
impl ConverseProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn converse(&self, input: &ConverseInput) -> Result<ConverseOutput, BackendError> {
        collect_stream(self.converse_stream(input).await?).await
    }

    async fn converse_stream(&self, input: &ConverseInput) -> Result<EventStream, BackendError> {
        if input.guardrail.is_some() {
            debug!(provider = %self.id, "Inline guardrail config is not supported by this backend; ignoring");
        }
        let body = build_request(input);
        debug!(provider = %self.id, model = %body.model, "Streaming Anthropic Messages API");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            // 529 is Anthropic's "overloaded" status.
            if status == 529 {
                return Err(BackendError::unavailable(format!("HTTP 529: {body}")));
            }
            return Err(BackendError::from_http(status, &body));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error));
        Ok(translate_stream(Box::pin(parse_sse_stream(bytes))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceConfig;
    use switchyard_core::protocol::assemble;
    use switchyard_core::types::ToolSpec;

    fn sse(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.into(),
        }
    }

    #[test]
    fn test_translate_tool_turn() {
        let raw = [
            r#"{"type":"message_start","message":{"id":"m1","usage":{"input_tokens":120,"output_tokens":1,"cache_read_input_tokens":100,"cache_creation_input_tokens":null}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Looking"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"search","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let mut translator = Translator::default();
        let mut events = Vec::new();
        for line in raw {
            events.extend(translator.translate(&sse(line)).unwrap());
        }

        let out = assemble(events);
        assert_eq!(out.message.text(), "Looking");
        let (id, name, input) = out.message.tool_uses().next().unwrap();
        assert_eq!((id, name), ("toolu_1", "search"));
        assert_eq!(input, &json!({"q": "rust"}));
        assert_eq!(out.stop_reason, Some(StopReason::ToolUse));
        let usage = out.usage.unwrap();
        assert_eq!(usage.input_tokens, 120);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.cache_read_input_tokens, 100);
        assert_eq!(usage.cache_write_input_tokens, 0);
    }

    #[test]
    fn test_translate_error_event() {
        let mut translator = Translator::default();
        let err = translator
            .translate(&sse(
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            ))
            .unwrap_err();
        assert_eq!(err.status, BackendStatus::Unavailable);
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn"), StopReason::EndTurn);
        assert_eq!(map_stop_reason("max_tokens"), StopReason::MaxTokens);
        assert_eq!(map_stop_reason("refusal"), StopReason::ContentFiltered);
    }

    #[test]
    fn test_cache_point_becomes_cache_control() {
        let input = ConverseInput {
            model_id: "claude-sonnet-4".into(),
            messages: vec![Message {
                role: Role::User,
                content: vec![ContentBlock::text("long context"), ContentBlock::CachePoint],
            }],
            system: Some("sys".into()),
            cache_system: true,
            tools: vec![ToolSpec {
                name: "notes".into(),
                description: "Notes".into(),
                input_schema: json!({"type": "object"}),
            }],
            cache_tools: true,
            inference: InferenceConfig {
                max_tokens: 100,
                temperature: Some(0.5),
                thinking_budget_tokens: None,
            },
            guardrail: None,
        };
        let body = serde_json::to_value(build_request(&input)).unwrap();
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["tools"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_provider_creation() {
        let provider =
            AnthropicProvider::new("claude", None, "k".into(), Duration::from_secs(1)).unwrap();
        assert_eq!(provider.id(), "claude");
        assert_eq!(provider.base_url, ANTHROPIC_BASE_URL);
    }
}
