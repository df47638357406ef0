//! Streaming event protocol and message assembly.
//!
//! A model turn is streamed as newline-delimited JSON, one [`StreamEvent`] per
//! line. [`MessageAssembler`] folds the events back into a [`Message`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::partial_json;
use crate::types::{ContentBlock, Message, Role, StopReason, TokenUsage};

/// Variant announced by a `contentBlockStart` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BlockStart {
    ToolUse { tool_use_id: String, name: String },
    Text {},
    ReasoningContent {},
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUseDelta {
    pub input: String,
}

/// Incremental content for an open block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockDelta {
    Text(String),
    ReasoningContent(ReasoningDelta),
    ToolUse(ToolUseDelta),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    #[serde(default)]
    pub latency_ms: u64,
}

/// One line of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    MessageStart {
        role: Role,
    },
    ContentBlockStart {
        start: BlockStart,
        content_block_index: usize,
    },
    ContentBlockDelta {
        delta: BlockDelta,
        content_block_index: usize,
    },
    ContentBlockStop {
        content_block_index: usize,
    },
    MessageStop {
        stop_reason: StopReason,
    },
    Metadata {
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<StreamMetrics>,
        /// Backend trace, including guardrail assessments when enabled.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<Value>,
    },
}

impl StreamEvent {
    pub fn text_delta(index: usize, text: impl Into<String>) -> Self {
        Self::ContentBlockDelta {
            delta: BlockDelta::Text(text.into()),
            content_block_index: index,
        }
    }

    pub fn tool_input_delta(index: usize, input: impl Into<String>) -> Self {
        Self::ContentBlockDelta {
            delta: BlockDelta::ToolUse(ToolUseDelta {
                input: input.into(),
            }),
            content_block_index: index,
        }
    }
}

/// Serialize an event as one NDJSON line, newline included.
pub fn encode_line(event: &StreamEvent) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Parse one NDJSON line. Blank lines yield `None`; malformed lines are
/// logged and yield `None`.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(%e, line = %truncate_for_log(trimmed), "Skipping malformed stream line");
            None
        }
    }
}

fn truncate_for_log(s: &str) -> &str {
    match s.char_indices().nth(200) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Splits a byte stream into lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters that
/// straddle chunk boundaries are decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Take the unterminated tail at end of stream, if it has content.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Block variants as seen by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Reasoning,
    ToolUse,
}

/// An event that breaks the assembly rules. The event is not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("block index {index} skips ahead; next expected index is {expected}")]
    IndexGap { index: usize, expected: usize },

    #[error("block {index} is {existing:?} but received {received:?} content")]
    VariantMismatch {
        index: usize,
        existing: BlockKind,
        received: BlockKind,
    },

    #[error("block {index} started twice")]
    DuplicateStart { index: usize },

    #[error("block {index} received content after its stop event")]
    AfterStop { index: usize },

    #[error("stop for unknown block {index}")]
    UnknownBlock { index: usize },

    #[error("tool use block {index} has no start event")]
    ToolUseWithoutStart { index: usize },
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: String,
        parsed: Option<Value>,
    },
}

impl PartialBlock {
    fn kind(&self) -> BlockKind {
        match self {
            Self::Text(_) => BlockKind::Text,
            Self::Reasoning { .. } => BlockKind::Reasoning,
            Self::ToolUse { .. } => BlockKind::ToolUse,
        }
    }

    fn into_content(self) -> ContentBlock {
        match self {
            Self::Text(text) => ContentBlock::Text { text },
            Self::Reasoning { text, signature } => ContentBlock::Reasoning { text, signature },
            Self::ToolUse {
                tool_use_id,
                name,
                input,
                parsed,
            } => {
                let input = parsed.unwrap_or_else(|| {
                    debug!(tool_use_id = %tool_use_id, "Tool input never closed, parsing what arrived");
                    partial_json::parse_tool_input(&input)
                });
                ContentBlock::ToolUse {
                    tool_use_id,
                    name,
                    input,
                }
            }
        }
    }
}

/// Result of assembling one streamed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    pub message: Message,
    /// `None` when the stream ended without a `messageStop`.
    pub stop_reason: Option<StopReason>,
    /// `None` when no `metadata` event was seen.
    pub usage: Option<TokenUsage>,
    pub trace: Option<Value>,
}

/// Folds stream events into a single assistant message.
///
/// Block indices are introduced in order: a start or delta for index `i` is
/// accepted only if `i` is an existing block or exactly the next one. A block
/// keeps the variant it started with.
#[derive(Debug)]
pub struct MessageAssembler {
    role: Role,
    blocks: Vec<PartialBlock>,
    stopped: Vec<bool>,
    stop_reason: Option<StopReason>,
    usage: Option<TokenUsage>,
    trace: Option<Value>,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            role: Role::Assistant,
            blocks: Vec::new(),
            stopped: Vec::new(),
            stop_reason: None,
            usage: None,
            trace: None,
        }
    }

    pub fn apply(&mut self, event: &StreamEvent) -> Result<(), ProtocolViolation> {
        match event {
            StreamEvent::MessageStart { role } => self.role = *role,
            StreamEvent::ContentBlockStart {
                start,
                content_block_index,
            } => self.start_block(*content_block_index, start)?,
            StreamEvent::ContentBlockDelta {
                delta,
                content_block_index,
            } => self.apply_delta(*content_block_index, delta)?,
            StreamEvent::ContentBlockStop {
                content_block_index,
            } => self.stop_block(*content_block_index)?,
            StreamEvent::MessageStop { stop_reason } => self.stop_reason = Some(*stop_reason),
            StreamEvent::Metadata { usage, trace, .. } => {
                self.usage = Some(*usage);
                self.trace = trace.clone();
            }
        }
        Ok(())
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// True once the terminal `metadata` event has been applied.
    pub fn has_metadata(&self) -> bool {
        self.usage.is_some()
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }

    pub fn trace(&self) -> Option<&Value> {
        self.trace.as_ref()
    }

    pub fn finish(self) -> AssembledMessage {
        let content = self.blocks.into_iter().map(PartialBlock::into_content).collect();
        AssembledMessage {
            message: Message {
                role: self.role,
                content,
            },
            stop_reason: self.stop_reason,
            usage: self.usage,
            trace: self.trace,
        }
    }

    fn check_new_index(&self, index: usize) -> Result<(), ProtocolViolation> {
        if index == self.blocks.len() {
            Ok(())
        } else {
            Err(ProtocolViolation::IndexGap {
                index,
                expected: self.blocks.len(),
            })
        }
    }

    fn push_block(&mut self, block: PartialBlock) {
        self.blocks.push(block);
        self.stopped.push(false);
    }

    fn start_block(&mut self, index: usize, start: &BlockStart) -> Result<(), ProtocolViolation> {
        if index < self.blocks.len() {
            return Err(ProtocolViolation::DuplicateStart { index });
        }
        self.check_new_index(index)?;
        let block = match start {
            BlockStart::Text {} => PartialBlock::Text(String::new()),
            BlockStart::ReasoningContent {} => PartialBlock::Reasoning {
                text: String::new(),
                signature: None,
            },
            BlockStart::ToolUse { tool_use_id, name } => PartialBlock::ToolUse {
                tool_use_id: tool_use_id.clone(),
                name: name.clone(),
                input: String::new(),
                parsed: None,
            },
        };
        self.push_block(block);
        Ok(())
    }

    fn apply_delta(&mut self, index: usize, delta: &BlockDelta) -> Result<(), ProtocolViolation> {
        let received = match delta {
            BlockDelta::Text(_) => BlockKind::Text,
            BlockDelta::ReasoningContent(_) => BlockKind::Reasoning,
            BlockDelta::ToolUse(_) => BlockKind::ToolUse,
        };

        if index >= self.blocks.len() {
            self.check_new_index(index)?;
            // Text and reasoning blocks may begin without an explicit start.
            // A tool use needs its start for the id and name.
            let block = match received {
                BlockKind::Text => PartialBlock::Text(String::new()),
                BlockKind::Reasoning => PartialBlock::Reasoning {
                    text: String::new(),
                    signature: None,
                },
                BlockKind::ToolUse => return Err(ProtocolViolation::ToolUseWithoutStart { index }),
            };
            self.push_block(block);
        }

        if self.stopped[index] {
            return Err(ProtocolViolation::AfterStop { index });
        }

        let block = &mut self.blocks[index];
        let existing = block.kind();
        match (block, delta) {
            (PartialBlock::Text(text), BlockDelta::Text(more)) => text.push_str(more),
            (PartialBlock::Reasoning { text, signature }, BlockDelta::ReasoningContent(more)) => {
                if let Some(t) = &more.text {
                    text.push_str(t);
                }
                if let Some(s) = &more.signature {
                    *signature = Some(s.clone());
                }
            }
            (PartialBlock::ToolUse { input, .. }, BlockDelta::ToolUse(more)) => {
                input.push_str(&more.input);
            }
            _ => {
                return Err(ProtocolViolation::VariantMismatch {
                    index,
                    existing,
                    received,
                });
            }
        }
        Ok(())
    }

    fn stop_block(&mut self, index: usize) -> Result<(), ProtocolViolation> {
        let Some(block) = self.blocks.get_mut(index) else {
            return Err(ProtocolViolation::UnknownBlock { index });
        };
        if self.stopped[index] {
            return Ok(());
        }
        self.stopped[index] = true;

        if let PartialBlock::ToolUse {
            tool_use_id,
            input,
            parsed,
            ..
        } = block
        {
            let mut parser = partial_json::PartialJsonParser::new();
            parser.feed(input);
            if !parser.is_complete() {
                debug!(tool_use_id = %tool_use_id, "Recovered truncated tool input");
            }
            *parsed = Some(
                parser
                    .finish()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            );
        }
        Ok(())
    }
}

/// Assemble a complete event sequence, skipping events that violate the
/// protocol.
pub fn assemble<I>(events: I) -> AssembledMessage
where
    I: IntoIterator<Item = StreamEvent>,
{
    let mut assembler = MessageAssembler::new();
    for event in events {
        if let Err(e) = assembler.apply(&event) {
            warn!(%e, "Skipping stream event");
        }
    }
    assembler.finish()
}
