//! Deterministic scripted backend.
//!
//! Each call pops the next [`MockTurn`] from the script. With an empty
//! script the provider echoes the last user message, so it also works as an
//! offline backend for the CLI.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use switchyard_core::error::BackendError;
use switchyard_core::protocol::{BlockDelta, BlockStart, StreamEvent, ToolUseDelta};
use switchyard_core::types::{Role, StopReason, TokenUsage};

use crate::{ConverseInput, ConverseOutput, ConverseProvider, EventStream, collect_stream};

/// One scripted backend response.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Stream these events, then end.
    Events(Vec<StreamEvent>),
    /// Fail before any event is produced.
    Fail(BackendError),
    /// Stream these events, then fail mid-stream.
    Interrupted {
        events: Vec<StreamEvent>,
        error: BackendError,
    },
    /// Stream these events, then never end.
    Hang(Vec<StreamEvent>),
}

const DEFAULT_USAGE: TokenUsage = TokenUsage {
    input_tokens: 10,
    output_tokens: 5,
    cache_read_input_tokens: 0,
    cache_write_input_tokens: 0,
};

fn block_events(index: usize, start: BlockStart, deltas: Vec<BlockDelta>) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::ContentBlockStart {
        start,
        content_block_index: index,
    }];
    events.extend(deltas.into_iter().map(|delta| StreamEvent::ContentBlockDelta {
        delta,
        content_block_index: index,
    }));
    events.push(StreamEvent::ContentBlockStop {
        content_block_index: index,
    });
    events
}

fn wrap(blocks: Vec<StreamEvent>, stop_reason: StopReason) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        role: Role::Assistant,
    }];
    events.extend(blocks);
    events.push(StreamEvent::MessageStop { stop_reason });
    events.push(StreamEvent::Metadata {
        usage: DEFAULT_USAGE,
        metrics: None,
        trace: None,
    });
    events
}

impl MockTurn {
    /// A plain text answer ending the turn.
    pub fn text(text: impl Into<String>) -> Self {
        let blocks = block_events(0, BlockStart::Text {}, vec![BlockDelta::Text(text.into())]);
        Self::Events(wrap(blocks, StopReason::EndTurn))
    }

    /// A single tool call whose input arrives in the given fragments.
    pub fn tool_use(id: &str, name: &str, fragments: &[&str]) -> Self {
        Self::tool_uses(&[(id, name, fragments)])
    }

    /// Several tool calls in one round, each as `(id, name, fragments)`.
    pub fn tool_uses(calls: &[(&str, &str, &[&str])]) -> Self {
        let blocks = calls
            .iter()
            .enumerate()
            .flat_map(|(index, (id, name, fragments))| {
                let deltas = fragments
                    .iter()
                    .map(|f| {
                        BlockDelta::ToolUse(ToolUseDelta {
                            input: (*f).to_string(),
                        })
                    })
                    .collect();
                block_events(
                    index,
                    BlockStart::ToolUse {
                        tool_use_id: (*id).to_string(),
                        name: (*name).to_string(),
                    },
                    deltas,
                )
            })
            .collect();
        Self::Events(wrap(blocks, StopReason::ToolUse))
    }

    /// Replace the usage reported in the metadata event.
    pub fn with_usage(self, usage: TokenUsage) -> Self {
        self.map_events(|events| {
            for event in events.iter_mut() {
                if let StreamEvent::Metadata { usage: u, .. } = event {
                    *u = usage;
                }
            }
        })
    }

    /// Attach a backend trace to the metadata event.
    pub fn with_trace(self, trace: serde_json::Value) -> Self {
        self.map_events(|events| {
            for event in events.iter_mut() {
                if let StreamEvent::Metadata { trace: t, .. } = event {
                    *t = Some(trace.clone());
                }
            }
        })
    }

    /// Drop the trailing metadata event.
    pub fn without_metadata(self) -> Self {
        self.map_events(|events| events.retain(|e| !matches!(e, StreamEvent::Metadata { .. })))
    }

    /// Keep the scripted events but never finish the stream.
    pub fn hang(self) -> Self {
        match self {
            Self::Events(events) => Self::Hang(events),
            other => other,
        }
    }

    /// Keep the scripted events but fail after them.
    pub fn interrupt(self, error: BackendError) -> Self {
        match self {
            Self::Events(events) => Self::Interrupted { events, error },
            other => other,
        }
    }

    fn map_events(mut self, f: impl FnOnce(&mut Vec<StreamEvent>)) -> Self {
        match &mut self {
            Self::Events(events) | Self::Hang(events) | Self::Interrupted { events, .. } => {
                f(events)
            }
            Self::Fail(_) => {}
        }
        self
    }
}

pub struct MockProvider {
    id: String,
    script: Mutex<VecDeque<MockTurn>>,
    calls: Mutex<Vec<ConverseInput>>,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_script(id, Vec::new())
    }

    pub fn with_script(id: impl Into<String>, turns: Vec<MockTurn>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(turns.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, turn: MockTurn) {
        self.script.lock().await.push_back(turn);
    }

    /// Every input received so far, in call order.
    pub async fn calls(&self) -> Vec<ConverseInput> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    fn echo(input: &ConverseInput) -> MockTurn {
        let last = input
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        MockTurn::text(format!("echo: {last}"))
    }
}

#[async_trait]
impl ConverseProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn converse(&self, input: &ConverseInput) -> Result<ConverseOutput, BackendError> {
        collect_stream(self.converse_stream(input).await?).await
    }

    async fn converse_stream(&self, input: &ConverseInput) -> Result<EventStream, BackendError> {
        self.calls.lock().await.push(input.clone());
        let turn = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Self::echo(input));

        let stream: EventStream = match turn {
            MockTurn::Events(events) => Box::pin(futures::stream::iter(events.into_iter().map(Ok))),
            MockTurn::Fail(error) => return Err(error),
            MockTurn::Interrupted { events, error } => Box::pin(
                futures::stream::iter(events.into_iter().map(Ok))
                    .chain(futures::stream::once(async move { Err(error) })),
            ),
            MockTurn::Hang(events) => Box::pin(
                futures::stream::iter(events.into_iter().map(Ok))
                    .chain(futures::stream::pending()),
            ),
        };
        Ok(stream)
    }
}
