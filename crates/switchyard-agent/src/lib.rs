//! Agent loop orchestration.
//!
//! The [`Orchestrator`] takes a conversation, screens the latest user input,
//! streams the model response, executes tool calls and loops until the model
//! stops asking for tools. Progress is reported as a stream of
//! [`AgentEvent`]s for the gateway to forward.

use serde::{Deserialize, Serialize};

use switchyard_core::error::ErrorKind;
use switchyard_core::protocol::StreamEvent;
use switchyard_core::types::{Message, Role, StopReason, TokenUsage, ToolResultContent};

pub mod cache;
pub mod normalize;
pub mod runtime;

pub use runtime::Orchestrator;

/// Events emitted by the orchestrator during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStart {
        turn_id: String,
    },

    /// A provider round is about to start (1-based).
    RoundStart {
        round: u32,
    },

    /// A protocol event from the model stream, forwarded as received.
    Stream {
        event: StreamEvent,
    },

    /// The assembled assistant message of a round.
    Message {
        message: Message,
    },

    /// A tool call is being made.
    ToolCall {
        tool_use_id: String,
        tool: String,
        input: serde_json::Value,
    },

    /// A tool call has completed.
    ToolResult {
        tool_use_id: String,
        tool: String,
        content: Vec<ToolResultContent>,
        is_error: bool,
    },

    /// A usage record was committed.
    Usage {
        usage: TokenUsage,
        cost: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<f64>,
    },

    /// The turn finished.
    Done {
        turn_id: String,
        stop_reason: StopReason,
        rounds: u32,
        usage: TokenUsage,
        cost: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        remaining: Option<f64>,
    },

    /// The turn failed. `message` is safe to show to the caller.
    Error { kind: ErrorKind, message: String },
}

/// A request to run one turn over a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Caller identity. The gateway fills this from the request headers.
    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub conversation_id: String,

    /// Client-chosen turn id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,

    /// Public model id; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Full conversation history, ending with the new user message.
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget_tokens: Option<u32>,

    /// Use the streaming backend call. Defaults to `agent.stream`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl TurnRequest {
    /// Single user message for `user_id`.
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn_id: String,
    /// Messages produced during the turn, in order.
    pub messages: Vec<Message>,
    pub stop_reason: StopReason,
    pub rounds: u32,
    pub tool_calls: u32,
    /// Token usage summed over all rounds.
    pub usage: TokenUsage,
    /// Total charged for the turn, screening included.
    pub cost: f64,
    /// Remaining budget after the last charge. `None` for unlimited users.
    pub remaining: Option<f64>,
}

impl TurnOutcome {
    /// Text of the last assistant message.
    pub fn final_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(Message::text)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = AgentEvent::RoundStart { round: 2 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "round_start", "round": 2})
        );

        let event = AgentEvent::Error {
            kind: ErrorKind::QuotaExceeded,
            message: "no".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "error", "kind": "quota_exceeded", "message": "no"})
        );
    }

    #[test]
    fn test_turn_request_defaults() {
        let request: TurnRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        }))
        .unwrap();
        assert!(request.user_id.is_empty());
        assert_eq!(request.messages[0].text(), "hi");
        assert_eq!(request.stream, None);
    }
}
