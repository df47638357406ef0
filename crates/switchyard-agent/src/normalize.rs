//! History normalization before each round.
//!
//! Backends reject histories with empty blocks, undecoded payloads, or
//! tool-use/tool-result mismatches. [`normalize_history`] repairs all three in
//! place.

use std::collections::HashSet;

use serde_json::json;
use tracing::{debug, warn};

use switchyard_core::types::{
    BinarySource, ContentBlock, Message, Role, ToolResultContent, ToolResultStatus,
};

pub const EMPTY_MESSAGE_PLACEHOLDER: &str = "(empty message)";
pub const EMPTY_RESULT_PLACEHOLDER: &str = "(no output)";

/// Result synthesized for a tool-use that never got one.
pub fn synthesized_result(tool_use_id: &str) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content: vec![ToolResultContent::Json(json!({}))],
        status: ToolResultStatus::Error,
    }
}

fn decode_binary(source: &mut BinarySource) -> bool {
    if let BinarySource::Base64(_) = source {
        match source.to_bytes() {
            Ok(bytes) => *source = BinarySource::Bytes(bytes),
            Err(e) => {
                warn!(%e, "Dropping undecodable binary payload");
                return false;
            }
        }
    }
    true
}

/// Clean one block. `None` drops it.
fn clean_block(block: ContentBlock) -> Option<ContentBlock> {
    match block {
        ContentBlock::Text { text } if text.trim().is_empty() => None,
        ContentBlock::Reasoning { text, signature } if text.is_empty() && signature.is_none() => {
            None
        }
        // Markers are placed by the cache planner per request.
        ContentBlock::CachePoint => None,
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            status,
        } if content.is_empty() => Some(ContentBlock::ToolResult {
            tool_use_id,
            content: vec![ToolResultContent::Text(EMPTY_RESULT_PLACEHOLDER.into())],
            status,
        }),
        ContentBlock::Image { format, mut source } => {
            if decode_binary(&mut source) {
                Some(ContentBlock::Image { format, source })
            } else {
                Some(ContentBlock::text(format!("[{format} image could not be decoded]")))
            }
        }
        ContentBlock::Document {
            name,
            format,
            mut source,
        } => {
            if decode_binary(&mut source) {
                Some(ContentBlock::Document {
                    name,
                    format,
                    source,
                })
            } else {
                Some(ContentBlock::text(format!("[document '{name}' could not be decoded]")))
            }
        }
        other => Some(other),
    }
}

fn tool_result_id(block: &ContentBlock) -> Option<&str> {
    match block {
        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id),
        _ => None,
    }
}

/// Rebuild a user message so it answers exactly `pending`, in order.
///
/// Results for other ids are dropped; missing ones are synthesized. Results
/// come first, followed by the message's other content.
fn pair_results(message: &mut Message, pending: &[String]) {
    let blocks = std::mem::take(&mut message.content);
    let (mut results, others): (Vec<ContentBlock>, Vec<ContentBlock>) =
        blocks.into_iter().partition(|b| tool_result_id(b).is_some());

    let mut ordered = Vec::with_capacity(pending.len() + others.len());
    for id in pending {
        match results
            .iter()
            .position(|b| tool_result_id(b) == Some(id.as_str()))
        {
            Some(pos) => ordered.push(results.swap_remove(pos)),
            None => {
                debug!(tool_use_id = %id, "Synthesizing missing tool result");
                ordered.push(synthesized_result(id));
            }
        }
    }
    for dropped in &results {
        if let Some(id) = tool_result_id(dropped) {
            warn!(tool_use_id = %id, "Dropping tool result with no matching tool use");
        }
    }
    ordered.extend(others);
    message.content = ordered;
}

/// Normalize a history in place.
pub fn normalize_history(messages: &mut Vec<Message>) {
    for message in messages.iter_mut() {
        let blocks = std::mem::take(&mut message.content);
        message.content = blocks.into_iter().filter_map(clean_block).collect();
    }

    let mut index = 0;
    while index < messages.len() {
        let pending: Vec<String> = if messages[index].role == Role::Assistant {
            messages[index]
                .tool_uses()
                .map(|(id, _, _)| id.to_string())
                .collect()
        } else {
            Vec::new()
        };

        // Results only belong in the message right after their tool uses.
        if messages[index].role == Role::User && !answers_previous(messages, index) {
            pair_results(&mut messages[index], &[]);
        }

        if !pending.is_empty() {
            match messages.get_mut(index + 1) {
                Some(next) if next.role == Role::User => pair_results(next, &pending),
                _ => {
                    let results = pending.iter().map(|id| synthesized_result(id)).collect();
                    messages.insert(
                        index + 1,
                        Message {
                            role: Role::User,
                            content: results,
                        },
                    );
                }
            }
            // The next message is now paired.
            index += 2;
            continue;
        }
        index += 1;
    }

    for message in messages.iter_mut() {
        if message.content.is_empty() {
            message.content.push(ContentBlock::text(EMPTY_MESSAGE_PLACEHOLDER));
        }
    }
}

fn answers_previous(messages: &[Message], index: usize) -> bool {
    index > 0
        && messages[index - 1].role == Role::Assistant
        && messages[index - 1].content.iter().any(ContentBlock::is_tool_use)
}

/// Tool-use ids in `messages` that lack a result in the following message.
pub fn orphaned_tool_uses(messages: &[Message]) -> Vec<String> {
    let mut orphans = Vec::new();
    for (index, message) in messages.iter().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        let answered: HashSet<&str> = messages
            .get(index + 1)
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.iter().filter_map(tool_result_id).collect())
            .unwrap_or_default();
        orphans.extend(
            message
                .tool_uses()
                .filter(|(id, _, _)| !answered.contains(id))
                .map(|(id, _, _)| id.to_string()),
        );
    }
    orphans
}
