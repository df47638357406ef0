//! Converse JSON shapes for messages and requests.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use switchyard_core::types::{
    BinarySource, ContentBlock, Message, Role, StopReason, TokenUsage, ToolResultContent,
    ToolResultStatus,
};

use crate::ConverseInput;

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

pub(crate) fn encode_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "text": text }),
        ContentBlock::Image { format, source } => json!({
            "image": { "format": format, "source": { "bytes": source.to_base64() } }
        }),
        ContentBlock::Document {
            name,
            format,
            source,
        } => json!({
            "document": { "name": name, "format": format, "source": { "bytes": source.to_base64() } }
        }),
        ContentBlock::Reasoning { text, signature } => {
            let mut reasoning = json!({ "text": text });
            if let Some(sig) = signature {
                reasoning["signature"] = json!(sig);
            }
            json!({ "reasoningContent": { "reasoningText": reasoning } })
        }
        ContentBlock::ToolUse {
            tool_use_id,
            name,
            input,
        } => json!({
            "toolUse": { "toolUseId": tool_use_id, "name": name, "input": input }
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            status,
        } => {
            let content: Vec<Value> = content
                .iter()
                .map(|c| match c {
                    ToolResultContent::Text(text) => json!({ "text": text }),
                    ToolResultContent::Json(value) => json!({ "json": value }),
                })
                .collect();
            let status = match status {
                ToolResultStatus::Success => "success",
                ToolResultStatus::Error => "error",
            };
            json!({
                "toolResult": { "toolUseId": tool_use_id, "content": content, "status": status }
            })
        }
        ContentBlock::CachePoint => json!({ "cachePoint": { "type": "default" } }),
    }
}

pub(crate) fn encode_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            json!({
                "role": role_str(m.role),
                "content": m.content.iter().map(encode_block).collect::<Vec<_>>(),
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceFields {
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConverseRequestBody {
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<Value>,
    inference_config: InferenceFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_model_request_fields: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guardrail_config: Option<Value>,
}

pub(crate) fn request_body(input: &ConverseInput) -> ConverseRequestBody {
    let mut system = Vec::new();
    if let Some(prompt) = &input.system {
        system.push(json!({ "text": prompt }));
        if input.cache_system {
            system.push(json!({ "cachePoint": { "type": "default" } }));
        }
    }

    let tool_config = (!input.tools.is_empty()).then(|| {
        let mut tools: Vec<Value> = input
            .tools
            .iter()
            .map(|t| {
                json!({
                    "toolSpec": {
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": { "json": t.input_schema },
                    }
                })
            })
            .collect();
        if input.cache_tools {
            tools.push(json!({ "cachePoint": { "type": "default" } }));
        }
        json!({ "tools": tools })
    });

    // Temperature must be 1 while extended thinking is on.
    let (temperature, thinking) = match input.inference.thinking_budget_tokens {
        Some(budget) => (
            None,
            Some(json!({ "thinking": { "type": "enabled", "budget_tokens": budget } })),
        ),
        None => (input.inference.temperature, None),
    };

    ConverseRequestBody {
        messages: encode_messages(&input.messages),
        system,
        tool_config,
        inference_config: InferenceFields {
            max_tokens: input.inference.max_tokens,
            temperature,
        },
        additional_model_request_fields: thinking,
        guardrail_config: input.guardrail.clone(),
    }
}

/// Decode one Converse content block. Unknown shapes yield `None`.
pub(crate) fn decode_block(value: &Value) -> Option<ContentBlock> {
    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return Some(ContentBlock::text(text));
    }
    if let Some(reasoning) = value.get("reasoningContent") {
        let inner = reasoning.get("reasoningText").unwrap_or(reasoning);
        return Some(ContentBlock::Reasoning {
            text: inner
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            signature: inner
                .get("signature")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }
    if let Some(tool) = value.get("toolUse") {
        return Some(ContentBlock::ToolUse {
            tool_use_id: tool.get("toolUseId")?.as_str()?.to_string(),
            name: tool.get("name")?.as_str()?.to_string(),
            input: tool.get("input").cloned().unwrap_or_else(|| json!({})),
        });
    }
    if let Some(image) = value.get("image") {
        return Some(ContentBlock::Image {
            format: image.get("format")?.as_str()?.to_string(),
            source: BinarySource::Base64(image.pointer("/source/bytes")?.as_str()?.to_string()),
        });
    }
    debug!(block = %value, "Ignoring unrecognised content block");
    None
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConverseResponseMessage {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConverseResponseOutput {
    message: ConverseResponseMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConverseResponse {
    output: ConverseResponseOutput,
    stop_reason: StopReason,
    #[serde(default)]
    usage: TokenUsage,
    #[serde(default)]
    trace: Option<Value>,
}

impl ConverseResponse {
    pub(crate) fn into_output(self) -> crate::ConverseOutput {
        let content = self
            .output
            .message
            .content
            .iter()
            .filter_map(decode_block)
            .collect();
        crate::ConverseOutput {
            message: Message::assistant(content),
            stop_reason: self.stop_reason,
            usage: self.usage,
            trace: self.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceConfig;
    use switchyard_core::types::ToolSpec;

    fn input() -> ConverseInput {
        ConverseInput {
            model_id: "m".into(),
            messages: vec![
                Message::user("hi"),
                Message::assistant(vec![ContentBlock::ToolUse {
                    tool_use_id: "t1".into(),
                    name: "search".into(),
                    input: json!({"q": "x"}),
                }]),
                Message {
                    role: Role::User,
                    content: vec![
                        ContentBlock::ToolResult {
                            tool_use_id: "t1".into(),
                            content: vec![ToolResultContent::Json(json!({"hits": 3}))],
                            status: ToolResultStatus::Success,
                        },
                        ContentBlock::CachePoint,
                    ],
                },
            ],
            system: Some("be brief".into()),
            cache_system: true,
            tools: vec![ToolSpec {
                name: "search".into(),
                description: "Search".into(),
                input_schema: json!({"type": "object"}),
            }],
            cache_tools: true,
            inference: InferenceConfig {
                max_tokens: 512,
                temperature: Some(0.2),
                thinking_budget_tokens: None,
            },
            guardrail: None,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(request_body(&input())).unwrap();
        assert_eq!(body["system"][0]["text"], "be brief");
        assert_eq!(body["system"][1]["cachePoint"]["type"], "default");
        assert_eq!(body["toolConfig"]["tools"][0]["toolSpec"]["name"], "search");
        assert!(body["toolConfig"]["tools"][1].get("cachePoint").is_some());
        assert_eq!(body["inferenceConfig"]["maxTokens"], 512);
        assert_eq!(body["inferenceConfig"]["temperature"], 0.2);
        assert!(body.get("additionalModelRequestFields").is_none());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"][0]["toolUse"]["toolUseId"], "t1");
        assert_eq!(
            messages[2]["content"][0]["toolResult"]["content"][0]["json"]["hits"],
            3
        );
        assert_eq!(messages[2]["content"][1]["cachePoint"]["type"], "default");
    }

    #[test]
    fn test_thinking_drops_temperature() {
        let mut input = input();
        input.inference.thinking_budget_tokens = Some(2048);
        let body = serde_json::to_value(request_body(&input)).unwrap();
        assert!(body["inferenceConfig"].get("temperature").is_none());
        assert_eq!(
            body["additionalModelRequestFields"]["thinking"]["budget_tokens"],
            2048
        );
    }

    #[test]
    fn test_binary_encoded_as_base64() {
        let block = ContentBlock::Image {
            format: "png".into(),
            source: BinarySource::Bytes(b"hello".to_vec()),
        };
        assert_eq!(encode_block(&block)["image"]["source"]["bytes"], "aGVsbG8=");
    }

    #[test]
    fn test_decode_response() {
        let resp: ConverseResponse = serde_json::from_value(json!({
            "output": {"message": {"role": "assistant", "content": [
                {"reasoningContent": {"reasoningText": {"text": "hmm", "signature": "s"}}},
                {"text": "answer"},
                {"toolUse": {"toolUseId": "t2", "name": "notes", "input": {"command": "view"}}},
                {"somethingNew": {}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 5, "outputTokens": 7}
        }))
        .unwrap();
        let out = resp.into_output();
        assert_eq!(out.stop_reason, StopReason::ToolUse);
        assert_eq!(out.usage.output_tokens, 7);
        assert_eq!(out.message.content.len(), 3);
        assert_eq!(out.message.text(), "answer");
        assert_eq!(out.message.tool_uses().next().unwrap().1, "notes");
    }
}
