//! Pre-flight screening through a separate guardrail service.
//!
//! Calls `POST {endpoint}/guardrail/{id}/version/{version}/apply` with the
//! text to screen. A response action of `GUARDRAIL_INTERVENED` blocks the
//! request; the policy units in `usage` are charged either way.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use switchyard_core::config::{GuardrailConfig, GuardrailMode, GuardrailPricing};
use switchyard_core::error::BackendError;

use crate::{GuardrailAssessment, GuardrailPolicy, GuardrailVerdict};

const INTERVENED: &str = "GUARDRAIL_INTERVENED";

pub struct StandaloneGuardrail {
    endpoint: String,
    identifier: String,
    version: String,
    api_key: Option<String>,
    pricing: GuardrailPricing,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    source: &'static str,
    content: Vec<ApplyContent<'a>>,
}

#[derive(Debug, Serialize)]
struct ApplyContent<'a> {
    text: ApplyText<'a>,
}

#[derive(Debug, Serialize)]
struct ApplyText<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    action: String,
    #[serde(default)]
    usage: GuardrailAssessment,
    #[serde(default)]
    assessments: Vec<Value>,
}

impl StandaloneGuardrail {
    pub fn new(
        endpoint: &str,
        identifier: impl Into<String>,
        version: impl Into<String>,
        api_key: Option<String>,
        pricing: GuardrailPricing,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            identifier: identifier.into(),
            version: version.into(),
            api_key,
            pricing,
            client,
        })
    }

    pub fn from_config(config: &GuardrailConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Standalone guardrail requires an endpoint"))?;
        let identifier = config
            .identifier
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Standalone guardrail requires an identifier"))?;
        Self::new(
            endpoint,
            identifier,
            config.version(),
            config.resolve_api_key(),
            config.pricing,
        )
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::timeout(e.to_string())
    } else if e.is_connect() {
        BackendError::unavailable(e.to_string())
    } else {
        BackendError::other(e.to_string())
    }
}

/// Names of the policies that blocked, from the assessment tree.
fn blocked_details(assessments: &[Value]) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                let blocked = map.get("action").and_then(Value::as_str) == Some("BLOCKED");
                if blocked {
                    let label = ["name", "type", "match"]
                        .iter()
                        .find_map(|k| map.get(*k).and_then(Value::as_str));
                    if let Some(label) = label {
                        out.push(label.to_string());
                    }
                }
                map.values().for_each(|child| walk(child, out));
            }
            Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
            _ => {}
        }
    }

    let mut out = Vec::new();
    assessments.iter().for_each(|a| walk(a, &mut out));
    out
}

#[async_trait]
impl GuardrailPolicy for StandaloneGuardrail {
    fn mode(&self) -> GuardrailMode {
        GuardrailMode::Standalone
    }

    async fn check(&self, text: &str) -> Result<GuardrailVerdict, BackendError> {
        let url = format!(
            "{}/guardrail/{}/version/{}/apply",
            self.endpoint, self.identifier, self.version
        );
        let body = ApplyRequest {
            source: "INPUT",
            content: vec![ApplyContent {
                text: ApplyText { text },
            }],
        };

        let mut req = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        let response = req.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_http(status, &body));
        }
        let applied: ApplyResponse = response.json().await.map_err(transport_error)?;

        let blocked = applied.action == INTERVENED;
        let cost = applied.usage.cost(&self.pricing);
        let details = if blocked {
            blocked_details(&applied.assessments)
        } else {
            Vec::new()
        };
        if blocked {
            info!(guardrail = %self.identifier, ?details, cost, "Guardrail blocked input");
        } else {
            debug!(guardrail = %self.identifier, cost, "Guardrail passed input");
        }

        Ok(GuardrailVerdict {
            blocked,
            cost,
            assessment: applied.usage,
            details,
        })
    }

    fn inline_config(&self, _streaming: bool) -> Option<Value> {
        None
    }

    fn cost_from_response(&self, _trace: Option<&Value>) -> f64 {
        0.0
    }
}
