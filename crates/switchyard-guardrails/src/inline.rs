//! Guardrail configuration attached to the inference call.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use switchyard_core::config::{GuardrailConfig, GuardrailMode, GuardrailPricing};
use switchyard_core::error::BackendError;

use crate::{GuardrailAssessment, GuardrailPolicy, GuardrailVerdict};

pub struct InlineGuardrail {
    identifier: String,
    version: String,
    pricing: GuardrailPricing,
}

impl InlineGuardrail {
    pub fn new(identifier: impl Into<String>, version: impl Into<String>, pricing: GuardrailPricing) -> Self {
        Self {
            identifier: identifier.into(),
            version: version.into(),
            pricing,
        }
    }

    pub fn from_config(config: &GuardrailConfig) -> anyhow::Result<Self> {
        let identifier = config
            .identifier
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Inline guardrail requires an identifier"))?;
        Ok(Self::new(identifier, config.version(), config.pricing))
    }
}

/// Sum every `invocationMetrics.usage` block found in a response trace.
///
/// Assessments nest differently for input and output screening (and per
/// guardrail id), so the trace is walked rather than addressed by path.
pub fn assessment_from_trace(trace: &Value) -> GuardrailAssessment {
    let mut total = GuardrailAssessment::default();
    collect_usage(trace, &mut total);
    total
}

fn collect_usage(value: &Value, total: &mut GuardrailAssessment) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "invocationMetrics" {
                    if let Some(usage) = child.get("usage") {
                        match serde_json::from_value::<GuardrailAssessment>(usage.clone()) {
                            Ok(units) => total.accumulate(&units),
                            Err(e) => debug!(%e, "Unreadable guardrail usage in trace"),
                        }
                    }
                } else {
                    collect_usage(child, total);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_usage(item, total)),
        _ => {}
    }
}

#[async_trait]
impl GuardrailPolicy for InlineGuardrail {
    fn mode(&self) -> GuardrailMode {
        GuardrailMode::Inline
    }

    async fn check(&self, _text: &str) -> Result<GuardrailVerdict, BackendError> {
        Ok(GuardrailVerdict::pass())
    }

    fn inline_config(&self, streaming: bool) -> Option<Value> {
        let mut config = json!({
            "guardrailIdentifier": self.identifier,
            "guardrailVersion": self.version,
            "trace": "enabled",
        });
        if streaming {
            config["streamProcessingMode"] = json!("async");
        }
        Some(config)
    }

    fn cost_from_response(&self, trace: Option<&Value>) -> f64 {
        trace
            .map(|t| assessment_from_trace(t).cost(&self.pricing))
            .unwrap_or(0.0)
    }
}
