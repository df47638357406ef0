//! Local term-list screening for development and tests.

use async_trait::async_trait;
use serde_json::Value;

use switchyard_core::config::{GuardrailConfig, GuardrailMode, GuardrailPricing};
use switchyard_core::error::BackendError;

use crate::{GuardrailAssessment, GuardrailPolicy, GuardrailVerdict};

/// Characters covered by one content policy unit.
const CHARS_PER_UNIT: usize = 1000;

pub struct DenyListGuardrail {
    terms: Vec<String>,
    pricing: GuardrailPricing,
}

impl DenyListGuardrail {
    pub fn new(terms: impl IntoIterator<Item = impl Into<String>>, pricing: GuardrailPricing) -> Self {
        Self {
            terms: terms
                .into_iter()
                .map(|t| t.into().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            pricing,
        }
    }

    pub fn from_config(config: &GuardrailConfig) -> Self {
        Self::new(config.terms.iter().cloned(), config.pricing)
    }
}

#[async_trait]
impl GuardrailPolicy for DenyListGuardrail {
    fn mode(&self) -> GuardrailMode {
        GuardrailMode::DenyList
    }

    async fn check(&self, text: &str) -> Result<GuardrailVerdict, BackendError> {
        let chars = text.chars().count();
        let assessment = GuardrailAssessment {
            content_policy_units: chars.div_ceil(CHARS_PER_UNIT) as u64,
            ..Default::default()
        };
        let lowered = text.to_lowercase();
        let details: Vec<String> = self
            .terms
            .iter()
            .filter(|term| lowered.contains(term.as_str()))
            .cloned()
            .collect();

        Ok(GuardrailVerdict {
            blocked: !details.is_empty(),
            cost: assessment.cost(&self.pricing),
            assessment,
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
