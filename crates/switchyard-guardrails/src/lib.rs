//! Guardrail policies.
//!
//! A policy either rides along with the inference call ([`InlineGuardrail`])
//! or screens the latest user text before inference
//! ([`StandaloneGuardrail`], [`DenyListGuardrail`]). Screening cost is the
//! sum of policy units per category times the configured unit price.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchyard_core::config::{GuardrailConfig, GuardrailMode, GuardrailPricing};
use switchyard_core::error::{BackendError, GuardrailOrigin};

pub mod deny_list;
pub mod inline;
pub mod standalone;

pub use deny_list::DenyListGuardrail;
pub use inline::InlineGuardrail;
pub use standalone::StandaloneGuardrail;

/// Policy units consumed by one screening pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailAssessment {
    #[serde(default)]
    pub content_policy_units: u64,
    #[serde(default)]
    pub topic_policy_units: u64,
    #[serde(default)]
    pub sensitive_information_policy_units: u64,
    #[serde(default)]
    pub contextual_grounding_policy_units: u64,
}

impl GuardrailAssessment {
    pub fn cost(&self, pricing: &GuardrailPricing) -> f64 {
        self.content_policy_units as f64 * pricing.content_policy_unit
            + self.topic_policy_units as f64 * pricing.topic_policy_unit
            + self.sensitive_information_policy_units as f64
                * pricing.sensitive_information_policy_unit
            + self.contextual_grounding_policy_units as f64
                * pricing.contextual_grounding_policy_unit
    }

    pub fn accumulate(&mut self, other: &GuardrailAssessment) {
        self.content_policy_units += other.content_policy_units;
        self.topic_policy_units += other.topic_policy_units;
        self.sensitive_information_policy_units += other.sensitive_information_policy_units;
        self.contextual_grounding_policy_units += other.contextual_grounding_policy_units;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of a screening pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub blocked: bool,
    pub cost: f64,
    pub assessment: GuardrailAssessment,
    /// Human-readable reasons, e.g. matched policy names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl GuardrailVerdict {
    /// Allowed at zero cost.
    pub fn pass() -> Self {
        Self::default()
    }
}

/// A screening strategy.
#[async_trait]
pub trait GuardrailPolicy: Send + Sync {
    fn mode(&self) -> GuardrailMode;

    /// Where a block from this policy originates. Inline policies never
    /// block before the call, so only standalone origins reach an error.
    fn origin(&self) -> GuardrailOrigin {
        match self.mode() {
            GuardrailMode::Inline => GuardrailOrigin::Inline,
            GuardrailMode::Standalone | GuardrailMode::DenyList => GuardrailOrigin::Standalone,
        }
    }

    /// Screen text before inference.
    async fn check(&self, text: &str) -> Result<GuardrailVerdict, BackendError>;

    /// Configuration to attach to the inference call, if any.
    fn inline_config(&self, streaming: bool) -> Option<Value>;

    /// Screening cost reported in an inference response trace.
    fn cost_from_response(&self, trace: Option<&Value>) -> f64;
}

/// Build the configured policy.
pub fn from_config(config: &GuardrailConfig) -> anyhow::Result<Arc<dyn GuardrailPolicy>> {
    let policy: Arc<dyn GuardrailPolicy> = match config.mode {
        GuardrailMode::Inline => Arc::new(InlineGuardrail::from_config(config)?),
        GuardrailMode::Standalone => Arc::new(StandaloneGuardrail::from_config(config)?),
        GuardrailMode::DenyList => Arc::new(DenyListGuardrail::from_config(config)),
    };
    Ok(policy)
}
