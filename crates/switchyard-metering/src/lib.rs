//! Usage metering and budget enforcement.
//!
//! Every completed inference call and every standalone screening pass becomes
//! an immutable [`UsageRecord`]. Committing a record decrements the user's
//! remaining budget inside the store, floored at zero.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use switchyard_core::config::{Config, ModelPricing, UsageStoreKind};
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::types::TokenUsage;

pub mod jsonl;
pub mod store;

pub use jsonl::JsonlUsageStore;
pub use store::{MemoryUsageStore, UsageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// A model call made by the agent loop.
    Agent,
    Guardrail,
}

/// One metered charge. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub kind: UsageKind,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub guardrail_cost: f64,
    /// Total charged, guardrail cost included.
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    fn new(
        user_id: &str,
        model_id: Option<&str>,
        kind: UsageKind,
        usage: TokenUsage,
        guardrail_cost: f64,
        cost: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            model_id: model_id.map(String::from),
            kind,
            usage,
            guardrail_cost,
            cost,
            created_at: Utc::now(),
        }
    }
}

/// A user's spending ceiling and live balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBudget {
    pub user_id: String,
    /// Budget per reset period; `None` means unlimited.
    pub budget: Option<f64>,
    /// Remaining balance; `None` for unlimited users.
    pub remaining: Option<f64>,
}

impl UserBudget {
    pub fn new(user_id: impl Into<String>, budget: Option<f64>) -> Self {
        Self {
            user_id: user_id.into(),
            budget,
            remaining: budget,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining, Some(r) if r <= 0.0)
    }

    /// Deduct `cost`, flooring the balance at zero. Negative costs deduct
    /// nothing, so the balance never grows within a period.
    pub fn charge(&mut self, cost: f64) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = (*remaining - cost.max(0.0)).max(0.0);
        }
    }

    /// Start a new reset period.
    pub fn reset(&mut self) {
        self.remaining = self.budget;
    }
}

/// Model cost of one call: tokens / 1000 × rate, per category.
pub fn model_cost(usage: &TokenUsage, pricing: &ModelPricing) -> f64 {
    usage.input_tokens as f64 / 1000.0 * pricing.input_per_1k
        + usage.output_tokens as f64 / 1000.0 * pricing.output_per_1k
        + usage.cache_read_input_tokens as f64 / 1000.0 * pricing.cache_read_per_1k
        + usage.cache_write_input_tokens as f64 / 1000.0 * pricing.cache_write_per_1k
}

/// Outcome of committing a charge.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub record: UsageRecord,
    pub budget: UserBudget,
}

/// Budget checks and charge recording over a [`UsageStore`].
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn UsageStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    /// Reject unknown users and users with an exhausted finite budget.
    pub async fn ensure_budget(&self, user_id: &str) -> Result<UserBudget> {
        let budget = self
            .store
            .budget(user_id)
            .await?
            .ok_or_else(|| SwitchyardError::Authorization(format!("Unknown user '{user_id}'")))?;
        if budget.is_exhausted() {
            info!(user = %user_id, "Budget exhausted, rejecting request");
            return Err(SwitchyardError::QuotaExceeded {
                user_id: user_id.to_string(),
            });
        }
        Ok(budget)
    }

    /// Charge a completed inference call, including inline screening cost.
    pub async fn record_inference(
        &self,
        user_id: &str,
        model_id: &str,
        usage: &TokenUsage,
        pricing: &ModelPricing,
        guardrail_cost: f64,
    ) -> Result<Charge> {
        let cost = model_cost(usage, pricing) + guardrail_cost;
        let record = UsageRecord::new(
            user_id,
            Some(model_id),
            UsageKind::Agent,
            *usage,
            guardrail_cost,
            cost,
        );
        self.commit(record).await
    }

    /// Charge a standalone screening pass.
    pub async fn record_guardrail(
        &self,
        user_id: &str,
        model_id: Option<&str>,
        cost: f64,
    ) -> Result<Charge> {
        let record = UsageRecord::new(
            user_id,
            model_id,
            UsageKind::Guardrail,
            TokenUsage::default(),
            cost,
            cost,
        );
        self.commit(record).await
    }

    async fn commit(&self, record: UsageRecord) -> Result<Charge> {
        let budget = self.store.commit(&record).await?;
        debug!(
            user = %record.user_id,
            kind = ?record.kind,
            cost = record.cost,
            remaining = ?budget.remaining,
            "Usage committed"
        );
        Ok(Charge { record, budget })
    }
}

/// Open the configured store and seed budgets for users it does not know.
pub async fn store_from_config(config: &Config) -> Result<Arc<dyn UsageStore>> {
    let metering = config.metering.clone().unwrap_or_default();
    let store: Arc<dyn UsageStore> = match metering.store {
        UsageStoreKind::Memory => Arc::new(MemoryUsageStore::new()),
        UsageStoreKind::Jsonl => Arc::new(JsonlUsageStore::open(config.usage_dir()).await?),
    };
    for seed in &metering.users {
        store.ensure_user(&seed.user_id, seed.budget).await?;
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> ModelPricing {
        ModelPricing {
            input_per_1k: 0.003,
            output_per_1k: 0.015,
            cache_read_per_1k: 0.0003,
            cache_write_per_1k: 0.00375,
        }
    }

    #[test]
    fn test_model_cost_is_sum_of_categories() {
        let usage = TokenUsage {
            input_tokens: 2000,
            output_tokens: 1000,
            cache_read_input_tokens: 10_000,
            cache_write_input_tokens: 1000,
        };
        let expected = 2.0 * 0.003 + 0.015 + 10.0 * 0.0003 + 0.00375;
        assert!((model_cost(&usage, &pricing()) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_charge_floors_at_zero() {
        let mut budget = UserBudget::new("u", Some(0.0005));
        budget.charge(0.01);
        assert_eq!(budget.remaining, Some(0.0));
        assert!(budget.is_exhausted());

        budget.reset();
        assert_eq!(budget.remaining, Some(0.0005));
    }

    #[test]
    fn test_negative_charge_never_raises_balance() {
        let mut budget = UserBudget::new("u", Some(1.0));
        budget.charge(0.4);
        budget.charge(-5.0);
        let remaining = budget.remaining.unwrap();
        assert!((remaining - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_unlimited_never_exhausted() {
        let mut budget = UserBudget::new("u", None);
        budget.charge(1e9);
        assert!(!budget.is_exhausted());
        assert_eq!(budget.remaining, None);
    }

    #[tokio::test]
    async fn test_meter_rejects_unknown_and_exhausted() {
        let store = Arc::new(MemoryUsageStore::new());
        store.ensure_user("alice", Some(0.0005)).await.unwrap();
        let meter = UsageMeter::new(store);

        let err = meter.ensure_budget("mallory").await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Authorization(_)));

        meter.ensure_budget("alice").await.unwrap();
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 0,
            ..Default::default()
        };
        let pricing = ModelPricing {
            input_per_1k: 0.01,
            ..Default::default()
        };
        let charge = meter
            .record_inference("alice", "m", &usage, &pricing, 0.0)
            .await
            .unwrap();
        assert!((charge.record.cost - 0.01).abs() < 1e-12);
        assert_eq!(charge.budget.remaining, Some(0.0));

        let err = meter.ensure_budget("alice").await.unwrap_err();
        assert!(matches!(err, SwitchyardError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_guardrail_record() {
        let store = Arc::new(MemoryUsageStore::new());
        store.ensure_user("bob", Some(1.0)).await.unwrap();
        let meter = UsageMeter::new(store.clone());

        let charge = meter.record_guardrail("bob", Some("m"), 0.25).await.unwrap();
        assert_eq!(charge.record.kind, UsageKind::Guardrail);
        assert_eq!(charge.record.usage, TokenUsage::default());
        assert_eq!(charge.budget.remaining, Some(0.75));
        assert_eq!(store.records(Some("bob")).await.unwrap().len(), 1);
    }
}
