use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use switchyard_core::error::{Result, SwitchyardError};

use crate::{UsageRecord, UserBudget};

/// Persistence for usage records and per-user budgets.
///
/// `commit` appends the record and decrements the balance as one step; two
/// commits for the same user never interleave.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn budget(&self, user_id: &str) -> Result<Option<UserBudget>>;

    /// Append `record` and charge its cost. Returns the updated budget.
    async fn commit(&self, record: &UsageRecord) -> Result<UserBudget>;

    /// Register a user unless already known. Existing balances are kept.
    async fn ensure_user(&self, user_id: &str, budget: Option<f64>) -> Result<UserBudget>;

    /// Set a user's budget and start a new period.
    async fn set_budget(&self, user_id: &str, budget: Option<f64>) -> Result<UserBudget>;

    /// Restore the remaining balance to the full budget.
    async fn reset(&self, user_id: &str) -> Result<UserBudget>;

    /// Records in commit order, optionally for one user.
    async fn records(&self, user_id: Option<&str>) -> Result<Vec<UsageRecord>>;
}

pub(crate) fn unknown_user(user_id: &str) -> SwitchyardError {
    SwitchyardError::Authorization(format!("Unknown user '{user_id}'"))
}

#[derive(Debug, Default)]
struct MemoryState {
    budgets: HashMap<String, UserBudget>,
    records: Vec<UsageRecord>,
}

/// In-process store. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    state: Mutex<MemoryState>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn budget(&self, user_id: &str) -> Result<Option<UserBudget>> {
        Ok(self.state.lock().await.budgets.get(user_id).cloned())
    }

    async fn commit(&self, record: &UsageRecord) -> Result<UserBudget> {
        let mut state = self.state.lock().await;
        let budget = state
            .budgets
            .get_mut(&record.user_id)
            .ok_or_else(|| unknown_user(&record.user_id))?;
        budget.charge(record.cost);
        let updated = budget.clone();
        state.records.push(record.clone());
        Ok(updated)
    }

    async fn ensure_user(&self, user_id: &str, budget: Option<f64>) -> Result<UserBudget> {
        let mut state = self.state.lock().await;
        Ok(state
            .budgets
            .entry(user_id.to_string())
            .or_insert_with(|| UserBudget::new(user_id, budget))
            .clone())
    }

    async fn set_budget(&self, user_id: &str, budget: Option<f64>) -> Result<UserBudget> {
        let updated = UserBudget::new(user_id, budget);
        self.state
            .lock()
            .await
            .budgets
            .insert(user_id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn reset(&self, user_id: &str) -> Result<UserBudget> {
        let mut state = self.state.lock().await;
        let budget = state
            .budgets
            .get_mut(user_id)
            .ok_or_else(|| unknown_user(user_id))?;
        budget.reset();
        Ok(budget.clone())
    }

    async fn records(&self, user_id: Option<&str>) -> Result<Vec<UsageRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsageKind;
    use chrono::Utc;
    use switchyard_core::types::TokenUsage;
    use uuid::Uuid;

    fn record(user: &str, cost: f64) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            user_id: user.into(),
            model_id: None,
            kind: UsageKind::Agent,
            usage: TokenUsage::default(),
            guardrail_cost: 0.0,
            cost,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ensure_user_keeps_existing_balance() {
        let store = MemoryUsageStore::new();
        store.ensure_user("a", Some(1.0)).await.unwrap();
        store.commit(&record("a", 0.4)).await.unwrap();
        let again = store.ensure_user("a", Some(5.0)).await.unwrap();
        assert_eq!(again.budget, Some(1.0));
        assert!((again.remaining.unwrap() - 0.6).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_commit_unknown_user_fails() {
        let store = MemoryUsageStore::new();
        let err = store.commit(&record("ghost", 0.1)).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Authorization(_)));
        assert!(store.records(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_budget_and_reset() {
        let store = MemoryUsageStore::new();
        store.set_budget("a", Some(2.0)).await.unwrap();
        store.commit(&record("a", 1.5)).await.unwrap();
        let reset = store.reset("a").await.unwrap();
        assert_eq!(reset.remaining, Some(2.0));

        let unlimited = store.set_budget("a", None).await.unwrap();
        assert_eq!(unlimited.remaining, None);
    }
}
