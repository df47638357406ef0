//! File-backed usage store.
//!
//! Layout:
//! - `<base>/usage.jsonl`: one usage record per line, append-only
//! - `<base>/budgets.json`: array of `UserBudget`, replaced atomically

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use switchyard_core::error::{Result, SwitchyardError};

use crate::store::{UsageStore, unknown_user};
use crate::{UsageRecord, UserBudget};

pub struct JsonlUsageStore {
    base: PathBuf,
    /// Budgets as last written to disk. The lock also serialises file writes.
    budgets: Mutex<BTreeMap<String, UserBudget>>,
}

impl JsonlUsageStore {
    /// Open (or create) a store rooted at `base`.
    pub async fn open(base: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&base).await?;
        let budgets = load_budgets(&base.join("budgets.json")).await?;
        debug!(path = %base.display(), users = budgets.len(), "Opened usage store");
        Ok(Self {
            base,
            budgets: Mutex::new(budgets),
        })
    }

    fn usage_path(&self) -> PathBuf {
        self.base.join("usage.jsonl")
    }

    fn budgets_path(&self) -> PathBuf {
        self.base.join("budgets.json")
    }

    async fn save_budgets(&self, budgets: &BTreeMap<String, UserBudget>) -> Result<()> {
        let list: Vec<&UserBudget> = budgets.values().collect();
        let data = serde_json::to_string_pretty(&list)?;
        let path = self.budgets_path();
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append_record(&self, record: &UsageRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.usage_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn load_budgets(path: &Path) -> Result<BTreeMap<String, UserBudget>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = tokio::fs::read_to_string(path).await?;
    let list: Vec<UserBudget> = serde_json::from_str(&data)
        .map_err(|e| SwitchyardError::Storage(format!("corrupt budgets file: {e}")))?;
    Ok(list.into_iter().map(|b| (b.user_id.clone(), b)).collect())
}

#[async_trait]
impl UsageStore for JsonlUsageStore {
    async fn budget(&self, user_id: &str) -> Result<Option<UserBudget>> {
        Ok(self.budgets.lock().await.get(user_id).cloned())
    }

    async fn commit(&self, record: &UsageRecord) -> Result<UserBudget> {
        let mut budgets = self.budgets.lock().await;
        let mut updated = budgets
            .get(&record.user_id)
            .cloned()
            .ok_or_else(|| unknown_user(&record.user_id))?;
        updated.charge(record.cost);

        // Balance first: if the record append then fails the user is
        // under-billed, never billed without a matching deduction.
        let mut next = budgets.clone();
        next.insert(updated.user_id.clone(), updated.clone());
        self.save_budgets(&next).await?;
        *budgets = next;
        self.append_record(record).await?;
        Ok(updated)
    }

    async fn ensure_user(&self, user_id: &str, budget: Option<f64>) -> Result<UserBudget> {
        let mut budgets = self.budgets.lock().await;
        if let Some(existing) = budgets.get(user_id) {
            return Ok(existing.clone());
        }
        let created = UserBudget::new(user_id, budget);
        let mut next = budgets.clone();
        next.insert(user_id.to_string(), created.clone());
        self.save_budgets(&next).await?;
        *budgets = next;
        Ok(created)
    }

    async fn set_budget(&self, user_id: &str, budget: Option<f64>) -> Result<UserBudget> {
        let mut budgets = self.budgets.lock().await;
        let updated = UserBudget::new(user_id, budget);
        let mut next = budgets.clone();
        next.insert(user_id.to_string(), updated.clone());
        self.save_budgets(&next).await?;
        *budgets = next;
        Ok(updated)
    }

    async fn reset(&self, user_id: &str) -> Result<UserBudget> {
        let mut budgets = self.budgets.lock().await;
        let mut updated = budgets
            .get(user_id)
            .cloned()
            .ok_or_else(|| unknown_user(user_id))?;
        updated.reset();
        let mut next = budgets.clone();
        next.insert(user_id.to_string(), updated.clone());
        self.save_budgets(&next).await?;
        *budgets = next;
        Ok(updated)
    }

    async fn records(&self, user_id: Option<&str>) -> Result<Vec<UsageRecord>> {
        // Hold the lock so a concurrent append is never read half-written.
        let _guard = self.budgets.lock().await;
        let path = self.usage_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => {
                    if user_id.is_none_or(|u| record.user_id == u) {
                        records.push(record);
                    }
                }
                Err(e) => warn!(line = lineno + 1, %e, "Skipping corrupt usage line"),
            }
        }
        Ok(records)
    }
}
