use std::sync::Arc;

use switchyard_core::config::ModelPricing;
use switchyard_core::types::TokenUsage;
use switchyard_metering::{JsonlUsageStore, MemoryUsageStore, UsageMeter, UsageStore};

fn pricing() -> ModelPricing {
    ModelPricing {
        input_per_1k: 0.001,
        ..Default::default()
    }
}

fn usage(input_tokens: u64) -> TokenUsage {
    TokenUsage {
        input_tokens,
        ..Default::default()
    }
}

async fn concurrent_commits_lose_nothing(store: Arc<dyn UsageStore>) {
    store.ensure_user("alice", Some(10.0)).await.unwrap();
    let meter = UsageMeter::new(store.clone());

    // 50 calls of 1000 input tokens at 0.001 per 1k: 0.05 in total.
    let tasks = (0..50).map(|_| {
        let meter = meter.clone();
        tokio::spawn(async move {
            meter
                .record_inference("alice", "m", &usage(1000), &pricing(), 0.0)
                .await
                .unwrap()
        })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let budget = store.budget("alice").await.unwrap().unwrap();
    assert!((budget.remaining.unwrap() - 9.95).abs() < 1e-9);
    assert_eq!(store.records(Some("alice")).await.unwrap().len(), 50);
}

#[tokio::test]
async fn test_memory_store_concurrent_commits() {
    concurrent_commits_lose_nothing(Arc::new(MemoryUsageStore::new())).await;
}

#[tokio::test]
async fn test_jsonl_store_concurrent_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlUsageStore::open(dir.path().to_path_buf()).await.unwrap();
    concurrent_commits_lose_nothing(Arc::new(store)).await;
}

#[tokio::test]
async fn test_jsonl_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = JsonlUsageStore::open(dir.path().to_path_buf()).await.unwrap();
        store.ensure_user("bob", Some(1.0)).await.unwrap();
        store.ensure_user("carol", None).await.unwrap();
        let meter = UsageMeter::new(Arc::new(store));
        meter
            .record_inference("bob", "m", &usage(250_000), &pricing(), 0.05)
            .await
            .unwrap();
    }

    assert!(dir.path().join("usage.jsonl").exists());
    assert!(!dir.path().join("budgets.json.tmp").exists());

    let store = JsonlUsageStore::open(dir.path().to_path_buf()).await.unwrap();
    let bob = store.budget("bob").await.unwrap().unwrap();
    assert!((bob.remaining.unwrap() - 0.70).abs() < 1e-9);
    let carol = store.budget("carol").await.unwrap().unwrap();
    assert_eq!(carol.budget, None);

    let records = store.records(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!((records[0].guardrail_cost - 0.05).abs() < 1e-12);

    let reset = store.reset("bob").await.unwrap();
    assert_eq!(reset.remaining, Some(1.0));
}

#[tokio::test]
async fn test_remaining_floors_at_zero() {
    let store = Arc::new(MemoryUsageStore::new());
    store.set_budget("dave", Some(0.0005)).await.unwrap();
    let meter = UsageMeter::new(store.clone());

    let charge = meter
        .record_inference("dave", "m", &usage(10_000), &pricing(), 0.0)
        .await
        .unwrap();
    assert!((charge.record.cost - 0.01).abs() < 1e-12);
    assert_eq!(charge.budget.remaining, Some(0.0));
}

#[tokio::test]
async fn test_jsonl_failed_budget_write_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlUsageStore::open(dir.path().to_path_buf()).await.unwrap());
    store.ensure_user("erin", Some(1.0)).await.unwrap();
    let meter = UsageMeter::new(store.clone());

    // A directory in place of the temp file makes the budget write fail.
    let blocker = dir.path().join("budgets.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    let err = meter
        .record_inference("erin", "m", &usage(100_000), &pricing(), 0.0)
        .await;
    assert!(err.is_err());
    assert!(store.records(Some("erin")).await.unwrap().is_empty());
    assert_eq!(store.budget("erin").await.unwrap().unwrap().remaining, Some(1.0));

    std::fs::remove_dir(&blocker).unwrap();
    meter
        .record_inference("erin", "m", &usage(100_000), &pricing(), 0.0)
        .await
        .unwrap();
    assert_eq!(store.records(Some("erin")).await.unwrap().len(), 1);
    let reopened = JsonlUsageStore::open(dir.path().to_path_buf()).await.unwrap();
    let erin = reopened.budget("erin").await.unwrap().unwrap();
    assert!((erin.remaining.unwrap() - 0.9).abs() < 1e-9);
}
