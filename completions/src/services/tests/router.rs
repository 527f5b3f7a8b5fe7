//! Tests for the primary/secondary router

use std::sync::Arc;
use std::time::Duration;

use shared::{
    ApiFailure, InMemoryStore, KeyValueStore, ManualClock, MockKeyValueStore, Priority, ProviderId, StoreError,
};
use tokio::time::Instant;

use super::{ok_response, request, scripted_client};
use crate::config::{KeyPoolConfig, RouterConfig};
use crate::services::key_pool::KeyPool;
use crate::services::router::{PrimaryProvider, ProviderRouter, PENDING_MARKER};
use crate::traits::MockChatClient;
use crate::types::QueuedRequest;

const PRIMARY_KEY: &str = "primary-key";

fn untouched_client() -> MockChatClient {
    let mut client = MockChatClient::new();
    client.expect_chat().never();
    client
}

fn build_router(
    primary: Option<MockChatClient>,
    secondary: MockChatClient,
    store: Arc<dyn KeyValueStore>,
    config: RouterConfig,
) -> ProviderRouter {
    let clock = Arc::new(ManualClock::default());
    let pool = KeyPool::new(
        vec!["secondary-key".to_string()],
        Arc::new(secondary),
        "secondary-model",
        KeyPoolConfig::default(),
        clock.clone(),
    )
    .unwrap();
    let primary = primary.map(|client| PrimaryProvider::new(Arc::new(client), PRIMARY_KEY, "primary-model"));
    ProviderRouter::new(primary, Arc::new(pool), store, config, clock)
}

#[tokio::test]
async fn test_fast_path_uses_primary() {
    let (primary, _calls) = scripted_client(vec![]);
    let store = Arc::new(InMemoryStore::new());
    let router = build_router(Some(primary), untouched_client(), store.clone(), RouterConfig::default());

    let result = router.complete(request("fast")).await;

    assert!(result.success);
    assert_eq!(result.provider, ProviderId::Primary);
    assert_eq!(result.retry_count, 0);
    assert_eq!(store.scard("primary:processing").await.unwrap(), 0);
}

#[tokio::test]
async fn test_without_primary_everything_goes_to_pool() {
    let (secondary, calls) = scripted_client(vec![]);
    let router = build_router(None, secondary, Arc::new(InMemoryStore::new()), RouterConfig::default());

    let result = router.complete(request("no-primary")).await;

    assert!(result.success);
    assert_eq!(result.provider, ProviderId::Secondary);
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(!router.is_primary_available().await);
}

#[tokio::test]
async fn test_busy_queue_bypasses_primary() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..20 {
        store.zadd("primary:queue", i as f64, &format!("queued-{i}")).await.unwrap();
    }
    let (secondary, _calls) = scripted_client(vec![]);
    let router = build_router(Some(untouched_client()), secondary, store, RouterConfig::default());

    let stats = router.queue_stats().await;
    assert_eq!(stats.queued, 20);
    assert!(stats.is_busy);

    let result = router.complete(request("busy")).await;
    assert_eq!(result.provider, ProviderId::Secondary);
    assert!(result.success);
}

#[tokio::test]
async fn test_store_failure_counts_as_busy() {
    let mut store = MockKeyValueStore::new();
    store
        .expect_zcard()
        .returning(|_| Err(StoreError::Connection { message: "refused".into() }));
    store.expect_scard().returning(|_| Ok(0));

    let (secondary, _calls) = scripted_client(vec![]);
    let router = build_router(Some(untouched_client()), secondary, Arc::new(store), RouterConfig::default());

    assert!(router.queue_stats().await.is_busy);
    let result = router.complete(request("store-down")).await;
    assert_eq!(result.provider, ProviderId::Secondary);
}

#[tokio::test]
async fn test_non_retryable_primary_failure_falls_back_immediately() {
    let (primary, _) = scripted_client(vec![(PRIMARY_KEY, vec![Err(ApiFailure::InvalidRequest("bad".into()))])]);
    let (secondary, _) = scripted_client(vec![]);
    let store = Arc::new(InMemoryStore::new());
    let router = build_router(Some(primary), secondary, store.clone(), RouterConfig::default());

    let result = router.complete(request("invalid")).await;

    assert_eq!(result.provider, ProviderId::Secondary);
    assert_eq!(result.retry_count, 1);
    assert_eq!(store.zcard("primary:queue").await.unwrap(), 0);
}

#[tokio::test]
async fn test_secondary_ignores_model_override() {
    let mut secondary = MockChatClient::new();
    secondary
        .expect_chat()
        .withf(|_, req| req.model.as_deref() == Some("secondary-model"))
        .times(1)
        .returning(|_, _| Err(ApiFailure::InvalidRequest("bad".into())));
    let router = build_router(None, secondary, Arc::new(InMemoryStore::new()), RouterConfig::default());

    let result = router.complete(request("override").with_model("primary-only")).await;

    assert!(!result.success);
    assert_eq!(result.provider, ProviderId::Secondary);
    assert_eq!(result.model, "secondary-model");
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_served_from_queue() {
    let (primary, calls) = scripted_client(vec![(PRIMARY_KEY, vec![Err(ApiFailure::ServiceUnavailable)])]);
    let store = Arc::new(InMemoryStore::new());
    let router = build_router(Some(primary), untouched_client(), store.clone(), RouterConfig::default());
    router.start().await;

    let req = request("deferred");
    let result_key = format!("primary:result:{}", req.id);
    let result = router.complete(req).await;

    assert!(result.success);
    assert_eq!(result.provider, ProviderId::Primary);
    assert_eq!(result.retry_count, 1);
    assert_eq!(calls.lock().unwrap().len(), 2);
    assert_eq!(store.zcard("primary:queue").await.unwrap(), 0);
    assert_eq!(store.get(&result_key).await.unwrap(), None);

    router.stop().await;
    assert!(!router.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_queue_wait_ceiling_falls_back_and_withdraws_entry() {
    let (primary, _) = scripted_client(vec![(PRIMARY_KEY, vec![Err(ApiFailure::NetworkTimeout)])]);
    let (secondary, _) = scripted_client(vec![]);
    let store = Arc::new(InMemoryStore::new());
    // Processor never started, so nothing drains the queue
    let router = build_router(Some(primary), secondary, store.clone(), RouterConfig::default());

    let started = Instant::now();
    let result = router.complete(request("stuck")).await;

    assert_eq!(result.provider, ProviderId::Secondary);
    assert!(result.success);
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert!(started.elapsed() < Duration::from_secs(121));
    assert_eq!(store.zcard("primary:queue").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_queued_failure_is_requeued() {
    let down = vec![Err(ApiFailure::ServiceUnavailable); 2];
    let (primary, calls) = scripted_client(vec![(PRIMARY_KEY, down)]);
    let store = Arc::new(InMemoryStore::new());
    let router = build_router(Some(primary), untouched_client(), store.clone(), RouterConfig::default());
    router.start().await;

    let result = router.complete(request("second-chance")).await;

    assert!(result.success);
    assert_eq!(result.provider, ProviderId::Primary);
    assert_eq!(result.retry_count, 2);
    assert_eq!(calls.lock().unwrap().len(), 3);
    assert_eq!(store.zcard("primary:queue").await.unwrap(), 0);

    router.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_deferred_result_falls_back() {
    let down = vec![Err(ApiFailure::ServiceUnavailable); 3];
    let (primary, primary_calls) = scripted_client(vec![(PRIMARY_KEY, down)]);
    let (secondary, secondary_calls) = scripted_client(vec![]);
    let router = build_router(Some(primary), secondary, Arc::new(InMemoryStore::new()), RouterConfig::default());
    router.start().await;

    let started = Instant::now();
    let result = router.complete(request("triple-fault")).await;

    assert!(result.success);
    assert_eq!(result.provider, ProviderId::Secondary);
    assert_eq!(result.retry_count, 3);
    assert_eq!(primary_calls.lock().unwrap().len(), 3);
    assert_eq!(secondary_calls.lock().unwrap().len(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));

    router.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_deferred_attempt_is_not_requeued() {
    let down = vec![Err(ApiFailure::ServiceUnavailable); 2];
    let (primary, primary_calls) = scripted_client(vec![(PRIMARY_KEY, down)]);
    let (secondary, secondary_calls) = scripted_client(vec![]);
    let config = RouterConfig {
        primary_max_retries: 1,
        ..RouterConfig::default()
    };
    let router = build_router(Some(primary), secondary, Arc::new(InMemoryStore::new()), config);
    router.start().await;

    let result = router.complete(request("double-fault")).await;

    assert_eq!(result.provider, ProviderId::Secondary);
    assert_eq!(result.retry_count, 2);
    assert_eq!(primary_calls.lock().unwrap().len(), 2);
    assert_eq!(secondary_calls.lock().unwrap().len(), 1);

    router.stop().await;
}

#[tokio::test]
async fn test_batch_claims_highest_priority_first() {
    let store = Arc::new(InMemoryStore::new());
    let (primary, _) = scripted_client(vec![]);
    let config = RouterConfig {
        batch_size: 1,
        ..RouterConfig::default()
    };
    let router = build_router(Some(primary), untouched_client(), store.clone(), config.clone());

    let low = request("low").with_priority(Priority::new(1));
    let high = request("high").with_priority(Priority::new(9));
    for req in [&low, &high] {
        let entry = QueuedRequest {
            request: req.clone(),
            retry_count: 1,
            enqueued_at_ms: 1_000,
        };
        let score = req.priority.queue_score(entry.enqueued_at_ms, config.priority_weight_ms);
        store.set_ex(&config.result_key(&req.id), PENDING_MARKER, config.result_ttl).await.unwrap();
        store
            .zadd(&config.queue_key, score, &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
    }

    let processed = router.process_queue_batch().await.unwrap();

    assert_eq!(processed, 1);
    let high_result = store.get(&config.result_key(&high.id)).await.unwrap().unwrap();
    assert_ne!(high_result, PENDING_MARKER);
    assert_eq!(
        store.get(&config.result_key(&low.id)).await.unwrap().as_deref(),
        Some(PENDING_MARKER)
    );
    assert_eq!(store.zcard(&config.queue_key).await.unwrap(), 1);
}

#[tokio::test]
async fn test_malformed_queue_entry_is_dropped() {
    let store = Arc::new(InMemoryStore::new());
    store.zadd("primary:queue", 1.0, "not json").await.unwrap();
    let router = build_router(Some(untouched_client()), untouched_client(), store.clone(), RouterConfig::default());

    assert_eq!(router.process_queue_batch().await.unwrap(), 0);
    assert_eq!(store.zcard("primary:queue").await.unwrap(), 0);
}

#[tokio::test]
async fn test_complete_many_keeps_input_order() {
    let (primary, _) = scripted_client(vec![]);
    let router = build_router(Some(primary), untouched_client(), Arc::new(InMemoryStore::new()), RouterConfig::default());

    let requests: Vec<_> = (0..3).map(|i| request(&format!("batch-{i}"))).collect();
    let ids: Vec<_> = requests.iter().map(|r| r.id.clone()).collect();
    let results = router.complete_many(requests).await;

    assert_eq!(results.iter().map(|r| r.request_id.clone()).collect::<Vec<_>>(), ids);
    assert!(results.iter().all(|r| r.provider == ProviderId::Primary));
}

#[tokio::test]
async fn test_clear_queue_resets_depth() {
    let store = Arc::new(InMemoryStore::new());
    store.zadd("primary:queue", 1.0, "a").await.unwrap();
    store.sadd("primary:processing", "b").await.unwrap();
    let router = build_router(Some(untouched_client()), untouched_client(), store, RouterConfig::default());

    router.clear_queue().await.unwrap();

    assert_eq!(router.queue_stats().await.total, 0);
    assert!(router.is_primary_available().await);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let router = build_router(
        Some(untouched_client()),
        untouched_client(),
        Arc::new(InMemoryStore::new()),
        RouterConfig::default(),
    );

    router.start().await;
    router.start().await;
    assert!(router.is_running().await);

    router.stop().await;
    router.stop().await;
    assert!(!router.is_running().await);
}

#[tokio::test]
async fn test_pool_result_reports_secondary_usage() {
    let (secondary, _) = scripted_client(vec![("secondary-key", vec![Ok(ok_response("pooled"))])]);
    let router = build_router(None, secondary, Arc::new(InMemoryStore::new()), RouterConfig::default());

    let result = router.complete(request("usage")).await;

    assert_eq!(result.content, "pooled");
    assert_eq!(result.usage.unwrap().total(), 15);
    assert_eq!(router.pool().stats().await.available_keys, 1);
}
