use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use preview_core::qr::{generate_qr_code, CacheKey, MemoryQrCache, QrCacheStore, QrFormat, QrOptions};
use preview_core::store::Store;
use preview_core::task::Task;
use preview_core::types::{ContainerStatus, Platform, ResourceUsage};
use preview_core::container::{ProvisionedIds, RemoteContainer};
use preview_provider::{HttpContainerClient, HttpTimeouts, LogQuery, MemoryContainerClient, ProviderError};
use tokio::sync::Notify;

use super::*;

fn settings() -> LifecycleSettings {
    LifecycleSettings {
        monitor_backoff: Duration::from_millis(1),
        monitor_max_retries: 3,
        poll_interval: Duration::from_millis(20),
        ..LifecycleSettings::default()
    }
}

struct Harness {
    store: Arc<Store>,
    client: MemoryContainerClient,
    cache: Arc<MemoryQrCache>,
    service: LifecycleService,
}

fn harness_with(store: Arc<Store>, client: MemoryContainerClient) -> Harness {
    harness_with_settings(store, client, settings())
}

fn harness_with_settings(
    store: Arc<Store>,
    client: MemoryContainerClient,
    settings: LifecycleSettings,
) -> Harness {
    let cache = Arc::new(MemoryQrCache::new());
    let service = LifecycleService::new(
        store.clone(),
        Arc::new(client.clone()),
        cache.clone(),
        settings,
    );
    Harness {
        store,
        client,
        cache,
        service,
    }
}

fn harness() -> Harness {
    harness_with(
        Arc::new(Store::open_in_memory().unwrap()),
        MemoryContainerClient::new(),
    )
}

fn seed(h: &Harness, id: &str, platform: Platform) {
    h.store.insert_task(&Task::new(id, "user-1", platform)).unwrap();
}

fn cache_something(h: &Harness, task_id: &str) -> CacheKey {
    let key = CacheKey::new(task_id, QrFormat::Svg, 256);
    let art = generate_qr_code("https://old.example.com", &QrOptions::default());
    h.cache.set(key.clone(), art, Duration::from_secs(60));
    key
}

#[tokio::test]
async fn provision_creates_running_container_and_invalidates_cache() {
    let h = harness();
    seed(&h, "task-123", Platform::Mobile);
    let key = cache_something(&h, "task-123");

    let p = h
        .service
        .provision_container("task-123", "user-1", false)
        .await
        .unwrap();
    assert!(!p.reused);
    assert_eq!(p.status, ContainerStatus::Running);
    assert!(p.metro_url.starts_with("https://"));
    assert!(h.cache.get(&key).is_none());

    let row = h.store.get_container(p.db_id).unwrap().unwrap();
    assert_eq!(row.container_id, p.container_id);
    assert_eq!(row.status, ContainerStatus::Running);
}

#[tokio::test]
async fn second_provision_returns_same_container() {
    let h = harness();
    seed(&h, "task-1", Platform::Ios);
    let first = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    let second = h.service.provision_container("task-1", "user-1", false).await.unwrap();

    assert_eq!(first.container_id, second.container_id);
    assert!(second.reused);
    assert_eq!(h.client.create_calls().await, 1);
    assert_eq!(h.store.list_containers().unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_provisions_create_one_container() {
    let h = harness();
    seed(&h, "task-1", Platform::Android);
    let (a, b) = tokio::join!(
        h.service.provision_container("task-1", "user-1", false),
        h.service.provision_container("task-1", "user-1", false),
    );
    assert_eq!(a.unwrap().container_id, b.unwrap().container_id);
    assert_eq!(h.client.create_calls().await, 1);
}

#[tokio::test]
async fn web_task_is_rejected() {
    let h = harness();
    seed(&h, "task-web", Platform::Web);
    let err = h
        .service
        .provision_container("task-web", "user-1", false)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotMobile { .. }));
    assert_eq!(h.client.create_calls().await, 0);
}

#[tokio::test]
async fn unknown_or_foreign_task_is_not_found() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    assert!(matches!(
        h.service.provision_container("task-9", "user-1", false).await,
        Err(LifecycleError::TaskNotFound(_))
    ));
    assert!(matches!(
        h.service.provision_container("task-1", "user-2", false).await,
        Err(LifecycleError::TaskNotFound(_))
    ));
    assert!(h
        .service
        .provision_container("task-1", "user-2", true)
        .await
        .is_ok());
}

#[tokio::test]
async fn provider_failure_leaves_no_row() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    h.client
        .fail_next_create(ProviderError::QuotaExceeded("limit".into()))
        .await;

    let err = h
        .service
        .provision_container("task-1", "user-1", false)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ProvisioningFailed { .. }));
    assert_eq!(err.to_string(), PROVISION_FAILED_MESSAGE);
    assert!(h.store.list_containers().unwrap().is_empty());
    assert!(h.store.pending_candidates().unwrap().is_empty());
}

#[tokio::test]
async fn ambiguous_create_is_reconciled() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    h.client.ambiguous_next_create().await;

    let err = h
        .service
        .provision_container("task-1", "user-1", false)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Ambiguous { .. }));
    assert_eq!(h.store.pending_candidates().unwrap().len(), 1);
    assert_eq!(h.client.live_count().await, 1);

    let report = h.service.reconcile().await.unwrap();
    assert_eq!(report.orphans_stopped.len(), 1);
    assert_eq!(report.candidates_resolved, 1);
    assert!(report.errors.is_empty());
    assert_eq!(h.client.live_count().await, 0);
    assert!(h.store.pending_candidates().unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_leaves_claimed_containers_alone() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    h.service.provision_container("task-1", "user-1", false).await.unwrap();

    let report = h.service.reconcile().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(h.client.live_count().await, 1);
}

#[tokio::test]
async fn reconcile_marks_rows_missing_from_provider() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    h.client.reap(&p.container_id).await;

    let report = h.service.reconcile().await.unwrap();
    assert_eq!(report.rows_marked_stopped, vec![p.container_id.clone()]);
    let row = h.store.get_container(p.db_id).unwrap().unwrap();
    assert_eq!(row.status, ContainerStatus::Stopped);
}

#[tokio::test]
async fn reconcile_spares_container_of_in_flight_provision() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    h.client.delay_next_create(Duration::from_millis(200)).await;

    let (provisioned, report) = tokio::join!(
        h.service.provision_container("task-1", "user-1", false),
        async {
            // The container is listed before its create call returns.
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.service.reconcile().await
        }
    );
    let report = report.unwrap();
    assert!(report.orphans_stopped.is_empty());
    let p = provisioned.unwrap();
    assert_eq!(p.status, ContainerStatus::Running);
    assert_eq!(h.client.status_of(&p.container_id).await, Some(ContainerStatus::Running));

    let report = h.service.reconcile().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(h.client.live_count().await, 1);
}

#[tokio::test]
async fn reconcile_keeps_row_whose_container_has_unknown_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/containers")
        .match_query(mockito::Matcher::UrlEncoded(
            "label".into(),
            preview_provider::TASK_LABEL.into(),
        ))
        .with_status(200)
        .with_body(
            r#"{"containers":[{"containerId":"c1","status":"restarting","labels":{"preview.task-id":"task-1"}}]}"#,
        )
        .create_async()
        .await;

    let timeouts = HttpTimeouts {
        create: Duration::from_millis(500),
        request: Duration::from_millis(500),
        status: Duration::from_millis(500),
        logs: Duration::from_millis(500),
    };
    let client = HttpContainerClient::new(&server.url(), None, timeouts).unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    store
        .insert_task(&Task::new("task-1", "user-1", Platform::Mobile))
        .unwrap();
    let row = RemoteContainer::provisioning(
        "task-1",
        "user-1",
        ProvisionedIds {
            container_id: "c1".into(),
            metro_url: "https://c1.up.railway.app".into(),
            project_id: None,
            service_id: None,
        },
    );
    store.insert_container(&row).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let service = LifecycleService::new(
        store.clone(),
        Arc::new(client),
        Arc::new(MemoryQrCache::new()),
        settings(),
    );
    let report = service.reconcile().await.unwrap();
    assert!(report.is_clean());
    let row = store.get_container(row.id).unwrap().unwrap();
    assert_eq!(row.status, ContainerStatus::Provisioning);
}

#[tokio::test]
async fn reaped_container_is_replaced_on_next_provision() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let first = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    h.client.reap(&first.container_id).await;

    let second = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    assert_ne!(first.container_id, second.container_id);
    assert!(!second.reused);

    let old = h.store.get_container(first.db_id).unwrap().unwrap();
    assert_eq!(old.status, ContainerStatus::Stopped);
    assert_eq!(old.status_reason.as_deref(), Some("reaped by provider"));
}

#[tokio::test]
async fn unverifiable_existing_container_is_returned_not_duplicated() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let first = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    h.client.fail_status(&first.container_id, 1).await;

    let second = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    assert_eq!(second.container_id, first.container_id);
    assert!(second.reused);
    assert_eq!(h.client.create_calls().await, 1);
}

#[tokio::test]
async fn monitor_reports_resource_usage() {
    let h = harness();
    seed(&h, "task-123", Platform::Mobile);
    let p = h.service.provision_container("task-123", "user-1", false).await.unwrap();
    h.client
        .set_resource_usage(
            &p.container_id,
            ResourceUsage {
                cpu: 45.0,
                ram: 512.0,
                network: 0.0,
            },
        )
        .await;

    let snap = h.service.monitor_container(&p.container_id).await.unwrap();
    assert_eq!(snap.status, ContainerStatus::Running);
    assert_eq!(snap.resource_usage.cpu, 45.0);
    assert_eq!(snap.resource_usage.ram, 512.0);
}

#[tokio::test]
async fn monitor_not_found_marks_row_stopped_without_error() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    let key = cache_something(&h, "task-1");
    h.client.reap(&p.container_id).await;

    let snap = h.service.monitor_container(&p.container_id).await.unwrap();
    assert_eq!(snap.status, ContainerStatus::Stopped);
    assert_eq!(snap.reason.as_deref(), Some("reaped by provider"));
    assert!(h.cache.get(&key).is_none());
}

#[tokio::test]
async fn monitor_retries_transient_errors() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    h.client.fail_status(&p.container_id, 2).await;

    let snap = h.service.monitor_container(&p.container_id).await.unwrap();
    assert_eq!(snap.status, ContainerStatus::Running);
}

#[tokio::test]
async fn monitor_gives_up_and_leaves_row_untouched() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    let before = h.store.get_container(p.db_id).unwrap().unwrap();
    h.client.fail_status(&p.container_id, 10).await;

    let err = h.service.monitor_container(&p.container_id).await.unwrap_err();
    match err {
        LifecycleError::Monitoring { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected Monitoring, got {other:?}"),
    }
    let after = h.store.get_container(p.db_id).unwrap().unwrap();
    assert_eq!(before, after);
}

#[test]
fn retry_backoff_doubles_up_to_a_cap() {
    use super::monitor::next_backoff;
    assert_eq!(next_backoff(Duration::from_millis(500)), Duration::from_secs(1));
    assert_eq!(next_backoff(Duration::from_secs(20)), Duration::from_secs(30));
    assert_eq!(next_backoff(Duration::MAX), Duration::from_secs(30));
}

#[tokio::test]
async fn terminal_row_answers_without_provider() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    h.service.stop_container(&p.container_id, "user request").await.unwrap();
    h.client.fail_status(&p.container_id, 100).await;

    let snap = h.service.monitor_container(&p.container_id).await.unwrap();
    assert_eq!(snap.status, ContainerStatus::Stopped);
    assert_eq!(snap.reason.as_deref(), Some("user request"));
}

#[tokio::test]
async fn unknown_container_id_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.service.monitor_container("nope").await,
        Err(LifecycleError::ContainerNotFound(_))
    ));
}

#[tokio::test]
async fn idle_container_is_stopped_by_sweep() {
    let h = harness_with_settings(
        Arc::new(Store::open_in_memory().unwrap()),
        MemoryContainerClient::new(),
        LifecycleSettings {
            idle_timeout: Duration::from_millis(100),
            ..settings()
        },
    );
    seed(&h, "task-1", Platform::Mobile);
    seed(&h, "task-2", Platform::Mobile);
    let idle = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    let busy = h.service.provision_container("task-2", "user-1", false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.client.set_last_activity(&busy.container_id, Utc::now()).await;
    h.service.monitor_all().await.unwrap();

    let stopped = h.service.sweep_idle().await.unwrap();
    assert_eq!(stopped, vec![idle.container_id.clone()]);
    assert_eq!(
        h.client.status_of(&idle.container_id).await,
        Some(ContainerStatus::Stopped)
    );
    assert_eq!(
        h.client.status_of(&busy.container_id).await,
        Some(ContainerStatus::Running)
    );
    let row = h.store.get_container(idle.db_id).unwrap().unwrap();
    assert_eq!(row.status_reason.as_deref(), Some("idle timeout"));
}

#[tokio::test]
async fn teardown_stops_active_container() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();

    let snap = h.service.teardown_task("task-1").await.unwrap().unwrap();
    assert_eq!(snap.status, ContainerStatus::Stopped);
    assert!(h.service.teardown_task("task-1").await.unwrap().is_none());
    assert_eq!(h.client.live_count().await, 0);
    assert!(h.store.active_container_for_task("task-1").unwrap().is_none());
    assert_eq!(
        h.store.get_container(p.db_id).unwrap().unwrap().status_reason.as_deref(),
        Some("task deleted")
    );
}

#[tokio::test]
async fn delete_during_create_leaves_no_live_container() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    h.client.delay_next_create(Duration::from_millis(200)).await;

    let (provisioned, torn_down) = tokio::join!(
        h.service.provision_container("task-1", "user-1", false),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.store.soft_delete_task("task-1", "user-1", false).unwrap();
            h.service.teardown_task("task-1").await
        }
    );
    assert!(matches!(provisioned, Err(LifecycleError::TaskNotFound(_))));
    assert!(torn_down.unwrap().is_none());
    assert_eq!(h.client.create_calls().await, 1);
    assert_eq!(h.client.live_count().await, 0);
    assert!(h.store.active_container_for_task("task-1").unwrap().is_none());
}

#[tokio::test]
async fn container_failing_at_start_is_a_provisioning_error() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    h.client.crash_next_start().await;

    let err = h
        .service
        .provision_container("task-1", "user-1", false)
        .await
        .unwrap_err();
    match err {
        LifecycleError::StartFailed { status, .. } => assert_eq!(status, ContainerStatus::Error),
        other => panic!("expected StartFailed, got {other:?}"),
    }
    assert!(h.store.active_container_for_task("task-1").unwrap().is_none());

    // The next attempt provisions a fresh container.
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();
    assert_eq!(p.status, ContainerStatus::Running);
    assert_eq!(h.client.create_calls().await, 2);
}

#[tokio::test]
async fn logs_for_reaped_container_are_empty() {
    let h = harness();
    seed(&h, "task-1", Platform::Mobile);
    let p = h.service.provision_container("task-1", "user-1", false).await.unwrap();

    let page = h
        .service
        .container_logs("task-1", "user-1", false, LogQuery::default())
        .await
        .unwrap();
    assert!(!page.logs.is_empty());

    h.client.reap(&p.container_id).await;
    let page = h
        .service
        .container_logs("task-1", "user-1", false, LogQuery::default())
        .await
        .unwrap();
    assert!(page.logs.is_empty());
}

#[tokio::test]
async fn monitoring_resumes_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("preview.db");
    let client = MemoryContainerClient::new();

    let container_id = {
        let h = harness_with(Arc::new(Store::open(&path).unwrap()), client.clone());
        seed(&h, "task-1", Platform::Mobile);
        h.service
            .provision_container("task-1", "user-1", false)
            .await
            .unwrap()
            .container_id
    };

    // Fresh process: only the stored provider id survives.
    let h = harness_with(Arc::new(Store::open(&path).unwrap()), client.clone());
    client.reap(&container_id).await;
    assert_eq!(h.service.resume().await.unwrap(), 1);
    let row = h.store.find_by_container_id(&container_id).unwrap().unwrap();
    assert_eq!(row.status, ContainerStatus::Stopped);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let h = harness();
    let service = Arc::new(h.service);
    let shutdown = Arc::new(Notify::new());
    let handle = tokio::spawn(service.clone().run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
