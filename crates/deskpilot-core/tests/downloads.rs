//! Artifact download state machine against the in-memory model service.

use std::sync::Arc;
use std::time::Duration;

use deskpilot_core::{
    ArtifactState, ArtifactStatus, Broadcaster, DownloadError, DownloadManager, DownloadTicket,
    Subscription, UNHEALTHY_MESSAGE,
};
use deskpilot_engine::fakes::MemoryModelService;
use deskpilot_engine::{EngineError, PullProgress};

const THROTTLE: Duration = Duration::from_secs(1);

fn manager(service: &MemoryModelService) -> DownloadManager {
    DownloadManager::new(Arc::new(service.clone()), Broadcaster::new(1024), THROTTLE)
}

async fn until_terminal(sub: &mut Subscription<ArtifactState>) -> Vec<ArtifactState> {
    let mut seen = Vec::new();
    while let Some(state) = sub.recv().await {
        let terminal = state.status.is_terminal();
        seen.push(state);
        if terminal {
            break;
        }
    }
    seen
}

#[tokio::test]
async fn test_status_resolves_against_installed_list() {
    let service = MemoryModelService::new().with_installed(&["llama3:latest"]);
    let downloads = manager(&service);

    let ready = downloads.status("llama3").await.unwrap();
    assert_eq!(ready.status, ArtifactStatus::Ready);
    assert_eq!(ready.progress, 100);

    let missing = downloads.status("demo-model").await.unwrap();
    assert_eq!(missing.status, ArtifactStatus::NotDownloaded);
    assert_eq!(missing.progress, 0);

    let names: Vec<String> = downloads.list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["demo-model", "llama3"]);
}

#[tokio::test]
async fn test_empty_name_is_rejected() {
    let downloads = manager(&MemoryModelService::new());
    assert!(matches!(
        downloads.request_download(" ").await.unwrap_err(),
        DownloadError::InvalidName(_)
    ));
    assert!(downloads.status("").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_demo_model_downloads_to_ready() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_millis(100));
    let downloads = manager(&service);

    let initial = downloads.status("demo-model").await.unwrap();
    assert_eq!(initial.status, ArtifactStatus::NotDownloaded);

    let mut sub = downloads.subscribe("demo-model");
    let ticket = downloads.request_download("demo-model").await.unwrap();
    assert_eq!(ticket, DownloadTicket::Started);

    let events = until_terminal(&mut sub).await;
    assert_eq!(events.first().unwrap().status, ArtifactStatus::Downloading);
    let last = events.last().unwrap();
    assert_eq!(last.status, ArtifactStatus::Ready);
    assert_eq!(last.progress, 100);
    assert_eq!(events.iter().filter(|e| e.status.is_terminal()).count(), 1);

    // Revisions strictly increase along the stream.
    assert!(events.windows(2).all(|w| w[0].revision < w[1].revision));

    assert!(service.is_installed("demo-model"));
    assert_eq!(service.pull_count("demo-model"), 1);

    let again = downloads.request_download("demo-model").await.unwrap();
    assert_eq!(again, DownloadTicket::AlreadyReady);
    assert_eq!(service.pull_count("demo-model"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_open_one_feed() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_millis(50));
    let downloads = manager(&service);

    let (a, b) = tokio::join!(
        downloads.request_download("demo-model"),
        downloads.request_download("demo-model"),
    );
    let mut tickets = vec![a.unwrap(), b.unwrap()];
    tickets.sort_by_key(|t| *t != DownloadTicket::Started);
    assert_eq!(
        tickets,
        vec![DownloadTicket::Started, DownloadTicket::AlreadyInProgress]
    );

    let (x, y) = tokio::join!(
        downloads.wait_terminal("demo-model"),
        downloads.wait_terminal("demo-model"),
    );
    assert_eq!(x.unwrap().status, ArtifactStatus::Ready);
    assert_eq!(y.unwrap().status, ArtifactStatus::Ready);
    assert_eq!(service.pull_count("demo-model"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_progress_burst_is_throttled() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_millis(1));
    let mut script: Vec<_> = (1..=100u64)
        .map(|i| Ok(PullProgress::downloading(i, 100)))
        .collect();
    script.push(Ok(PullProgress::success()));
    service.script_pull("burst", script, false);
    let downloads = manager(&service);

    let mut sub = downloads.subscribe("burst");
    downloads.request_download("burst").await.unwrap();
    let events = until_terminal(&mut sub).await;

    // First event is the transition into `downloading`; the rest of the
    // non-terminal events are throttled progress updates.
    let progress_updates = events
        .iter()
        .skip(1)
        .filter(|e| e.status == ArtifactStatus::Downloading)
        .count();
    assert!(
        progress_updates <= 2,
        "expected at most 2 progress updates in a 100ms burst, got {progress_updates}"
    );
    assert_eq!(events.iter().filter(|e| e.status.is_terminal()).count(), 1);
    assert_eq!(events.last().unwrap().status, ArtifactStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_progress_never_moves_backwards() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_secs(2));
    service.script_pull(
        "layered",
        vec![
            Ok(PullProgress::downloading(60, 100)),
            // A second layer restarts its own counters.
            Ok(PullProgress::downloading(10, 100)),
            Ok(PullProgress::downloading(80, 100)),
            Ok(PullProgress::success()),
        ],
        false,
    );
    let downloads = manager(&service);

    let mut sub = downloads.subscribe("layered");
    downloads.request_download("layered").await.unwrap();
    let events = until_terminal(&mut sub).await;

    let percents: Vec<u8> = events.iter().map(|e| e.progress).collect();
    assert!(
        percents.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {percents:?}"
    );
    assert!(percents.contains(&60));
    assert!(percents.contains(&80));
}

#[tokio::test(start_paused = true)]
async fn test_byte_counts_follow_the_reported_percent() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_secs(2));
    service.script_pull(
        "layered",
        vec![
            Ok(PullProgress::downloading(600, 1000)),
            // A small second layer at a lower percent.
            Ok(PullProgress::downloading(5, 50)),
            Ok(PullProgress::success()),
        ],
        false,
    );
    let downloads = manager(&service);

    let mut sub = downloads.subscribe("layered");
    downloads.request_download("layered").await.unwrap();
    let events = until_terminal(&mut sub).await;

    for state in events.iter().filter(|s| s.status == ArtifactStatus::Downloading) {
        if let (Some(done), Some(total)) = (state.downloaded_bytes, state.total_bytes) {
            assert_eq!(
                (done * 100 / total) as u8,
                state.progress,
                "bytes disagree with percent: {state:?}"
            );
        }
    }
    let before_terminal = &events[events.len() - 2];
    assert_eq!(before_terminal.progress, 60);
    assert_eq!(before_terminal.downloaded_bytes, Some(600));
    assert_eq!(before_terminal.total_bytes, Some(1000));
}

#[tokio::test]
async fn test_error_record_fails_download() {
    let service = MemoryModelService::new();
    service.script_pull(
        "broken",
        vec![
            Ok(PullProgress::status("pulling manifest")),
            Ok(PullProgress::failed("pull model manifest: file does not exist")),
        ],
        false,
    );
    let downloads = manager(&service);

    downloads.request_download("broken").await.unwrap();
    let state = downloads.wait_terminal("broken").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::Error);
    assert_eq!(
        state.error.as_deref(),
        Some("pull model manifest: file does not exist")
    );

    // Errors are retryable.
    service.script_pull("broken", vec![Ok(PullProgress::success())], false);
    let ticket = downloads.request_download("broken").await.unwrap();
    assert_eq!(ticket, DownloadTicket::Started);
    let state = downloads.wait_terminal("broken").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::Ready);
}

#[tokio::test]
async fn test_feed_ending_without_success_is_an_error() {
    let service = MemoryModelService::new();
    service.script_pull("short", vec![Ok(PullProgress::downloading(5, 10))], false);
    let downloads = manager(&service);

    downloads.request_download("short").await.unwrap();
    let state = downloads.wait_terminal("short").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::Error);
    assert_eq!(state.error.as_deref(), Some("Download ended before completion"));
}

#[tokio::test]
async fn test_pull_open_failure_is_an_error() {
    let service = MemoryModelService::new();
    service.fail_pull_open(Some(EngineError::Unavailable("connection refused".into())));
    let downloads = manager(&service);

    downloads.request_download("demo-model").await.unwrap();
    let state = downloads.wait_terminal("demo-model").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::Error);
    assert!(state.error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_cancel_closes_feed_once() {
    let service = MemoryModelService::new();
    service.script_pull(
        "stalled",
        vec![Ok(PullProgress::downloading(1, 100))],
        true,
    );
    let downloads = manager(&service);

    downloads.request_download("stalled").await.unwrap();
    assert!(downloads.cancel("stalled"));
    assert!(!downloads.cancel("stalled"));

    let state = downloads.wait_terminal("stalled").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::Error);
    assert_eq!(state.error.as_deref(), Some("Download cancelled"));
    assert!(!downloads.cancel("stalled"));
}

#[tokio::test]
async fn test_shutdown_closes_every_feed() {
    let service = MemoryModelService::new();
    for name in ["a", "b"] {
        service.script_pull(name, vec![], true);
    }
    let downloads = manager(&service);
    downloads.request_download("a").await.unwrap();
    downloads.request_download("b").await.unwrap();

    downloads.shutdown();

    for name in ["a", "b"] {
        let state = downloads.wait_terminal(name).await.unwrap();
        assert_eq!(state.status, ArtifactStatus::Error);
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropping_observer_does_not_cancel_download() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_millis(100));
    let downloads = manager(&service);

    let sub = downloads.subscribe("demo-model");
    downloads.request_download("demo-model").await.unwrap();
    drop(sub);

    let state = downloads.wait_terminal("demo-model").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_service_marks_idle_artifacts_and_refuses_downloads() {
    let service = MemoryModelService::new().with_step_delay(Duration::from_millis(100));
    let downloads = manager(&service);

    downloads.status("idle-model").await.unwrap();
    downloads.request_download("busy-model").await.unwrap();

    service.set_healthy(false);
    assert!(!downloads.check_health().await);

    let idle = downloads.snapshot("idle-model").unwrap();
    assert_eq!(idle.status, ArtifactStatus::Error);
    assert_eq!(idle.error.as_deref(), Some(UNHEALTHY_MESSAGE));

    // In-flight downloads are left to finish.
    assert_eq!(
        downloads.snapshot("busy-model").unwrap().status,
        ArtifactStatus::Downloading
    );
    assert!(matches!(
        downloads.request_download("idle-model").await.unwrap_err(),
        DownloadError::ServiceUnhealthy
    ));
    let busy = downloads.wait_terminal("busy-model").await.unwrap();
    assert_eq!(busy.status, ArtifactStatus::Ready);

    service.set_healthy(true);
    assert!(downloads.check_health().await);
    let idle = downloads.recheck("idle-model").await.unwrap();
    assert_eq!(idle.status, ArtifactStatus::NotDownloaded);
}

#[tokio::test]
async fn test_refresh_marks_installed_artifacts_ready() {
    let service = MemoryModelService::new();
    let downloads = manager(&service);
    assert_eq!(
        downloads.status("phi3").await.unwrap().status,
        ArtifactStatus::NotDownloaded
    );

    // The fake shares its state across clones, so the manager sees this.
    let _service = service.with_installed(&["phi3:latest", "qwen2"]);
    let models = downloads.refresh().await.unwrap();
    assert_eq!(models.len(), 2);

    assert_eq!(downloads.snapshot("phi3").unwrap().status, ArtifactStatus::Ready);
    assert_eq!(
        downloads.snapshot("qwen2").map(|s| s.status),
        Some(ArtifactStatus::Ready)
    );
}

#[tokio::test]
async fn test_recheck_is_the_way_out_of_ready() {
    let service = MemoryModelService::new().with_installed(&["llama3"]);
    let downloads = manager(&service);
    assert_eq!(
        downloads.status("llama3").await.unwrap().status,
        ArtifactStatus::Ready
    );

    let _service = service.with_installed(&[]);
    assert_eq!(
        downloads.status("llama3").await.unwrap().status,
        ArtifactStatus::Ready
    );
    let state = downloads.recheck("llama3").await.unwrap();
    assert_eq!(state.status, ArtifactStatus::NotDownloaded);
}

#[tokio::test]
async fn test_reconcile_publishes_only_when_installation_flips() {
    let service = MemoryModelService::new();
    let downloads = manager(&service);
    let first = downloads.status("mistral").await.unwrap();
    assert_eq!(first.status, ArtifactStatus::NotDownloaded);

    let mut sub = downloads.subscribe("mistral");
    let quiet = downloads.reconcile("mistral").await.unwrap();
    assert_eq!(quiet.revision, first.revision);
    assert!(sub.try_recv().is_none());

    // Installed behind the manager's back.
    let service = service.with_installed(&["mistral:latest"]);
    let flipped = downloads.reconcile("mistral").await.unwrap();
    assert_eq!(flipped.status, ArtifactStatus::Ready);
    assert_eq!(sub.try_recv().map(|s| s.status), Some(ArtifactStatus::Ready));

    let _service = service.with_installed(&[]);
    let removed = downloads.reconcile("mistral").await.unwrap();
    assert_eq!(removed.status, ArtifactStatus::NotDownloaded);
    assert_eq!(removed.progress, 0);
}

#[tokio::test]
async fn test_reconcile_leaves_failed_download_alone() {
    let service = MemoryModelService::new();
    service.script_pull("broken", vec![Ok(PullProgress::failed("manifest unknown"))], false);
    let downloads = manager(&service);

    downloads.request_download("broken").await.unwrap();
    let failed = downloads.wait_terminal("broken").await.unwrap();
    assert_eq!(failed.status, ArtifactStatus::Error);

    let after = downloads.reconcile("broken").await.unwrap();
    assert_eq!(after.status, ArtifactStatus::Error);
    assert_eq!(after.revision, failed.revision);
}
