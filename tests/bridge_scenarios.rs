//! End-to-end scenarios for license gating, downloads and catalog sync
//!
//! Every test drives a `Runtime` against the simulated engine in manual mode,
//! pushing download states the way the native layer would.

use engine_bridge::config::SimulatedModel;
use engine_bridge::{
    DownloadError, LicenseError, LicenseStatus, ModelDownloadState, ModelRef, NativeEngine,
    Runtime, SessionError, SimulatedEngine,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

const TOTAL: u64 = 1000;

async fn activated_runtime(engine: &SimulatedEngine) -> Arc<Runtime> {
    let runtime = Runtime::start(Arc::new(engine.clone()));
    let status = runtime.activate("good-key").await.expect("activation call failed");
    assert_eq!(status, LicenseStatus::Activated);
    runtime
}

fn manual_engine() -> SimulatedEngine {
    SimulatedEngine::new()
        .with_valid_key("good-key")
        .with_local_model("m1", TOTAL)
        .with_local_model("m2", TOTAL)
        .with_cloud_model("cloud")
}

// =============================================================================
// Download progress
// =============================================================================

#[tokio::test]
async fn test_progress_sequence_completes_on_downloaded() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let handle = runtime.download_handle("m1");

    let mut progress = handle.progress();
    // Replay of the current state comes first
    let first = progress.next().await.unwrap().unwrap();
    assert_eq!(first.progress, 0.0);
    assert_eq!(first.total_bytes, Some(TOTAL));

    handle.start().unwrap();
    assert_eq!(engine.download_requests("m1"), 1);

    engine.emit_state("m1", ModelDownloadState::downloading(200, TOTAL));
    engine.emit_state("m1", ModelDownloadState::downloading(900, TOTAL));
    engine.emit_state("m1", ModelDownloadState::downloaded(TOTAL));

    let rest: Vec<f64> = progress
        .map(|update| update.unwrap().progress)
        .collect()
        .await;
    assert_eq!(rest, vec![0.2, 0.9, 1.0]);
    assert!(runtime.state("m1").is_downloaded());
}

#[tokio::test]
async fn test_pause_keeps_sequence_open() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let handle = runtime.download_handle("m1");

    let mut progress = tokio_test::task::spawn(handle.progress());
    // First poll registers the subscription
    assert_pending!(progress.poll_next());
    runtime.flush().await;

    engine.emit_state("m1", ModelDownloadState::downloading(400, TOTAL));
    handle.pause();
    runtime.flush().await;

    let replay = assert_ready!(progress.poll_next()).unwrap().unwrap();
    assert_eq!(replay.progress, 0.0);
    let downloading = assert_ready!(progress.poll_next()).unwrap().unwrap();
    assert_eq!(downloading.progress, 0.4);
    let paused = assert_ready!(progress.poll_next()).unwrap().unwrap();
    assert_eq!(paused.progress, 0.4);
    assert_eq!(paused.completed_bytes, 400);

    // Paused is not terminal
    assert_pending!(progress.poll_next());
    assert_eq!(runtime.state("m1"), ModelDownloadState::paused(400, TOTAL));
    assert_eq!(runtime.bridge().subscriber_count("m1"), 1);

    handle.resume();
    runtime.flush().await;
    let resumed = assert_ready!(progress.poll_next()).unwrap().unwrap();
    assert_eq!(resumed.progress, 0.4);
}

#[tokio::test]
async fn test_late_subscriber_receives_current_state() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let handle = runtime.download_handle("m1");
    handle.start().unwrap();

    engine.emit_state("m1", ModelDownloadState::downloading(500, TOTAL));
    runtime.flush().await;

    let mut late = runtime.download_handle("m1").progress();
    let first = late.next().await.unwrap().unwrap();
    assert_eq!(first.progress, 0.5);
    assert_eq!(first.completed_bytes, 500);
}

#[tokio::test]
async fn test_error_terminates_sequence_once() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let handle = runtime.download_handle("m1");

    let mut progress = handle.progress();
    progress.next().await.unwrap().unwrap();

    engine.emit_state("m1", ModelDownloadState::downloading(100, TOTAL));
    engine.emit_state("m1", ModelDownloadState::error("disk full"));
    // Not observed: the sequence already ended
    engine.emit_state("m1", ModelDownloadState::downloading(200, TOTAL));

    assert_eq!(progress.next().await.unwrap().unwrap().progress, 0.1);
    let err = progress.next().await.unwrap().unwrap_err();
    assert_eq!(
        err,
        DownloadError::Failed {
            identifier: "m1".to_string(),
            message: "disk full".to_string()
        }
    );
    assert!(progress.next().await.is_none());
}

#[tokio::test]
async fn test_error_does_not_touch_other_models() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    engine.emit_state("m2", ModelDownloadState::downloading(300, TOTAL));
    engine.emit_state("m1", ModelDownloadState::error("checksum mismatch"));
    runtime.flush().await;

    assert_eq!(runtime.state("m2"), ModelDownloadState::downloading(300, TOTAL));
    assert!(runtime.state("m2").is_downloading());
    assert_eq!(runtime.state("m1").phase().to_string(), "error");
}

#[tokio::test]
async fn test_dropping_progress_deregisters() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let handle = runtime.download_handle("m1");
    handle.start().unwrap();

    let mut progress = handle.progress();
    progress.next().await.unwrap().unwrap();
    assert_eq!(runtime.bridge().subscriber_count("m1"), 1);

    drop(progress);
    assert_eq!(runtime.bridge().subscriber_count("m1"), 0);

    // The download itself is unaffected
    engine.emit_state("m1", ModelDownloadState::downloading(700, TOTAL));
    runtime.flush().await;
    assert_eq!(runtime.state("m1").downloaded_bytes(), 700);
}

#[tokio::test]
async fn test_start_on_downloaded_model_completes_immediately() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    engine.emit_state("m1", ModelDownloadState::downloaded(TOTAL));
    runtime.flush().await;

    let handle = runtime.download_handle("m1");
    handle.start().unwrap();
    assert_eq!(engine.download_requests("m1"), 0);

    let updates: Vec<_> = handle.progress_fractions().collect().await;
    assert_eq!(updates, vec![Ok(1.0)]);
}

#[tokio::test]
async fn test_unknown_identifier_defaults_to_not_downloaded() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    let mut progress = runtime.download_handle("not-listed").progress();
    let first = progress.next().await.unwrap().unwrap();
    assert_eq!(first.progress, 0.0);
    assert_eq!(first.total_bytes, None);
    assert_eq!(runtime.state("not-listed"), ModelDownloadState::default());
}

#[tokio::test]
async fn test_download_model_with_auto_engine() {
    let engine = manual_engine().with_auto_downloads(4, Duration::from_millis(1));
    let runtime = activated_runtime(&engine).await;

    let done = tokio::time::timeout(Duration::from_secs(5), runtime.download_model("m1"))
        .await
        .expect("download did not finish")
        .unwrap();
    assert_eq!(done.progress, 1.0);
    assert_eq!(done.completed_bytes, TOTAL);

    // Deleting returns the model to not downloaded
    runtime.delete("m1");
    runtime.flush().await;
    assert_eq!(
        runtime.state("m1"),
        ModelDownloadState::not_downloaded(Some(TOTAL))
    );
}

#[tokio::test]
async fn test_start_while_downloading_is_noop() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let handle = runtime.download_handle("m1");

    handle.start().unwrap();
    assert_eq!(engine.download_requests("m1"), 1);

    engine.emit_state("m1", ModelDownloadState::downloading(300, TOTAL));
    runtime.flush().await;

    handle.start().unwrap();
    runtime.download_handle("m1").start().unwrap();
    assert_eq!(engine.download_requests("m1"), 1);
    assert_eq!(runtime.state("m1"), ModelDownloadState::downloading(300, TOTAL));
}

#[tokio::test]
async fn test_download_model_retry_after_error_succeeds() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    engine.emit_state("m1", ModelDownloadState::error("network blip"));
    runtime.flush().await;

    let retry = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.download_model("m1").await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.download_requests("m1") == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("retry never reached the engine");
    runtime.flush().await;

    engine.emit_state("m1", ModelDownloadState::downloading(500, TOTAL));
    engine.emit_state("m1", ModelDownloadState::downloaded(TOTAL));

    let done = tokio::time::timeout(Duration::from_secs(5), retry)
        .await
        .expect("retry did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(done.progress, 1.0);
    assert_eq!(engine.download_requests("m1"), 1);
}

#[tokio::test]
async fn test_download_model_retry_reports_fresh_error() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    engine.emit_state("m1", ModelDownloadState::error("network blip"));
    runtime.flush().await;

    let retry = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.download_model("m1").await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.download_requests("m1") == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("retry never reached the engine");
    runtime.flush().await;

    engine.emit_state("m1", ModelDownloadState::error("disk full"));
    let err = retry.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        DownloadError::Failed {
            identifier: "m1".to_string(),
            message: "disk full".to_string()
        }
    );
}

#[tokio::test]
async fn test_progress_after_retry_replays_error_without_ending() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    engine.emit_state("m1", ModelDownloadState::error("network blip"));
    runtime.flush().await;

    let handle = runtime.download_handle("m1");
    handle.start().unwrap();
    let mut progress = handle.progress();

    // The old failure comes back as a plain update
    let replay = progress.next().await.unwrap().unwrap();
    assert_eq!(replay.progress, 0.0);

    engine.emit_state("m1", ModelDownloadState::downloading(500, TOTAL));
    engine.emit_state("m1", ModelDownloadState::downloaded(TOTAL));

    let rest: Vec<f64> = progress
        .map(|update| update.unwrap().progress)
        .collect()
        .await;
    assert_eq!(rest, vec![0.5, 1.0]);
}

// =============================================================================
// License gating
// =============================================================================

#[tokio::test]
async fn test_bad_key_gates_sessions_before_engine() {
    let engine = manual_engine();
    let runtime = Runtime::start(Arc::new(engine.clone()));

    let status = runtime.activate("bad-key").await.unwrap();
    assert_eq!(status, LicenseStatus::InvalidApiKey);
    assert_eq!(runtime.license_status(), LicenseStatus::InvalidApiKey);
    assert!(!runtime.is_license_usable());

    let err = runtime
        .create_session(&ModelRef::Cloud("cloud".into()), None)
        .unwrap_err();
    assert_eq!(err, SessionError::License(LicenseError::InvalidApiKey));
    assert_eq!(engine.session_requests(), 0);

    let err = runtime.download_handle("m1").start().unwrap_err();
    assert_eq!(err, DownloadError::License(LicenseError::InvalidApiKey));
    assert_eq!(engine.download_requests("m1"), 0);
}

#[tokio::test]
async fn test_grace_period_is_usable() {
    let engine = manual_engine().with_grace_key("late-key");
    let runtime = Runtime::start(Arc::new(engine.clone()));

    let status = runtime.activate("late-key").await.unwrap();
    assert_eq!(status, LicenseStatus::GracePeriodActive);
    assert!(runtime.is_license_usable());
    assert!(
        runtime
            .create_session(&ModelRef::Cloud("cloud".into()), None)
            .is_ok()
    );
}

#[tokio::test]
async fn test_pushed_license_change_is_observed() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    let mut license = runtime.subscribe_license();
    license.borrow_and_update();

    engine.emit_license(LicenseStatus::PaymentRequired);
    tokio::time::timeout(Duration::from_secs(1), license.changed())
        .await
        .expect("license change not delivered")
        .unwrap();
    assert_eq!(*license.borrow(), LicenseStatus::PaymentRequired);

    let err = runtime
        .create_session(&ModelRef::Cloud("cloud".into()), None)
        .unwrap_err();
    assert_eq!(err, SessionError::License(LicenseError::PaymentRequired));
}

// =============================================================================
// Catalog
// =============================================================================

#[tokio::test]
async fn test_sync_replaces_catalog() {
    let engine = SimulatedEngine::new()
        .with_valid_key("good-key")
        .with_local_model("A", TOTAL)
        .with_local_model("C", TOTAL);
    let runtime = activated_runtime(&engine).await;

    engine.emit_state("A", ModelDownloadState::downloaded(TOTAL));
    engine.emit_state("C", ModelDownloadState::downloading(10, TOTAL));
    runtime.flush().await;

    engine.set_upstream(vec![
        SimulatedModel::local("A", TOTAL),
        SimulatedModel::local("B", TOTAL),
    ]);
    let diff = runtime.sync().await.unwrap();

    assert_eq!(diff.added, vec!["B"]);
    assert_eq!(diff.removed, vec!["C"]);
    assert_eq!(diff.retained, vec!["A"]);
    assert_eq!(runtime.catalog().identifiers(), vec!["A", "B"]);
    assert!(runtime.state("A").is_downloaded());
    assert!(runtime.states().get("C").is_none());
    assert!(runtime.info("C").is_none());
}

#[tokio::test]
async fn test_incremental_updates_upsert_without_deleting() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;

    let mut renamed = SimulatedModel::local("m1", TOTAL);
    renamed.name = "First".to_string();
    let mut renamed_again = renamed.clone();
    renamed_again.name = "Second".to_string();

    engine.emit_catalog(vec![renamed, SimulatedModel::cloud("new-cloud")]);
    engine.emit_catalog(vec![renamed_again]);
    runtime.flush().await;

    assert_eq!(runtime.info("m1").unwrap().name, "Second");
    assert!(runtime.info("new-cloud").is_some());
    assert_eq!(
        runtime.catalog().identifiers(),
        vec!["cloud", "m1", "m2", "new-cloud"]
    );
}

#[tokio::test]
async fn test_failed_sync_keeps_catalog() {
    let engine = manual_engine();
    let runtime = activated_runtime(&engine).await;
    engine.set_registry_error(Some(engine_bridge::EngineError::new(
        engine_bridge::EngineErrorKind::Network,
        "offline",
    )));

    let err = runtime.sync().await.unwrap_err();
    assert_eq!(err.to_string(), "offline");
    assert_eq!(runtime.catalog().len(), 3);
    assert_eq!(engine.models().len(), 3);
}
