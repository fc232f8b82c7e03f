use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use geocopilot_core::{
    validate, DataSource, DebugRetryOrchestrator, Field, FieldKind, FnRuntime, LogAggregator,
    MemoryLayer, NewFeature, SandboxExecutor, ScriptContext, ScriptFault, ScriptRuntime,
    SourceCatalog,
};
use geocopilot_types::{
    EnvironmentProfile, ErrorKind, ExecutionRequest, ExecutionStatus, LogEvent, Operation,
    ReferenceSystem, Severity, TargetLayer,
};
use serde_json::json;
use tempfile::TempDir;

fn parcels() -> Arc<MemoryLayer> {
    Arc::new(
        MemoryLayer::new(
            "parcels",
            vec![
                Field::new("owner", FieldKind::Text),
                Field::new("area", FieldKind::Real),
            ],
        )
        .with_features(vec![
            NewFeature::default()
                .with_attribute("owner", json!("Ross"))
                .with_attribute("area", json!(120.5)),
            NewFeature::default()
                .with_attribute("owner", json!("Moore"))
                .with_attribute("area", json!(88.0)),
        ]),
    )
}

fn headless() -> EnvironmentProfile {
    EnvironmentProfile::headless()
}

fn worker_profile() -> EnvironmentProfile {
    EnvironmentProfile {
        has_background_task_framework: true,
        ..EnvironmentProfile::headless()
    }
}

#[test]
fn test_read_only_connector_reports_unsupported_operation() {
    let layer = MemoryLayer::new("census", vec![]).with_connector("delimitedtext", true);
    for operation in [
        Operation::AddFeatures,
        Operation::DeleteFeatures,
        Operation::ChangeAttributes,
        Operation::AddAttributes,
        Operation::ChangeGeometries,
    ] {
        let report = validate("req-1", Some(&layer as &dyn DataSource), &operation);
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::UnsupportedOperation));
        assert_eq!(report.request_id, "req-1");
    }
    let read = validate("req-1", Some(&layer as &dyn DataSource), &Operation::Read);
    assert!(read.is_allowed());
}

#[test]
fn test_invalid_target_reference_system() {
    let layer = MemoryLayer::new("census", vec![]);
    let report = validate(
        "req-2",
        Some(&layer as &dyn DataSource),
        &Operation::Reproject {
            target: ReferenceSystem::new("EPSG:not-a-code"),
        },
    );
    assert_eq!(
        report.reason_if_invalid,
        Some(ErrorKind::InvalidReferenceSystem)
    );
}

#[tokio::test]
async fn test_partial_edit_then_raise_leaves_source_identical() {
    let dir = TempDir::new().unwrap();
    let layer = parcels();
    let before = layer.persisted_bytes().unwrap();
    let catalog = SourceCatalog::new();
    catalog.register(layer.clone());

    let runtime = Arc::new(FnRuntime::new(
        "partial",
        |_: String, ctx: ScriptContext| async move {
            let mut session = ctx.begin_edit("parcels").await?;
            for i in 0..5 {
                if i == 3 {
                    return Err(ScriptFault::runtime("RuntimeError: disk full"));
                }
                session.add_feature(
                    NewFeature::default().with_attribute("owner", json!(format!("new-{i}"))),
                )?;
            }
            session.commit()?;
            Ok(())
        },
    ));
    let executor = SandboxExecutor::new(catalog, runtime);
    let request = ExecutionRequest::new("edit parcels", dir.path());
    let result = executor.execute(&request, &worker_profile()).await;

    assert_eq!(result.status, ExecutionStatus::RuntimeError);
    assert_eq!(layer.feature_count(), 2);
    assert_eq!(layer.persisted_bytes().unwrap(), before);
}

#[tokio::test]
async fn test_missing_capability_never_reaches_runtime() {
    let dir = TempDir::new().unwrap();
    let catalog = SourceCatalog::new();
    catalog.register(Arc::new(
        MemoryLayer::new("parcels", vec![]).with_capabilities(Default::default()),
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let runtime = Arc::new(FnRuntime::new("count", move |_: String, _: ScriptContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), ScriptFault>(()) }
    }));
    let executor = SandboxExecutor::new(catalog, runtime);
    let request = ExecutionRequest::new("layer.addFeature(f)", dir.path()).with_targets(vec![
        TargetLayer::with_operations("parcels", vec![Operation::AddFeatures]),
    ]);
    let result = executor.execute(&request, &headless()).await;

    assert_eq!(result.status, ExecutionStatus::ValidationFailed);
    assert_eq!(result.error_kind(), Some(ErrorKind::UnsupportedOperation));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_target_is_invalid_source() {
    let dir = TempDir::new().unwrap();
    let runtime: Arc<dyn ScriptRuntime> = Arc::new(FnRuntime::new(
        "noop",
        |_: String, _: ScriptContext| async { Ok::<(), ScriptFault>(()) },
    ));
    let executor = SandboxExecutor::new(SourceCatalog::new(), runtime);
    let request = ExecutionRequest::new("pass", dir.path())
        .with_targets(vec![TargetLayer::read("missing")]);
    let result = executor.execute(&request, &headless()).await;
    assert_eq!(result.status, ExecutionStatus::ValidationFailed);
    assert_eq!(result.error_kind(), Some(ErrorKind::InvalidSource));
}

#[tokio::test]
async fn test_sleeping_past_cap_is_cancelled() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(FnRuntime::new(
        "sleepy",
        |_: String, _: ScriptContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), ScriptFault>(())
        },
    ));
    let executor = SandboxExecutor::new(SourceCatalog::new(), runtime)
        .with_timeout(Duration::from_millis(100));
    let request = ExecutionRequest::new("import time\ntime.sleep(60)", dir.path());
    let result = executor.execute(&request, &worker_profile()).await;

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.duration_ms < 10_000);
}

#[tokio::test]
async fn test_read_only_script_twice_gives_identical_artifacts() {
    let dir = TempDir::new().unwrap();
    let catalog = SourceCatalog::new();
    catalog.register(parcels());
    let runtime = Arc::new(FnRuntime::new(
        "summary",
        |_: String, ctx: ScriptContext| async move {
            let source = ctx.source("parcels")?;
            let mut csv = String::from("id,owner\n");
            for feature in source.features() {
                let owner = feature
                    .attributes
                    .get("owner")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                csv.push_str(&format!("{},{owner}\n", feature.id));
            }
            ctx.write_artifact("owners.csv", csv.as_bytes()).await?;
            Ok::<(), ScriptFault>(())
        },
    ));
    let executor = SandboxExecutor::new(catalog, runtime);

    let mut contents = Vec::new();
    for _ in 0..2 {
        let request = ExecutionRequest::new("summarise owners", dir.path());
        let result = executor.execute(&request, &headless()).await;
        assert!(result.is_success());
        assert_eq!(result.produced_artifacts.len(), 1);
        contents.push(std::fs::read(&result.produced_artifacts[0]).unwrap());
    }
    assert_eq!(contents[0], contents[1]);
}

#[test]
fn test_one_window_one_message_with_max_severity() {
    let mut aggregator = LogAggregator::new(Duration::from_secs(5));
    assert!(aggregator.observe(LogEvent::info("reading parcels")).is_none());
    assert!(aggregator.observe(LogEvent::warning("slow provider")).is_none());
    assert!(aggregator.observe(LogEvent::info("done")).is_none());
    let message = aggregator.flush().unwrap();
    assert_eq!(message.event_count(), 3);
    assert_eq!(message.severity(), Severity::Warning);
    assert!(aggregator.flush().is_none());
}

#[tokio::test]
async fn test_three_failures_exhaust_three_attempts() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(FnRuntime::new(
        "broken",
        |_: String, _: ScriptContext| async {
            Err::<(), ScriptFault>(ScriptFault::runtime("TypeError: unsupported operand"))
        },
    ));
    let executor = SandboxExecutor::new(SourceCatalog::new(), runtime);
    let orchestrator = DebugRetryOrchestrator::new(3);

    let mut request = ExecutionRequest::new("x = 1 + 'a'", dir.path());
    let mut session = None;
    for attempt in 1..=3u32 {
        let result = executor.execute(&request, &headless()).await;
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        let next = orchestrator
            .on_failure(&request, &result, session.take(), Vec::new())
            .unwrap();
        assert_eq!(next.attempt_count, attempt);
        assert!(next.attempt_count <= next.max_attempts);
        assert_eq!(next.is_terminal(), attempt == 3);
        request = next.next_request(format!("x = {attempt}"));
        session = Some(next);
    }
    assert!(session.unwrap().turn().is_none());
}
