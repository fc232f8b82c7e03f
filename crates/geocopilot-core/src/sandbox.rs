use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use geocopilot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use geocopilot_types::{
    EnvironmentProfile, ErrorKind, ExecutionRequest, ExecutionResult, ExecutionStatus, LogEvent,
    RunState, StructuredError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::capability::validate;
use crate::config::ExecutorConfig;
use crate::datasource::SourceCatalog;
use crate::edit_session::EditRegistry;
use crate::environment::{Detection, HostBindings};
use crate::preflight::{ApiManifest, Preflight};
use crate::runtime::{RunOutput, ScriptContext, ScriptFault, ScriptRuntime};
use crate::screening::SafetyPolicy;
use crate::workspace::Workspace;

enum Outcome {
    Finished(Result<(), ScriptFault>),
    TimedOut,
    Cancelled,
}

struct RunTracker {
    run_id: String,
    state: RunState,
}

impl RunTracker {
    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "run state");
        self.state = next;
    }
}

/// Everything a finished run reports besides status and error.
#[derive(Default)]
struct RunCapture {
    stdout_lines: Vec<String>,
    produced_artifacts: Vec<PathBuf>,
}

/// Validates and runs script bodies one request at a time.
#[derive(Clone)]
pub struct SandboxExecutor {
    catalog: SourceCatalog,
    edits: EditRegistry,
    runtime: Arc<dyn ScriptRuntime>,
    bindings: HostBindings,
    manifest: Arc<ApiManifest>,
    policy: SafetyPolicy,
    timeout: Duration,
    process: ProcessKind,
}

impl SandboxExecutor {
    pub fn new(catalog: SourceCatalog, runtime: Arc<dyn ScriptRuntime>) -> Self {
        let config = ExecutorConfig::default();
        Self {
            catalog,
            edits: EditRegistry::new(),
            runtime,
            bindings: HostBindings::default(),
            manifest: Arc::new(ApiManifest::builtin()),
            policy: SafetyPolicy::for_mode(config.safety_mode),
            timeout: config.timeout(),
            process: ProcessKind::Host,
        }
    }

    pub fn from_config(
        config: &ExecutorConfig,
        catalog: SourceCatalog,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> Self {
        Self::new(catalog, runtime)
            .with_policy(SafetyPolicy::for_mode(config.safety_mode))
            .with_timeout(config.timeout())
    }

    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_manifest(mut self, manifest: Arc<ApiManifest>) -> Self {
        self.manifest = manifest;
        self
    }

    /// Host objects used by [`SandboxExecutor::execute`].
    pub fn with_bindings(mut self, bindings: HostBindings) -> Self {
        self.bindings = bindings;
        self
    }

    /// Shares the single-writer table with other executors in the process.
    pub fn with_edit_registry(mut self, edits: EditRegistry) -> Self {
        self.edits = edits;
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    pub fn edits(&self) -> &EditRegistry {
        &self.edits
    }

    pub fn manifest(&self) -> Arc<ApiManifest> {
        self.manifest.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        profile: &EnvironmentProfile,
    ) -> ExecutionResult {
        let detection = Detection {
            profile: profile.clone(),
            bindings: self.bindings.clone(),
        };
        let (sink, _) = mpsc::unbounded_channel();
        self.execute_streaming(request, &detection, sink, CancellationToken::new())
            .await
    }

    /// Runs `request`, forwarding log events to `sink` in emission order.
    /// Open edit sessions are rolled back before this returns.
    pub async fn execute_streaming(
        &self,
        request: &ExecutionRequest,
        detection: &Detection,
        sink: mpsc::UnboundedSender<LogEvent>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut tracker = RunTracker {
            run_id: uuid::Uuid::new_v4().to_string(),
            state: RunState::Pending,
        };
        self.emit(
            Level::INFO,
            "run.start",
            request,
            &tracker.run_id,
            Some("pending"),
            None,
        );

        let (status, error, capture) = self
            .run_phases(request, detection, &sink, cancel, &mut tracker)
            .await;

        if let Some(err) = &error {
            let _ = sink.send(LogEvent::error(err.summary()));
        }
        let result = ExecutionResult {
            request_id: request.id.clone(),
            run_id: tracker.run_id.clone(),
            status,
            stdout_lines: capture.stdout_lines,
            structured_error: error,
            produced_artifacts: capture.produced_artifacts,
            duration_ms: clock.elapsed().as_millis() as u64,
            started_at,
        };
        let level = if result.is_success() {
            Level::INFO
        } else {
            Level::WARN
        };
        self.emit(
            level,
            "run.finish",
            request,
            &result.run_id,
            Some(result.status.as_str()),
            result.error_kind().map(|k| k.as_str()),
        );
        result
    }

    async fn run_phases(
        &self,
        request: &ExecutionRequest,
        detection: &Detection,
        sink: &mpsc::UnboundedSender<LogEvent>,
        cancel: CancellationToken,
        tracker: &mut RunTracker,
    ) -> (ExecutionStatus, Option<StructuredError>, RunCapture) {
        let profile = &detection.profile;
        let none = RunCapture::default();

        if cancel.is_cancelled() {
            tracker.advance(RunState::Cancelled);
            let err = StructuredError::new(ErrorKind::Cancelled, "cancelled before start");
            return (ExecutionStatus::Cancelled, Some(err), none);
        }

        let preflight = Preflight::new(&self.manifest).check(
            &request.script_text,
            profile,
            detection.bindings.algorithms.as_deref(),
        );
        for finding in &preflight.warnings {
            let _ = sink.send(LogEvent::warning(finding.render()));
        }
        if let Some(err) = preflight.blocking {
            tracker.advance(RunState::Failed);
            return (ExecutionStatus::ValidationFailed, Some(err), none);
        }

        if !request.declared_target_layers.is_empty() {
            tracker.advance(RunState::Validating);
            for target in &request.declared_target_layers {
                let source = self.catalog.get(&target.source_id);
                for operation in &target.operations {
                    let report = validate(&request.id, source.as_deref(), operation);
                    if let Some(kind) = report.reason_if_invalid {
                        tracker.advance(RunState::Failed);
                        let err = StructuredError::new(kind, report.detail);
                        return (ExecutionStatus::ValidationFailed, Some(err), none);
                    }
                }
            }
        }

        tracker.advance(RunState::Running);
        if let Err(violation) = self.policy.screen(&request.script_text) {
            tracker.advance(RunState::Failed);
            let err = StructuredError::new(ErrorKind::UncaughtRuntimeError, violation.to_string());
            return (ExecutionStatus::RuntimeError, Some(err), none);
        }

        let workspace = Workspace::new(&request.workspace_root);
        let prepared = async {
            let run_dir = workspace.begin_run(&tracker.run_id).await?;
            let script_path = run_dir
                .write_script(request.filename_hint.as_deref(), &request.script_text)
                .await?;
            Ok::<_, crate::workspace::WorkspaceError>((run_dir, script_path))
        };
        let (run_dir, script_path) = match prepared.await {
            Ok(prepared) => prepared,
            Err(err) => {
                tracker.advance(RunState::Failed);
                let err = StructuredError::new(ErrorKind::UncaughtRuntimeError, err.to_string());
                return (ExecutionStatus::RuntimeError, Some(err), none);
            }
        };

        let (output, output_rx) = mpsc::unbounded_channel();
        let run_cancel = cancel.child_token();
        let ctx = ScriptContext {
            request_id: request.id.clone(),
            run_id: tracker.run_id.clone(),
            profile: profile.clone(),
            bindings: detection.bindings.clone(),
            catalog: self.catalog.clone(),
            edits: self.edits.clone(),
            workspace: run_dir.clone(),
            script_path: script_path.clone(),
            output,
            cancel: run_cancel.clone(),
        };
        let drained = CancellationToken::new();
        let forwarder = spawn_forwarder(output_rx, sink.clone(), drained.clone());

        let runtime = self.runtime.clone();
        let script = request.script_text.clone();
        let run = async move { runtime.run(&script, ctx).await };
        let outcome = if profile.has_background_task_framework {
            drive_spawned(tokio::spawn(run), self.timeout, &cancel, &run_cancel).await
        } else {
            drive_inline(run, self.timeout, &cancel, &run_cancel).await
        };

        drained.cancel();
        let stdout_lines = forwarder.await.unwrap_or_default();
        let produced_artifacts = match run_dir.collect_artifacts(Some(&script_path)).await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                tracing::warn!(run_id = %tracker.run_id, "artifact listing failed: {err}");
                Vec::new()
            }
        };
        let capture = RunCapture {
            stdout_lines,
            produced_artifacts,
        };

        match outcome {
            Outcome::Finished(Ok(())) => {
                tracker.advance(RunState::Succeeded);
                (ExecutionStatus::Success, None, capture)
            }
            Outcome::Finished(Err(fault)) if fault.kind == ErrorKind::Cancelled => {
                tracker.advance(RunState::Cancelled);
                (ExecutionStatus::Cancelled, Some(fault.into()), capture)
            }
            Outcome::Finished(Err(fault)) => {
                tracker.advance(RunState::Failed);
                (ExecutionStatus::RuntimeError, Some(fault.into()), capture)
            }
            Outcome::TimedOut => {
                tracker.advance(RunState::Cancelled);
                let err = StructuredError::new(
                    ErrorKind::Timeout,
                    format!("run exceeded {} ms", self.timeout.as_millis()),
                );
                (ExecutionStatus::Cancelled, Some(err), capture)
            }
            Outcome::Cancelled => {
                tracker.advance(RunState::Cancelled);
                let err = StructuredError::new(ErrorKind::Cancelled, "run cancelled");
                (ExecutionStatus::Cancelled, Some(err), capture)
            }
        }
    }

    fn emit(
        &self,
        level: Level,
        event: &str,
        request: &ExecutionRequest,
        run_id: &str,
        status: Option<&str>,
        error_code: Option<&str>,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: "sandbox",
                request_id: Some(&request.id),
                run_id: Some(run_id),
                status,
                error_code,
                detail: Some(self.runtime.name()),
                ..Default::default()
            },
        );
    }
}

/// Stdout lines become Info events and are kept for the result. Once
/// `drained` fires, whatever is queued is forwarded and the task ends.
fn spawn_forwarder(
    mut output: mpsc::UnboundedReceiver<RunOutput>,
    sink: mpsc::UnboundedSender<LogEvent>,
    drained: CancellationToken,
) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = Vec::new();
        let forward = |item: RunOutput, lines: &mut Vec<String>| match item {
            RunOutput::Stdout(line) => {
                let _ = sink.send(LogEvent::info(line.clone()));
                lines.push(line);
            }
            RunOutput::Event(event) => {
                let _ = sink.send(event);
            }
        };
        loop {
            tokio::select! {
                biased;
                item = output.recv() => match item {
                    Some(item) => forward(item, &mut lines),
                    None => break,
                },
                _ = drained.cancelled() => {
                    while let Ok(item) = output.try_recv() {
                        forward(item, &mut lines);
                    }
                    break;
                }
            }
        }
        lines
    })
}

/// Polls the run on the current task. The future is dropped before this
/// returns, which rolls back any open edit session.
async fn drive_inline<F>(
    run: F,
    limit: Duration,
    cancel: &CancellationToken,
    run_cancel: &CancellationToken,
) -> Outcome
where
    F: Future<Output = Result<(), ScriptFault>>,
{
    let run = AssertUnwindSafe(run).catch_unwind();
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => Outcome::Finished(
            result.unwrap_or_else(|_| Err(ScriptFault::runtime("script runtime panicked")))
        ),
        _ = tokio::time::sleep(limit) => {
            run_cancel.cancel();
            Outcome::TimedOut
        }
        _ = cancel.cancelled() => Outcome::Cancelled,
    }
}

/// Waits on a worker task; on timeout or cancel the task is aborted and
/// joined so its edit sessions are gone before this returns.
async fn drive_spawned(
    mut handle: JoinHandle<Result<(), ScriptFault>>,
    limit: Duration,
    cancel: &CancellationToken,
    run_cancel: &CancellationToken,
) -> Outcome {
    let outcome = tokio::select! {
        joined = &mut handle => {
            return Outcome::Finished(joined.unwrap_or_else(|err| {
                Err(ScriptFault::runtime(format!("script worker failed: {err}")))
            }));
        }
        _ = tokio::time::sleep(limit) => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };
    run_cancel.cancel();
    handle.abort();
    let _ = handle.await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyMode;
    use crate::datasource::{DataSource, Field, FieldKind, MemoryLayer, NewFeature};
    use crate::runtime::FnRuntime;
    use geocopilot_types::{Capabilities, Capability, Operation, TargetLayer};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn profile(background: bool) -> EnvironmentProfile {
        EnvironmentProfile {
            has_background_task_framework: background,
            ..EnvironmentProfile::headless()
        }
    }

    fn towns() -> Arc<MemoryLayer> {
        Arc::new(
            MemoryLayer::new("towns", vec![Field::new("name", FieldKind::Text)]).with_features(
                vec![
                    NewFeature::default().with_attribute("name", json!("Ayr")),
                    NewFeature::default().with_attribute("name", json!("Troon")),
                ],
            ),
        )
    }

    fn printing_runtime() -> Arc<dyn ScriptRuntime> {
        Arc::new(FnRuntime::new("test", |script: String, ctx: ScriptContext| async move {
            ctx.print(script);
            Ok::<(), ScriptFault>(())
        }))
    }

    #[tokio::test]
    async fn success_captures_stdout_and_streams_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = SandboxExecutor::new(SourceCatalog::new(), printing_runtime());
        let request = ExecutionRequest::new("print('a')\nprint('b')", dir.path());
        let (sink, mut events) = mpsc::unbounded_channel();
        let detection = Detection {
            profile: profile(true),
            bindings: HostBindings::default(),
        };
        let result = executor
            .execute_streaming(&request, &detection, sink, CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.request_id, request.id);
        assert_eq!(result.stdout_lines, vec!["print('a')", "print('b')"]);
        assert!(result.produced_artifacts.is_empty());
        let first = events.recv().await.expect("event");
        assert_eq!(first.text, "print('a')");
        assert!(dir.path().join("runs").join(&result.run_id).is_dir());
    }

    #[tokio::test]
    async fn missing_capability_never_invokes_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = SourceCatalog::new();
        catalog.register(Arc::new(
            MemoryLayer::new("towns", vec![])
                .with_capabilities(Capabilities::empty().with(Capability::AddFeatures)),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let runtime = Arc::new(FnRuntime::new("count", move |_: String, _: ScriptContext| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), ScriptFault>(()) }
        }));
        let executor = SandboxExecutor::new(catalog, runtime);
        let request = ExecutionRequest::new("pass", dir.path()).with_targets(vec![
            TargetLayer::with_operations("towns", vec![Operation::DeleteFeatures]),
        ]);
        let result = executor.execute(&request, &profile(false)).await;
        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert_eq!(result.error_kind(), Some(ErrorKind::UnsupportedOperation));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn screening_rejects_before_any_line_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = SandboxExecutor::new(SourceCatalog::new(), printing_runtime())
            .with_policy(SafetyPolicy::for_mode(SafetyMode::Relaxed));
        let request = ExecutionRequest::new("import subprocess\nprint(1)", dir.path());
        let result = executor.execute(&request, &profile(false)).await;
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.error_kind(), Some(ErrorKind::UncaughtRuntimeError));
        assert!(result.stdout_lines.is_empty());
        assert!(!dir.path().join("runs").exists());
    }

    #[tokio::test]
    async fn headless_iface_use_fails_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = SandboxExecutor::new(SourceCatalog::new(), printing_runtime());
        let request = ExecutionRequest::new("layer = iface.activeLayer()", dir.path());
        let result = executor.execute(&request, &profile(false)).await;
        assert_eq!(result.status, ExecutionStatus::ValidationFailed);
        assert_eq!(
            result.error_kind(),
            Some(ErrorKind::MissingInteractiveContext)
        );
    }

    #[tokio::test]
    async fn raise_mid_session_leaves_source_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = towns();
        let before = layer.persisted_bytes().expect("bytes");
        let catalog = SourceCatalog::new();
        catalog.register(layer.clone());
        let runtime = Arc::new(FnRuntime::new("edit", |_: String, ctx: ScriptContext| async move {
            let mut session = ctx.begin_edit("towns").await?;
            session.add_feature(NewFeature::default().with_attribute("name", json!("Irvine")))?;
            session.delete_feature(1)?;
            Err::<(), ScriptFault>(ScriptFault::runtime("ValueError: boom"))
        }));
        let executor = SandboxExecutor::new(catalog, runtime);
        let request = ExecutionRequest::new("edit", dir.path());
        let (sink, mut events) = mpsc::unbounded_channel();
        let detection = Detection {
            profile: profile(true),
            bindings: HostBindings::default(),
        };
        let result = executor
            .execute_streaming(&request, &detection, sink, CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(layer.persisted_bytes().expect("bytes"), before);
        assert_eq!(layer.feature_count(), 2);
        assert!(executor.edits().holder("towns").is_none());

        let mut texts = Vec::new();
        while let Ok(event) = events.try_recv() {
            texts.push(event.text);
        }
        assert!(texts.iter().any(|t| t.contains("rolled back")));
        assert_eq!(
            texts.last().map(String::as_str),
            Some("[uncaught_runtime_error] ValueError: boom")
        );
    }

    #[tokio::test]
    async fn timeout_cancels_and_rolls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = towns();
        let catalog = SourceCatalog::new();
        catalog.register(layer.clone());
        let runtime = Arc::new(FnRuntime::new("slow", |_: String, ctx: ScriptContext| async move {
            let mut session = ctx.begin_edit("towns").await?;
            session.delete_feature(1)?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            session.commit()?;
            Ok::<(), ScriptFault>(())
        }));
        for background in [true, false] {
            let executor = SandboxExecutor::new(catalog.clone(), runtime.clone())
                .with_timeout(Duration::from_millis(50));
            let request = ExecutionRequest::new("slow", dir.path());
            let result = executor.execute(&request, &profile(background)).await;
            assert_eq!(result.status, ExecutionStatus::Cancelled);
            assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
            assert_eq!(layer.feature_count(), 2);
            assert!(executor.edits().holder("towns").is_none());
        }
    }

    #[tokio::test]
    async fn external_cancel_reports_cancelled_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(FnRuntime::new("wait", |_: String, _: ScriptContext| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), ScriptFault>(())
        }));
        let executor = SandboxExecutor::new(SourceCatalog::new(), runtime);
        let request = ExecutionRequest::new("wait", dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let (sink, _events) = mpsc::unbounded_channel();
        let detection = Detection {
            profile: profile(true),
            bindings: HostBindings::default(),
        };
        let result = executor
            .execute_streaming(&request, &detection, sink, cancel)
            .await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn external_cancel_rolls_back_open_edit_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = towns();
        let before = layer.persisted_bytes().expect("bytes");
        let catalog = SourceCatalog::new();
        catalog.register(layer.clone());
        let opened = Arc::new(tokio::sync::Notify::new());
        let signal = opened.clone();
        let runtime = Arc::new(FnRuntime::new("hold", move |_: String, ctx: ScriptContext| {
            let signal = signal.clone();
            async move {
                let mut session = ctx.begin_edit("towns").await?;
                session.delete_feature(1)?;
                signal.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                session.commit()?;
                Ok::<(), ScriptFault>(())
            }
        }));
        for background in [true, false] {
            let executor = SandboxExecutor::new(catalog.clone(), runtime.clone());
            let request = ExecutionRequest::new("hold", dir.path());
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let waiter = opened.clone();
            tokio::spawn(async move {
                waiter.notified().await;
                trigger.cancel();
            });
            let (sink, mut events) = mpsc::unbounded_channel();
            let detection = Detection {
                profile: profile(background),
                bindings: HostBindings::default(),
            };
            let result = executor
                .execute_streaming(&request, &detection, sink, cancel)
                .await;
            assert_eq!(result.status, ExecutionStatus::Cancelled);
            assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
            assert_eq!(layer.feature_count(), 2);
            assert_eq!(layer.persisted_bytes().expect("bytes"), before);
            assert!(executor.edits().holder("towns").is_none());

            let mut texts = Vec::new();
            while let Ok(event) = events.try_recv() {
                texts.push(event.text);
            }
            assert!(texts.iter().any(|t| t.contains("rolled back")));
        }
    }

    #[tokio::test]
    async fn artifacts_are_listed_without_the_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(FnRuntime::new("art", |_: String, ctx: ScriptContext| async move {
            ctx.write_artifact("Road Summary.csv", b"name,count\nA1,3\n").await?;
            Ok::<(), ScriptFault>(())
        }));
        let executor = SandboxExecutor::new(SourceCatalog::new(), runtime);
        let request = ExecutionRequest::new("summarise", dir.path()).with_filename_hint("summary");
        let result = executor.execute(&request, &profile(false)).await;
        assert!(result.is_success());
        assert_eq!(result.produced_artifacts.len(), 1);
        let name = result.produced_artifacts[0]
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name");
        assert!(name.ends_with(".csv"));
    }
}
