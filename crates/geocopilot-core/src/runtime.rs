use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use geocopilot_types::{
    CapabilityReport, EnvironmentProfile, ErrorKind, LogEvent, Operation, StructuredError,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capability::validate;
use crate::datasource::{DataSource, SourceCatalog, SourceError};
use crate::edit_session::{EditRegistry, EditSession};
use crate::environment::{HostBindings, InteractiveHandle};
use crate::workspace::RunWorkspace;

/// A failure raised by a script, already mapped onto the error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ScriptFault {
    pub kind: ErrorKind,
    pub message: String,
    pub traceback: Option<String>,
}

impl ScriptFault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UncaughtRuntimeError, message)
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn from_source_error(source_id: &str, err: SourceError) -> Self {
        let kind = match &err {
            SourceError::ReadOnly(_) | SourceError::Unsupported { .. } => {
                ErrorKind::UnsupportedOperation
            }
            SourceError::InvalidGeometry(_) => ErrorKind::InvalidGeometry,
            SourceError::Unavailable(_) => ErrorKind::InvalidSource,
            SourceError::FeatureNotFound(_)
            | SourceError::FieldNotFound(_)
            | SourceError::DuplicateField(_) => ErrorKind::UncaughtRuntimeError,
        };
        Self::new(kind, format!("`{source_id}`: {err}"))
    }
}

impl From<ScriptFault> for StructuredError {
    fn from(value: ScriptFault) -> Self {
        let err = StructuredError::new(value.kind, value.message);
        match value.traceback {
            Some(tb) => err.with_traceback(tb),
            None => err,
        }
    }
}

impl From<anyhow::Error> for ScriptFault {
    fn from(value: anyhow::Error) -> Self {
        ScriptFault::runtime(format!("{value:#}"))
    }
}

/// What a running script emits, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    Stdout(String),
    Event(LogEvent),
}

/// The only names a script can reach: approved host objects plus output.
#[derive(Clone)]
pub struct ScriptContext {
    pub(crate) request_id: String,
    pub(crate) run_id: String,
    pub(crate) profile: EnvironmentProfile,
    pub(crate) bindings: HostBindings,
    pub(crate) catalog: SourceCatalog,
    pub(crate) edits: EditRegistry,
    pub(crate) workspace: RunWorkspace,
    pub(crate) script_path: PathBuf,
    pub(crate) output: mpsc::UnboundedSender<RunOutput>,
    pub(crate) cancel: CancellationToken,
}

impl ScriptContext {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn profile(&self) -> &EnvironmentProfile {
        &self.profile
    }

    pub fn run_dir(&self) -> PathBuf {
        self.workspace.dir().to_path_buf()
    }

    /// The script body as saved in the run directory.
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn print(&self, text: impl AsRef<str>) {
        for line in text.as_ref().lines() {
            let _ = self.output.send(RunOutput::Stdout(line.to_string()));
        }
    }

    pub fn warn(&self, text: impl Into<String>) {
        let _ = self.output.send(RunOutput::Event(LogEvent::warning(text)));
    }

    pub fn check(&self, source_id: &str, operation: &Operation) -> CapabilityReport {
        let source = self.catalog.get(source_id);
        validate(&self.request_id, source.as_deref(), operation)
    }

    /// Readable handle to a source; only committed state is visible.
    pub fn source(&self, source_id: &str) -> Result<Arc<dyn DataSource>, ScriptFault> {
        let source = self.catalog.get(source_id);
        let report = validate(&self.request_id, source.as_deref(), &Operation::Read);
        match (report.reason_if_invalid, source) {
            (None, Some(source)) => Ok(source),
            (Some(kind), _) => Err(ScriptFault::new(kind, report.detail)),
            (None, None) => Err(ScriptFault::new(
                ErrorKind::InvalidSource,
                format!("no source named `{source_id}`"),
            )),
        }
    }

    /// Opens the single edit session for `source_id`, waiting while another
    /// run holds it.
    pub async fn begin_edit(&self, source_id: &str) -> Result<EditSession, ScriptFault> {
        let source = self.source(source_id)?;
        let lease = tokio::select! {
            lease = self.edits.acquire(source_id, &self.run_id) => lease,
            _ = self.cancel.cancelled() => {
                return Err(ScriptFault::new(ErrorKind::Cancelled, "cancelled while waiting for edit session"));
            }
        };
        Ok(EditSession::open(
            &self.request_id,
            source,
            lease,
            Some(self.output.clone()),
        ))
    }

    pub fn interactive(&self) -> Result<Arc<dyn InteractiveHandle>, ScriptFault> {
        let handle = self
            .bindings
            .interactive
            .clone()
            .filter(|_| self.profile.has_interactive_handle);
        handle.ok_or_else(|| {
            ScriptFault::new(
                ErrorKind::MissingInteractiveContext,
                "the interactive map handle is not available in this environment",
            )
        })
    }

    pub fn run_algorithm(&self, algorithm_id: &str, parameters: &Value) -> Result<Value, ScriptFault> {
        let registry = self
            .bindings
            .algorithms
            .clone()
            .filter(|_| self.profile.has_processing_registry)
            .ok_or_else(|| {
                ScriptFault::new(
                    ErrorKind::AlgorithmNotFound,
                    format!("no processing registry available to run `{algorithm_id}`"),
                )
            })?;
        if !registry.has_algorithm(algorithm_id) {
            return Err(ScriptFault::new(
                ErrorKind::AlgorithmNotFound,
                format!("algorithm `{algorithm_id}` is not registered"),
            ));
        }
        registry
            .run(algorithm_id, parameters)
            .map_err(|err| ScriptFault::runtime(format!("{algorithm_id}: {err:#}")))
    }

    pub async fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, ScriptFault> {
        self.workspace
            .write_artifact(name, bytes)
            .await
            .map_err(|err| ScriptFault::runtime(err.to_string()))
    }
}

/// Executes a script body against a [`ScriptContext`].
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// File-based runtimes read [`ScriptContext::script_path`]; in-process
    /// runtimes interpret `script` directly.
    async fn run(&self, script: &str, ctx: ScriptContext) -> Result<(), ScriptFault>;
}

/// Adapts an async closure into a runtime, for embedding hosts and tests.
pub struct FnRuntime<F> {
    name: String,
    f: F,
}

impl<F> FnRuntime<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> ScriptRuntime for FnRuntime<F>
where
    F: Fn(String, ScriptContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ScriptFault>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, script: &str, ctx: ScriptContext) -> Result<(), ScriptFault> {
        (self.f)(script.to_string(), ctx).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn print_splits_lines_and_gated_objects_fault() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ctx, mut rx) = test_support::context(dir.path(), "").await;
        ctx.print("a\nb");
        assert_eq!(rx.recv().await, Some(RunOutput::Stdout("a".to_string())));
        assert_eq!(rx.recv().await, Some(RunOutput::Stdout("b".to_string())));

        let fault = ctx.interactive().err().expect("headless");
        assert_eq!(fault.kind, ErrorKind::MissingInteractiveContext);
        let fault = ctx
            .run_algorithm("native:buffer", &Value::Null)
            .expect_err("no registry");
        assert_eq!(fault.kind, ErrorKind::AlgorithmNotFound);
        let fault = ctx.source("missing").err().expect("unknown source");
        assert_eq!(fault.kind, ErrorKind::InvalidSource);
    }

    #[test]
    fn source_errors_map_onto_taxonomy() {
        let fault = ScriptFault::from_source_error("roads", SourceError::ReadOnly("roads".into()));
        assert_eq!(fault.kind, ErrorKind::UnsupportedOperation);
        let fault = ScriptFault::from_source_error("roads", SourceError::FeatureNotFound(3));
        assert_eq!(fault.kind, ErrorKind::UncaughtRuntimeError);
        assert!(fault.message.contains("feature 3"));
        let fault =
            ScriptFault::from_source_error("roads", SourceError::InvalidGeometry("x".into()));
        assert_eq!(fault.kind, ErrorKind::InvalidGeometry);
    }

    #[test]
    fn fault_converts_to_structured_error() {
        let err: StructuredError = ScriptFault::runtime("ZeroDivisionError: division by zero")
            .with_traceback("line 3")
            .into();
        assert_eq!(err.kind, ErrorKind::UncaughtRuntimeError);
        assert_eq!(err.traceback.as_deref(), Some("line 3"));
    }
}
