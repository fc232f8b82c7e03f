use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ErrorKind, Operation, StructuredError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLayer {
    pub source_id: String,
    #[serde(default = "default_target_operations")]
    pub operations: Vec<Operation>,
}

fn default_target_operations() -> Vec<Operation> {
    vec![Operation::Read]
}

impl TargetLayer {
    pub fn read(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            operations: default_target_operations(),
        }
    }

    pub fn with_operations(source_id: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            source_id: source_id.into(),
            operations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestOrigin {
    User,
    DebugRetry { session_id: String, attempt: u32 },
}

/// A script body bound for the sandbox. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    pub script_text: String,
    pub originating_message_id: Option<String>,
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub declared_target_layers: Vec<TargetLayer>,
    pub origin: RequestOrigin,
    #[serde(default)]
    pub filename_hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(script_text: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            script_text: script_text.into(),
            originating_message_id: None,
            workspace_root: workspace_root.into(),
            declared_target_layers: Vec::new(),
            origin: RequestOrigin::User,
            filename_hint: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_message(mut self, message_id: impl Into<String>) -> Self {
        self.originating_message_id = Some(message_id.into());
        self
    }

    pub fn with_targets(mut self, targets: Vec<TargetLayer>) -> Self {
        self.declared_target_layers = targets;
        self
    }

    pub fn with_origin(mut self, origin: RequestOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_filename_hint(mut self, hint: impl Into<String>) -> Self {
        self.filename_hint = Some(hint.into());
        self
    }

    pub fn is_user_initiated(&self) -> bool {
        matches!(self.origin, RequestOrigin::User)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    ValidationFailed,
    RuntimeError,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::ValidationFailed => "validation_failed",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ExecutionStatus::RuntimeError | ExecutionStatus::ValidationFailed
        )
    }
}

/// Lifecycle of one run inside the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Validating,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Validating)
                | (RunState::Pending, RunState::Running)
                | (RunState::Pending, RunState::Failed)
                | (RunState::Pending, RunState::Cancelled)
                | (RunState::Validating, RunState::Running)
                | (RunState::Validating, RunState::Failed)
                | (RunState::Validating, RunState::Cancelled)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub run_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub stdout_lines: Vec<String>,
    #[serde(default)]
    pub structured_error: Option<StructuredError>,
    #[serde(default)]
    pub produced_artifacts: Vec<PathBuf>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.structured_error.as_ref().map(|e| e.kind)
    }
}
