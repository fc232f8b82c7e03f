use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSource,
    UnsupportedOperation,
    InvalidReferenceSystem,
    InvalidGeometry,
    AlgorithmNotFound,
    MissingInteractiveContext,
    Timeout,
    Cancelled,
    UncaughtRuntimeError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidSource => "invalid_source",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::InvalidReferenceSystem => "invalid_reference_system",
            ErrorKind::InvalidGeometry => "invalid_geometry",
            ErrorKind::AlgorithmNotFound => "algorithm_not_found",
            ErrorKind::MissingInteractiveContext => "missing_interactive_context",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::UncaughtRuntimeError => "uncaught_runtime_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuredError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl StructuredError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        let traceback = traceback.into();
        if !traceback.trim().is_empty() {
            self.traceback = Some(traceback);
        }
        self
    }

    pub fn summary(&self) -> String {
        format!("[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}
