use std::sync::Arc;

use geocopilot_types::{ChatMessage, ExecutionRequest, ExecutionResult, RequestOrigin};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{RetryConfig, RetryScope};
use crate::conversation::ConversationTurn;
use crate::preflight::ApiManifest;

static MISSING_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'(\w+)' object has no attribute '(\w+)'").expect("static regex")
});
static NOT_FOUND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(Qgs\w+)\.(\w+) not found").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryState {
    Retrying { turn: ConversationTurn },
    GaveUp,
}

/// Bounded follow-up state for one failing script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySession {
    pub id: String,
    pub original_request: ExecutionRequest,
    pub failure_result: ExecutionResult,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub state: RetryState,
}

impl RetrySession {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RetryState::GaveUp)
    }

    pub fn turn(&self) -> Option<&ConversationTurn> {
        match &self.state {
            RetryState::Retrying { turn } => Some(turn),
            RetryState::GaveUp => None,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Request carrying the collaborator's corrected script. Targets, origin
    /// message and workspace carry over from the first request.
    pub fn next_request(&self, script: impl Into<String>) -> ExecutionRequest {
        let original = &self.original_request;
        let mut request = ExecutionRequest::new(script, original.workspace_root.clone())
            .with_targets(original.declared_target_layers.clone())
            .with_origin(RequestOrigin::DebugRetry {
                session_id: self.id.clone(),
                attempt: self.attempt_count,
            });
        request.originating_message_id = original.originating_message_id.clone();
        request.filename_hint = original.filename_hint.clone();
        request
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("{0} results are not retryable")]
    NotRetryable(&'static str),
    #[error("result {result_id} does not belong to request {request_id}")]
    RequestMismatch {
        request_id: String,
        result_id: String,
    },
}

/// Turns failed results into bounded retry sessions. Never calls the
/// collaborator itself.
#[derive(Debug, Clone)]
pub struct DebugRetryOrchestrator {
    max_attempts: u32,
    scope: RetryScope,
    manifest: Option<Arc<ApiManifest>>,
}

impl DebugRetryOrchestrator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            scope: RetryScope::default(),
            manifest: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts).with_scope(config.scope)
    }

    pub fn with_scope(mut self, scope: RetryScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_manifest(mut self, manifest: Arc<ApiManifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn scope(&self) -> RetryScope {
        self.scope
    }

    pub fn on_failure(
        &self,
        request: &ExecutionRequest,
        result: &ExecutionResult,
        session: Option<RetrySession>,
        prior_messages: Vec<ChatMessage>,
    ) -> Result<RetrySession, OrchestratorError> {
        if result.request_id != request.id {
            return Err(OrchestratorError::RequestMismatch {
                request_id: request.id.clone(),
                result_id: result.request_id.clone(),
            });
        }
        if !result.status.is_retryable() {
            return Err(OrchestratorError::NotRetryable(result.status.as_str()));
        }

        let session = match (session, self.scope) {
            (Some(_), RetryScope::PerRequest) if request.is_user_initiated() => None,
            (session, _) => session,
        };

        let mut session = match session {
            Some(existing) if existing.is_terminal() => return Ok(existing),
            Some(mut existing) => {
                existing.attempt_count = (existing.attempt_count + 1).min(existing.max_attempts);
                existing.failure_result = result.clone();
                existing
            }
            None => RetrySession {
                id: uuid::Uuid::new_v4().to_string(),
                original_request: request.clone(),
                failure_result: result.clone(),
                attempt_count: 1,
                max_attempts: self.max_attempts,
                state: RetryState::GaveUp,
            },
        };

        session.state = if session.attempt_count >= session.max_attempts {
            tracing::info!(
                session_id = %session.id,
                attempts = session.attempt_count,
                "retry budget exhausted"
            );
            RetryState::GaveUp
        } else {
            RetryState::Retrying {
                turn: ConversationTurn {
                    provider_id: None,
                    prior_messages,
                    text: self.suggest_fix(&request.script_text, result),
                    prior_script: Some(request.script_text.clone()),
                    failure: result.structured_error.clone(),
                },
            }
        };
        Ok(session)
    }

    /// A success ends the session.
    pub fn on_success(&self, _session: Option<RetrySession>) -> Option<RetrySession> {
        None
    }

    fn suggest_fix(&self, script: &str, result: &ExecutionResult) -> String {
        let (summary, details) = match &result.structured_error {
            Some(err) => (
                err.summary(),
                err.traceback.clone().unwrap_or_else(|| err.message.clone()),
            ),
            None => (
                format!("[{}] run failed", result.status.as_str()),
                result.stdout_lines.join("\n"),
            ),
        };

        let mut out = vec![
            "The code execution failed. Please analyze the error and provide a corrected version."
                .to_string(),
            String::new(),
            "SPECIFIC FIX NEEDED:".to_string(),
            summary,
        ];
        let hints = self.api_hints(&details);
        if !hints.is_empty() {
            out.push(String::new());
            out.push("CORRECT API USAGE:".to_string());
            out.extend(hints);
        }
        out.extend([
            String::new(),
            "Error Details:".to_string(),
            "```".to_string(),
            details,
            "```".to_string(),
            String::new(),
            "FAILED CODE:".to_string(),
            "```python".to_string(),
            script.trim_end().to_string(),
            "```".to_string(),
            String::new(),
            "TASK: Provide corrected code that fixes the error above. Return one complete \
             script in a single fenced python block."
                .to_string(),
        ]);
        out.join("\n")
    }

    fn api_hints(&self, details: &str) -> Vec<String> {
        let Some(manifest) = &self.manifest else {
            return Vec::new();
        };
        MISSING_ATTR_RE
            .captures_iter(details)
            .chain(NOT_FOUND_RE.captures_iter(details))
            .filter_map(|caps| {
                let (class, attr) = (&caps[1], &caps[2]);
                let suggestions = manifest.suggest(class, attr);
                (!suggestions.is_empty()).then(|| {
                    format!(
                        "- {class}.{attr} does not exist. Did you mean: {}?",
                        suggestions.join(", ")
                    )
                })
            })
            .collect()
    }
}

impl Default for DebugRetryOrchestrator {
    fn default() -> Self {
        Self::new(RetryConfig::default().max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use geocopilot_types::{ErrorKind, ExecutionStatus, StructuredError, TargetLayer};

    fn failed(request: &ExecutionRequest, message: &str) -> ExecutionResult {
        ExecutionResult {
            request_id: request.id.clone(),
            run_id: uuid::Uuid::new_v4().to_string(),
            status: ExecutionStatus::RuntimeError,
            stdout_lines: vec![],
            structured_error: Some(
                StructuredError::new(ErrorKind::UncaughtRuntimeError, message)
                    .with_traceback(format!("Traceback (most recent call last):\n{message}")),
            ),
            produced_artifacts: vec![],
            duration_ms: 12,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn third_failure_with_three_attempts_is_terminal() {
        let orchestrator = DebugRetryOrchestrator::new(3);
        let request = ExecutionRequest::new("print(x)", "/tmp/ws");
        let first = orchestrator
            .on_failure(&request, &failed(&request, "NameError: x"), None, vec![])
            .expect("first");
        assert_eq!(first.attempt_count, 1);
        let turn = first.turn().expect("turn");
        assert_eq!(turn.prior_script.as_deref(), Some("print(x)"));
        assert_eq!(
            turn.failure.as_ref().map(|e| e.kind),
            Some(ErrorKind::UncaughtRuntimeError)
        );
        assert!(turn.text.contains("FAILED CODE:\n```python\nprint(x)\n```"));

        let retry = first.next_request("print(y)");
        let second = orchestrator
            .on_failure(&retry, &failed(&retry, "NameError: y"), Some(first), vec![])
            .expect("second");
        assert_eq!(second.attempt_count, 2);
        assert!(!second.is_terminal());

        let retry = second.next_request("print(z)");
        let third = orchestrator
            .on_failure(&retry, &failed(&retry, "NameError: z"), Some(second), vec![])
            .expect("third");
        assert_eq!(third.attempt_count, 3);
        assert!(third.is_terminal());
        assert!(third.turn().is_none());
        assert_eq!(third.remaining(), 0);

        let again = orchestrator
            .on_failure(&retry, &failed(&retry, "NameError: z"), Some(third), vec![])
            .expect("gave up");
        assert_eq!(again.attempt_count, 3);
        assert!(again.is_terminal());
    }

    #[test]
    fn success_and_cancel_are_not_retryable() {
        let orchestrator = DebugRetryOrchestrator::default();
        let request = ExecutionRequest::new("print(1)", "/tmp/ws");
        let mut result = failed(&request, "x");
        result.status = ExecutionStatus::Cancelled;
        assert_eq!(
            orchestrator.on_failure(&request, &result, None, vec![]),
            Err(OrchestratorError::NotRetryable("cancelled"))
        );
        result.status = ExecutionStatus::Success;
        assert!(orchestrator
            .on_failure(&request, &result, None, vec![])
            .is_err());
    }

    #[test]
    fn result_must_belong_to_request() {
        let orchestrator = DebugRetryOrchestrator::default();
        let request = ExecutionRequest::new("print(1)", "/tmp/ws");
        let other = ExecutionRequest::new("print(2)", "/tmp/ws");
        let err = orchestrator
            .on_failure(&request, &failed(&other, "x"), None, vec![])
            .expect_err("mismatch");
        assert!(matches!(err, OrchestratorError::RequestMismatch { .. }));
    }

    #[test]
    fn retry_request_keeps_targets_and_origin() {
        let orchestrator = DebugRetryOrchestrator::new(2);
        let request = ExecutionRequest::new("print(x)", "/tmp/ws")
            .from_message("msg-1")
            .with_targets(vec![TargetLayer::read("roads")]);
        let session = orchestrator
            .on_failure(&request, &failed(&request, "boom"), None, vec![])
            .expect("session");
        let next = session.next_request("print(1)");
        assert_eq!(next.declared_target_layers, request.declared_target_layers);
        assert_eq!(next.originating_message_id.as_deref(), Some("msg-1"));
        assert_eq!(
            next.origin,
            RequestOrigin::DebugRetry {
                session_id: session.id.clone(),
                attempt: 1
            }
        );
    }

    #[test]
    fn per_request_scope_resets_on_new_user_script() {
        let orchestrator = DebugRetryOrchestrator::new(2);
        let request = ExecutionRequest::new("a()", "/tmp/ws");
        let session = orchestrator
            .on_failure(&request, &failed(&request, "x"), None, vec![])
            .expect("first");
        let fresh = ExecutionRequest::new("b()", "/tmp/ws");
        let reset = orchestrator
            .on_failure(&fresh, &failed(&fresh, "x"), Some(session.clone()), vec![])
            .expect("reset");
        assert_eq!(reset.attempt_count, 1);
        assert_ne!(reset.id, session.id);

        let shared = DebugRetryOrchestrator::new(2).with_scope(RetryScope::PerConversation);
        let continued = shared
            .on_failure(&fresh, &failed(&fresh, "x"), Some(session), vec![])
            .expect("continued");
        assert_eq!(continued.attempt_count, 2);
        assert!(continued.is_terminal());
    }

    #[test]
    fn missing_attribute_gets_manifest_hint() {
        let orchestrator =
            DebugRetryOrchestrator::new(3).with_manifest(Arc::new(ApiManifest::builtin()));
        let request = ExecutionRequest::new("shader.setColorRamp(ramp)", "/tmp/ws");
        let result = failed(
            &request,
            "AttributeError: 'QgsColorRampShader' object has no attribute 'setColorRamp'",
        );
        let session = orchestrator
            .on_failure(&request, &result, None, vec![])
            .expect("session");
        let text = &session.turn().expect("turn").text;
        assert!(text.contains("CORRECT API USAGE:"));
        assert!(text.contains("setSourceColorRamp"));
    }
}
