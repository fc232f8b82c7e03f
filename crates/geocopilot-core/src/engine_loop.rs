use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use geocopilot_observability::{emit_event, ObservabilityEvent, ProcessKind};
use geocopilot_types::{
    ChatMessage, EngineEvent, ExecutionRequest, ExecutionResult, ExecutionStatus, Role,
    TargetLayer,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::aggregator::spawn_log_pump;
use crate::cancellation::CancellationRegistry;
use crate::config::{AppConfig, ConfigStore};
use crate::conversation::{
    extract_script, Conversation, ConversationCollaborator, ConversationTurn, Intent,
};
use crate::environment::EnvironmentMonitor;
use crate::event_bus::EventBus;
use crate::history::{ExecutionHistory, ExecutionStatistics};
use crate::retry::{DebugRetryOrchestrator, RetrySession};
use crate::sandbox::SandboxExecutor;
use crate::workspace::Workspace;

const RETRY_CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum DebugOutcome {
    Retried(ExecutionResult),
    GaveUp { attempts: u32 },
    /// The collaborator round trip was cancelled; the failure stays pending.
    Cancelled,
    NothingToDebug,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Copied { script: String },
    Saved { path: PathBuf },
    Executed(ExecutionResult),
    Debugged(DebugOutcome),
}

struct LoopState {
    conversation: Conversation,
    retry: Option<RetrySession>,
    pending_failure: Option<(ExecutionRequest, ExecutionResult)>,
    history: ExecutionHistory,
}

/// One conversation wired to the collaborator and the sandbox. Scripts run
/// one at a time, so results land in submission order.
#[derive(Clone)]
pub struct CopilotLoop {
    config: ConfigStore,
    environment: EnvironmentMonitor,
    executor: SandboxExecutor,
    collaborator: Arc<dyn ConversationCollaborator>,
    event_bus: EventBus,
    cancellations: CancellationRegistry,
    state: Arc<Mutex<LoopState>>,
    run_lock: Arc<Mutex<()>>,
    process: ProcessKind,
}

impl CopilotLoop {
    pub fn new(
        config: ConfigStore,
        environment: EnvironmentMonitor,
        executor: SandboxExecutor,
        collaborator: Arc<dyn ConversationCollaborator>,
        event_bus: EventBus,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            config,
            environment,
            executor,
            collaborator,
            event_bus,
            cancellations,
            state: Arc::new(Mutex::new(LoopState {
                conversation: Conversation::new(),
                retry: None,
                pending_failure: None,
                history: ExecutionHistory::default(),
            })),
            run_lock: Arc::new(Mutex::new(())),
            process: ProcessKind::Host,
        }
    }

    pub fn with_history_limit(self, limit: usize) -> Self {
        if let Ok(mut state) = self.state.try_lock() {
            state.history = ExecutionHistory::new(limit);
        }
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    pub async fn conversation_id(&self) -> String {
        self.state.lock().await.conversation.id().to_string()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.conversation.messages().to_vec()
    }

    pub async fn retry_session(&self) -> Option<RetrySession> {
        self.state.lock().await.retry.clone()
    }

    pub async fn statistics(&self) -> ExecutionStatistics {
        self.state.lock().await.history.statistics()
    }

    pub async fn history_summary(&self, last_n: usize) -> String {
        self.state.lock().await.history.context_summary(last_n)
    }

    /// Cancels the running script and any pending collaborator round trip.
    pub async fn cancel(&self) -> bool {
        let id = self.conversation_id().await;
        let run = self.cancellations.cancel(&run_key(&id)).await;
        let prompt = self.cancellations.cancel(&prompt_key(&id)).await;
        run || prompt
    }

    /// Sends user text to the collaborator and appends both sides.
    pub async fn send_prompt(&self, text: &str) -> anyhow::Result<ChatMessage> {
        let (conversation_id, prior) = {
            let mut state = self.state.lock().await;
            let prior = state.conversation.tail(RETRY_CONTEXT_MESSAGES);
            let user = state.conversation.append_user(text);
            self.publish_message(state.conversation.id(), &user);
            (state.conversation.id().to_string(), prior)
        };
        let reply = self
            .complete(&conversation_id, ConversationTurn::prompt(text, prior))
            .await?;
        let mut state = self.state.lock().await;
        let assistant = state.conversation.append_assistant(&reply);
        self.publish_message(&conversation_id, &assistant);
        Ok(assistant)
    }

    pub async fn handle_intent(&self, intent: Intent) -> anyhow::Result<IntentOutcome> {
        match intent {
            Intent::Copy { message_id } => Ok(IntentOutcome::Copied {
                script: self.script_for(&message_id).await?,
            }),
            Intent::Edit { message_id } => {
                let script = self.script_for(&message_id).await?;
                let hint = self.state.lock().await.conversation.first_user_line();
                let config = self.config.get().await;
                let path = Workspace::new(config.executor.resolved_workspace_root())
                    .save_task_script(&script, hint.as_deref())
                    .await?;
                tracing::info!("saved task script to {}", path.display());
                Ok(IntentOutcome::Saved { path })
            }
            Intent::Run { message_id } => {
                let script = self.script_for(&message_id).await?;
                let result = self
                    .run_script(&script, Some(message_id), Vec::new())
                    .await?;
                Ok(IntentOutcome::Executed(result))
            }
            Intent::Debug => Ok(IntentOutcome::Debugged(self.debug().await?)),
        }
    }

    /// Runs a user-initiated script, then auto-debugs when configured.
    pub async fn run_script(
        &self,
        script: &str,
        message_id: Option<String>,
        targets: Vec<TargetLayer>,
    ) -> anyhow::Result<ExecutionResult> {
        let config = self.config.get().await;
        let hint = self.state.lock().await.conversation.first_user_line();
        let mut request = ExecutionRequest::new(script, config.executor.resolved_workspace_root())
            .with_targets(targets);
        if let Some(id) = message_id {
            request = request.from_message(id);
        }
        if let Some(hint) = hint {
            request = request.with_filename_hint(hint);
        }
        let result = self.execute(request).await?;
        if !config.executor.auto_debug || !result.status.is_retryable() {
            return Ok(result);
        }
        let mut last = result;
        loop {
            match self.debug().await? {
                DebugOutcome::Retried(result) => {
                    let done = result.is_success() || !result.status.is_retryable();
                    last = result;
                    if done {
                        return Ok(last);
                    }
                }
                DebugOutcome::GaveUp { .. }
                | DebugOutcome::Cancelled
                | DebugOutcome::NothingToDebug => return Ok(last),
            }
        }
    }

    /// One debug round: package the pending failure, ask the collaborator for
    /// a fix and run it. Until a corrected script is in hand the failure and
    /// the previous retry session are restored on every exit.
    pub async fn debug(&self) -> anyhow::Result<DebugOutcome> {
        let config = self.config.get().await;
        let orchestrator = DebugRetryOrchestrator::from_config(&config.retry)
            .with_manifest(self.executor.manifest());

        let (conversation_id, failure, previous, session) = {
            let mut state = self.state.lock().await;
            let Some((request, result)) = state.pending_failure.take() else {
                return Ok(DebugOutcome::NothingToDebug);
            };
            let prior = state.conversation.tail(RETRY_CONTEXT_MESSAGES);
            let previous = state.retry.take();
            let session =
                match orchestrator.on_failure(&request, &result, previous.clone(), prior) {
                    Ok(session) => session,
                    Err(err) => {
                        state.retry = previous;
                        state.pending_failure = Some((request, result));
                        return Err(err.into());
                    }
                };
            state.retry = Some(session.clone());
            (
                state.conversation.id().to_string(),
                (request, result),
                previous,
                session,
            )
        };

        let Some(turn) = session.turn().cloned() else {
            self.event_bus.publish(EngineEvent::new(
                "retry.gave_up",
                json!({
                    "conversationID": conversation_id,
                    "retrySessionID": session.id,
                    "attempts": session.attempt_count,
                }),
            ));
            tracing::info!(
                "retry session {} gave up after {} attempts",
                session.id,
                session.attempt_count
            );
            return Ok(DebugOutcome::GaveUp {
                attempts: session.attempt_count,
            });
        };

        self.event_bus.publish(EngineEvent::new(
            "retry.started",
            json!({
                "conversationID": conversation_id,
                "retrySessionID": session.id,
                "attempt": session.attempt_count,
                "maxAttempts": session.max_attempts,
            }),
        ));
        let reply = match self.round_trip(&conversation_id, turn).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.restore_failure(failure, previous).await;
                tracing::info!("retry session {} cancelled before a fix arrived", session.id);
                return Ok(DebugOutcome::Cancelled);
            }
            Err(err) => {
                self.restore_failure(failure, previous).await;
                return Err(err);
            }
        };
        let assistant = {
            let mut state = self.state.lock().await;
            let assistant = state.conversation.append_assistant(&reply);
            self.publish_message(&conversation_id, &assistant);
            assistant
        };
        let Some(script) = extract_script(&reply) else {
            self.restore_failure(failure, previous).await;
            bail!("collaborator reply contained no script");
        };
        let request = session.next_request(script).from_message(assistant.id);
        let result = self.execute(request).await?;
        Ok(DebugOutcome::Retried(result))
    }

    async fn restore_failure(
        &self,
        failure: (ExecutionRequest, ExecutionResult),
        previous: Option<RetrySession>,
    ) {
        let mut state = self.state.lock().await;
        state.retry = previous;
        state.pending_failure = Some(failure);
    }

    async fn script_for(&self, message_id: &str) -> anyhow::Result<String> {
        let state = self.state.lock().await;
        let message = state
            .conversation
            .get(message_id)
            .with_context(|| format!("unknown message `{message_id}`"))?;
        match message.canonical_script() {
            Some(script) => Ok(script.to_string()),
            None => bail!("message `{message_id}` has no code block"),
        }
    }

    async fn complete(
        &self,
        conversation_id: &str,
        turn: ConversationTurn,
    ) -> anyhow::Result<String> {
        self.round_trip(conversation_id, turn)
            .await?
            .ok_or_else(|| anyhow!("collaborator request cancelled"))
    }

    /// `Ok(None)` when the round trip was cancelled.
    async fn round_trip(
        &self,
        conversation_id: &str,
        mut turn: ConversationTurn,
    ) -> anyhow::Result<Option<String>> {
        let config: AppConfig = self.config.get().await;
        let provider = config.active_provider().map(|(id, _)| id);
        turn.provider_id = provider.clone();
        let key = prompt_key(conversation_id);
        let cancel = self.cancellations.create(&key).await;
        self.emit_provider(Level::INFO, conversation_id, provider.as_deref(), "start");
        let reply = tokio::select! {
            reply = self.collaborator.complete(turn, cancel.clone()) => reply,
            _ = cancel.cancelled() => Err(anyhow!("collaborator request cancelled")),
        };
        self.cancellations.remove(&key).await;
        if cancel.is_cancelled() {
            self.emit_provider(Level::INFO, conversation_id, provider.as_deref(), "cancelled");
            return Ok(None);
        }
        match &reply {
            Ok(_) => self.emit_provider(Level::INFO, conversation_id, provider.as_deref(), "ok"),
            Err(_) => {
                self.emit_provider(Level::ERROR, conversation_id, provider.as_deref(), "error")
            }
        }
        reply.map(Some)
    }

    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionResult> {
        let _turn = self.run_lock.lock().await;
        let config = self.config.get().await;
        let conversation_id = self.conversation_id().await;
        let detection = self.environment.detection().await;

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (coalesced_tx, mut coalesced_rx) = mpsc::unbounded_channel();
        let pump = spawn_log_pump(config.executor.coalesce_window(), log_rx, coalesced_tx);
        let appender = {
            let state = self.state.clone();
            let bus = self.event_bus.clone();
            let conversation_id = conversation_id.clone();
            tokio::spawn(async move {
                while let Some(log) = coalesced_rx.recv().await {
                    let message = state.lock().await.conversation.append_log(log);
                    bus.publish(message_event(&conversation_id, &message));
                }
            })
        };

        self.event_bus.publish(EngineEvent::new(
            "run.started",
            json!({
                "conversationID": conversation_id,
                "requestID": request.id,
                "origin": request.origin,
            }),
        ));
        let key = run_key(&conversation_id);
        let cancel: CancellationToken = self.cancellations.create(&key).await;
        let result = self
            .executor
            .execute_streaming(&request, &detection, log_tx, cancel)
            .await;
        self.cancellations.remove(&key).await;
        pump.await.context("log pump")?;
        appender.await.context("log appender")?;

        self.event_bus.publish(EngineEvent::new(
            "run.finished",
            json!({
                "conversationID": conversation_id,
                "requestID": result.request_id,
                "runID": result.run_id,
                "status": result.status,
                "errorKind": result.error_kind(),
                "durationMs": result.duration_ms,
                "artifacts": result.produced_artifacts,
            }),
        ));

        let mut state = self.state.lock().await;
        state.history.record(&request.script_text, &result);
        match result.status {
            ExecutionStatus::Success => {
                let session = state.retry.take();
                state.retry = DebugRetryOrchestrator::default().on_success(session);
                state.pending_failure = None;
            }
            status if status.is_retryable() => {
                state.pending_failure = Some((request, result.clone()));
            }
            _ => state.pending_failure = None,
        }
        Ok(result)
    }

    fn publish_message(&self, conversation_id: &str, message: &ChatMessage) {
        self.event_bus
            .publish(message_event(conversation_id, message));
    }

    fn emit_provider(
        &self,
        level: Level,
        conversation_id: &str,
        provider_id: Option<&str>,
        status: &str,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event: "provider.call",
                component: "copilot.loop",
                conversation_id: Some(conversation_id),
                provider_id,
                status: Some(status),
                ..Default::default()
            },
        );
    }
}

fn run_key(conversation_id: &str) -> String {
    format!("{conversation_id}:run")
}

fn prompt_key(conversation_id: &str) -> String {
    format!("{conversation_id}:prompt")
}

fn message_event(conversation_id: &str, message: &ChatMessage) -> EngineEvent {
    EngineEvent::new(
        "message.appended",
        json!({
            "conversationID": conversation_id,
            "messageID": message.id,
            "role": message.role,
            "severity": message.severity,
            "text": message.plain_text(),
            "isLog": message.role == Role::SystemLog,
        }),
    )
}
