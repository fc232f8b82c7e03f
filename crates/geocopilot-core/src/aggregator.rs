use std::ops::Deref;
use std::time::Duration;

use geocopilot_types::{ChatMessage, LogEvent, MessageBlock, Role, Severity};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A system-log message. Only [`LogAggregator`] can create one, so the
/// conversation cannot be handed a system-log message from anywhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedLog {
    message: ChatMessage,
    event_count: usize,
}

impl CoalescedLog {
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn severity(&self) -> Severity {
        self.message.severity.unwrap_or(Severity::Info)
    }

    pub fn into_message(self) -> ChatMessage {
        self.message
    }
}

impl Deref for CoalescedLog {
    type Target = ChatMessage;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

fn render_line(event: &LogEvent) -> String {
    match event.severity {
        Severity::Info => event.text.clone(),
        Severity::Warning => format!("warning: {}", event.text),
        Severity::Error => format!("error: {}", event.text),
    }
}

/// Buffers log events and coalesces each fixed window into one message.
#[derive(Debug)]
pub struct LogAggregator {
    window: Duration,
    pending: Vec<LogEvent>,
    window_start: Option<Instant>,
}

impl LogAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            window_start: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the open window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.window_start.map(|start| start + self.window)
    }

    pub fn observe(&mut self, event: LogEvent) -> Option<CoalescedLog> {
        self.observe_at(event, Instant::now())
    }

    /// Returns the previous window's message when `event` falls outside it.
    pub fn observe_at(&mut self, event: LogEvent, now: Instant) -> Option<CoalescedLog> {
        let flushed = self.flush_if_expired(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.pending.push(event);
        flushed
    }

    pub fn flush_if_expired(&mut self, now: Instant) -> Option<CoalescedLog> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<CoalescedLog> {
        self.window_start = None;
        if self.pending.is_empty() {
            return None;
        }
        let events = std::mem::take(&mut self.pending);
        let severity = events
            .iter()
            .map(|e| e.severity)
            .max()
            .unwrap_or(Severity::Info);
        let blocks = events
            .iter()
            .map(|e| MessageBlock::text(render_line(e)))
            .collect::<Vec<_>>();
        let mut message = ChatMessage::new(Role::SystemLog, blocks).with_severity(severity);
        if let Some(last) = events.last() {
            message.timestamp = last.timestamp;
        }
        Some(CoalescedLog {
            message,
            event_count: events.len(),
        })
    }
}

/// Drives an aggregator from a channel. Window expiry flushes on a timer; the
/// channel closing (run finished or cancelled) flushes immediately.
pub fn spawn_log_pump(
    window: Duration,
    mut events: mpsc::UnboundedReceiver<LogEvent>,
    out: mpsc::UnboundedSender<CoalescedLog>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut aggregator = LogAggregator::new(window);
        loop {
            let deadline = aggregator.deadline();
            tokio::select! {
                biased;
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(message) = aggregator.observe(event) {
                        let _ = out.send(message);
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if let Some(message) = aggregator.flush() {
                        let _ = out.send(message);
                    }
                }
            }
        }
        if let Some(message) = aggregator.flush() {
            let _ = out.send(message);
        }
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
