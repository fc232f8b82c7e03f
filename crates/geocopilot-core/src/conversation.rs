use async_trait::async_trait;
use geocopilot_types::{BlockKind, ChatMessage, MessageBlock, Role, StructuredError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::aggregator::CoalescedLog;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(```|~~~)[ \t]*([\w+#.-]*)[^\n]*\n(.*?)(?:\n)?(```|~~~)").expect("static regex")
});
static INLINE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").expect("static regex"));
const INLINE_CODE_MARKERS: &[&str] = &["iface", "project", "layer", "canvas", "Qgs", "=", "def ", "import "];

/// Splits assistant text into ordered text and fenced code blocks.
pub fn parse_blocks(text: &str) -> Vec<MessageBlock> {
    fn push_text(blocks: &mut Vec<MessageBlock>, body: &str) {
        let body = body.trim();
        if !body.is_empty() {
            blocks.push(MessageBlock::text(body));
        }
    }

    let mut blocks = Vec::new();
    let mut cursor = 0;
    for caps in FENCE_RE.captures_iter(text) {
        let (Some(whole), Some(open), Some(close)) = (caps.get(0), caps.get(1), caps.get(4)) else {
            continue;
        };
        if open.as_str() != close.as_str() {
            continue;
        }
        push_text(&mut blocks, &text[cursor..whole.start()]);
        let language = caps
            .get(2)
            .map(|m| m.as_str().trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty());
        let body = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        blocks.push(MessageBlock::code(body.trim_end(), language));
        cursor = whole.end();
    }
    push_text(&mut blocks, &text[cursor..]);
    blocks
}

/// First fenced block, falling back to single-backtick lines that look like code.
/// An empty first block means no script; later blocks are never promoted.
pub fn extract_script(text: &str) -> Option<String> {
    let fenced = parse_blocks(text)
        .into_iter()
        .find(|b| b.kind == BlockKind::Code);
    if let Some(block) = fenced {
        return Some(block.body).filter(|body| !body.trim().is_empty());
    }
    let inline = INLINE_CODE_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|snippet| INLINE_CODE_MARKERS.iter().any(|m| snippet.contains(m)))
        .collect::<Vec<_>>();
    if inline.is_empty() {
        None
    } else {
        Some(inline.join("\n"))
    }
}

/// Append-only record of one chat.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    messages: Vec<ChatMessage>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn append_user(&mut self, text: &str) -> ChatMessage {
        self.push(ChatMessage::user(text))
    }

    pub fn append_assistant(&mut self, text: &str) -> ChatMessage {
        self.push(ChatMessage::new(Role::Assistant, parse_blocks(text)))
    }

    pub fn append_log(&mut self, log: CoalescedLog) -> ChatMessage {
        self.push(log.into_message())
    }

    fn push(&mut self, message: ChatMessage) -> ChatMessage {
        self.messages.push(message.clone());
        message
    }

    /// The most recent `n` messages, oldest first.
    pub fn tail(&self, n: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    /// Text of the first user message, used to name task files.
    pub fn first_user_line(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.blocks.first())
            .and_then(|b| b.body.lines().next())
            .map(str::to_string)
    }
}

/// One request to the language-model collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub provider_id: Option<String>,
    pub prior_messages: Vec<ChatMessage>,
    pub text: String,
    #[serde(default)]
    pub prior_script: Option<String>,
    #[serde(default)]
    pub failure: Option<StructuredError>,
}

impl ConversationTurn {
    pub fn prompt(text: impl Into<String>, prior_messages: Vec<ChatMessage>) -> Self {
        Self {
            provider_id: None,
            prior_messages,
            text: text.into(),
            prior_script: None,
            failure: None,
        }
    }
}

/// Text in, text out. Provider transport lives behind this trait.
#[async_trait]
pub trait ConversationCollaborator: Send + Sync {
    async fn complete(
        &self,
        turn: ConversationTurn,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;
}

/// User actions on a message in the presentation surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    Copy { message_id: String },
    Edit { message_id: String },
    Run { message_id: String },
    Debug,
}
