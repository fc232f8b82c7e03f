use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Severity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    SystemLog,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Code,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub kind: BlockKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl MessageBlock {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Text,
            body: body.into(),
            language: None,
        }
    }

    pub fn code(body: impl Into<String>, language: Option<String>) -> Self {
        Self {
            kind: BlockKind::Code,
            body: body.into(),
            language,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub blocks: Vec<MessageBlock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl ChatMessage {
    pub fn new(role: Role, blocks: Vec<MessageBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            blocks,
            timestamp: Utc::now(),
            severity: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessageBlock::text(text)])
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn code_blocks(&self) -> impl Iterator<Item = &MessageBlock> {
        self.blocks.iter().filter(|b| b.kind == BlockKind::Code)
    }

    /// First code block, treated as the canonical script of the message.
    pub fn canonical_script(&self) -> Option<&str> {
        self.code_blocks().next().map(|b| b.body.as_str())
    }

    pub fn plain_text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| match b.kind {
                BlockKind::Text => b.body.clone(),
                BlockKind::Code => format!(
                    "```{}\n{}\n```",
                    b.language.as_deref().unwrap_or(""),
                    b.body.trim_end()
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_script_is_first_code_block() {
        let msg = ChatMessage::new(
            Role::Assistant,
            vec![
                MessageBlock::text("Here you go"),
                MessageBlock::code("print(1)", Some("python".to_string())),
                MessageBlock::code("print(2)", None),
            ],
        );
        assert_eq!(msg.canonical_script(), Some("print(1)"));
        assert!(msg.plain_text().contains("```python\nprint(1)\n```"));
    }
}
