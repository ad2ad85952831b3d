//! Data model: the rows that make up the conversation store. These are
//! plain structs — the storage layer is responsible for the SQL shape, these
//! are what callers actually hold onto.

use serde::{Deserialize, Serialize};

use crate::ids::{ArtifactId, ConversationId, EdgeRelation, ItemId, MessageId, PartId, RunId, SummaryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartKind {
    Text,
    Image,
    ToolCall,
    ToolResult,
    Thinking,
    Json,
    Other,
}

impl PartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartKind::Text => "text",
            PartKind::Image => "image",
            PartKind::ToolCall => "toolCall",
            PartKind::ToolResult => "toolResult",
            PartKind::Thinking => "thinking",
            PartKind::Json => "json",
            PartKind::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(PartKind::Text),
            "image" => Some(PartKind::Image),
            "toolCall" => Some(PartKind::ToolCall),
            "toolResult" => Some(PartKind::ToolResult),
            "thinking" => Some(PartKind::Thinking),
            "json" => Some(PartKind::Json),
            _ => Some(PartKind::Other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextItemType {
    Message,
    Summary,
    Note,
    Artifact,
}

impl ContextItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextItemType::Message => "message",
            ContextItemType::Summary => "summary",
            ContextItemType::Note => "note",
            ContextItemType::Artifact => "artifact",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "message" => Some(ContextItemType::Message),
            "summary" => Some(ContextItemType::Summary),
            "note" => Some(ContextItemType::Note),
            "artifact" => Some(ContextItemType::Artifact),
            _ => None,
        }
    }
}

/// Whether a summary item is a leaf (derived straight from messages) or
/// condensed (derived from adjacent leaf summaries). Stored in
/// `ContextItem.metadata_json` rather than as its own column, since it only
/// applies to `item_type = summary` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Leaf,
    Condensed,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Leaf => "leaf",
            SummaryKind::Condensed => "condensed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "leaf" => Some(SummaryKind::Leaf),
            "condensed" => Some(SummaryKind::Condensed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub session_id: String,
    pub channel: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub ordinal: i64,
    pub role: Role,
    pub author_id: Option<String>,
    pub content_text: String,
    pub payload_json: serde_json::Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    pub part_id: PartId,
    pub message_id: MessageId,
    pub part_index: i64,
    pub kind: PartKind,
    pub mime_type: Option<String>,
    pub text_content: Option<String>,
    pub blob_path: Option<String>,
    pub token_count: Option<i64>,
    pub payload_json: serde_json::Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub item_id: ItemId,
    pub conversation_id: ConversationId,
    pub source_message_id: Option<MessageId>,
    pub item_type: ContextItemType,
    pub depth: i64,
    pub title: Option<String>,
    pub body: String,
    pub metadata_json: serde_json::Value,
    pub tombstoned: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ContextItem {
    /// The token estimate used throughout assembly and compaction: title +
    /// body, the same measurement used to decide what counts as active
    /// context.
    pub fn token_estimate(&self) -> i64 {
        crate::token::estimate_tokens_many([self.title.as_deref().unwrap_or(""), self.body.as_str()])
    }

    pub fn summary_kind(&self) -> Option<SummaryKind> {
        self.metadata_json
            .get("summaryKind")
            .and_then(|v| v.as_str())
            .and_then(SummaryKind::parse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    pub parent_item_id: ItemId,
    pub child_item_id: ItemId,
    pub relation: EdgeRelation,
    pub metadata_json: serde_json::Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl CompactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionStatus::Running => "running",
            CompactionStatus::Completed => "completed",
            CompactionStatus::Failed => "failed",
            CompactionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(CompactionStatus::Running),
            "completed" => Some(CompactionStatus::Completed),
            "failed" => Some(CompactionStatus::Failed),
            "skipped" => Some(CompactionStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionRun {
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub strategy: String,
    pub status: CompactionStatus,
    pub summary_item_id: Option<ItemId>,
    pub input_item_count: i64,
    pub output_item_count: i64,
    pub error_text: Option<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub conversation_id: ConversationId,
    pub message_id: Option<MessageId>,
    pub part_id: Option<PartId>,
    pub path: String,
    pub mime_type: Option<String>,
    pub bytes: Option<i64>,
    pub sha256: Option<String>,
    pub created_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
    }

    #[test]
    fn context_item_token_estimate_includes_title() {
        let item = ContextItem {
            item_id: ItemId::new("item_1"),
            conversation_id: ConversationId::new("conv_1"),
            source_message_id: None,
            item_type: ContextItemType::Summary,
            depth: 1,
            title: Some("Compacted 4 messages".to_string()),
            body: "- [0] user: hi".to_string(),
            metadata_json: serde_json::json!({}),
            tombstoned: false,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert!(item.token_estimate() > crate::token::estimate_tokens(&item.body));
    }
}
