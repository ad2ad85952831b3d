//! Ingestion (C4): normalizes an external message sequence into canonical
//! [`Message`]/[`MessagePart`] rows and seeds one `ContextItem{type=message}`
//! per message.

use serde::{Deserialize, Serialize};

use crate::error::LcmResult;
use crate::ids::{ConversationId, ItemId, MessageId, PartId};
use crate::model::{Message, MessagePart, PartKind, Role};
use crate::store::Store;

/// One turn as handed in by the chat transport, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: InboundContent,
    pub author_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundContent {
    Text(String),
    Parts(Vec<InboundPart>),
}

impl Default for InboundContent {
    fn default() -> Self {
        InboundContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundPart {
    #[serde(default = "default_part_kind")]
    pub kind: String,
    pub text: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_part_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IngestMeta {
    pub conversation_id: Option<String>,
}

/// `meta.conversationId` wins, falling back to `session_id`.
pub fn resolve_conversation_id(session_id: &str, meta: &IngestMeta) -> ConversationId {
    match &meta.conversation_id {
        Some(id) if !id.is_empty() => ConversationId::new(id.clone()),
        _ => ConversationId::new(session_id.to_string()),
    }
}

pub struct IngestResult {
    pub messages: Vec<Message>,
    pub context_item_ids: Vec<ItemId>,
}

/// Persist `inbound` as canonical rows starting at the conversation's next
/// dense ordinal (`starting_ordinal`), in one request.
pub async fn ingest_messages(
    store: &Store,
    conversation_id: &ConversationId,
    session_id: &str,
    starting_ordinal: i64,
    inbound: &[InboundMessage],
    now_ms: i64,
) -> LcmResult<IngestResult> {
    store.create_conversation(conversation_id, session_id, None, now_ms).await?;

    let mut messages = Vec::with_capacity(inbound.len());
    let mut context_item_ids = Vec::with_capacity(inbound.len());

    for (offset, raw) in inbound.iter().enumerate() {
        let ordinal = starting_ordinal + offset as i64;
        let role = normalize_role(&raw.role);
        let message_id = MessageId::derive(conversation_id.as_str(), &format!("ingest-{ordinal}"), now_ms);

        let (content_text, parts) = match &raw.content {
            InboundContent::Text(text) => (text.clone(), Vec::new()),
            InboundContent::Parts(raw_parts) => {
                let parts = build_parts(&message_id, raw_parts, now_ms);
                let joined: String = parts
                    .iter()
                    .filter(|p| p.kind == PartKind::Text)
                    .filter_map(|p| p.text_content.as_deref())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                let content_text = if joined.is_empty() {
                    serde_json::to_string(raw_parts).unwrap_or_default()
                } else {
                    joined
                };
                (content_text, parts)
            }
        };

        let message = Message {
            message_id: message_id.clone(),
            conversation_id: conversation_id.clone(),
            ordinal,
            role,
            author_id: raw.author_id.clone(),
            content_text: content_text.clone(),
            payload_json: serde_json::json!({}),
            created_at_ms: now_ms + offset as i64,
        };
        store.create_message(&message).await?;
        if !parts.is_empty() {
            store.create_message_parts(&parts).await?;
        }

        let item_id = ItemId::derive(conversation_id.as_str(), &format!("ctx-{ordinal}"), now_ms + offset as i64);
        store
            .append_context_message(&item_id, conversation_id, &message_id, content_text, now_ms + offset as i64)
            .await?;

        messages.push(message);
        context_item_ids.push(item_id);
    }

    Ok(IngestResult { messages, context_item_ids })
}

/// Tool-call results collapse to `role=tool`; anything unrecognized falls
/// back to `user` rather than failing ingestion outright.
fn normalize_role(raw: &str) -> Role {
    match raw {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" | "tool_result" | "toolResult" => Role::Tool,
        _ => Role::User,
    }
}

fn build_parts(message_id: &MessageId, raw_parts: &[InboundPart], now_ms: i64) -> Vec<MessagePart> {
    raw_parts
        .iter()
        .enumerate()
        .map(|(idx, raw)| {
            let kind = PartKind::parse(&raw.kind).unwrap_or(PartKind::Other);
            let text_content = raw.text.clone();
            let token_count = text_content.as_deref().map(crate::token::estimate_tokens);
            MessagePart {
                part_id: PartId::derive(message_id.as_str(), &idx.to_string(), now_ms),
                message_id: message_id.clone(),
                part_index: idx as i64,
                kind,
                mime_type: raw.mime_type.clone(),
                text_content,
                blob_path: None,
                token_count,
                payload_json: raw.payload.clone(),
                created_at_ms: now_ms,
            }
        })
        .collect()
}
