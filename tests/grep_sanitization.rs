mod common;

use lcm_core::ids::{ConversationId, ItemId, MessageId};
use lcm_core::model::{Message, Role};
use lcm_core::retrieval::{GrepMode, GrepRequest, GrepScope};

/// FTS5 treats bare `AND`/`OR`/`NOT` as boolean operators. A query containing
/// those words as ordinary search terms must still match literally instead of
/// being parsed as query syntax (or rejected outright).
#[tokio::test]
async fn full_text_grep_treats_boolean_operator_words_as_literal_terms() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_fts_sanitize");
    engine.store.create_conversation(&conv, "session-1", None, 0).await.unwrap();

    let message_id = MessageId::derive(conv.as_str(), "0", 1_000);
    let message = Message {
        message_id: message_id.clone(),
        conversation_id: conv.clone(),
        ordinal: 0,
        role: Role::User,
        author_id: None,
        content_text: "the gateway accepts requests and rejects malformed ones, not silently".into(),
        payload_json: serde_json::json!({}),
        created_at_ms: 1_000,
    };
    engine.store.create_message(&message).await.unwrap();
    let item_id = ItemId::derive(conv.as_str(), "ctx-0", 1_000);
    engine.store.append_context_message(&item_id, &conv, &message_id, message.content_text.clone(), 1_000).await.unwrap();

    let result = engine
        .retrieval
        .grep(
            &GrepRequest {
                query: "and not silently".into(),
                mode: GrepMode::FullText,
                scope: GrepScope::Messages,
                conversation_id: Some(conv.clone()),
                limit: 10,
                session_key: None,
            },
            2_000,
        )
        .await
        .unwrap();

    assert_eq!(result.matches.len(), 1, "boolean-operator words must be searched literally, not parsed as FTS syntax");
}

#[tokio::test]
async fn full_text_grep_respects_conversation_scope() {
    let engine = common::in_memory_engine().await;
    let conv_a = ConversationId::new("conv_fts_a");
    let conv_b = ConversationId::new("conv_fts_b");
    engine.store.create_conversation(&conv_a, "session-1", None, 0).await.unwrap();
    engine.store.create_conversation(&conv_b, "session-1", None, 0).await.unwrap();

    for (conv, slug) in [(&conv_a, "a"), (&conv_b, "b")] {
        let message_id = MessageId::derive(conv.as_str(), slug, 1_000);
        let message = Message {
            message_id: message_id.clone(),
            conversation_id: conv.clone(),
            ordinal: 0,
            role: Role::User,
            author_id: None,
            content_text: "routing prefix match".into(),
            payload_json: serde_json::json!({}),
            created_at_ms: 1_000,
        };
        engine.store.create_message(&message).await.unwrap();
        let item_id = ItemId::derive(conv.as_str(), &format!("ctx-{slug}"), 1_000);
        engine.store.append_context_message(&item_id, conv, &message_id, message.content_text.clone(), 1_000).await.unwrap();
    }

    let result = engine
        .retrieval
        .grep(
            &GrepRequest { query: "routing prefix".into(), mode: GrepMode::FullText, scope: GrepScope::Messages, conversation_id: Some(conv_a.clone()), limit: 10, session_key: None },
            2_000,
        )
        .await
        .unwrap();

    assert_eq!(result.matches.len(), 1);
    assert_eq!(result.matches[0].conversation_id, conv_a);
}
