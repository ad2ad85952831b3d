mod common;

use std::sync::Arc;

use common::{ScriptedSubagentRunner, TimingOutSubagentRunner};
use lcm_core::ids::{ConversationId, ItemId, MessageId};
use lcm_core::model::{ContextItem, ContextItemType, Message, Role};
use lcm_core::orchestrator::{OrchestrateRequest, Strategy, SubagentOrchestrator};

async fn seed_summary(engine: &lcm_core::LcmEngine, conv: &ConversationId, slug: &str) -> ItemId {
    engine.store.create_conversation(conv, "session-1", None, 0).await.unwrap();
    let message_id = MessageId::derive(conv.as_str(), "0", 1_000);
    let message = Message {
        message_id: message_id.clone(),
        conversation_id: conv.clone(),
        ordinal: 0,
        role: Role::User,
        author_id: None,
        content_text: "how does the gateway route requests".into(),
        payload_json: serde_json::json!({}),
        created_at_ms: 1_000,
    };
    engine.store.create_message(&message).await.unwrap();
    let message_item = ItemId::derive(conv.as_str(), "ctx-0", 1_000);
    engine.store.append_context_message(&message_item, conv, &message_id, message.content_text.clone(), 1_000).await.unwrap();

    let summary = ContextItem {
        item_id: ItemId::derive(conv.as_str(), slug, 2_000),
        conversation_id: conv.clone(),
        source_message_id: None,
        item_type: ContextItemType::Summary,
        depth: 1,
        title: Some("Gateway routing".into()),
        body: "The gateway routes requests by matching the longest path prefix.".into(),
        metadata_json: serde_json::json!({"summaryKind": "leaf"}),
        tombstoned: false,
        created_at_ms: 2_000,
        updated_at_ms: 2_000,
    };
    engine.store.insert_summary(&summary).await.unwrap();
    engine.store.link_summary_to_messages(&summary.item_id, &[message_item], 2_000).await.unwrap();
    summary.item_id
}

#[tokio::test]
async fn direct_strategy_with_no_runner_expands_in_process() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_direct");
    let summary_id = seed_summary(&engine, &conv, "summary-direct").await;

    let orchestrator = SubagentOrchestrator::new(engine.retrieval.clone(), None);
    let result = orchestrator
        .orchestrate(
            OrchestrateRequest {
                target_ids: vec![summary_id],
                question: "how does routing work".into(),
                session_key: None,
                depth: 1,
                token_cap: 2_000,
                include_messages: false,
                max_passes: 3,
                strategy: Strategy::Auto,
                direct_depth_threshold: 2,
            },
            3_000,
        )
        .await
        .unwrap();

    assert_eq!(result.strategy_used, Strategy::Direct);
    assert!(result.passes.is_empty());
}

#[tokio::test]
async fn subagent_strategy_runs_passes_and_deletes_gateway_session() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_subagent");
    let summary_id = seed_summary(&engine, &conv, "summary-subagent").await;

    let runner = Arc::new(ScriptedSubagentRunner::new(vec![
        "{\"synthesis\":\"routing matches longest prefix\",\"citedIds\":[\"item_1\"],\"nextSummaryIds\":[]}".to_string(),
    ]));
    let orchestrator = SubagentOrchestrator::new(engine.retrieval.clone(), Some(runner.clone()));

    let result = orchestrator
        .orchestrate(
            OrchestrateRequest {
                target_ids: vec![summary_id],
                question: "how does routing work".into(),
                session_key: None,
                depth: 5,
                token_cap: 2_000,
                include_messages: false,
                max_passes: 3,
                strategy: Strategy::Subagent,
                direct_depth_threshold: 1,
            },
            3_000,
        )
        .await
        .unwrap();

    assert_eq!(result.strategy_used, Strategy::Subagent);
    assert_eq!(result.passes.len(), 1);
    assert_eq!(result.cited_ids, vec!["item_1".to_string()]);
    assert_eq!(runner.deleted_sessions().len(), 1, "the gateway session must be torn down after the run");
}

#[tokio::test]
async fn subagent_wait_timeout_still_deletes_the_gateway_session() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_timeout");
    let summary_id = seed_summary(&engine, &conv, "summary-timeout").await;

    let runner = Arc::new(TimingOutSubagentRunner::new());
    let orchestrator = SubagentOrchestrator::new(engine.retrieval.clone(), Some(runner.clone()));

    let err = orchestrator
        .orchestrate(
            OrchestrateRequest {
                target_ids: vec![summary_id],
                question: "how does routing work".into(),
                session_key: None,
                depth: 5,
                token_cap: 2_000,
                include_messages: false,
                max_passes: 3,
                strategy: Strategy::Subagent,
                direct_depth_threshold: 1,
            },
            3_000,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, lcm_core::error::LcmError::ExternalTimeout(_)));
    assert_eq!(runner.deleted_sessions().len(), 1, "cleanup must still run when a pass times out");
}
