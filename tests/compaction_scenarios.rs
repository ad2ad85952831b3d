mod common;

use lcm_core::compaction::CompactRequest;
use lcm_core::ids::{ConversationId, ItemId, MessageId};
use lcm_core::model::{Message, Role};

async fn seed_long_conversation(engine: &lcm_core::LcmEngine, conv: &ConversationId, count: i64) {
    engine.store.create_conversation(conv, "session-1", None, 0).await.unwrap();
    for i in 0..count {
        let message_id = MessageId::derive(conv.as_str(), &i.to_string(), 1_000);
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        let text = format!("turn {i}: discussing the authentication chain and how requests flow through the gateway");
        let message = Message {
            message_id: message_id.clone(),
            conversation_id: conv.clone(),
            ordinal: i,
            role,
            author_id: None,
            content_text: text.clone(),
            payload_json: serde_json::json!({}),
            created_at_ms: 1_000 + i,
        };
        engine.store.create_message(&message).await.unwrap();
        let item_id = ItemId::derive(conv.as_str(), &format!("ctx-{i}"), 1_000 + i);
        engine.store.append_context_message(&item_id, conv, &message_id, text, 1_000 + i).await.unwrap();
    }
}

#[tokio::test]
async fn manual_compaction_reduces_active_tokens_by_at_least_thirty_percent() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_manual_compaction");
    seed_long_conversation(&engine, &conv, 24).await;

    let request = CompactRequest {
        conversation_id: conv.clone(),
        model_budget: 10_000,
        target_tokens: 80,
        fresh_tail_count: 2,
        manual: true,
        custom_instructions: None,
    };

    let result = engine.compaction.compact(request, 5_000).await.unwrap();
    assert!(result.compacted);
    assert!(result.batches.leaf >= 1);

    let reduction = 1.0 - (result.tokens_after as f64 / result.tokens_before as f64);
    assert!(reduction >= 0.30, "expected at least 30% reduction, got {:.2}", reduction);

    let integrity = engine.integrity.scan(Some(&conv), lcm_core::integrity::ScanMode::Check).await.unwrap();
    assert!(integrity.ok, "compaction must not leave dangling lineage or duplicate ordinals: {:?}", integrity.violations);
}

#[tokio::test]
async fn manual_compaction_condenses_leaf_summaries_in_one_call() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_condensed_pass");
    seed_long_conversation(&engine, &conv, 40).await;

    let request = CompactRequest {
        conversation_id: conv.clone(),
        model_budget: 10_000,
        target_tokens: 20,
        fresh_tail_count: 2,
        manual: true,
        custom_instructions: None,
    };

    let result = engine.compaction.compact(request, 5_000).await.unwrap();
    assert!(result.compacted);
    assert!(result.batches.leaf >= 2, "needs several leaf batches before adjacent leaves exist to condense");
    assert!(result.batches.condensed >= 1, "condensed pass should fire in the same compact() call that produced its leaf summaries");

    let integrity = engine.integrity.scan(Some(&conv), lcm_core::integrity::ScanMode::Check).await.unwrap();
    assert!(integrity.ok, "condensed pass must not leave dangling lineage or duplicate ordinals: {:?}", integrity.violations);
}

#[tokio::test]
async fn compaction_below_threshold_is_a_no_op() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_small");
    seed_long_conversation(&engine, &conv, 3).await;

    let request = CompactRequest {
        conversation_id: conv.clone(),
        model_budget: 10_000,
        target_tokens: 500,
        fresh_tail_count: 8,
        manual: false,
        custom_instructions: None,
    };

    let result = engine.compaction.compact(request, 5_000).await.unwrap();
    assert!(!result.compacted);
    assert_eq!(result.tokens_before, result.tokens_after);
}
