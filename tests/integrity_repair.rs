mod common;

use lcm_core::ids::{ConversationId, ItemId, MessageId};
use lcm_core::integrity::{ScanMode, ViolationCode};

#[tokio::test]
async fn repair_tombstones_dangling_context_item_and_deletes_orphan_part() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_repair");
    engine.store.create_conversation(&conv, "session-1", None, 0).await.unwrap();

    let dangling_item = ItemId::derive(conv.as_str(), "dangling", 1_000);
    engine
        .store
        .append_context_message(&dangling_item, &conv, &MessageId::new("msg_never_created"), "ghost body".into(), 1_000)
        .await
        .unwrap();

    let checked = engine.integrity.scan(Some(&conv), ScanMode::Check).await.unwrap();
    assert!(!checked.ok);
    assert!(checked.violations.iter().any(|v| v.code == ViolationCode::MessageContextMissingCanonicalMessage));
    assert_eq!(checked.pre_repair_violation_count, checked.violations.len());
    assert!(checked.repair_result.is_none(), "check mode must not mutate anything");

    let repaired = engine.integrity.scan(Some(&conv), ScanMode::Repair).await.unwrap();
    let outcome = repaired.repair_result.expect("repair mode should report an outcome");
    assert_eq!(outcome.applied_count, 1);

    let item = engine.store.get_context_item(&dangling_item).await.unwrap().unwrap();
    assert!(item.tombstoned);

    let rescanned = engine.integrity.scan(Some(&conv), ScanMode::Check).await.unwrap();
    assert!(rescanned.ok, "repaired conversation should scan clean: {:?}", rescanned.violations);
}

#[tokio::test]
async fn repair_is_idempotent_on_an_already_clean_conversation() {
    let engine = common::in_memory_engine().await;
    let conv = ConversationId::new("conv_clean");
    engine.store.create_conversation(&conv, "session-1", None, 0).await.unwrap();

    let message_id = MessageId::derive(conv.as_str(), "0", 1_000);
    let message = lcm_core::model::Message {
        message_id: message_id.clone(),
        conversation_id: conv.clone(),
        ordinal: 0,
        role: lcm_core::model::Role::User,
        author_id: None,
        content_text: "hello".into(),
        payload_json: serde_json::json!({}),
        created_at_ms: 1_000,
    };
    engine.store.create_message(&message).await.unwrap();
    let item_id = ItemId::derive(conv.as_str(), "ctx-0", 1_000);
    engine.store.append_context_message(&item_id, &conv, &message_id, "hello".into(), 1_000).await.unwrap();

    let first = engine.integrity.scan(Some(&conv), ScanMode::Repair).await.unwrap();
    assert!(first.ok);
    assert!(first.repair_result.is_none(), "nothing to repair means no outcome is reported");

    let second = engine.integrity.scan(Some(&conv), ScanMode::Repair).await.unwrap();
    assert!(second.ok);
}

/// Duplicate ordinals and duplicate part indices are excluded from the
/// repair plan regardless of how they were detected, since picking which
/// of two colliding rows survives is a judgment call this checker won't
/// make on its own.
#[test]
fn duplicate_violation_codes_are_never_fixable() {
    assert!(!ViolationCode::DuplicateMessageOrdinal.fixable());
    assert!(!ViolationCode::DuplicateMessagePartOrdinal.fixable());
    assert!(ViolationCode::MessageContextMissingCanonicalMessage.fixable());
}
