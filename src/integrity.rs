//! Integrity Checker (C11): scans the conversation store for the
//! violation classes in the data-model invariants and, in repair mode,
//! fixes the ones that have an unambiguous fix-up action.

use std::sync::Arc;

use sqlx::Row;

use crate::error::LcmResult;
use crate::ids::ConversationId;
use crate::observability::Recorder;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationCode {
    SummaryWithoutSource,
    ContextItemMissingSourceMessage,
    MessageContextMissingCanonicalMessage,
    OrphanMessagePart,
    DuplicateMessageOrdinal,
    DuplicateMessagePartOrdinal,
    LineageEdgeMissingEndpoint,
    ContextItemMissingConversation,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::SummaryWithoutSource => "summary_without_source",
            ViolationCode::ContextItemMissingSourceMessage => "context_item_missing_source_message",
            ViolationCode::MessageContextMissingCanonicalMessage => "message_context_missing_canonical_message",
            ViolationCode::OrphanMessagePart => "orphan_message_part",
            ViolationCode::DuplicateMessageOrdinal => "duplicate_message_ordinal",
            ViolationCode::DuplicateMessagePartOrdinal => "duplicate_message_part_ordinal",
            ViolationCode::LineageEdgeMissingEndpoint => "lineage_edge_missing_endpoint",
            ViolationCode::ContextItemMissingConversation => "context_item_missing_conversation",
        }
    }

    pub fn severity(&self) -> &'static str {
        match self {
            ViolationCode::DuplicateMessageOrdinal | ViolationCode::DuplicateMessagePartOrdinal => "critical",
            _ => "warning",
        }
    }

    /// Whether this class of violation has an unambiguous, safe repair
    /// action. Duplicate-ordinal violations do not: picking which of two
    /// colliding rows to keep is a judgment call this checker won't make.
    pub fn fixable(&self) -> bool {
        !matches!(self, ViolationCode::DuplicateMessageOrdinal | ViolationCode::DuplicateMessagePartOrdinal)
    }

    fn all() -> [ViolationCode; 8] {
        [
            ViolationCode::SummaryWithoutSource,
            ViolationCode::ContextItemMissingSourceMessage,
            ViolationCode::MessageContextMissingCanonicalMessage,
            ViolationCode::OrphanMessagePart,
            ViolationCode::DuplicateMessageOrdinal,
            ViolationCode::DuplicateMessagePartOrdinal,
            ViolationCode::LineageEdgeMissingEndpoint,
            ViolationCode::ContextItemMissingConversation,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub code: ViolationCode,
    pub target_id: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct InvariantCheck {
    pub id: String,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct RepairAction {
    pub code: ViolationCode,
    pub target_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct RepairPlan {
    pub actions: Vec<RepairAction>,
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub applied_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Check,
    Repair,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub ok: bool,
    pub violations: Vec<Violation>,
    pub invariants: Vec<InvariantCheck>,
    pub repair_plan: RepairPlan,
    pub pre_repair_violation_count: usize,
    pub repair_result: Option<RepairOutcome>,
}

pub struct IntegrityChecker {
    store: Store,
    recorder: Arc<Recorder>,
}

impl IntegrityChecker {
    pub fn new(store: Store, recorder: Arc<Recorder>) -> Self {
        Self { store, recorder }
    }

    pub async fn scan(&self, conversation_id: Option<&ConversationId>, mode: ScanMode) -> LcmResult<ScanResult> {
        let mut violations = Vec::new();
        violations.extend(self.find_summary_without_source(conversation_id).await?);
        violations.extend(self.find_context_item_missing_source_message(conversation_id).await?);
        violations.extend(self.find_message_context_missing_canonical_message(conversation_id).await?);
        violations.extend(self.find_orphan_message_part(conversation_id).await?);
        violations.extend(self.find_duplicate_message_ordinal(conversation_id).await?);
        violations.extend(self.find_duplicate_message_part_ordinal(conversation_id).await?);
        violations.extend(self.find_lineage_edge_missing_endpoint(conversation_id).await?);
        violations.extend(self.find_context_item_missing_conversation(conversation_id).await?);

        for violation in &violations {
            self.recorder.record_integrity_failure(violation.code.as_str(), violation.code.severity(), violation.code.fixable());
        }

        let pre_repair_violation_count = violations.len();
        let invariants = ViolationCode::all()
            .into_iter()
            .map(|code| InvariantCheck { id: code.as_str().to_string(), ok: !violations.iter().any(|v| v.code == code) })
            .collect();

        let repair_plan = build_repair_plan(&violations);

        let repair_result = if mode == ScanMode::Repair && !repair_plan.actions.is_empty() {
            Some(self.apply_repair_plan(&repair_plan).await?)
        } else {
            None
        };

        Ok(ScanResult { ok: pre_repair_violation_count == 0, violations, invariants, repair_plan, pre_repair_violation_count, repair_result })
    }

    async fn find_summary_without_source(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT item_id FROM context_items c
                 WHERE c.item_type = 'summary' AND c.tombstoned = 0 AND c.conversation_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM lineage_edges e WHERE e.parent_item_id = c.item_id)",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query(
                "SELECT item_id FROM context_items c
                 WHERE c.item_type = 'summary' AND c.tombstoned = 0
                   AND NOT EXISTS (SELECT 1 FROM lineage_edges e WHERE e.parent_item_id = c.item_id)",
            )
            .fetch_all(self.store.pool())
            .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("item_id").ok())
            .map(|id| Violation { code: ViolationCode::SummaryWithoutSource, detail: format!("summary {id} has no lineage edges to source items"), target_id: id })
            .collect())
    }

    async fn find_context_item_missing_source_message(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query("SELECT item_id FROM context_items WHERE item_type = 'message' AND source_message_id IS NULL AND conversation_id = ?1")
                .bind(conv.as_str())
                .fetch_all(self.store.pool())
                .await?
        } else {
            sqlx::query("SELECT item_id FROM context_items WHERE item_type = 'message' AND source_message_id IS NULL")
                .fetch_all(self.store.pool())
                .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("item_id").ok())
            .map(|id| Violation { code: ViolationCode::ContextItemMissingSourceMessage, detail: format!("message-type context item {id} has no source_message_id"), target_id: id })
            .collect())
    }

    async fn find_message_context_missing_canonical_message(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT c.item_id FROM context_items c
                 WHERE c.item_type = 'message' AND c.source_message_id IS NOT NULL AND c.conversation_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.message_id = c.source_message_id)",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query(
                "SELECT c.item_id FROM context_items c
                 WHERE c.item_type = 'message' AND c.source_message_id IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.message_id = c.source_message_id)",
            )
            .fetch_all(self.store.pool())
            .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("item_id").ok())
            .map(|id| Violation {
                code: ViolationCode::MessageContextMissingCanonicalMessage,
                detail: format!("context item {id} points at a missing canonical message"),
                target_id: id,
            })
            .collect())
    }

    async fn find_orphan_message_part(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT p.part_id FROM message_parts p
                 WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.message_id = p.message_id AND m.conversation_id = ?1)",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query("SELECT p.part_id FROM message_parts p WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.message_id = p.message_id)")
                .fetch_all(self.store.pool())
                .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("part_id").ok())
            .map(|id| Violation { code: ViolationCode::OrphanMessagePart, detail: format!("message part {id} has no owning message"), target_id: id })
            .collect())
    }

    async fn find_duplicate_message_ordinal(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT conversation_id || ':' || ordinal AS key, COUNT(*) AS n FROM messages
                 WHERE conversation_id = ?1 GROUP BY conversation_id, ordinal HAVING COUNT(*) > 1",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query("SELECT conversation_id || ':' || ordinal AS key, COUNT(*) AS n FROM messages GROUP BY conversation_id, ordinal HAVING COUNT(*) > 1")
                .fetch_all(self.store.pool())
                .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .map(|key| Violation { code: ViolationCode::DuplicateMessageOrdinal, detail: format!("duplicate ordinal at {key}"), target_id: key })
            .collect())
    }

    async fn find_duplicate_message_part_ordinal(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT p.message_id || ':' || p.part_index AS key, COUNT(*) AS n FROM message_parts p
                 JOIN messages m ON m.message_id = p.message_id
                 WHERE m.conversation_id = ?1 GROUP BY p.message_id, p.part_index HAVING COUNT(*) > 1",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query("SELECT message_id || ':' || part_index AS key, COUNT(*) AS n FROM message_parts GROUP BY message_id, part_index HAVING COUNT(*) > 1")
                .fetch_all(self.store.pool())
                .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .map(|key| Violation { code: ViolationCode::DuplicateMessagePartOrdinal, detail: format!("duplicate part_index at {key}"), target_id: key })
            .collect())
    }

    async fn find_lineage_edge_missing_endpoint(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT e.parent_item_id || '->' || e.child_item_id || ':' || e.relation AS key FROM lineage_edges e
                 WHERE (NOT EXISTS (SELECT 1 FROM context_items c WHERE c.item_id = e.parent_item_id)
                        OR NOT EXISTS (SELECT 1 FROM context_items c WHERE c.item_id = e.child_item_id))
                   AND (e.parent_item_id IN (SELECT item_id FROM context_items WHERE conversation_id = ?1)
                        OR e.child_item_id IN (SELECT item_id FROM context_items WHERE conversation_id = ?1))",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query(
                "SELECT e.parent_item_id || '->' || e.child_item_id || ':' || e.relation AS key FROM lineage_edges e
                 WHERE NOT EXISTS (SELECT 1 FROM context_items c WHERE c.item_id = e.parent_item_id)
                    OR NOT EXISTS (SELECT 1 FROM context_items c WHERE c.item_id = e.child_item_id)",
            )
            .fetch_all(self.store.pool())
            .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .map(|key| Violation { code: ViolationCode::LineageEdgeMissingEndpoint, detail: format!("lineage edge {key} references a missing endpoint"), target_id: key })
            .collect())
    }

    async fn find_context_item_missing_conversation(&self, conversation_id: Option<&ConversationId>) -> LcmResult<Vec<Violation>> {
        let rows = if let Some(conv) = conversation_id {
            sqlx::query(
                "SELECT item_id FROM context_items c WHERE c.conversation_id = ?1
                 AND NOT EXISTS (SELECT 1 FROM conversations v WHERE v.conversation_id = c.conversation_id)",
            )
            .bind(conv.as_str())
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query(
                "SELECT item_id FROM context_items c
                 WHERE NOT EXISTS (SELECT 1 FROM conversations v WHERE v.conversation_id = c.conversation_id)",
            )
            .fetch_all(self.store.pool())
            .await?
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("item_id").ok())
            .map(|id| Violation { code: ViolationCode::ContextItemMissingConversation, detail: format!("context item {id} references a missing conversation"), target_id: id })
            .collect())
    }

    async fn apply_repair_plan(&self, plan: &RepairPlan) -> LcmResult<RepairOutcome> {
        let mut tx = self.store.pool().begin().await?;
        let mut applied = 0usize;

        for action in &plan.actions {
            match action.code {
                ViolationCode::SummaryWithoutSource | ViolationCode::ContextItemMissingSourceMessage | ViolationCode::MessageContextMissingCanonicalMessage | ViolationCode::ContextItemMissingConversation => {
                    sqlx::query("UPDATE context_items SET tombstoned = 1 WHERE item_id = ?1").bind(&action.target_id).execute(&mut *tx).await?;
                    applied += 1;
                }
                ViolationCode::OrphanMessagePart => {
                    sqlx::query("DELETE FROM message_parts WHERE part_id = ?1").bind(&action.target_id).execute(&mut *tx).await?;
                    applied += 1;
                }
                ViolationCode::LineageEdgeMissingEndpoint => {
                    if let Some((parent, rest)) = action.target_id.split_once("->") {
                        if let Some((child, relation)) = rest.split_once(':') {
                            sqlx::query("DELETE FROM lineage_edges WHERE parent_item_id = ?1 AND child_item_id = ?2 AND relation = ?3")
                                .bind(parent)
                                .bind(child)
                                .bind(relation)
                                .execute(&mut *tx)
                                .await?;
                            applied += 1;
                        }
                    }
                }
                ViolationCode::DuplicateMessageOrdinal | ViolationCode::DuplicateMessagePartOrdinal => {}
            }
        }

        tx.commit().await?;
        Ok(RepairOutcome { applied_count: applied })
    }
}

fn build_repair_plan(violations: &[Violation]) -> RepairPlan {
    let actions = violations
        .iter()
        .filter(|v| v.code.fixable())
        .map(|v| RepairAction { code: v.code, target_id: v.target_id.clone(), description: repair_description(v) })
        .collect();
    RepairPlan { actions }
}

fn repair_description(violation: &Violation) -> String {
    match violation.code {
        ViolationCode::SummaryWithoutSource | ViolationCode::ContextItemMissingSourceMessage | ViolationCode::MessageContextMissingCanonicalMessage | ViolationCode::ContextItemMissingConversation => {
            format!("tombstone context item {}", violation.target_id)
        }
        ViolationCode::OrphanMessagePart => format!("delete orphan message part {}", violation.target_id),
        ViolationCode::LineageEdgeMissingEndpoint => format!("delete dangling lineage edge {}", violation.target_id),
        ViolationCode::DuplicateMessageOrdinal | ViolationCode::DuplicateMessagePartOrdinal => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ConversationId, ItemId, MessageId};
    use crate::model::{ContextItem, ContextItemType};
    use crate::storage;

    async fn checker_with_store() -> (IntegrityChecker, Store, ConversationId) {
        let pool = storage::connect_in_memory().await.unwrap();
        let store = Store::new(pool, crate::storage::busy_ceiling_default());
        let conv = ConversationId::new("conv_integrity");
        store.create_conversation(&conv, "s1", None, 0).await.unwrap();
        let checker = IntegrityChecker::new(store.clone(), Arc::new(Recorder::new(100)));
        (checker, store, conv)
    }

    #[tokio::test]
    async fn clean_store_reports_ok() {
        let (checker, _store, conv) = checker_with_store().await;
        let result = checker.scan(Some(&conv), ScanMode::Check).await.unwrap();
        assert!(result.ok);
        assert!(result.invariants.iter().all(|i| i.ok));
    }

    #[tokio::test]
    async fn dangling_message_context_item_is_detected_and_repaired() {
        let (checker, store, conv) = checker_with_store().await;
        let item_id = ItemId::derive(conv.as_str(), "dangling", 1_000);
        store
            .append_context_message(&item_id, &conv, &MessageId::new("msg_missing"), "orphan body".into(), 1_000)
            .await
            .unwrap();

        let checked = checker.scan(Some(&conv), ScanMode::Check).await.unwrap();
        assert!(!checked.ok);
        assert!(checked.violations.iter().any(|v| v.code == ViolationCode::MessageContextMissingCanonicalMessage));
        assert!(checked.repair_result.is_none());

        let repaired = checker.scan(Some(&conv), ScanMode::Repair).await.unwrap();
        assert_eq!(repaired.repair_result.unwrap().applied_count, 1);

        let item = store.get_context_item(&item_id).await.unwrap().unwrap();
        assert!(item.tombstoned);
    }

    #[tokio::test]
    async fn summary_without_lineage_is_flagged() {
        let (checker, store, conv) = checker_with_store().await;
        let summary = ContextItem {
            item_id: ItemId::derive(conv.as_str(), "lonely-summary", 1_000),
            conversation_id: conv.clone(),
            source_message_id: None,
            item_type: ContextItemType::Summary,
            depth: 1,
            title: Some("Lonely summary".into()),
            body: "body".into(),
            metadata_json: serde_json::json!({}),
            tombstoned: false,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
        };
        store.insert_summary(&summary).await.unwrap();

        let result = checker.scan(Some(&conv), ScanMode::Check).await.unwrap();
        assert!(result.violations.iter().any(|v| v.code == ViolationCode::SummaryWithoutSource));
    }
}
