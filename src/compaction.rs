//! Compaction Engine (C6): per-conversation-locked two-pass hierarchical
//! summarization. The leaf pass replaces batches of raw message items with
//! a leaf summary; the condensed pass merges adjacent leaf summaries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::capability::Summarizer;
use crate::config::CompactionConfig;
use crate::error::LcmResult;
use crate::ids::{ConversationId, EdgeRelation, ItemId};
use crate::model::{ContextItem, ContextItemType};
use crate::observability::Recorder;
use crate::store::{GetContextItemsFilter, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    Manual,
    TokenThreshold,
    MessageThreshold,
    None,
}

/// `token_trigger = floor(context_threshold * model_budget)`; reasons in
/// priority order `manual > token_threshold > message_threshold > none`.
pub fn evaluate_trigger(
    assembled_tokens: i64,
    model_budget: i64,
    context_threshold: f64,
    active_message_count: usize,
    max_active_messages: usize,
    manual: bool,
) -> CompactionTrigger {
    if manual {
        return CompactionTrigger::Manual;
    }
    let token_trigger = (context_threshold * model_budget as f64).floor() as i64;
    if assembled_tokens >= token_trigger {
        return CompactionTrigger::TokenThreshold;
    }
    if active_message_count > max_active_messages {
        return CompactionTrigger::MessageThreshold;
    }
    CompactionTrigger::None
}

/// Collapse whitespace, keep at most `max` code points, suffix `"..."` if
/// the input was longer.
pub fn truncate(text: &str, max: usize) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = collapsed.chars().collect();
    if chars.len() <= max {
        collapsed
    } else {
        let mut kept: String = chars[..max].iter().collect();
        kept.push_str("...");
        kept
    }
}

#[derive(Debug, Clone)]
pub struct CompactRequest {
    pub conversation_id: ConversationId,
    pub model_budget: i64,
    pub target_tokens: i64,
    pub fresh_tail_count: usize,
    pub manual: bool,
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchCounts {
    pub leaf: usize,
    pub condensed: usize,
}

#[derive(Debug, Clone)]
pub struct CompactResult {
    pub compacted: bool,
    pub summaries: Vec<ItemId>,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub batches: BatchCounts,
    pub decision: CompactionTrigger,
}

pub struct CompactionEngine {
    store: Store,
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
    recorder: Arc<Recorder>,
    locks: SyncMutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>,
}

impl CompactionEngine {
    pub fn new(store: Store, config: CompactionConfig, summarizer: Arc<dyn Summarizer>, recorder: Arc<Recorder>) -> Self {
        Self { store, config, summarizer, recorder, locks: SyncMutex::new(HashMap::new()) }
    }

    fn lock_for(&self, conversation_id: &ConversationId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(conversation_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn release_lock_if_unused(&self, conversation_id: &ConversationId, handle: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock();
        // strong_count == 2: one held by `handle` here, one in the map. No follower queued.
        if Arc::strong_count(&handle) <= 2 {
            locks.remove(conversation_id);
        }
    }

    pub async fn compact(&self, request: CompactRequest, now_ms: i64) -> LcmResult<CompactResult> {
        let handle = self.lock_for(&request.conversation_id);
        let guard = handle.clone().lock_owned().await;
        let result = self.compact_locked(&request, now_ms).await;
        drop(guard);
        self.release_lock_if_unused(&request.conversation_id, handle);
        result
    }

    async fn active_token_total(&self, conversation_id: &ConversationId) -> LcmResult<i64> {
        let items = self
            .store
            .get_context_items(conversation_id, &GetContextItemsFilter::default())
            .await?;
        Ok(items.iter().map(|item| item.token_estimate()).sum())
    }

    async fn compact_locked(&self, request: &CompactRequest, now_ms: i64) -> LcmResult<CompactResult> {
        let active_message_items = self
            .store
            .get_context_items(
                &request.conversation_id,
                &GetContextItemsFilter { include_tombstoned: false, item_types: vec![ContextItemType::Message], limit: None },
            )
            .await?;

        let decision = evaluate_trigger(
            request.target_tokens,
            request.model_budget,
            self.config.context_threshold,
            active_message_items.len(),
            self.config.max_active_messages,
            request.manual,
        );

        let tokens_before = self.active_token_total(&request.conversation_id).await?;

        if decision == CompactionTrigger::None {
            return Ok(CompactResult {
                compacted: false,
                summaries: Vec::new(),
                tokens_before,
                tokens_after: tokens_before,
                batches: BatchCounts { leaf: 0, condensed: 0 },
                decision,
            });
        }

        let mut summaries = Vec::new();
        let leaf_batches = self.run_leaf_pass(request, now_ms, &mut summaries).await?;
        let condensed_batches = self.run_condensed_pass(request, now_ms, &mut summaries).await?;

        let tokens_after = self.active_token_total(&request.conversation_id).await?;

        self.recorder.record_compaction_run(&request.conversation_id, decision, tokens_before, tokens_after);

        Ok(CompactResult {
            compacted: leaf_batches > 0 || condensed_batches > 0,
            summaries,
            tokens_before,
            tokens_after,
            batches: BatchCounts { leaf: leaf_batches, condensed: condensed_batches },
            decision,
        })
    }

    async fn run_leaf_pass(&self, request: &CompactRequest, now_ms: i64, summaries: &mut Vec<ItemId>) -> LcmResult<usize> {
        let mut batches = 0usize;
        loop {
            let active_total = self.active_token_total(&request.conversation_id).await?;
            if active_total <= request.target_tokens {
                break;
            }

            let mut active_message_items = self
                .store
                .get_context_items(
                    &request.conversation_id,
                    &GetContextItemsFilter { include_tombstoned: false, item_types: vec![ContextItemType::Message], limit: None },
                )
                .await?;
            if active_message_items.len() <= request.fresh_tail_count {
                break;
            }
            let protected = active_message_items.split_off(active_message_items.len() - request.fresh_tail_count);
            drop(protected);
            let candidates = active_message_items;
            if candidates.len() < 2 {
                break;
            }

            let batch_size = self.config.leaf_batch_size.min(candidates.len());
            let batch = &candidates[..batch_size];
            if batch.len() < 2 {
                break;
            }

            let summary_id = self.insert_leaf_summary(request, batch, now_ms).await?;
            summaries.push(summary_id);
            batches += 1;
        }
        Ok(batches)
    }

    async fn insert_leaf_summary(&self, request: &CompactRequest, batch: &[ContextItem], now_ms: i64) -> LcmResult<ItemId> {
        let message_ids: Vec<_> = batch.iter().filter_map(|item| item.source_message_id.clone()).collect();
        let messages = self.store.list_messages(&request.conversation_id, Some(&message_ids), None).await?;

        let mut lines = Vec::new();
        for message in &messages {
            lines.push(format!("- [{}] {}: {}", message.ordinal, message.role.as_str(), truncate(&message.content_text, 220)));
        }
        let deterministic_body = build_leaf_body(request.custom_instructions.as_deref(), &lines);
        let body = match self.summarizer.summarize(&deterministic_body, false).await {
            Ok(rewritten) if !rewritten.trim().is_empty() => rewritten,
            _ => deterministic_body,
        };

        let summary_id = ItemId::derive(request.conversation_id.as_str(), &format!("leaf-{now_ms}-{}", batch[0].item_id), now_ms);
        let summary = ContextItem {
            item_id: summary_id.clone(),
            conversation_id: request.conversation_id.clone(),
            source_message_id: None,
            item_type: ContextItemType::Summary,
            depth: 1,
            title: Some(format!("Compacted {} messages", messages.len())),
            body,
            metadata_json: serde_json::json!({"summaryKind": "leaf"}),
            tombstoned: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };

        let start = &batch.first().unwrap().item_id;
        let end = &batch.last().unwrap().item_id;
        self.store
            .replace_context_range_with_summary(&request.conversation_id, &summary, start, end, EdgeRelation::Summarizes, now_ms)
            .await?;

        Ok(summary_id)
    }

    async fn run_condensed_pass(&self, request: &CompactRequest, now_ms: i64, summaries: &mut Vec<ItemId>) -> LcmResult<usize> {
        let mut batches = 0usize;
        loop {
            let active_total = self.active_token_total(&request.conversation_id).await?;
            if active_total <= request.target_tokens {
                break;
            }

            let active_items = self
                .store
                .get_context_items(&request.conversation_id, &GetContextItemsFilter::default())
                .await?;

            let run = find_adjacent_leaf_run(&active_items);
            let Some(run) = run else { break };
            if run.len() < 2 {
                break;
            }

            let summary_id = self.insert_condensed_summary(request, &run, now_ms).await?;
            summaries.push(summary_id);
            batches += 1;
        }
        Ok(batches)
    }

    async fn insert_condensed_summary(&self, request: &CompactRequest, run: &[ContextItem], now_ms: i64) -> LcmResult<ItemId> {
        let mut lines = Vec::new();
        for item in run {
            let title = item.title.clone().unwrap_or_default();
            lines.push(format!("{}: {}", title, truncate(&item.body, 220)));
        }
        let deterministic_body = build_condensed_body(request.custom_instructions.as_deref(), &lines);
        let body = match self.summarizer.summarize(&deterministic_body, true).await {
            Ok(rewritten) if !rewritten.trim().is_empty() => rewritten,
            _ => deterministic_body,
        };

        let summary_id = ItemId::derive(request.conversation_id.as_str(), &format!("condensed-{now_ms}-{}", run[0].item_id), now_ms);
        let summary = ContextItem {
            item_id: summary_id.clone(),
            conversation_id: request.conversation_id.clone(),
            source_message_id: None,
            item_type: ContextItemType::Summary,
            depth: 2,
            title: Some(format!("Condensed {} leaf summaries", run.len())),
            body,
            metadata_json: serde_json::json!({"summaryKind": "condensed"}),
            tombstoned: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };

        let start = &run.first().unwrap().item_id;
        let end = &run.last().unwrap().item_id;
        self.store
            .replace_context_range_with_summary(&request.conversation_id, &summary, start, end, EdgeRelation::Condenses, now_ms)
            .await?;

        Ok(summary_id)
    }
}

fn build_leaf_body(custom_instructions: Option<&str>, lines: &[String]) -> String {
    let mut out = String::new();
    if let Some(instructions) = custom_instructions {
        out.push_str(&format!("Instructions: {instructions}\n"));
    }
    out.push_str("Key points from older conversation turns:\n");
    out.push_str(&lines.join("\n"));
    out
}

fn build_condensed_body(custom_instructions: Option<&str>, lines: &[String]) -> String {
    let mut out = String::new();
    if let Some(instructions) = custom_instructions {
        out.push_str(&format!("Instructions: {instructions}\n"));
    }
    out.push_str("Merged history of prior compaction summaries:\n");
    out.push_str(&lines.join("\n"));
    out
}

/// Finds the first maximal adjacent run (in chronological order) of active
/// `summary{kind=leaf}` items. A run is broken by any item that isn't an
/// active leaf summary, which keeps the fresh tail (still raw messages) out
/// of consideration without needing to compare timestamps against it.
fn find_adjacent_leaf_run(active_items: &[ContextItem]) -> Option<Vec<ContextItem>> {
    let mut ordered = active_items.to_vec();
    ordered.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.item_id.cmp(&b.item_id)));

    let mut run: Vec<ContextItem> = Vec::new();
    for item in ordered {
        let is_eligible_leaf =
            item.item_type == ContextItemType::Summary && item.summary_kind() == Some(crate::model::SummaryKind::Leaf);
        if is_eligible_leaf {
            run.push(item);
        } else if !run.is_empty() {
            return Some(run);
        }
    }
    if run.len() >= 2 {
        Some(run)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NoopSummarizer;
    use crate::ids::MessageId;
    use crate::model::{Message, Role};
    use crate::storage;

    #[test]
    fn truncate_collapses_whitespace_and_suffixes() {
        assert_eq!(truncate("hello   world", 20), "hello world");
        let long = "a".repeat(300);
        let truncated = truncate(&long, 220);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 223);
    }

    #[test]
    fn manual_trigger_wins_over_everything() {
        let decision = evaluate_trigger(0, 1000, 0.75, 0, 200, true);
        assert_eq!(decision, CompactionTrigger::Manual);
    }

    #[test]
    fn token_threshold_beats_message_threshold() {
        let decision = evaluate_trigger(900, 1000, 0.75, 300, 200, false);
        assert_eq!(decision, CompactionTrigger::TokenThreshold);
    }

    async fn seed_conversation(store: &Store, conv: &ConversationId, count: i64) {
        store.create_conversation(conv, "s1", None, 0).await.unwrap();
        for i in 0..count {
            let message_id = MessageId::derive(conv.as_str(), &i.to_string(), 1_000);
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let text = format!("turn number {i} with some reasonably long filler content to accrue tokens");
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
            store.create_message(&message).await.unwrap();
            let item_id = ItemId::derive(conv.as_str(), &format!("ctx-{i}"), 1_000 + i);
            store.append_context_message(&item_id, conv, &message_id, text, 1_000 + i).await.unwrap();
        }
    }

    #[tokio::test]
    async fn compaction_reduces_tokens_for_long_conversation() {
        let pool = storage::connect_in_memory().await.unwrap();
        let store = Store::new(pool, crate::storage::busy_ceiling_default());
        let conv = ConversationId::new("conv_compact");
        seed_conversation(&store, &conv, 10).await;

        let engine = CompactionEngine::new(
            store.clone(),
            CompactionConfig { leaf_batch_size: 3, ..Default::default() },
            Arc::new(NoopSummarizer),
            Arc::new(Recorder::new(200)),
        );

        let request = CompactRequest {
            conversation_id: conv.clone(),
            model_budget: 1000,
            target_tokens: 40,
            fresh_tail_count: 2,
            manual: true,
            custom_instructions: None,
        };

        let result = engine.compact(request, 2_000).await.unwrap();
        assert!(result.compacted);
        assert!(result.tokens_after <= result.tokens_before);
        assert!(result.batches.leaf >= 1);
    }

    #[tokio::test]
    async fn condensed_pass_merges_adjacent_leaf_summaries_in_the_same_run() {
        let pool = storage::connect_in_memory().await.unwrap();
        let store = Store::new(pool, crate::storage::busy_ceiling_default());
        let conv = ConversationId::new("conv_condense");
        seed_conversation(&store, &conv, 20).await;

        let engine = CompactionEngine::new(
            store.clone(),
            CompactionConfig { leaf_batch_size: 3, ..Default::default() },
            Arc::new(NoopSummarizer),
            Arc::new(Recorder::new(200)),
        );

        let request = CompactRequest {
            conversation_id: conv.clone(),
            model_budget: 1000,
            target_tokens: 20,
            fresh_tail_count: 2,
            manual: true,
            custom_instructions: None,
        };

        let result = engine.compact(request, 2_000).await.unwrap();
        assert!(result.compacted);
        assert!(result.batches.leaf >= 2, "expects several leaf batches so the condensed pass has adjacent leaves to merge");
        assert!(result.batches.condensed >= 1, "condensed pass must be able to fire within the same compact() call that created its leaf summaries");
    }

    #[test]
    fn adjacent_leaf_run_ignores_leaf_summaries_sharing_the_current_now_ms() {
        let conv = ConversationId::new("conv_run");
        let leaf = |slug: &str, created_at_ms: i64| ContextItem {
            item_id: ItemId::derive(conv.as_str(), slug, created_at_ms),
            conversation_id: conv.clone(),
            source_message_id: None,
            item_type: ContextItemType::Summary,
            depth: 1,
            title: Some("leaf".into()),
            body: "body".into(),
            metadata_json: serde_json::json!({"summaryKind": "leaf"}),
            tombstoned: false,
            created_at_ms,
            updated_at_ms: created_at_ms,
        };
        let now_ms = 2_000;
        let items = vec![leaf("leaf-0", now_ms), leaf("leaf-1", now_ms)];
        let run = find_adjacent_leaf_run(&items).expect("freshly created leaf summaries should still form a run");
        assert_eq!(run.len(), 2);
    }
}
