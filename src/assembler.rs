//! Context Assembler (C5): deterministic, bounded selection of policy
//! messages, a fresh tail, and the best-scoring summaries under a token
//! target.

use std::collections::HashSet;

use crate::error::LcmResult;
use crate::ids::ConversationId;
use crate::model::{ContextItem, ContextItemType, Message, Role};
use crate::store::{GetContextItemsFilter, Store};
use crate::token::estimate_tokens_many;

#[derive(Debug, Clone)]
pub struct AssembleRequest {
    pub conversation_id: ConversationId,
    pub target_tokens: i64,
    pub fresh_tail_count: usize,
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    pub summaries: Vec<ContextItem>,
    pub token_estimate: i64,
}

fn is_policy_message(message: &Message) -> bool {
    if message.role == Role::System {
        return true;
    }
    let text = message.content_text.trim_start();
    if text.starts_with("policy:") || text.starts_with("instruction:") {
        return true;
    }
    message
        .payload_json
        .get("policy")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn tokenize(text: &str) -> HashSet<String> {
    let re = regex::Regex::new(r"[a-z0-9]{3,}").unwrap();
    re.find_iter(&text.to_lowercase()).map(|m| m.as_str().to_string()).collect()
}

fn jaccard_overlap_score(anchor_tokens: &HashSet<String>, summary_body: &str) -> f64 {
    let summary_tokens = tokenize(summary_body);
    if summary_tokens.is_empty() {
        return 0.0;
    }
    let intersection = anchor_tokens.intersection(&summary_tokens).count();
    intersection as f64 / summary_tokens.len() as f64
}

pub async fn assemble(store: &Store, request: &AssembleRequest) -> LcmResult<AssembledContext> {
    let active_items = store
        .get_context_items(
            &request.conversation_id,
            &GetContextItemsFilter {
                include_tombstoned: false,
                item_types: vec![ContextItemType::Message, ContextItemType::Summary],
                limit: None,
            },
        )
        .await?;

    let message_item_ids: Vec<_> = active_items
        .iter()
        .filter(|item| item.item_type == ContextItemType::Message)
        .filter_map(|item| item.source_message_id.clone())
        .collect();
    let mut messages = store.list_messages(&request.conversation_id, Some(&message_item_ids), None).await?;
    messages.sort_by_key(|m| m.ordinal);

    let (policy, non_policy): (Vec<Message>, Vec<Message>) = messages.into_iter().partition(is_policy_message);

    let mut running_tokens: i64 = estimate_tokens_many(policy.iter().map(|m| m.content_text.as_str()));

    let mut fresh_tail: Vec<Message> = Vec::new();
    for message in non_policy.iter().rev() {
        if fresh_tail.len() >= request.fresh_tail_count {
            break;
        }
        let candidate_tokens = crate::token::estimate_tokens(&message.content_text);
        if running_tokens + candidate_tokens > request.target_tokens {
            continue;
        }
        running_tokens += candidate_tokens;
        fresh_tail.push(message.clone());
    }
    fresh_tail.sort_by_key(|m| m.ordinal);

    let oldest_fresh_tail_created_at = fresh_tail.first().map(|m| m.created_at_ms);

    let anchor_text = if fresh_tail.is_empty() {
        policy.iter().map(|m| m.content_text.as_str()).collect::<Vec<_>>().join(" ")
    } else {
        fresh_tail.iter().map(|m| m.content_text.as_str()).collect::<Vec<_>>().join(" ")
    };
    let anchor_tokens = tokenize(&anchor_text);

    let mut candidate_summaries: Vec<ContextItem> = active_items
        .into_iter()
        .filter(|item| item.item_type == ContextItemType::Summary)
        .filter(|item| oldest_fresh_tail_created_at.map(|ts| item.created_at_ms < ts).unwrap_or(true))
        .collect();

    let mut scored: Vec<(f64, ContextItem)> = candidate_summaries
        .drain(..)
        .map(|item| {
            let score = jaccard_overlap_score(&anchor_tokens, &item.body);
            (score, item)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap()
            .then_with(|| b.1.created_at_ms.cmp(&a.1.created_at_ms))
            .then_with(|| a.1.item_id.cmp(&b.1.item_id))
    });

    let mut summaries = Vec::new();
    for (_, item) in scored {
        let item_tokens = item.token_estimate();
        if running_tokens + item_tokens > request.target_tokens {
            continue;
        }
        running_tokens += item_tokens;
        summaries.push(item);
    }

    let mut result_messages = policy;
    result_messages.extend(fresh_tail);

    Ok(AssembledContext {
        messages: result_messages,
        summaries,
        token_estimate: running_tokens,
    })
}
