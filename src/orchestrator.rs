//! Sub-agent Expansion Orchestrator (C10): bounded multi-pass deep
//! expansion, coordinating with an externally supplied sub-agent runner.
//! Never performs unauthorized traversal — every pass goes back through
//! [`RetrievalEngine::describe`]/`expand`, both called with the caller's own
//! `session_key`, so `ExpansionGrantRegistry` is consulted on every target
//! and candidate, not just on whichever conversation the caller happened to
//! point at first.

use std::collections::HashSet;
use std::sync::Arc;

use crate::capability::{SpawnRequest, SubagentRunner, WaitStatus};
use crate::error::LcmResult;
use crate::ids::ItemId;
use crate::retrieval::{ExpandRequest, RetrievalEngine};
use crate::routing::{decide_routing, Intent, RoutingAction, RoutingInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Auto,
    Direct,
    Subagent,
}

#[derive(Debug, Clone)]
pub struct OrchestrateRequest {
    pub target_ids: Vec<ItemId>,
    pub question: String,
    pub session_key: Option<String>,
    pub depth: i64,
    pub token_cap: i64,
    pub include_messages: bool,
    pub max_passes: u32,
    pub strategy: Strategy,
    pub direct_depth_threshold: i64,
}

#[derive(Debug, Clone)]
pub struct PassRecord {
    pub pass_index: u32,
    pub target_ids: Vec<ItemId>,
    pub cited_ids: Vec<String>,
    pub next_summary_ids: Vec<ItemId>,
}

#[derive(Debug, Clone)]
pub struct OrchestrateResult {
    pub strategy_used: Strategy,
    pub synthesis: String,
    pub cited_ids: Vec<String>,
    pub next_summary_ids: Vec<ItemId>,
    pub truncated: bool,
    pub passes: Vec<PassRecord>,
}

pub struct SubagentOrchestrator {
    retrieval: Arc<RetrievalEngine>,
    runner: Option<Arc<dyn SubagentRunner>>,
}

impl SubagentOrchestrator {
    pub fn new(retrieval: Arc<RetrievalEngine>, runner: Option<Arc<dyn SubagentRunner>>) -> Self {
        Self { retrieval, runner }
    }

    fn select_strategy(&self, request: &OrchestrateRequest) -> Strategy {
        if self.runner.is_none() {
            return Strategy::Direct;
        }
        match request.strategy {
            Strategy::Direct => Strategy::Direct,
            Strategy::Subagent => Strategy::Subagent,
            Strategy::Auto => {
                if request.depth <= request.direct_depth_threshold {
                    return Strategy::Direct;
                }
                let decision = decide_routing(&RoutingInput {
                    intent: Intent::ExplicitExpand,
                    query: Some(request.question.clone()),
                    requested_max_depth: request.depth,
                    candidate_summary_count: request.target_ids.len(),
                    token_cap: request.token_cap,
                    include_messages: request.include_messages,
                });
                match decision.action {
                    RoutingAction::AnswerDirectly | RoutingAction::ExpandShallow => Strategy::Direct,
                    RoutingAction::DelegateTraversal => Strategy::Subagent,
                }
            }
        }
    }

    pub async fn orchestrate(&self, request: OrchestrateRequest, now_ms: i64) -> LcmResult<OrchestrateResult> {
        let strategy = self.select_strategy(&request);
        match strategy {
            Strategy::Direct | Strategy::Auto => self.run_direct(&request, now_ms).await,
            Strategy::Subagent => {
                let runner = self.runner.clone().expect("subagent strategy requires a runner");
                self.run_subagent(&request, runner, now_ms).await
            }
        }
    }

    async fn run_direct(&self, request: &OrchestrateRequest, now_ms: i64) -> LcmResult<OrchestrateResult> {
        let per_target_cap = (request.token_cap / request.target_ids.len().max(1) as i64).max(1);
        let mut cited_ids = Vec::new();
        let mut next_summary_ids = Vec::new();
        let mut truncated = false;
        let mut bodies = Vec::new();

        for target in &request.target_ids {
            let result = self
                .retrieval
                .expand(
                    &ExpandRequest {
                        summary_id: target.clone(),
                        depth: request.depth,
                        include_messages: request.include_messages,
                        token_cap: per_target_cap,
                        limit: 50,
                        session_key: request.session_key.clone(),
                    },
                    now_ms,
                )
                .await?;
            truncated |= result.truncated;
            next_summary_ids.extend(result.next_summary_ids);
            for summary in &result.summaries {
                cited_ids.push(summary.item_id.as_str().to_string());
                bodies.push(crate::compaction::truncate(&summary.body, 400));
            }
        }

        Ok(OrchestrateResult {
            strategy_used: Strategy::Direct,
            synthesis: bodies.join("\n"),
            cited_ids,
            next_summary_ids,
            truncated,
            passes: Vec::new(),
        })
    }

    async fn run_subagent(&self, request: &OrchestrateRequest, runner: Arc<dyn SubagentRunner>, now_ms: i64) -> LcmResult<OrchestrateResult> {
        let session_key = format!("subagent-expand-{now_ms}");

        // try/finally: the gateway session is deleted on every exit path
        // (pass limit, budget exhaustion, error, or early return) exactly
        // once, never left dangling because some earlier `?` bailed out.
        let result = self.run_subagent_passes(request, &runner, &session_key, now_ms).await;
        let cleanup_result = runner.delete_session(&session_key, false).await;

        match (result, cleanup_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(cleanup_err)) => Err(crate::error::LcmError::ExternalError(format!("sub-agent session cleanup failed: {cleanup_err}"))),
            (Err(run_err), _) => Err(run_err),
        }
    }

    async fn run_subagent_passes(&self, request: &OrchestrateRequest, runner: &Arc<dyn SubagentRunner>, session_key: &str, now_ms: i64) -> LcmResult<OrchestrateResult> {
        let mut authorized_conversations = HashSet::new();
        for target in &request.target_ids {
            if let Some(crate::retrieval::Describe::Summary { conversation_id, .. }) =
                self.retrieval.describe(target, &request.session_key, now_ms).await?
            {
                authorized_conversations.insert(conversation_id);
            }
        }

        let mut remaining_depth = request.depth;
        let mut remaining_tokens = request.token_cap;
        let mut frontier = request.target_ids.clone();
        let mut passes = Vec::new();
        let mut all_cited = Vec::new();
        let mut syntheses = Vec::new();
        let mut truncated = false;

        for pass_index in 0..request.max_passes {
            if frontier.is_empty() || remaining_depth <= 0 || remaining_tokens <= 0 {
                break;
            }

            let pass_cap = (remaining_tokens / (request.max_passes - pass_index).max(1) as i64).max(1);
            let pass_depth = (remaining_depth / (request.max_passes - pass_index).max(1) as i64).max(1);

            let prompt = build_prompt(&frontier, &request.question, pass_depth, pass_cap, pass_index);
            let spawn = runner
                .spawn(SpawnRequest {
                    message: prompt,
                    session_key: session_key.to_string(),
                    deliver: false,
                    lane: None,
                    idempotency_key: Some(format!("{session_key}-{pass_index}")),
                    extra_system_prompt: None,
                })
                .await
                .map_err(|e| crate::error::LcmError::ExternalError(e.to_string()))?;

            let wait = runner
                .wait(&spawn.run_id, 120_000)
                .await
                .map_err(|e| crate::error::LcmError::ExternalTimeout(e.to_string()))?;

            match wait.status {
                WaitStatus::Ok => {}
                WaitStatus::Timeout => return Err(crate::error::LcmError::ExternalTimeout("sub-agent wait timed out".into())),
                WaitStatus::Error => return Err(crate::error::LcmError::ExternalError(wait.error.unwrap_or_default())),
            }

            let history = runner
                .read_history(session_key, 10)
                .await
                .map_err(|e| crate::error::LcmError::ExternalError(e.to_string()))?;
            let reply_text = history.last().map(|m| m.text_parts.join("\n")).unwrap_or_default();
            let parsed = parse_pass_reply(&reply_text);

            let mut filtered_next = Vec::new();
            for candidate in &parsed.next_summary_ids {
                let id = ItemId::new(candidate.clone());
                match self.retrieval.describe(&id, &request.session_key, now_ms).await {
                    Ok(Some(crate::retrieval::Describe::Summary { conversation_id, .. })) if authorized_conversations.contains(&conversation_id) => {
                        filtered_next.push(id);
                    }
                    Ok(_) => tracing::warn!(candidate_id = %candidate, "dropping out-of-scope nextSummaryId from sub-agent reply"),
                    Err(err) => tracing::warn!(candidate_id = %candidate, error = %err, "dropping nextSummaryId that failed authorization"),
                }
            }

            passes.push(PassRecord {
                pass_index,
                target_ids: frontier.clone(),
                cited_ids: parsed.cited_ids.clone(),
                next_summary_ids: filtered_next.clone(),
            });
            all_cited.extend(parsed.cited_ids);
            syntheses.push(parsed.synthesis);

            remaining_depth -= pass_depth;
            remaining_tokens -= pass_cap;
            if filtered_next.is_empty() {
                break;
            }
            frontier = filtered_next;
            if pass_index + 1 == request.max_passes {
                truncated = true;
            }
        }

        let next_summary_ids = passes.last().map(|p| p.next_summary_ids.clone()).unwrap_or_default();

        Ok(OrchestrateResult { strategy_used: Strategy::Subagent, synthesis: syntheses.join("\n"), cited_ids: all_cited, next_summary_ids, truncated, passes })
    }
}

fn build_prompt(targets: &[ItemId], question: &str, depth: i64, token_cap: i64, pass_index: u32) -> String {
    let ids: Vec<&str> = targets.iter().map(|id| id.as_str()).collect();
    format!(
        "Pass {pass_index}: expand targets [{}] to answer \"{question}\". depthCap={depth} tokenCap={token_cap}. \
         Respond with strict JSON {{\"synthesis\":..,\"citedIds\":[..],\"nextSummaryIds\":[..]}}.",
        ids.join(", ")
    )
}

struct ParsedReply {
    synthesis: String,
    cited_ids: Vec<String>,
    next_summary_ids: Vec<String>,
}

/// Attempts strict JSON (including a fenced code block), falling back to
/// `"Cited IDs:"` / `"Next Summary IDs:"` bullet sections.
fn parse_pass_reply(text: &str) -> ParsedReply {
    let candidate = extract_fenced_json(text).unwrap_or_else(|| text.to_string());
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) {
        let synthesis = value.get("synthesis").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let cited_ids = string_array(&value, "citedIds");
        let next_summary_ids = string_array(&value, "nextSummaryIds");
        return ParsedReply { synthesis, cited_ids, next_summary_ids };
    }

    ParsedReply { synthesis: text.to_string(), cited_ids: extract_bullet_section(text, "Cited IDs:"), next_summary_ids: extract_bullet_section(text, "Next Summary IDs:") }
}

fn string_array(value: &serde_json::Value, key: &str) -> Vec<String> {
    value.get(key).and_then(|v| v.as_array()).map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default()
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn extract_bullet_section(text: &str, header: &str) -> Vec<String> {
    let Some(start) = text.find(header) else { return Vec::new() };
    let after = &text[start + header.len()..];
    after
        .lines()
        .skip_while(|l| l.trim().is_empty())
        .take_while(|l| l.trim_start().starts_with('-') || l.trim_start().starts_with('*'))
        .map(|l| l.trim_start_matches(['-', '*', ' ']).trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pass_reply_accepts_fenced_json() {
        let text = "Here you go:\n```json\n{\"synthesis\":\"ok\",\"citedIds\":[\"item_1\"],\"nextSummaryIds\":[\"item_2\"]}\n```\n";
        let parsed = parse_pass_reply(text);
        assert_eq!(parsed.synthesis, "ok");
        assert_eq!(parsed.cited_ids, vec!["item_1"]);
        assert_eq!(parsed.next_summary_ids, vec!["item_2"]);
    }

    #[test]
    fn parse_pass_reply_falls_back_to_bullets() {
        let text = "Cited IDs:\n- item_1\n- item_2\n\nNext Summary IDs:\n- item_3\n";
        let parsed = parse_pass_reply(text);
        assert_eq!(parsed.cited_ids, vec!["item_1", "item_2"]);
        assert_eq!(parsed.next_summary_ids, vec!["item_3"]);
    }
}
