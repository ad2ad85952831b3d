//! Routing Policy (C9): a pure, deterministic classifier for whether an
//! expansion request should be answered directly, expanded shallowly
//! in-process, or delegated to a sub-agent.

use once_cell::sync::Lazy;
use regex::Regex;

const BASE_TOKENS: f64 = 220.0;
const INCLUDE_MESSAGES_MULTIPLIER: f64 = 1.9;
const PER_DEPTH_GROWTH: f64 = 0.65;
const BROAD_TIME_RANGE_MULTIPLIER: f64 = 1.35;
const MULTI_HOP_MULTIPLIER: f64 = 1.25;

const RISK_HIGH_THRESHOLD: f64 = 0.7;
const RISK_MODERATE_THRESHOLD: f64 = 0.35;

static BROAD_TIME_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(last|past)\s+\d+\s+(month|months|quarter|quarters|year|years)\b|\b(timeline|history|chronology)\b").unwrap()
});
static YEAR_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());
static MULTI_HOP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(root[- ]cause|chain[- ]of[- ]events)\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    QueryProbe,
    ExplicitExpand,
}

#[derive(Debug, Clone)]
pub struct RoutingInput {
    pub intent: Intent,
    pub query: Option<String>,
    pub requested_max_depth: i64,
    pub candidate_summary_count: usize,
    pub token_cap: i64,
    pub include_messages: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingAction {
    AnswerDirectly,
    ExpandShallow,
    DelegateTraversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone)]
pub struct RoutingIndicators {
    pub broad_time_range: bool,
    pub multi_hop: bool,
    pub estimated_tokens: i64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTriggers {
    pub direct_by_no_candidates: bool,
    pub direct_by_shallow_probe: bool,
    pub delegate_by_token_risk: bool,
    pub delegate_by_multi_hop: bool,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub action: RoutingAction,
    pub reasons: Vec<String>,
    pub indicators: RoutingIndicators,
    pub triggers: RoutingTriggers,
}

fn normalize_depth(requested: i64) -> i64 {
    if requested <= 0 {
        3
    } else {
        requested.clamp(1, 10)
    }
}

fn normalize_token_cap(token_cap: i64) -> i64 {
    token_cap.max(1)
}

fn detect_broad_time_range(query: &str) -> bool {
    if BROAD_TIME_RANGE_RE.is_match(query) {
        return true;
    }
    let years: Vec<i64> = YEAR_TOKEN_RE.find_iter(query).filter_map(|m| m.as_str().parse().ok()).collect();
    if years.len() >= 2 {
        let min = *years.iter().min().unwrap();
        let max = *years.iter().max().unwrap();
        if max - min >= 2 {
            return true;
        }
    }
    false
}

fn detect_multi_hop(depth: i64, candidate_count: usize, query: &str) -> bool {
    depth >= 3 || candidate_count >= 5 || MULTI_HOP_RE.is_match(query)
}

pub fn decide_routing(input: &RoutingInput) -> RoutingDecision {
    let depth = normalize_depth(input.requested_max_depth);
    let token_cap = normalize_token_cap(input.token_cap);
    let query = input.query.as_deref().unwrap_or("");

    let broad_time_range = detect_broad_time_range(query);
    let multi_hop = detect_multi_hop(depth, input.candidate_summary_count, query);

    let include_msgs_mul = if input.include_messages { INCLUDE_MESSAGES_MULTIPLIER } else { 1.0 };
    let depth_mul = 1.0 + PER_DEPTH_GROWTH * (depth as f64 - 1.0);
    let time_range_mul = if broad_time_range { BROAD_TIME_RANGE_MULTIPLIER } else { 1.0 };
    let multi_hop_mul = if multi_hop { MULTI_HOP_MULTIPLIER } else { 1.0 };

    let estimated_tokens = (BASE_TOKENS * include_msgs_mul * depth_mul * time_range_mul * multi_hop_mul * (input.candidate_summary_count.max(1) as f64))
        .ceil() as i64;

    let ratio = estimated_tokens as f64 / token_cap as f64;
    let risk_level = if ratio >= RISK_HIGH_THRESHOLD {
        RiskLevel::High
    } else if ratio >= RISK_MODERATE_THRESHOLD {
        RiskLevel::Moderate
    } else {
        RiskLevel::Low
    };

    let mut triggers = RoutingTriggers::default();
    let mut reasons = Vec::new();

    let action = if input.candidate_summary_count == 0 {
        triggers.direct_by_no_candidates = true;
        reasons.push("no candidate summaries".to_string());
        RoutingAction::AnswerDirectly
    } else if input.intent == Intent::QueryProbe
        && depth <= 2
        && input.candidate_summary_count <= 1
        && risk_level == RiskLevel::Low
        && !broad_time_range
        && !multi_hop
    {
        triggers.direct_by_shallow_probe = true;
        reasons.push("shallow probe with low risk".to_string());
        RoutingAction::AnswerDirectly
    } else if risk_level == RiskLevel::High {
        triggers.delegate_by_token_risk = true;
        reasons.push("high token risk".to_string());
        RoutingAction::DelegateTraversal
    } else if broad_time_range && multi_hop {
        triggers.delegate_by_multi_hop = true;
        reasons.push("broad time range combined with multi-hop query".to_string());
        RoutingAction::DelegateTraversal
    } else {
        reasons.push("default shallow expansion".to_string());
        RoutingAction::ExpandShallow
    };

    RoutingDecision {
        action,
        reasons,
        indicators: RoutingIndicators { broad_time_range, multi_hop, estimated_tokens, risk_level },
        triggers,
    }
}
