//! Observability (C12): an in-memory event recorder with counters, latency
//! aggregates, and a bounded ring buffer, mirrored by `tracing` events at
//! every call site so logs and the recorder never drift apart.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::compaction::CompactionTrigger;
use crate::ids::ConversationId;

const DEFAULT_RING_CAPACITY: usize = 200;
const MAX_RING_CAPACITY: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    ContextTokens,
    CompactionRun,
    SummaryCreated,
    ExpandLatency,
    SearchLatency,
    IntegrityFailure,
}

impl EventFamily {
    fn as_str(&self) -> &'static str {
        match self {
            EventFamily::ContextTokens => "context_tokens",
            EventFamily::CompactionRun => "compaction_run",
            EventFamily::SummaryCreated => "summary_created",
            EventFamily::ExpandLatency => "expand_latency",
            EventFamily::SearchLatency => "search_latency",
            EventFamily::IntegrityFailure => "integrity_failure",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Event {
    pub family: Option<String>,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub compaction_id: Option<String>,
    pub summary_id: Option<String>,
    pub kind: Option<String>,
    pub trigger_reason: Option<String>,
    pub token_before: Option<i64>,
    pub token_after: Option<i64>,
    pub latency_ms: Option<i64>,
    pub scope: Option<String>,
    pub mode: Option<String>,
    pub scanned_count: Option<i64>,
    pub result_count: Option<i64>,
    pub code: Option<String>,
    pub severity: Option<String>,
    pub fixable: Option<bool>,
    pub at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyAggregate {
    pub count: u64,
    pub total_ms: i64,
    pub max_ms: i64,
    pub last_ms: i64,
}

impl LatencyAggregate {
    fn observe(&mut self, latency_ms: i64) {
        self.count += 1;
        self.total_ms += latency_ms;
        self.max_ms = self.max_ms.max(latency_ms);
        self.last_ms = latency_ms;
    }
}

struct Inner {
    counters: HashMap<EventFamily, u64>,
    latencies: HashMap<EventFamily, LatencyAggregate>,
    ring: VecDeque<Event>,
    ring_capacity: usize,
}

/// Callback invoked synchronously for every recorded event (a future metrics
/// exporter hook point); never invoked from inside a lock.
pub type OnEvent = Box<dyn Fn(&Event) + Send + Sync>;

pub struct Recorder {
    inner: Mutex<Inner>,
    on_event: Option<OnEvent>,
}

impl Recorder {
    pub fn new(ring_capacity: usize) -> Self {
        let capacity = ring_capacity.clamp(1, MAX_RING_CAPACITY);
        Self {
            inner: Mutex::new(Inner { counters: HashMap::new(), latencies: HashMap::new(), ring: VecDeque::with_capacity(capacity), ring_capacity: capacity }),
            on_event: None,
        }
    }

    pub fn with_hook(ring_capacity: usize, on_event: OnEvent) -> Self {
        let mut recorder = Self::new(ring_capacity);
        recorder.on_event = Some(on_event);
        recorder
    }

    fn record(&self, family: EventFamily, mut event: Event, latency_ms: Option<i64>) {
        event.family = Some(family.as_str().to_string());
        {
            let mut inner = self.inner.lock();
            *inner.counters.entry(family).or_insert(0) += 1;
            if let Some(latency_ms) = latency_ms {
                inner.latencies.entry(family).or_default().observe(latency_ms);
            }
            if inner.ring.len() >= inner.ring_capacity {
                inner.ring.pop_front();
            }
            inner.ring.push_back(event.clone());
        }
        if let Some(hook) = &self.on_event {
            hook(&event);
        }
    }

    pub fn record_compaction_run(&self, conversation_id: &ConversationId, trigger: CompactionTrigger, tokens_before: i64, tokens_after: i64) {
        let trigger_reason = match trigger {
            CompactionTrigger::Manual => "manual",
            CompactionTrigger::TokenThreshold => "token_threshold",
            CompactionTrigger::MessageThreshold => "message_threshold",
            CompactionTrigger::None => "none",
        };
        tracing::info!(
            conversation_id = conversation_id.as_str(),
            trigger_reason,
            tokens_before,
            tokens_after,
            "compaction run completed"
        );
        self.record(
            EventFamily::CompactionRun,
            Event {
                conversation_id: Some(conversation_id.as_str().to_string()),
                trigger_reason: Some(trigger_reason.to_string()),
                token_before: Some(tokens_before),
                token_after: Some(tokens_after),
                ..Default::default()
            },
            None,
        );
    }

    pub fn record_summary_created(&self, conversation_id: &ConversationId, summary_id: &str, kind: &str) {
        tracing::debug!(conversation_id = conversation_id.as_str(), summary_id, kind, "summary created");
        self.record(
            EventFamily::SummaryCreated,
            Event {
                conversation_id: Some(conversation_id.as_str().to_string()),
                summary_id: Some(summary_id.to_string()),
                kind: Some(kind.to_string()),
                ..Default::default()
            },
            None,
        );
    }

    pub fn record_expand_latency(&self, conversation_id: &ConversationId, latency_ms: i64, result_count: i64, truncated: bool) {
        tracing::debug!(conversation_id = conversation_id.as_str(), latency_ms, result_count, truncated, "expand completed");
        self.record(
            EventFamily::ExpandLatency,
            Event {
                conversation_id: Some(conversation_id.as_str().to_string()),
                latency_ms: Some(latency_ms),
                result_count: Some(result_count),
                ..Default::default()
            },
            Some(latency_ms),
        );
    }

    pub fn record_search_latency(&self, scope: &str, mode: &str, latency_ms: i64, scanned_count: i64, result_count: i64) {
        tracing::debug!(scope, mode, latency_ms, scanned_count, result_count, "search completed");
        self.record(
            EventFamily::SearchLatency,
            Event {
                scope: Some(scope.to_string()),
                mode: Some(mode.to_string()),
                latency_ms: Some(latency_ms),
                scanned_count: Some(scanned_count),
                result_count: Some(result_count),
                ..Default::default()
            },
            Some(latency_ms),
        );
    }

    pub fn record_integrity_failure(&self, code: &str, severity: &str, fixable: bool) {
        tracing::warn!(code, severity, fixable, "integrity violation detected");
        self.record(
            EventFamily::IntegrityFailure,
            Event { code: Some(code.to_string()), severity: Some(severity.to_string()), fixable: Some(fixable), ..Default::default() },
            None,
        );
    }

    pub fn record_context_tokens(&self, conversation_id: &ConversationId, token_after: i64) {
        tracing::debug!(conversation_id = conversation_id.as_str(), token_after, "context tokens measured");
        self.record(
            EventFamily::ContextTokens,
            Event { conversation_id: Some(conversation_id.as_str().to_string()), token_after: Some(token_after), ..Default::default() },
            None,
        );
    }

    pub fn counters(&self) -> HashMap<EventFamily, u64> {
        self.inner.lock().counters.clone()
    }

    pub fn latency(&self, family: EventFamily) -> LatencyAggregate {
        self.inner.lock().latencies.get(&family).cloned().unwrap_or_default()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock();
        inner.ring.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_trims_oldest() {
        let recorder = Recorder::new(2);
        let conv = ConversationId::new("conv_1");
        for i in 0..5 {
            recorder.record_context_tokens(&conv, i);
        }
        let recent = recorder.recent_events(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].token_after, Some(4));
    }

    #[test]
    fn counters_increment_per_family() {
        let recorder = Recorder::new(10);
        let conv = ConversationId::new("conv_1");
        recorder.record_compaction_run(&conv, CompactionTrigger::Manual, 100, 50);
        recorder.record_compaction_run(&conv, CompactionTrigger::Manual, 50, 20);
        assert_eq!(*recorder.counters().get(&EventFamily::CompactionRun).unwrap(), 2);
    }

    #[test]
    fn latency_aggregate_tracks_max_and_last() {
        let recorder = Recorder::new(10);
        recorder.record_search_latency("messages", "regex", 10, 100, 5);
        recorder.record_search_latency("messages", "regex", 30, 100, 5);
        let agg = recorder.latency(EventFamily::SearchLatency);
        assert_eq!(agg.count, 2);
        assert_eq!(agg.max_ms, 30);
        assert_eq!(agg.last_ms, 30);
    }
}
