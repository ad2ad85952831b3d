//! External capability interfaces. The LLM that rewrites summary prose and
//! the sub-agent runner that performs delegated traversal are both out of
//! scope for this crate — they are injected here as explicit trait objects
//! so tests substitute fakes with an identical contract.

use async_trait::async_trait;

/// Rewrites a deterministically-built summary body into denser prose.
/// `aggressive=true` tolerates more lossy rewriting (used on the condensed
/// pass, where the input is already summarized material).
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, aggressive: bool) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub message: String,
    pub session_key: String,
    pub deliver: bool,
    pub lane: Option<String>,
    pub idempotency_key: Option<String>,
    pub extra_system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ok,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct WaitResult {
    pub status: WaitStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub text_parts: Vec<String>,
}

/// Sub-agent gateway capability. Every call carries its own timeout at the
/// driver level; the trait itself stays pure async-and-fallible.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnResult>;
    async fn wait(&self, run_id: &str, timeout_ms: u64) -> anyhow::Result<WaitResult>;
    async fn read_history(&self, session_key: &str, limit: usize) -> anyhow::Result<Vec<HistoryMessage>>;
    async fn delete_session(&self, session_key: &str, delete_transcript: bool) -> anyhow::Result<()>;
}

/// Deterministic, dependency-free fallback used whenever no [`Summarizer`]
/// is configured: the listing-style body built by the compaction engine is
/// returned unchanged.
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, text: &str, _aggressive: bool) -> anyhow::Result<String> {
        Ok(text.to_string())
    }
}
