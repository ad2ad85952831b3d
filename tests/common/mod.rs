// Shared integration-test helpers: an in-memory engine builder and a
// scriptable fake sub-agent runner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lcm_core::capability::{HistoryMessage, SpawnRequest, SpawnResult, SubagentRunner, WaitResult, WaitStatus};
use lcm_core::config::LcmConfig;
use lcm_core::storage;
use lcm_core::LcmEngine;

pub async fn in_memory_engine() -> LcmEngine {
    let pool = storage::connect_in_memory().await.expect("in-memory pool");
    LcmEngine::with_pool(LcmConfig::default(), pool, None, None).expect("engine wiring")
}

/// Replies one scripted reply per pass, in order; once exhausted, returns an
/// empty `nextSummaryIds` reply so the orchestrator naturally stops.
pub struct ScriptedSubagentRunner {
    replies: Vec<String>,
    next_reply: AtomicUsize,
    deleted_sessions: Mutex<Vec<String>>,
}

impl ScriptedSubagentRunner {
    pub fn new(replies: Vec<String>) -> Self {
        Self { replies, next_reply: AtomicUsize::new(0), deleted_sessions: Mutex::new(Vec::new()) }
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.deleted_sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubagentRunner for ScriptedSubagentRunner {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnResult> {
        Ok(SpawnResult { run_id: request.session_key })
    }

    async fn wait(&self, _run_id: &str, _timeout_ms: u64) -> anyhow::Result<WaitResult> {
        Ok(WaitResult { status: WaitStatus::Ok, error: None })
    }

    async fn read_history(&self, _session_key: &str, _limit: usize) -> anyhow::Result<Vec<HistoryMessage>> {
        let index = self.next_reply.fetch_add(1, Ordering::SeqCst);
        let text = self.replies.get(index).cloned().unwrap_or_else(|| {
            "{\"synthesis\":\"\",\"citedIds\":[],\"nextSummaryIds\":[]}".to_string()
        });
        Ok(vec![HistoryMessage { role: "assistant".to_string(), text_parts: vec![text] }])
    }

    async fn delete_session(&self, session_key: &str, _delete_transcript: bool) -> anyhow::Result<()> {
        self.deleted_sessions.lock().unwrap().push(session_key.to_string());
        Ok(())
    }
}

/// A runner whose `wait` always times out, to exercise the guaranteed
/// cleanup-on-every-exit-path behavior of the orchestrator.
pub struct TimingOutSubagentRunner {
    deleted_sessions: Mutex<Vec<String>>,
}

impl TimingOutSubagentRunner {
    pub fn new() -> Self {
        Self { deleted_sessions: Mutex::new(Vec::new()) }
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.deleted_sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubagentRunner for TimingOutSubagentRunner {
    async fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnResult> {
        Ok(SpawnResult { run_id: request.session_key })
    }

    async fn wait(&self, _run_id: &str, _timeout_ms: u64) -> anyhow::Result<WaitResult> {
        Ok(WaitResult { status: WaitStatus::Timeout, error: None })
    }

    async fn read_history(&self, _session_key: &str, _limit: usize) -> anyhow::Result<Vec<HistoryMessage>> {
        Ok(vec![])
    }

    async fn delete_session(&self, session_key: &str, _delete_transcript: bool) -> anyhow::Result<()> {
        self.deleted_sessions.lock().unwrap().push(session_key.to_string());
        Ok(())
    }
}
