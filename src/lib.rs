//! Lossless context management engine: storage, compaction, assembly, and
//! retrieval for long-running agent conversations.
//!
//! The crate is organized as a stack: [`storage`]/[`store`] hold the durable
//! conversation log, [`ingest`] and [`assembler`] move data in and out of the
//! active window, [`compaction`] keeps the active window bounded, and
//! [`retrieval`]/[`orchestrator`] provide on-demand deep access back into
//! everything compaction folded away. [`routing`] and [`auth`] gate who gets
//! to do that and how far. [`observability`] and [`integrity`] watch the
//! whole thing from the side.

pub mod assembler;
pub mod auth;
pub mod capability;
pub mod compaction;
pub mod config;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod integrity;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod retrieval;
pub mod routing;
pub mod storage;
pub mod store;
pub mod token;

pub use config::LcmConfig;
pub use error::{LcmError, LcmResult};
pub use store::Store;

use std::sync::Arc;

use capability::{NoopSummarizer, SubagentRunner, Summarizer};
use observability::Recorder;

/// The assembled engine: one instance per process (or per tenant, if the
/// host application is multi-tenant), holding the shared pool and every
/// component that operates on it.
pub struct LcmEngine {
    pub config: LcmConfig,
    pub store: Store,
    pub auth: Arc<auth::ExpansionGrantRegistry>,
    pub recorder: Arc<Recorder>,
    pub compaction: compaction::CompactionEngine,
    pub retrieval: Arc<retrieval::RetrievalEngine>,
    pub orchestrator: orchestrator::SubagentOrchestrator,
    pub integrity: integrity::IntegrityChecker,
}

impl LcmEngine {
    /// Wires every component together over a fresh connection pool built
    /// from `config.storage`, defaulting to a no-op summarizer and no
    /// sub-agent runner (pure direct-path expansion) when neither is
    /// supplied.
    pub async fn connect(
        config: LcmConfig,
        summarizer: Option<Arc<dyn Summarizer>>,
        subagent_runner: Option<Arc<dyn SubagentRunner>>,
    ) -> LcmResult<Self> {
        let pool = storage::connect(&config.storage).await?;
        Self::with_pool(config, pool, summarizer, subagent_runner)
    }

    pub fn with_pool(
        config: LcmConfig,
        pool: storage::Pool,
        summarizer: Option<Arc<dyn Summarizer>>,
        subagent_runner: Option<Arc<dyn SubagentRunner>>,
    ) -> LcmResult<Self> {
        let store = Store::new(pool, config.storage.busy_retry_ceiling);
        let auth = Arc::new(auth::ExpansionGrantRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let summarizer = summarizer.unwrap_or_else(|| Arc::new(NoopSummarizer));

        let compaction = compaction::CompactionEngine::new(store.clone(), config.compaction.clone(), summarizer, recorder.clone());
        let retrieval = Arc::new(retrieval::RetrievalEngine::new(store.clone(), auth.clone(), recorder.clone(), config.retrieval.scan_cap));
        let orchestrator = orchestrator::SubagentOrchestrator::new(retrieval.clone(), subagent_runner);
        let integrity = integrity::IntegrityChecker::new(store.clone(), recorder.clone());

        Ok(Self { config, store, auth, recorder, compaction, retrieval, orchestrator, integrity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_connects_against_in_memory_pool() {
        let config = LcmConfig::default();
        let pool = storage::connect_in_memory().await.unwrap();
        let engine = LcmEngine::with_pool(config, pool, None, None).unwrap();
        let conv = ids::ConversationId::new("conv_smoke");
        engine.store.create_conversation(&conv, "session-1", None, 0).await.unwrap();
        let result = engine.integrity.scan(Some(&conv), integrity::ScanMode::Check).await.unwrap();
        assert!(result.ok);
    }
}
