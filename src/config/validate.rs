//! Eager validation for `LcmConfig` — rejected with precise errors, never
//! partially applied.

use super::LcmConfig;
use crate::error::{LcmError, LcmResult};

pub fn validate(config: &LcmConfig) -> LcmResult<()> {
    let t = config.compaction.context_threshold;
    if !(0.1..=1.25).contains(&t) {
        return Err(LcmError::validation(format!(
            "contextThreshold must be in [0.1, 1.25], got {t}"
        )));
    }

    if config.retrieval.max_expand_tokens < 1 {
        return Err(LcmError::validation("maxExpandTokens must be >= 1"));
    }
    if config.retrieval.max_expand_tokens > 20_000 {
        return Err(LcmError::validation(
            "maxExpandTokens exceeds the hard cap of 20000",
        ));
    }
    if config.retrieval.large_file_token_threshold < 1 {
        return Err(LcmError::validation(
            "largeFileTokenThreshold must be >= 1",
        ));
    }

    if config.compaction.leaf_chunk_tokens < 1
        || config.compaction.leaf_target_tokens < 1
        || config.compaction.condensed_target_tokens < 1
    {
        return Err(LcmError::validation(
            "leafChunkTokens, leafTargetTokens, and condensedTargetTokens must be >= 1",
        ));
    }
    if config.compaction.leaf_batch_size < 2 {
        return Err(LcmError::validation("leafBatchSize must be >= 2"));
    }

    if config.routing.default_grant_ttl_ms < 1_000 || config.routing.default_grant_ttl_ms > 900_000
    {
        return Err(LcmError::validation(
            "defaultGrantTtlMs must be in [1000, 900000]",
        ));
    }

    if config.storage.max_connections == 0 {
        return Err(LcmError::validation("storage.maxConnections must be >= 1"));
    }

    Ok(())
}
