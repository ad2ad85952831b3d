//! Configuration envelope — a typed `LcmConfig` assembled through explicit
//! layering (defaults → file → env), validated eagerly at construction time.
//! Each concern gets its own `*Config` struct composed into one top-level
//! config, with a single `from_env()` entry point.

mod layering;
mod validate;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use layering::ConfigLayer;
use validate::validate;

use crate::error::{LcmError, LcmResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub busy_retry_ceiling: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("lcm.db"),
            max_connections: 5,
            busy_retry_ceiling: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AssemblerConfig {
    pub fresh_tail_count: usize,
    pub target_tokens: i64,
    pub retrieval_k: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            fresh_tail_count: 8,
            target_tokens: 8_000,
            retrieval_k: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompactionConfig {
    pub context_threshold: f64,
    pub max_active_messages: usize,
    pub leaf_chunk_tokens: i64,
    pub leaf_target_tokens: i64,
    pub condensed_target_tokens: i64,
    pub leaf_batch_size: usize,
    pub autocompact_disabled: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_threshold: 0.75,
            max_active_messages: 200,
            leaf_chunk_tokens: 1_500,
            leaf_target_tokens: 1_000,
            condensed_target_tokens: 1_500,
            leaf_batch_size: 10,
            autocompact_disabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrievalConfig {
    pub max_expand_tokens: i64,
    pub large_file_token_threshold: i64,
    pub scan_cap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_expand_tokens: 4_000,
            large_file_token_threshold: 2_000,
            scan_cap: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingConfig {
    pub direct_depth_threshold: u32,
    pub max_passes: u32,
    pub default_grant_ttl_ms: i64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            direct_depth_threshold: 2,
            max_passes: 3,
            default_grant_ttl_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LcmConfig {
    pub enabled: bool,
    pub storage: StorageConfig,
    pub assembler: AssemblerConfig,
    pub compaction: CompactionConfig,
    pub retrieval: RetrievalConfig,
    pub routing: RoutingConfig,
}

impl Default for LcmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
            assembler: AssemblerConfig::default(),
            compaction: CompactionConfig::default(),
            retrieval: RetrievalConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl LcmConfig {
    /// Build configuration purely from well-known `LCM_*` environment
    /// variables layered over defaults. Loads a `.env` file first,
    /// non-fatally.
    pub fn from_env() -> LcmResult<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        layering::apply_env(&mut config);
        validate(&config)?;
        Ok(config)
    }

    /// Apply layers in order, last wins, each layer only overwriting the
    /// fields it explicitly sets.
    pub fn layered(layers: &[ConfigLayer]) -> LcmResult<Self> {
        let mut config = Self::default();
        for layer in layers {
            match layer {
                ConfigLayer::Default => config = Self::default(),
                ConfigLayer::File(path) => {
                    let raw = std::fs::read_to_string(path).map_err(|e| {
                        LcmError::validation(format!("reading config file {:?}: {e}", path))
                    })?;
                    let file_config: LcmConfig = toml_like_json(&raw)?;
                    config = layering::merge(config, file_config);
                }
                ConfigLayer::Env => layering::apply_env(&mut config),
            }
        }
        validate(&config)?;
        Ok(config)
    }
}

/// Config files are JSON, parsed with `deny_unknown_fields` throughout;
/// this indirection exists so layering.rs can be swapped to a richer format
/// later without touching `LcmConfig::layered`'s call sites.
fn toml_like_json(raw: &str) -> LcmResult<LcmConfig> {
    serde_json::from_str(raw).map_err(|e| LcmError::validation(format!("invalid config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate(&LcmConfig::default()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_context_threshold() {
        let mut config = LcmConfig::default();
        config.compaction.context_threshold = 2.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_unknown_fields_in_file_layer() {
        let err = toml_like_json(r#"{"enabled": true, "bogus_field": 1}"#).unwrap_err();
        assert!(matches!(err, LcmError::Validation(_)));
    }
}
