//! Config layer application: defaults → file → env, last wins, field by
//! field.

use std::env;
use std::path::PathBuf;

use super::LcmConfig;

#[derive(Debug, Clone)]
pub enum ConfigLayer {
    Default,
    File(PathBuf),
    Env,
}

/// A file layer overwrites only the top-level sub-configs it differs from
/// the baseline default on. Since each sub-config is parsed as a whole
/// struct (not a sparse patch), "last wins" here means the later layer's
/// struct replaces the earlier one wholesale per section — finer-grained
/// field merging would require a generic patch representation the plain
/// JSON config files don't carry.
pub fn merge(base: LcmConfig, overlay: LcmConfig) -> LcmConfig {
    overlay_if_changed(base, overlay)
}

fn overlay_if_changed(base: LcmConfig, overlay: LcmConfig) -> LcmConfig {
    let default = LcmConfig::default();
    LcmConfig {
        enabled: overlay.enabled,
        storage: if toml_eq(&overlay.storage, &default.storage) {
            base.storage
        } else {
            overlay.storage
        },
        assembler: if toml_eq(&overlay.assembler, &default.assembler) {
            base.assembler
        } else {
            overlay.assembler
        },
        compaction: if toml_eq(&overlay.compaction, &default.compaction) {
            base.compaction
        } else {
            overlay.compaction
        },
        retrieval: if toml_eq(&overlay.retrieval, &default.retrieval) {
            base.retrieval
        } else {
            overlay.retrieval
        },
        routing: if toml_eq(&overlay.routing, &default.routing) {
            base.routing
        } else {
            overlay.routing
        },
    }
}

fn toml_eq<T: serde::Serialize>(a: &T, b: &T) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

/// Well-known `LCM_*` environment variables. Each is optional; absence
/// leaves the existing value (from the default or an earlier file layer)
/// untouched.
pub fn apply_env(config: &mut LcmConfig) {
    if let Ok(v) = env::var("LCM_ENABLED") {
        if let Ok(parsed) = v.parse() {
            config.enabled = parsed;
        }
    }
    if let Ok(v) = env::var("LCM_DATABASE_PATH") {
        config.storage.database_path = PathBuf::from(v);
    }
    if let Some(v) = parse_env("LCM_CONTEXT_THRESHOLD") {
        config.compaction.context_threshold = v;
    }
    if let Some(v) = parse_env("LCM_FRESH_TAIL_COUNT") {
        config.assembler.fresh_tail_count = v;
    }
    if let Some(v) = parse_env("LCM_TARGET_TOKENS") {
        config.assembler.target_tokens = v;
    }
    if let Some(v) = parse_env("LCM_MAX_EXPAND_TOKENS") {
        config.retrieval.max_expand_tokens = v;
    }
    if let Some(v) = parse_env("LCM_LARGE_FILE_TOKEN_THRESHOLD") {
        config.retrieval.large_file_token_threshold = v;
    }
    if let Some(v) = parse_env("LCM_MAX_ACTIVE_MESSAGES") {
        config.compaction.max_active_messages = v;
    }
    if let Ok(v) = env::var("LCM_AUTOCOMPACT_DISABLED") {
        if let Ok(parsed) = v.parse() {
            config.compaction.autocompact_disabled = parsed;
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
