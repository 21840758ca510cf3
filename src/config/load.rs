//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `HIERGRAPH_DATA_DIR` and `HIERGRAPH_LOG_LEVEL` env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

use super::raw::{self, RawConfig};
use super::types::*;

/// Deep-merge two TOML values.
/// Tables are merged recursively; the overlay only needs to specify keys that
/// differ from the base. For every other type the overlay value replaces the
/// base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return the
/// fully merged `toml::Value`. `visited` carries canonicalized paths already
/// seen in this chain so circular references are caught early.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides. Without a path and without `config/default.toml`, the
/// built-in defaults are used.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let data_dir_override = env::var("HIERGRAPH_DATA_DIR").ok();
    let log_level_override = env::var("HIERGRAPH_LOG_LEVEL").ok();

    if let Some(path) = config_path {
        return load_from(
            Path::new(path),
            data_dir_override.as_deref(),
            log_level_override.as_deref(),
        );
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        load_from(default_path, data_dir_override.as_deref(), log_level_override.as_deref())
    } else {
        let data_dir_str = data_dir_override.unwrap_or_else(raw::default_data_dir);
        let mut cfg = Config::with_data_dir(expand_home(&data_dir_str));
        if let Some(level) = log_level_override {
            cfg.log_level = level;
        }
        cfg.llm_api_key = env::var("LLM_API_KEY").ok();
        cfg.embedding_api_key = env::var("EMBEDDING_API_KEY").ok();
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Internal loader that accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    data_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let merged_val = load_raw_merged(path, &mut HashSet::new())?;

    let parsed: RawConfig = Deserialize::deserialize(merged_val).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;

    let e = parsed.engine;
    let data_dir = expand_home(data_dir_override.unwrap_or(&e.data_dir));
    let log_level = log_level_override.unwrap_or(&e.log_level).to_string();
    let under_data_dir = |p: String| {
        let p = expand_home(&p);
        if p.is_absolute() { p } else { data_dir.join(p) }
    };

    let backend = VectorBackend::parse(&parsed.index.backend).ok_or_else(|| {
        AppError::Config(format!("unknown index backend: {}", parsed.index.backend))
    })?;
    let index = IndexConfig {
        backend,
        external_path: parsed
            .index
            .external_path
            .map(under_data_dir)
            .unwrap_or_else(|| IndexConfig::for_data_dir(&data_dir).external_path),
    };

    let oai = OpenAiConfig::default();
    let llm = LlmConfig {
        provider: parsed.llm.provider,
        openai: OpenAiConfig {
            api_base_url: parsed.llm.openai.api_base_url.unwrap_or(oai.api_base_url),
            model: parsed.llm.openai.model.unwrap_or(oai.model),
            temperature: parsed.llm.openai.temperature.unwrap_or(oai.temperature),
            timeout_seconds: parsed.llm.openai.timeout_seconds.unwrap_or(oai.timeout_seconds),
        },
    };

    let emb = EmbeddingConfig::default();
    let r = parsed.embedding;
    let embedding = EmbeddingConfig {
        provider: r.provider,
        dimension: r.dimension.unwrap_or(emb.dimension),
        batch_size: r.batch_size.unwrap_or(emb.batch_size),
        concurrency: r.concurrency.unwrap_or(emb.concurrency),
        openai: OpenAiEmbeddingConfig {
            api_base_url: r.openai.api_base_url.unwrap_or(emb.openai.api_base_url),
            model: r.openai.model.unwrap_or(emb.openai.model),
            timeout_seconds: r.openai.timeout_seconds.unwrap_or(emb.openai.timeout_seconds),
        },
    };

    let ex = ExtractionConfig::default();
    let extraction = ExtractionConfig {
        concurrency: parsed.extraction.concurrency.unwrap_or(ex.concurrency),
        max_relationship_descriptions: parsed
            .extraction
            .max_relationship_descriptions
            .unwrap_or(ex.max_relationship_descriptions),
        max_tokens: parsed.extraction.max_tokens.unwrap_or(ex.max_tokens),
    };

    let t = TreeConfig::default();
    let tree = TreeConfig {
        cluster_size: parsed.tree.cluster_size.unwrap_or(t.cluster_size),
        min_cluster_size: parsed.tree.min_cluster_size.unwrap_or(t.min_cluster_size),
        max_levels: parsed.tree.max_levels.unwrap_or(t.max_levels),
        reduced_dimension: parsed.tree.reduced_dimension.unwrap_or(t.reduced_dimension),
        summary_token_budget: parsed.tree.summary_token_budget.unwrap_or(t.summary_token_budget),
        concurrency: parsed.tree.concurrency.unwrap_or(t.concurrency),
        seed: parsed.tree.seed.unwrap_or(t.seed),
    };

    let c = CommunityConfig::default();
    let communities = CommunityConfig {
        max_levels: parsed.communities.max_levels.unwrap_or(c.max_levels),
        max_cluster_size: parsed.communities.max_cluster_size.unwrap_or(c.max_cluster_size),
        summary_token_budget: parsed
            .communities
            .summary_token_budget
            .unwrap_or(c.summary_token_budget),
        concurrency: parsed.communities.concurrency.unwrap_or(c.concurrency),
        seed: parsed.communities.seed.unwrap_or(c.seed),
    };

    let d = DriftConfig::default();
    let drift = DriftConfig {
        max_iterations: parsed.drift.max_iterations.unwrap_or(d.max_iterations),
        convergence_threshold: parsed
            .drift
            .convergence_threshold
            .unwrap_or(d.convergence_threshold),
        deadline_seconds: parsed.drift.deadline_seconds.unwrap_or(d.deadline_seconds),
        primer_k: parsed.drift.primer_k.unwrap_or(d.primer_k),
        top_k: parsed.drift.top_k.unwrap_or(d.top_k),
        follow_up_batch: parsed.drift.follow_up_batch.unwrap_or(d.follow_up_batch),
        concurrency: parsed.drift.concurrency.unwrap_or(d.concurrency),
        primer_level: parsed.drift.primer_level.unwrap_or(d.primer_level),
    };

    let router = RouterConfig {
        flat_max_words: parsed
            .router
            .flat_max_words
            .unwrap_or(RouterConfig::default().flat_max_words),
    };

    let cfg = Config {
        log_file: e.log_file.map(under_data_dir),
        prompts_dir: e.prompts_dir.map(under_data_dir),
        data_dir,
        log_level,
        llm,
        llm_api_key: env::var("LLM_API_KEY").ok(),
        embedding,
        embedding_api_key: env::var("EMBEDDING_API_KEY").ok(),
        index,
        extraction,
        tree,
        communities,
        drift,
        router,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
