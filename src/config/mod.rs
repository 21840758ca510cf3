//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `HIERGRAPH_DATA_DIR` and `HIERGRAPH_LOG_LEVEL` env overrides.
//!
//! # Module layout
//!
//! - **types**: public configuration structs consumed by the engine
//!   (`Config`, `TreeConfig`, `DriftConfig`, etc.).
//! - **raw**: raw TOML deserialization types mirroring the file shape; private.
//! - **load**: `merge_toml`, `load_raw_merged`, `load`, `load_from`,
//!   `expand_home`.

mod load;
mod raw;
mod types;

pub use load::{expand_home, load, load_from};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const MINIMAL_TOML: &str = r#"
[engine]
data_dir = "~/.hiergraph"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn write_named(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.embedding.dimension, 256);
        assert_eq!(cfg.tree.cluster_size, 6);
        assert_eq!(cfg.drift.max_iterations, 3);
        assert_eq!(cfg.index.backend, VectorBackend::Embedded);
        assert!(cfg.index.external_path.ends_with("vectors.db"));
        assert_eq!(cfg.llm.provider, "dummy");
        assert_eq!(cfg.embedding.provider, "hashing");
    }

    #[test]
    fn sections_override_defaults() {
        let toml = r#"
[engine]
data_dir = "/tmp/hg"

[index]
backend = "external"
external_path = "ext/vec.db"

[tree]
cluster_size = 10
min_cluster_size = 4

[drift]
max_iterations = 7
convergence_threshold = 0.3
"#;
        let f = write_toml(toml);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.index.backend, VectorBackend::External);
        assert_eq!(cfg.index.external_path, std::path::PathBuf::from("/tmp/hg/ext/vec.db"));
        assert_eq!(cfg.tree.cluster_size, 10);
        assert_eq!(cfg.tree.min_cluster_size, 4);
        assert_eq!(cfg.tree.max_levels, 4);
        assert_eq!(cfg.drift.max_iterations, 7);
        assert!((cfg.drift.convergence_threshold - 0.3).abs() < 1e-6);
    }

    #[test]
    fn unknown_backend_rejected() {
        let f = write_toml("[index]\nbackend = \"cloud\"\n");
        let err = load_from(f.path(), None, None).unwrap_err().to_string();
        assert!(err.contains("unknown index backend"));
    }

    #[test]
    fn invalid_tree_shape_rejected() {
        let f = write_toml("[tree]\ncluster_size = 2\nmin_cluster_size = 3\n");
        let err = load_from(f.path(), None, None).unwrap_err().to_string();
        assert!(err.contains("cluster_size"));
    }

    #[test]
    fn zero_dimension_rejected() {
        let f = write_toml("[embedding]\ndimension = 0\n");
        assert!(load_from(f.path(), None, None).is_err());
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let f = write_toml("[drift]\nconvergence_threshold = 1.5\n");
        assert!(load_from(f.path(), None, None).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.hiergraph");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with(".hiergraph"));
    }

    #[test]
    fn absolute_path_unchanged() {
        let p = expand_home("/absolute/path");
        assert_eq!(p, std::path::PathBuf::from("/absolute/path"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(std::path::Path::new("/nonexistent/config.toml"), None, None);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("config error"));
    }

    #[test]
    fn env_overrides_apply() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/test-override"), Some("debug")).unwrap();
        assert_eq!(cfg.data_dir, std::path::PathBuf::from("/tmp/test-override"));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn overlay_wins_scalar_and_keeps_base() {
        let dir = TempDir::new().unwrap();
        write_named(
            &dir,
            "base.toml",
            "[llm]\ndefault = \"dummy\"\n\n[llm.openai]\nmodel = \"gpt-base\"\ntemperature = 0.1\n",
        );
        let overlay = "[meta]\nbase = \"base.toml\"\n\n[llm.openai]\nmodel = \"gpt-overlay\"\n";
        let overlay_path = write_named(&dir, "overlay.toml", overlay);
        let cfg = load_from(&overlay_path, None, None).unwrap();
        assert_eq!(cfg.llm.openai.model, "gpt-overlay");
        assert_eq!(cfg.llm.openai.temperature, 0.1);
    }

    #[test]
    fn cycle_detection() {
        let dir = TempDir::new().unwrap();
        let self_path = dir.path().join("self.toml");
        let content = format!("[meta]\nbase = \"{}\"\n\n{MINIMAL_TOML}", self_path.display());
        std::fs::write(&self_path, content).unwrap();
        let msg = load_from(&self_path, None, None).unwrap_err().to_string();
        assert!(msg.contains("circular"));
    }

    #[test]
    fn with_data_dir_is_valid() {
        let cfg = Config::with_data_dir("/tmp/x");
        cfg.validate().unwrap();
        assert_eq!(cfg.db_path(), std::path::PathBuf::from("/tmp/x/hiergraph.db"));
    }
}
