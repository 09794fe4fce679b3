//! Engine configuration loading: defaults, then an optional TOML file, then
//! environment overrides, then validation.

use std::path::{Path, PathBuf};
use std::{env, fs};

use e8m_core::EngineConfig;

use crate::error::{Result, StoreError};

pub const CONFIG_FILE: &str = "e8m.toml";
pub const DATABASE_FILE: &str = "memory.db";

/// Default base directory for all e8m storage.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".e8mind")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from `path` (when given and present) with process
/// environment overrides applied on top.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(p) if p.exists() => {
            let content = fs::read_to_string(p)?;
            let config = parse_config(&content)
                .map_err(|e| StoreError::Config(format!("{}: {e}", p.display())))?;
            tracing::debug!(path = %p.display(), "config file loaded");
            config
        }
        _ => EngineConfig::default(),
    };
    let config = apply_overrides(config, |key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse TOML. Missing sections and fields fall back to defaults.
pub fn parse_config(content: &str) -> std::result::Result<EngineConfig, toml::de::Error> {
    toml::from_str(content)
}

/// Apply `E8_*` overrides. `lookup` returns the raw value of a variable.
pub fn apply_overrides<F>(mut config: EngineConfig, lookup: F) -> Result<EngineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = parse_var(&lookup, "E8_SEED")? {
        config.seed = v;
    }
    if let Some(v) = parse_var(&lookup, "E8_EMBED_DIM")? {
        config.embed_dim = v;
    }
    if let Some(v) = parse_var(&lookup, "E8_VISIBILITY_THRESHOLD")? {
        config.emergence.visibility_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "E8_PRESSURE_THRESHOLD")? {
        config.consolidation.pressure_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "E8_MEMORY_MAINTENANCE")? {
        config.maintenance_interval = v;
    }
    Ok(config)
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| StoreError::Config(format!("{key}='{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(parse_config("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = parse_config(
            "
            embed_dim = 384

            [retrieval]
            max_light_cone = 6

            [policy]
            epsilon = 0.3
            ",
        )
        .unwrap();
        assert_eq!(config.embed_dim, 384);
        assert_eq!(config.retrieval.max_light_cone, 6);
        assert_eq!(config.policy.epsilon, 0.3);
        assert_eq!(config.seed, EngineConfig::default().seed);
        assert_eq!(config.graph, EngineConfig::default().graph);
    }

    #[test]
    fn test_env_overrides() {
        let config = apply_overrides(
            EngineConfig::default(),
            vars(&[
                ("E8_SEED", "7"),
                ("E8_EMBED_DIM", "16"),
                ("E8_VISIBILITY_THRESHOLD", "0.25"),
                ("E8_PRESSURE_THRESHOLD", "0.002"),
                ("E8_MEMORY_MAINTENANCE", " 40 "),
            ]),
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.embed_dim, 16);
        assert_eq!(config.emergence.visibility_threshold, 0.25);
        assert_eq!(config.consolidation.pressure_threshold, 0.002);
        assert_eq!(config.maintenance_interval, 40);
    }

    #[test]
    fn test_empty_override_ignored() {
        let config = apply_overrides(EngineConfig::default(), vars(&[("E8_SEED", "")])).unwrap();
        assert_eq!(config.seed, EngineConfig::default().seed);
    }

    #[test]
    fn test_bad_override_rejected() {
        let err = apply_overrides(EngineConfig::default(), vars(&[("E8_EMBED_DIM", "wide")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(msg) if msg.contains("E8_EMBED_DIM")));
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "seed = 11\n[consolidation]\nmin_cluster_size = 4\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.consolidation.min_cluster_size, 4);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[consolidation]\nmin_cluster_size = 1\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, StoreError::Core(_)));
    }

    #[test]
    fn test_load_config_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "embed_dim = \"many\"").unwrap();

        assert!(matches!(load_config(Some(&path)), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.consolidation, EngineConfig::default().consolidation);
    }
}
