//! Runtime configuration for `policyline`.
//!
//! Loaded from `policyline.toml` (or the file named by `--config` /
//! `POLICYLINE_CONFIG`). Every section is optional.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [ledger]
//! max_lane_retries = 3
//!
//! [cache]
//! ttl_secs = 5
//!
//! [pipeline]
//! env = "prod"
//! activated_by = "policyline"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use policyline_pipeline::DEFAULT_MAX_LANE_RETRIES;

/// File picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "policyline.toml";

const MAX_LANE_RETRIES_LIMIT: u32 = 100;
const MAX_TTL_SECS: u64 = 3600;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// `[ledger]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Retries after a lane conflict before the upsert gives up.
    pub max_lane_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_lane_retries: DEFAULT_MAX_LANE_RETRIES,
        }
    }
}

/// `[cache]` section. `ttl_secs = 0` turns the read cache off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 5 }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Environment new snapshots are built for.
    pub env: String,
    /// Recorded on deployments the pipeline makes.
    pub activated_by: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            env: "prod".to_string(),
            activated_by: "policyline".to_string(),
        }
    }
}

// ── Functions ─────────────────────────────────────────────────────────────────

/// Read and parse a config TOML file from `path`.
pub fn read_config(path: &Path) -> Result<Config, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;

    toml::from_str(&content).map_err(|e| format!("could not parse '{}': {}", path.display(), e))
}

/// Resolve and load the effective configuration.
///
/// An explicit path (flag first, then `POLICYLINE_CONFIG`) must exist. The
/// default file is optional; without it the built-in defaults apply.
/// Environment overrides are applied last.
pub fn load(explicit: Option<&Path>) -> Result<Config, String> {
    load_with(explicit, |key| std::env::var(key).ok())
}

fn load_with(
    explicit: Option<&Path>,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Config, String> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| var("POLICYLINE_CONFIG").map(PathBuf::from));

    let mut config = match named {
        Some(path) => read_config(&path)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                read_config(default)?
            } else {
                Config::default()
            }
        }
    };
    config.apply_overrides(var)?;
    Ok(config)
}

impl Config {
    /// Apply `POLICYLINE_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(port) = var("POLICYLINE_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| format!("POLICYLINE_PORT must be a port number, got '{}'", port))?;
        }
        Ok(())
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be between 1 and 65535".to_string());
        }
        if self.ledger.max_lane_retries > MAX_LANE_RETRIES_LIMIT {
            errors.push(format!(
                "ledger.max_lane_retries must be at most {}, got {}",
                MAX_LANE_RETRIES_LIMIT, self.ledger.max_lane_retries
            ));
        }
        if self.cache.ttl_secs > MAX_TTL_SECS {
            errors.push(format!(
                "cache.ttl_secs must be at most {}, got {}",
                MAX_TTL_SECS, self.cache.ttl_secs
            ));
        }
        if self.pipeline.env.trim().is_empty() {
            errors.push("pipeline.env must not be empty".to_string());
        }
        if self.pipeline.activated_by.trim().is_empty() {
            errors.push("pipeline.activated_by must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn cache_ttl(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.cache.ttl_secs).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ledger.max_lane_retries, DEFAULT_MAX_LANE_RETRIES);
        assert_eq!(config.pipeline.env, "prod");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str("[ledger]\nmax_lane_retries = 7\n").unwrap();
        assert_eq!(config.ledger.max_lane_retries, 7);
        assert_eq!(config.cache.ttl_secs, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<Config>("[server]\nhost = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("host"), "{err}");
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = Config::default();
        config.server.port = 0;
        config.cache.ttl_secs = 99_999;
        config.pipeline.env = " ".to_string();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors[0].contains("server.port"));
    }

    #[test]
    fn port_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();

        let config = load_with(Some(&path), env(&[("POLICYLINE_PORT", "9100")])).unwrap();
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn bad_port_override_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("POLICYLINE_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.contains("POLICYLINE_PORT"));
    }

    #[test]
    fn config_path_from_environment_must_exist() {
        let err = load_with(None, env(&[("POLICYLINE_CONFIG", "/nonexistent/p.toml")]))
            .unwrap_err();
        assert!(err.contains("could not read"), "{err}");
    }
}
