//! Configuration management for logwarden
//!
//! The pipeline configuration lives in `pipeline.yml`, `pipeline.json` or
//! `pipeline.toml` inside the config directory (first one found wins). A
//! missing file means built-in defaults.

use crate::error::PipelineError;
use crate::logs::{PipelineConfig, ServiceConfig};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve the config directory
///
/// Precedence:
/// 1. explicit `--config` argument
/// 2. system-wide config (`/etc/logwarden/config`) if it exists
/// 3. user config (`~/.config/logwarden/config`)
pub fn resolve_config_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        let system_config = PathBuf::from("/etc/logwarden/config");
        if system_config.exists() {
            system_config
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("logwarden")
                .join("config")
        }
    })
}

/// Load the pipeline configuration from the config directory
pub fn load_pipeline_config(config_dir: &Path) -> Result<PipelineConfig> {
    let yaml_path = config_dir.join("pipeline.yml");
    let json_path = config_dir.join("pipeline.json");
    let toml_path = config_dir.join("pipeline.toml");

    let config: PipelineConfig = if yaml_path.exists() {
        let contents = read(&yaml_path)?;
        serde_yaml::from_str(&contents).map_err(|e| invalid(&yaml_path, e))?
    } else if json_path.exists() {
        let contents = read(&json_path)?;
        serde_json::from_str(&contents).map_err(|e| invalid(&json_path, e))?
    } else if toml_path.exists() {
        let contents = read(&toml_path)?;
        toml::from_str(&contents).map_err(|e| invalid(&toml_path, e))?
    } else {
        debug!("No pipeline config in {}, using defaults", config_dir.display());
        return Ok(PipelineConfig::default());
    };

    validate(&config)?;
    Ok(config)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn invalid(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::config(format!("{}: {}", path.display(), err))
}

/// Reject values no command can work with
pub fn validate(config: &PipelineConfig) -> Result<()> {
    if config.stats.top == 0 {
        return Err(PipelineError::config("stats.top must be at least 1").into());
    }
    validate_threshold(config.stats.threshold_secs)?;

    if config.rotation.max_files == 0 {
        return Err(PipelineError::config("rotation.max_files must be at least 1").into());
    }
    validate_compression_level(config.rotation.compression_level)?;

    let mut seen = HashSet::new();
    for service in &config.services {
        if service.name.is_empty() {
            return Err(PipelineError::config("service names must not be empty").into());
        }
        if service.name == "all" {
            return Err(PipelineError::config("'all' is reserved and cannot name a service").into());
        }
        if !seen.insert(service.name.as_str()) {
            return Err(PipelineError::config(format!(
                "duplicate service name '{}'",
                service.name
            ))
            .into());
        }
    }

    Ok(())
}

/// Slow-request threshold in seconds must be finite and non-negative
pub fn validate_threshold(threshold_secs: f64) -> Result<()> {
    if !threshold_secs.is_finite() || threshold_secs < 0.0 {
        return Err(PipelineError::config(format!(
            "threshold must be a non-negative number of seconds, got {}",
            threshold_secs
        ))
        .into());
    }
    Ok(())
}

/// Gzip levels run from 1 to 9
pub fn validate_compression_level(level: u32) -> Result<()> {
    if !(1..=9).contains(&level) {
        return Err(PipelineError::config(format!(
            "compression level must be between 1 and 9, got {}",
            level
        ))
        .into());
    }
    Ok(())
}

/// Services selected by `--service`; `all` selects every configured service
pub fn select_services<'a>(config: &'a PipelineConfig, name: &str) -> Result<Vec<&'a ServiceConfig>> {
    if name == "all" {
        return Ok(config.services.iter().collect());
    }

    config
        .services
        .iter()
        .find(|service| service.name == name)
        .map(|service| vec![service])
        .ok_or_else(|| PipelineError::UnknownService(name.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::SourceConfig;
    use std::fs;
    use tempfile::tempdir;

    fn assert_config_error(result: Result<()>) {
        let err = result.unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::Configuration(_))
            ),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_load_missing_config_returns_default() {
        let temp_dir = tempdir().unwrap();
        let config = load_pipeline_config(temp_dir.path()).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.alert.log_path, "logs/alerts.log");
        assert_eq!(config.rotation.dir, "logs/archive");
    }

    #[test]
    fn test_load_yaml_config() {
        let temp_dir = tempdir().unwrap();
        let yaml_content = r#"
services:
  - name: "api"
    source:
      type: "file"
      path: "/var/log/api/access.log"
  - name: "worker"
    source:
      type: "command"
      command: "journalctl -u worker --no-pager"
      follow_command: "journalctl -u worker -f --no-pager"
    parser: "json"
alert:
  pattern: "FATAL|panic"
  persist: false
rotation:
  dir: "/var/lib/logwarden/archive"
  max_files: 5
  compress: true
  compression_level: 9
stats:
  top: 3
  threshold_secs: 0.5
"#;
        fs::write(temp_dir.path().join("pipeline.yml"), yaml_content).unwrap();

        let config = load_pipeline_config(temp_dir.path()).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].name, "api");
        assert!(matches!(config.services[1].source, SourceConfig::Command { .. }));
        assert_eq!(config.alert.pattern, "FATAL|panic");
        assert!(!config.alert.persist);
        assert_eq!(config.alert.log_path, "logs/alerts.log");
        assert_eq!(config.rotation.max_files, 5);
        assert!(config.rotation.compress);
        assert_eq!(config.stats.top, 3);
        assert_eq!(config.stats.threshold_secs, 0.5);
    }

    #[test]
    fn test_load_json_config() {
        let temp_dir = tempdir().unwrap();
        let json_content = r#"{
  "services": [
    { "name": "backend", "source": { "type": "stdin" } }
  ],
  "stats": { "top": 20 }
}"#;
        fs::write(temp_dir.path().join("pipeline.json"), json_content).unwrap();

        let config = load_pipeline_config(temp_dir.path()).unwrap();
        assert_eq!(config.services[0].source, SourceConfig::Stdin);
        assert_eq!(config.stats.top, 20);
        assert_eq!(config.stats.threshold_secs, 1.0);
    }

    #[test]
    fn test_load_toml_config() {
        let temp_dir = tempdir().unwrap();
        let toml_content = r#"
[[services]]
name = "db"
source = { type = "file", path = "/var/log/postgres.log" }

[rotation]
max_files = 3
"#;
        fs::write(temp_dir.path().join("pipeline.toml"), toml_content).unwrap();

        let config = load_pipeline_config(temp_dir.path()).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "db");
        assert_eq!(config.rotation.max_files, 3);
    }

    #[test]
    fn test_yaml_takes_precedence() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("pipeline.yml"), "stats:\n  top: 7\n").unwrap();
        fs::write(temp_dir.path().join("pipeline.json"), r#"{"stats": {"top": 9}}"#).unwrap();

        let config = load_pipeline_config(temp_dir.path()).unwrap();
        assert_eq!(config.stats.top, 7);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("pipeline.json"), "{ not json").unwrap();
        assert_config_error(load_pipeline_config(temp_dir.path()).map(|_| ()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.stats.top = 0;
        assert_config_error(validate(&config));

        let mut config = PipelineConfig::default();
        config.rotation.max_files = 0;
        assert_config_error(validate(&config));

        let mut config = PipelineConfig::default();
        config.rotation.compression_level = 10;
        assert_config_error(validate(&config));

        let mut config = PipelineConfig::default();
        config.stats.threshold_secs = f64::NAN;
        assert_config_error(validate(&config));

        let mut config = PipelineConfig::default();
        config.services.push(config.services[0].clone());
        assert_config_error(validate(&config));

        assert!(validate(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_select_services() {
        let config = PipelineConfig::default();

        let all = select_services(&config, "all").unwrap();
        assert_eq!(all.len(), 2);

        let db = select_services(&config, "db").unwrap();
        assert_eq!(db[0].name, "db");

        let err = select_services(&config, "cache").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownService(_))
        ));
    }

    #[test]
    fn test_resolve_explicit_config_dir() {
        let dir = resolve_config_dir(Some(PathBuf::from("/tmp/custom")));
        assert_eq!(dir, PathBuf::from("/tmp/custom"));
        assert!(resolve_config_dir(None).ends_with("config"));
    }
}
