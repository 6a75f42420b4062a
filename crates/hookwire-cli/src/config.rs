//! Configuration loading.
//!
//! Reading happens before logging is set up, so [`read_config`] only returns
//! what happened and [`resolve_config`] reports it once tracing is live.

use hookwire_types::config::HookwireConfig;
use std::path::Path;
use tracing::{info, warn};

/// Outcome of reading the config file.
pub enum Loaded {
    Parsed(HookwireConfig),
    Missing,
    Unreadable(std::io::Error),
    Invalid(toml::de::Error),
}

pub fn read_config(path: &Path) -> Loaded {
    match std::fs::read_to_string(path) {
        Ok(contents) => match HookwireConfig::from_toml_str(&contents) {
            Ok(config) => Loaded::Parsed(config),
            Err(e) => Loaded::Invalid(e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Loaded::Missing,
        Err(e) => Loaded::Unreadable(e),
    }
}

impl Loaded {
    /// Log level to start tracing with when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &str {
        match self {
            Loaded::Parsed(config) => &config.log_level,
            _ => "info",
        }
    }
}

/// Log how the config was obtained and fall back to defaults on any failure.
pub fn resolve_config(loaded: Loaded, path: &Path) -> HookwireConfig {
    match loaded {
        Loaded::Parsed(config) => {
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Loaded::Missing => {
            info!(path = %path.display(), "Config file not found, using defaults");
            defaults()
        }
        Loaded::Unreadable(e) => {
            warn!(error = %e, path = %path.display(), "Failed to read config file, using defaults");
            defaults()
        }
        Loaded::Invalid(e) => {
            warn!(error = %e, path = %path.display(), "Failed to parse config, using defaults");
            defaults()
        }
    }
}

fn defaults() -> HookwireConfig {
    HookwireConfig {
        log_level: "info".to_string(),
        ..HookwireConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hookwire.toml");
        let loaded = read_config(&path);
        assert!(matches!(loaded, Loaded::Missing));
        assert_eq!(loaded.log_level(), "info");
        let config = resolve_config(loaded, &path);
        assert_eq!(config.records.server.listen_addr, "0.0.0.0:2000");
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hookwire.toml");
        std::fs::write(&path, "records = 3").unwrap();
        let loaded = read_config(&path);
        assert!(matches!(loaded, Loaded::Invalid(_)));
        assert_eq!(resolve_config(loaded, &path).log_level, "info");
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hookwire.toml");
        std::fs::write(
            &path,
            "log_level = \"debug\"\n[records]\nstore_path = \"/var/lib/hookwire/students.json\"\n",
        )
        .unwrap();
        let loaded = read_config(&path);
        assert_eq!(loaded.log_level(), "debug");
        let config = resolve_config(loaded, &path);
        assert_eq!(
            config.records.store_path,
            std::path::PathBuf::from("/var/lib/hookwire/students.json")
        );
        assert_eq!(config.evaluator.records.addr, "127.0.0.1:2000");
    }
}
