//! Configuration loading from `~/.tether/config.toml` with defaults.

use std::path::{Path, PathBuf};
use tether_types::TetherConfig;
use tracing::{info, warn};

/// Load node configuration from a TOML file.
///
/// A missing, unreadable or unparsable file yields the defaults.
pub fn load_config(path: Option<&Path>) -> TetherConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return TetherConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match TetherConfig::from_toml(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                TetherConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            TetherConfig::default()
        }
    }
}

/// The Tether home directory.
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tether")
}

pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config, TetherConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_name = \"edge\"\nbuiltin_toolkit = false").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.node_name, "edge");
        assert!(!config.builtin_toolkit);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_config_bad_toml_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_name = [").unwrap();
        assert_eq!(load_config(Some(file.path())), TetherConfig::default());
    }

    #[test]
    fn test_default_path() {
        assert!(default_config_path().ends_with(".tether/config.toml"));
    }
}
