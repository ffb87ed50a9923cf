use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::xdg;

pub const CONFIG_FILE_NAME: &str = "ifcache.toml";

/// Discovers ifcache configuration by traversing up the directory tree
pub fn discover_config(start_dir: &Path) -> Result<Option<PathBuf>> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Ok(Some(config_path));
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    // Fallback to global config
    let global_config = xdg::config_dir().join("config.toml");
    if global_config.exists() {
        return Ok(Some(global_config));
    }

    Ok(None)
}

/// Loads configuration with auto-discovery support
///
/// If `explicit_path` is provided, loads config from that path.
/// Otherwise, auto-discovers config by traversing up directory tree from cwd.
///
/// Returns the default configuration if none is found. The loaded
/// configuration is validated.
pub fn load_config_with_discovery(explicit_path: Option<&Path>) -> Result<EngineConfig> {
    let path = match explicit_path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let current_dir = std::env::current_dir()
                .context("Failed to get current directory for config discovery")?;
            discover_config(&current_dir)?
        }
    };

    let config = match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading configuration");
            let config = EngineConfig::from_file(&path)?;
            config
                .validate()
                .with_context(|| format!("Invalid configuration: {}", path.display()))?;
            config
        }
        None => EngineConfig::default(),
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_discover_config_finds_nearest() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let project = root.join("project");
        let subdir = project.join("subdir");
        fs::create_dir_all(&subdir).unwrap();

        let config_path = project.join(CONFIG_FILE_NAME);
        fs::write(&config_path, "# test config").unwrap();

        let found = discover_config(&subdir).unwrap();
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_explicit_config_is_validated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        fs::write(&path, "[execution]\nmode = \"remote\"\n").unwrap();

        let err = load_config_with_discovery(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("execution.mode"));

        fs::write(&path, "[store]\nstale_after = \"10m\"\n").unwrap();
        let config = load_config_with_discovery(Some(&path)).unwrap();
        assert_eq!(config.store.stale_after, "10m");
    }
}
