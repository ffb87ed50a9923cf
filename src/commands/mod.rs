pub mod cache;
pub mod config;
pub mod export;
pub mod inspect;
pub mod run;
pub mod runner;

use anyhow::{Context, Result};
use std::path::PathBuf;

use ifcache::config::EngineConfig;
use ifcache::config_discovery::{discover_config, load_config_with_discovery};
use ifcache::store::FilesystemResultStore;

use crate::cli::CommonConfigArgs;

/// Configuration and store location resolved from the command line
pub struct Session {
    pub config: EngineConfig,
    /// File the configuration came from, if any
    pub config_path: Option<PathBuf>,
    pub store_dir: PathBuf,
}

impl Session {
    pub fn load(common: &CommonConfigArgs) -> Result<Self> {
        let config_path = match &common.config {
            Some(path) => Some(path.clone()),
            None => {
                let current_dir = std::env::current_dir()
                    .context("Failed to get current directory for config discovery")?;
                discover_config(&current_dir)?
            }
        };

        let config = load_config_with_discovery(config_path.as_deref())?;
        let store_dir = config.store_dir(common.store_dir.as_deref());

        Ok(Self {
            config,
            config_path,
            store_dir,
        })
    }

    pub fn open_store(&self) -> Result<FilesystemResultStore> {
        let store = FilesystemResultStore::new(&self.store_dir, self.config.store_options()?)
            .with_context(|| {
                format!("Failed to open result store: {}", self.store_dir.display())
            })?;
        Ok(store)
    }
}
