use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fingerprint::HashMethod;
use crate::store::StoreOptions;
use crate::xdg;

/// Complete ifcache configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub hashing: HashingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Result store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store root; defaults to `$XDG_CACHE_HOME/ifcache`
    #[serde(default)]
    pub dir: Option<String>,

    /// Reservations without a heartbeat for this long may be reclaimed
    #[serde(default = "default_stale_after")]
    pub stale_after: String,

    /// Keep the first successful result for a fingerprint forever
    #[serde(default)]
    pub immutable_success: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            stale_after: default_stale_after(),
            immutable_success: false,
        }
    }
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Where units of work run: local, isolated
    #[serde(default = "default_mode")]
    pub mode: String,

    /// What to do when another worker is running the same fingerprint: wait, fail
    #[serde(default = "default_on_running")]
    pub on_running: String,

    /// First delay between polls while waiting (grows exponentially)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Give up waiting after this long
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: String,

    /// Program used for isolated execution; defaults to the ifcache binary
    #[serde(default)]
    pub runner: Option<String>,

    /// Kill isolated runs after this long
    #[serde(default)]
    pub runner_timeout: Option<String>,

    /// Root for per-fingerprint working directories; defaults to `<store>/work`
    #[serde(default)]
    pub work_dir: Option<String>,

    /// Environment variables captured into exported state
    #[serde(default)]
    pub env: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            on_running: default_on_running(),
            poll_interval: default_poll_interval(),
            wait_timeout: default_wait_timeout(),
            runner: None,
            runner_timeout: None,
            work_dir: None,
            env: Vec::new(),
        }
    }
}

/// Fingerprint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingConfig {
    /// How file inputs are digested: content, timestamp
    #[serde(default = "default_hash_method")]
    pub method: String,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            method: default_hash_method(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty, compact, json), overridden by IFCACHE_LOG_FORMAT
    #[serde(default)]
    pub log_format: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: None,
        }
    }
}

fn default_stale_after() -> String {
    "1h".to_string()
}

fn default_mode() -> String {
    "local".to_string()
}

fn default_on_running() -> String {
    "wait".to_string()
}

fn default_poll_interval() -> String {
    "500ms".to_string()
}

fn default_wait_timeout() -> String {
    "1h".to_string()
}

fn default_hash_method() -> String {
    "content".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Generate example configuration as TOML string
    pub fn example() -> Result<String> {
        let config = EngineConfig {
            store: StoreConfig {
                dir: Some("/shared/ifcache".to_string()),
                stale_after: "30m".to_string(),
                immutable_success: false,
            },
            execution: ExecutionConfig {
                mode: "isolated".to_string(),
                runner_timeout: Some("2h".to_string()),
                env: vec!["OMP_NUM_THREADS".to_string()],
                ..Default::default()
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: Some("compact".to_string()),
            },
            ..Default::default()
        };

        toml::to_string_pretty(&config).context("Failed to render example config")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.store.dir {
            if dir.is_empty() {
                anyhow::bail!("store.dir must not be empty when set");
            }
        }

        let stale_after = parse_duration(&self.store.stale_after)
            .with_context(|| format!("store.stale_after: {}", self.store.stale_after))?;
        if stale_after.is_zero() {
            anyhow::bail!("store.stale_after must be greater than zero");
        }

        if !["local", "isolated"].contains(&self.execution.mode.as_str()) {
            anyhow::bail!("execution.mode must be one of: local, isolated");
        }

        if !["wait", "fail"].contains(&self.execution.on_running.as_str()) {
            anyhow::bail!("execution.on_running must be one of: wait, fail");
        }

        parse_duration(&self.execution.poll_interval)
            .with_context(|| format!("execution.poll_interval: {}", self.execution.poll_interval))?;
        parse_duration(&self.execution.wait_timeout)
            .with_context(|| format!("execution.wait_timeout: {}", self.execution.wait_timeout))?;
        if let Some(timeout) = &self.execution.runner_timeout {
            parse_duration(timeout)
                .with_context(|| format!("execution.runner_timeout: {}", timeout))?;
        }

        self.hash_method()?;

        if !["trace", "debug", "info", "warn", "error"]
            .contains(&self.observability.log_level.as_str())
        {
            anyhow::bail!("observability.log_level must be one of: trace, debug, info, warn, error");
        }

        if let Some(format) = &self.observability.log_format {
            if !["pretty", "compact", "json"].contains(&format.as_str()) {
                anyhow::bail!("observability.log_format must be one of: pretty, compact, json");
            }
        }

        Ok(())
    }

    /// Store root: explicit override, then config, then the XDG cache directory
    pub fn store_dir(&self, override_dir: Option<&Path>) -> PathBuf {
        match (override_dir, &self.store.dir) {
            (Some(dir), _) => dir.to_path_buf(),
            (None, Some(dir)) => PathBuf::from(dir),
            (None, None) => xdg::cache_dir(),
        }
    }

    pub fn store_options(&self) -> Result<StoreOptions> {
        Ok(StoreOptions {
            stale_after: parse_duration(&self.store.stale_after)
                .with_context(|| format!("store.stale_after: {}", self.store.stale_after))?,
            immutable_success: self.store.immutable_success,
        })
    }

    pub fn hash_method(&self) -> Result<HashMethod> {
        self.hashing
            .method
            .parse()
            .map_err(|e: String| anyhow!("hashing.method: {}", e))
    }
}

/// Parse duration string (e.g., "500ms", "30s", "10m", "1h", "7d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("Empty duration string"));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("Missing duration unit: {}. Use: ms, s, m, h, d", s))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => return Err(anyhow!("Invalid duration unit: {}. Use: ms, s, m, h, d", unit)),
    };

    Ok(duration)
}
