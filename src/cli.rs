use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// ifcache - Interface execution and caching engine
///
/// ifcache fingerprints units of work, stores their results, and runs them
/// either in-process or in isolated runner processes sharing one store.
#[derive(Parser, Debug)]
#[command(name = "ifcache")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interface execution and caching engine", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Common configuration arguments shared across commands
#[derive(Parser, Debug, Clone)]
pub struct CommonConfigArgs {
    /// Config file path
    #[arg(short = 'c', long, env = "IFCACHE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Result store directory
    #[arg(long, env = "IFCACHE_STORE_DIR", global = true)]
    pub store_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute an exported unit of work and record its outcome
    Runner(RunnerArgs),

    /// Run an exported unit of work through the cache
    Run(RunArgs),

    /// Export a unit of work built from a JSON inputs file
    Export(ExportArgs),

    /// Show what an exported unit of work contains and its cache status
    Inspect(InspectArgs),

    /// Result store management
    Cache(CacheArgs),

    /// Configuration management utilities
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct RunnerArgs {
    /// Exported state file
    pub artifact: PathBuf,

    /// Reservation already taken by the caller
    #[arg(long)]
    pub reservation: Option<Uuid>,

    /// Write the outcome report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Working directory for outputs
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Execute even when another process holds the reservation
    #[arg(long)]
    pub allow_redundant: bool,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Exported state file
    pub artifact: PathBuf,

    /// Execute without consulting or updating the store
    #[arg(long)]
    pub no_cache: bool,

    /// Discard any stored result and execute again
    #[arg(long)]
    pub force: bool,

    /// Execute in a separate runner process
    #[arg(long)]
    pub isolated: bool,

    /// Execute even when another process holds the reservation
    #[arg(long)]
    pub allow_redundant: bool,

    /// Print outputs as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Implementation name (current registered version is used)
    pub implementation: String,

    /// JSON file with the input values
    #[arg(long)]
    pub inputs: PathBuf,

    /// Destination of the exported state
    #[arg(short, long, default_value = "ifcache-state.json")]
    pub output: PathBuf,
}

#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Exported state file
    pub artifact: PathBuf,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Show implementation and creation time
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show one cache entry
    Show {
        /// Fingerprint (64 hex characters)
        fingerprint: String,
    },

    /// Remove one cache entry
    Invalidate {
        /// Fingerprint (64 hex characters)
        fingerprint: String,
    },

    /// Remove every cache entry
    Clean {
        /// Confirm removal of all entries
        #[arg(long)]
        all: bool,
    },

    /// Show cache statistics
    Stats,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print an example configuration file
    Example,

    /// Validate a configuration file (the discovered one by default)
    Validate {
        /// Path to config file
        path: Option<PathBuf>,
    },

    /// Show effective configuration
    Show,
}
