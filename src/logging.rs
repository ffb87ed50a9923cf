//! Structured logging for ifcache
//!
//! Every engine log line carries structured fields so cache behaviour can be
//! followed from logs alone.
//!
//! # Log Format Conventions
//!
//! - `service`: The engine component ("fingerprint", "store", "runner", ...)
//! - `operation`: The operation being performed ("lookup", "begin", "commit", ...)
//! - `status`: The result status ("hit", "miss", "success", "error", ...)
//! - `fingerprint`: Fingerprint of the unit of work (hex-encoded)
//! - `implementation`: Implementation identifier (`name@version`)
//!
//! # Examples
//!
//! ```rust
//! use ifcache::logging::{operations, services, status};
//! use tracing::info;
//!
//! let fingerprint = "ab12";
//! info!(
//!     service = services::EXECUTOR,
//!     operation = operations::LOOKUP,
//!     status = status::HIT,
//!     fingerprint = %fingerprint,
//!     "cache hit"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Formatter that shows "ifcache" instead of the full module path
struct IfcacheFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for IfcacheFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(ifcache)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(ifcache): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// Uncolored single line (CI and child runner processes)
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    /// Resolve from `IFCACHE_LOG_FORMAT`, then the configured value, then `CI`
    pub fn resolve(configured: Option<&str>) -> Self {
        std::env::var("IFCACHE_LOG_FORMAT")
            .ok()
            .and_then(|v| Self::parse(&v))
            .or_else(|| configured.and_then(Self::parse))
            .unwrap_or_else(|| {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            })
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: Log filter, overrides `default_level` (e.g. "debug", "ifcache=trace")
/// - `IFCACHE_LOG_FORMAT`: "pretty", "compact" or "json"
/// - `CI`: If set, defaults to compact format
///
/// Logs always go to stderr; stdout is reserved for command output.
pub fn init(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A subscriber may already be installed (tests, embedding applications)
    let _ = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(IfcacheFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(IfcacheFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };
}

/// Component names
pub mod services {
    pub const FINGERPRINT: &str = "fingerprint";
    pub const STORE: &str = "store";
    pub const EXPORT: &str = "export";
    pub const RUNNER: &str = "runner";
    pub const EXECUTOR: &str = "executor";
}

/// Operation names
pub mod operations {
    pub const FINGERPRINT: &str = "fingerprint";
    pub const LOOKUP: &str = "lookup";
    pub const BEGIN: &str = "begin";
    pub const COMMIT: &str = "commit";
    pub const FAIL: &str = "fail";
    pub const INVALIDATE: &str = "invalidate";
    pub const EXPORT: &str = "export";
    pub const IMPORT: &str = "import";
    pub const EXECUTE: &str = "execute";
    pub const WAIT: &str = "wait";
}

/// Status values
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const BUSY: &str = "busy";
    pub const SKIPPED: &str = "skipped";
    pub const ERROR: &str = "error";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_log_format_resolution() {
        std::env::remove_var("IFCACHE_LOG_FORMAT");
        assert_eq!(LogFormat::resolve(Some("json")), LogFormat::Json);

        std::env::set_var("IFCACHE_LOG_FORMAT", "compact");
        assert_eq!(LogFormat::resolve(Some("json")), LogFormat::Compact);

        std::env::set_var("IFCACHE_LOG_FORMAT", "bogus");
        assert_eq!(LogFormat::resolve(Some("JSON")), LogFormat::Json);
        std::env::remove_var("IFCACHE_LOG_FORMAT");
    }
}
