use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// How a unit of work failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The interface returned an error
    Error,
    /// The interface panicked
    Panic,
    /// The isolated process exited without reporting a result
    Crash,
    /// The isolated process exceeded its time budget and was killed
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Error => "error",
            FailureKind::Panic => "panic",
            FailureKind::Crash => "crash",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Structured record of a failed execution, persisted in `failed` entries
/// and replayed verbatim on later lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    /// Context chain, outermost first
    #[serde(default)]
    pub details: Vec<String>,
    pub interface: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, interface: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
            interface: interface.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn from_error(err: &anyhow::Error, interface: impl Into<String>) -> Self {
        let mut record = Self::new(FailureKind::Error, interface, err.to_string());
        record.details = err.chain().skip(1).map(|cause| cause.to_string()).collect();
        record
    }

    pub fn from_panic(payload: &(dyn Any + Send), interface: impl Into<String>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(FailureKind::Panic, interface, message)
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.interface, self.kind, self.message)?;
        for detail in &self.details {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}
