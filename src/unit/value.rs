/// Tagged input/output values
///
/// Interfaces declare inputs as a mapping of names to [`Value`]s. Every variant
/// has an explicit canonical form (see `fingerprint::canonical`) and an explicit
/// portable serialization; there is no opaque fallback.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::atomic::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    /// Non-finite values serialize as `"nan"`, `"inf"` and `"-inf"`
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    /// Reference to a file; hashed by content, never by path
    File(PathBuf),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    /// An open, non-seekable stream. It can be passed to an interface running
    /// in-process, but it can neither be fingerprinted nor exported.
    Stream(String),
}

impl Value {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Value::File(path.into())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::File(p) => Some(p),
            _ => None,
        }
    }

    /// Rewrite file paths below `base` as paths relative to it
    fn relative_to(self, base: &Path) -> Self {
        match self {
            Value::File(path) => match path.strip_prefix(base) {
                Ok(rel) => Value::File(rel.to_path_buf()),
                Err(_) => Value::File(path),
            },
            Value::Sequence(items) => {
                Value::Sequence(items.into_iter().map(|v| v.relative_to(base)).collect())
            }
            Value::Mapping(map) => Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, v.relative_to(base)))
                    .collect(),
            ),
            other => other,
        }
    }

    fn resolved_in(&self, base: &Path) -> Self {
        match self {
            Value::File(path) if path.is_relative() => Value::File(base.join(path)),
            Value::Sequence(items) => {
                Value::Sequence(items.iter().map(|v| v.resolved_in(base)).collect())
            }
            Value::Mapping(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.resolved_in(base)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// JSON has no literal for non-finite floats, so they travel as text
mod float_repr {
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "nan" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::invalid_value(
                    de::Unexpected::Str(other),
                    &"a number, \"nan\", \"inf\" or \"-inf\"",
                )),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Sequence(v.into_iter().map(Into::into).collect())
    }
}

/// Declared input values of a unit of work.
///
/// Names missing from the mapping are undefined and take no part in the
/// fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inputs(BTreeMap<String, Value>);

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Entries sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Save the current inputs as JSON
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize inputs")?;
        write_atomic(path, &json)
            .with_context(|| format!("Failed to write inputs: {}", path.display()))?;
        tracing::debug!(path = %path.display(), count = self.len(), "saved inputs");
        Ok(())
    }

    /// Load inputs from JSON into this mapping.
    ///
    /// With `overwrite = false` only inputs that are currently undefined are
    /// taken from the file.
    pub fn load_json(&mut self, path: &Path, overwrite: bool) -> Result<usize> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read inputs: {}", path.display()))?;
        let loaded: Inputs = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse inputs: {}", path.display()))?;

        let mut applied = 0;
        for (name, value) in loaded.0 {
            if overwrite || !self.is_set(&name) {
                self.0.insert(name, value);
                applied += 1;
            }
        }
        Ok(applied)
    }
}

impl FromIterator<(String, Value)> for Inputs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Inputs(iter.into_iter().collect())
    }
}

/// Outputs produced by a unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs(BTreeMap<String, Value>);

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record files produced inside `working_dir` relative to it
    pub fn relativize(self, working_dir: &Path) -> Self {
        Outputs(
            self.0
                .into_iter()
                .map(|(k, v)| (k, v.relative_to(working_dir)))
                .collect(),
        )
    }

    /// Absolute view of the outputs for a given working directory
    pub fn resolve(&self, working_dir: &Path) -> Self {
        Outputs(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.resolved_in(working_dir)))
                .collect(),
        )
    }
}
