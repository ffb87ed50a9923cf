/// Canonical forms of input values
///
/// Every value is rendered into a tagged JSON form before digesting: the tag
/// keeps `Int(2)`, `Float(2.0)` and `Str("2")` apart, floats become fixed
/// text, and file references become content digests.
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

use super::files::{hash_file_content, hash_file_stamp};
use super::HashMethod;
use crate::error::{EngineError, Result};
use crate::unit::Value;

/// Canonical form of every hashed input, keyed by input name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalInputs(BTreeMap<String, serde_json::Value>);

impl CanonicalInputs {
    pub(crate) fn insert(&mut self, name: String, canonical: serde_json::Value) {
        self.0.insert(name, canonical);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> =
            self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::Value::Object(map)
    }
}

/// Fixed textual representation for floats
pub fn format_float(value: f64) -> String {
    format!("{:.10}", value)
}

/// Canonicalize one input value
pub fn canonical_value(
    name: &str,
    value: &Value,
    hash_files: bool,
    method: HashMethod,
) -> Result<serde_json::Value> {
    let canonical = match value {
        Value::Bool(b) => json!(["bool", b]),
        Value::Int(i) => json!(["int", i]),
        Value::Float(f) => json!(["float", format_float(*f)]),
        Value::Str(s) => json!(["str", s]),
        Value::File(path) if hash_files => canonical_file(name, path, method)?,
        Value::File(path) => json!(["path", path.to_string_lossy()]),
        Value::Sequence(items) => {
            let items = items
                .iter()
                .map(|item| canonical_value(name, item, hash_files, method))
                .collect::<Result<Vec<_>>>()?;
            json!(["seq", items])
        }
        Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), canonical_value(name, item, hash_files, method)?);
            }
            json!(["map", out])
        }
        Value::Stream(description) => {
            return Err(EngineError::UnhashableInput {
                name: name.to_string(),
                reason: format!("stream '{}' has no stable content", description),
            })
        }
    };
    Ok(canonical)
}

fn canonical_file(name: &str, path: &Path, method: HashMethod) -> Result<serde_json::Value> {
    let digest = match method {
        HashMethod::Content => hash_file_content(path).map(|d| json!(["file", d])),
        HashMethod::Timestamp => hash_file_stamp(path).map(|d| json!(["file_stamp", d])),
    };

    digest.map_err(|e| EngineError::UnhashableInput {
        name: name.to_string(),
        reason: format!("cannot read {}: {}", path.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn canon(value: &Value) -> serde_json::Value {
        canonical_value("x", value, true, HashMethod::Content).unwrap()
    }

    #[test]
    fn test_float_text_is_fixed() {
        assert_eq!(format_float(2.0), "2.0000000000");
        assert_eq!(format_float(0.1 + 0.2), "0.3000000000");
        assert_eq!(canon(&Value::Float(0.1 + 0.2)), canon(&Value::Float(0.3)));
    }

    #[test]
    fn test_variants_do_not_collide() {
        let forms = [
            canon(&Value::Int(2)),
            canon(&Value::Float(2.0)),
            canon(&Value::from("2")),
            canon(&Value::from(vec![2])),
        ];
        for (i, a) in forms.iter().enumerate() {
            for b in forms.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_files_nested_in_sequences_are_hashed() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("t1.nii");
        fs::write(&file, "abc").unwrap();

        let form = canon(&Value::Sequence(vec![Value::File(file.clone())]));
        let text = form.to_string();
        assert!(text.contains("\"file\""));
        assert!(!text.contains("t1.nii"));

        let path_only = canonical_value("x", &Value::File(file), false, HashMethod::Content).unwrap();
        assert!(path_only.to_string().contains("t1.nii"));
    }

    #[test]
    fn test_unhashable_values() {
        let err = canonical_value("log", &Value::Stream("stdin".into()), true, HashMethod::Content)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnhashableInput { ref name, .. } if name == "log"));

        let err = canonical_value(
            "image",
            &Value::file("/nonexistent/image.nii"),
            true,
            HashMethod::Content,
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/image.nii"));
    }
}
