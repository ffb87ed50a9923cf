/// Declared input schema of an interface
///
/// Mirrors the metadata interfaces attach to their inputs: which fields are
/// mandatory, which are mutually exclusive, which pull in others, and how a
/// field takes part in the fingerprint.
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::unit::{ImplementationId, Inputs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub mandatory: bool,
    /// Alternatives; at most one of the group may be set
    pub xor: Vec<String>,
    /// Fields that must be set whenever this one is
    pub requires: Vec<String>,
    /// Exclude the field from the fingerprint (e.g. thread counts)
    pub nohash: bool,
    /// Hash file references by content (default) or by path text
    pub hash_files: bool,
}

impl Default for FieldSpec {
    fn default() -> Self {
        Self {
            mandatory: false,
            xor: Vec::new(),
            requires: Vec::new(),
            nohash: false,
            hash_files: true,
        }
    }
}

impl FieldSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn xor(mut self, others: &[&str]) -> Self {
        self.xor = others.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn requires(mut self, others: &[&str]) -> Self {
        self.requires = others.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn nohash(mut self) -> Self {
        self.nohash = true;
        self
    }

    pub fn path_only(mut self) -> Self {
        self.hash_files = false;
        self
    }
}

/// An empty schema accepts any inputs and hashes all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_hashed(&self, name: &str) -> bool {
        self.get(name).map(|f| !f.nohash).unwrap_or(true)
    }

    pub fn hashes_file_content(&self, name: &str) -> bool {
        self.get(name).map(|f| f.hash_files).unwrap_or(true)
    }

    /// Check `inputs` against the declared fields
    pub fn validate(&self, implementation: &ImplementationId, inputs: &Inputs) -> Result<()> {
        if self.fields.is_empty() {
            return Ok(());
        }

        let invalid = |reason: String| EngineError::InvalidInputs {
            interface: implementation.to_string(),
            reason,
        };

        for name in inputs.names() {
            if !self.fields.contains_key(name) {
                return Err(invalid(format!("unknown input '{}'", name)));
            }
        }

        for (name, spec) in &self.fields {
            let set = inputs.is_set(name);

            if spec.mandatory && !set {
                if spec.xor.is_empty() {
                    return Err(invalid(format!("requires a value for input '{}'", name)));
                }
                if !spec.xor.iter().any(|alt| inputs.is_set(alt)) {
                    let mut group = vec![name.clone()];
                    group.extend(spec.xor.iter().cloned());
                    return Err(invalid(format!(
                        "requires a value for one of the inputs '{}'",
                        group.join(", ")
                    )));
                }
            }

            if !set {
                continue;
            }

            if let Some(other) = spec.xor.iter().find(|alt| inputs.is_set(alt)) {
                return Err(invalid(format!(
                    "inputs '{}' and '{}' are mutually exclusive",
                    name, other
                )));
            }

            let missing: Vec<&str> = spec
                .requires
                .iter()
                .filter(|req| !inputs.is_set(req))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(invalid(format!(
                    "input '{}' requires {}",
                    name,
                    missing
                        .iter()
                        .map(|m| format!("'{}'", m))
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warp_schema() -> InputSchema {
        InputSchema::new()
            .field("input_image", FieldSpec::new().mandatory())
            .field("reference_image", FieldSpec::new().xor(&["tightest_box"]))
            .field("tightest_box", FieldSpec::new().xor(&["reference_image"]))
            .field(
                "output_image",
                FieldSpec::new().mandatory().xor(&["out_postfix"]).path_only(),
            )
            .field("out_postfix", FieldSpec::new().xor(&["output_image"]))
            .field("invert_affine", FieldSpec::new().requires(&["reference_image"]))
            .field("num_threads", FieldSpec::new().nohash())
    }

    fn id() -> ImplementationId {
        ImplementationId::new("warp", "2.1")
    }

    #[test]
    fn test_valid_inputs() {
        let inputs = Inputs::new()
            .with("input_image", "a.nii")
            .with("out_postfix", "_warped");
        assert!(warp_schema().validate(&id(), &inputs).is_ok());
    }

    #[test]
    fn test_missing_mandatory() {
        let inputs = Inputs::new().with("out_postfix", "_warped");
        let err = warp_schema().validate(&id(), &inputs).unwrap_err();
        assert!(err.to_string().contains("'input_image'"));
    }

    #[test]
    fn test_mandatory_xor_group() {
        let inputs = Inputs::new().with("input_image", "a.nii");
        let err = warp_schema().validate(&id(), &inputs).unwrap_err();
        assert!(err.to_string().contains("one of the inputs 'output_image, out_postfix'"));
    }

    #[test]
    fn test_mutually_exclusive() {
        let inputs = Inputs::new()
            .with("input_image", "a.nii")
            .with("out_postfix", "_w")
            .with("reference_image", "ref.nii")
            .with("tightest_box", true);
        let err = warp_schema().validate(&id(), &inputs).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_requires_and_unknown() {
        let inputs = Inputs::new()
            .with("input_image", "a.nii")
            .with("out_postfix", "_w")
            .with("invert_affine", true);
        let err = warp_schema().validate(&id(), &inputs).unwrap_err();
        assert!(err.to_string().contains("requires 'reference_image'"));

        let inputs = Inputs::new()
            .with("input_image", "a.nii")
            .with("out_postfix", "_w")
            .with("bogus", 1);
        let err = warp_schema().validate(&id(), &inputs).unwrap_err();
        assert!(err.to_string().contains("unknown input 'bogus'"));
    }

    #[test]
    fn test_hash_metadata() {
        let schema = warp_schema();
        assert!(!schema.is_hashed("num_threads"));
        assert!(schema.is_hashed("input_image"));
        assert!(schema.is_hashed("undeclared"));
        assert!(!schema.hashes_file_content("output_image"));
        assert!(schema.hashes_file_content("input_image"));
    }
}
