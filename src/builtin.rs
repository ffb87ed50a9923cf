//! Reference interfaces shipped with the runner binary
//!
//! Small, deterministic computations used by the `ifcache` command line and
//! the test-suite. They exercise every engine path: file inputs and outputs,
//! failures, panics, long runs and hard crashes.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Component;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::unit::{
    ExecutionContext, FieldSpec, ImplementationRegistry, InputSchema, Inputs, Interface, Outputs,
    Value,
};

/// Gaussian-style smoothing stand-in: writes a smoothed copy of `image`
pub struct Smooth;

impl Interface for Smooth {
    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .field("sigma", FieldSpec::new().mandatory())
            .field("image", FieldSpec::new().mandatory())
            .field("out_file", FieldSpec::new().path_only())
            .field("num_threads", FieldSpec::new().nohash())
    }

    fn execute(&self, inputs: &Inputs, ctx: &ExecutionContext) -> Result<Outputs> {
        let sigma = inputs
            .get("sigma")
            .and_then(Value::as_f64)
            .context("sigma must be a number")?;
        if sigma <= 0.0 {
            bail!("sigma must be positive, got {}", sigma);
        }

        let image = inputs
            .get("image")
            .and_then(Value::as_path)
            .context("image must be a file")?;
        let voxels = fs::read(image)
            .with_context(|| format!("Failed to read image: {}", image.display()))?;

        let out_name = inputs
            .get("out_file")
            .and_then(Value::as_path)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| "out.nii".into());
        if !out_name
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!(
                "out_file must stay inside the working directory: {}",
                out_name.display()
            );
        }
        let out = ctx.output_path(&out_name);

        let mut smoothed = format!("smoothed sigma={:.3}\n", sigma).into_bytes();
        smoothed.extend_from_slice(&voxels);
        fs::write(&out, smoothed)
            .with_context(|| format!("Failed to write output: {}", out.display()))?;

        Ok(Outputs::new().with("smoothed", Value::File(out)))
    }
}

/// Returns its message
pub struct Echo;

impl Interface for Echo {
    fn schema(&self) -> InputSchema {
        InputSchema::new().field("message", FieldSpec::new().mandatory())
    }

    fn execute(&self, inputs: &Inputs, _ctx: &ExecutionContext) -> Result<Outputs> {
        let message = inputs.get("message").cloned().unwrap_or(Value::Str(String::new()));
        Ok(Outputs::new().with("message", message))
    }
}

/// Always fails; panics instead when `panic` is true
pub struct Fail;

impl Interface for Fail {
    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .field("message", FieldSpec::new())
            .field("panic", FieldSpec::new())
    }

    fn execute(&self, inputs: &Inputs, _ctx: &ExecutionContext) -> Result<Outputs> {
        let message = inputs
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        if inputs.get("panic").and_then(Value::as_bool).unwrap_or(false) {
            panic!("{}", message);
        }
        bail!("{}", message)
    }
}

/// Sleeps for `seconds`
pub struct Sleep;

impl Interface for Sleep {
    fn schema(&self) -> InputSchema {
        InputSchema::new()
            .field("seconds", FieldSpec::new().mandatory())
            .field("tag", FieldSpec::new())
    }

    fn execute(&self, inputs: &Inputs, _ctx: &ExecutionContext) -> Result<Outputs> {
        let seconds = inputs
            .get("seconds")
            .and_then(Value::as_f64)
            .context("seconds must be a number")?;
        thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
        Ok(Outputs::new().with("slept", seconds))
    }
}

/// Aborts the process without unwinding
pub struct Abort;

impl Interface for Abort {
    fn execute(&self, _inputs: &Inputs, _ctx: &ExecutionContext) -> Result<Outputs> {
        std::process::abort()
    }
}

/// Registry with every reference interface at version 1
pub fn builtin_registry() -> ImplementationRegistry {
    ImplementationRegistry::new()
        .with("smooth", "1", Arc::new(Smooth))
        .with("echo", "1", Arc::new(Echo))
        .with("fail", "1", Arc::new(Fail))
        .with("sleep", "1", Arc::new(Sleep))
        .with("abort", "1", Arc::new(Abort))
}
