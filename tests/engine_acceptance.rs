/// Acceptance tests for the caching engine used as a library
///
/// These drive the fingerprinter, result store, exporter and cache-aware
/// executor together against a real on-disk store.
mod common;

use common::{Counting, TestWorkspace};
use ifcache::builtin::builtin_registry;
use ifcache::store::{BeginOptions, EntryStatus, ResultStore, StoreOptions};
use ifcache::{
    run_exported, CacheAwareExecutor, EngineError, FailureKind, FilesystemResultStore,
    Fingerprinter, Inputs, OnRunning, RunOptions, RunnerOptions, RunnerReport, StateExporter,
    Value,
};
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn wait_quickly() -> OnRunning {
    OnRunning::Wait {
        poll_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(30),
    }
}

fn builtin_executor(ws: &TestWorkspace) -> CacheAwareExecutor<FilesystemResultStore> {
    CacheAwareExecutor::new(
        Arc::new(ws.store()),
        Arc::new(builtin_registry()),
        &ws.store_dir(),
    )
}

#[test]
fn test_smooth_scenario() {
    let ws = TestWorkspace::new();
    let image = ws.create_file("image.nii", "abc123");

    let executor = builtin_executor(&ws);
    let unit = executor
        .unit(
            "smooth",
            Inputs::new().with("sigma", 2.0).with("image", Value::File(image)),
        )
        .unwrap();

    let first = executor.run_with(&unit, RunOptions::default()).unwrap();
    assert!(!first.cache_hit);
    assert_eq!(first.outputs.get("smoothed"), Some(&Value::file("out.nii")));

    let fingerprint = first.fingerprint.clone().unwrap();
    let entry = executor.store().entry(&fingerprint).unwrap().unwrap();
    assert_eq!(entry.status(), EntryStatus::Success);
    assert_eq!(entry.outputs(), Some(&first.outputs));

    // A fresh executor over the same store stands in for another process
    let other = builtin_executor(&ws);
    let second = other.run_with(&unit, RunOptions::default()).unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.outputs, first.outputs);
    let smoothed = second.resolved_outputs();
    let written = fs::read_to_string(smoothed.get("smoothed").and_then(Value::as_path).unwrap())
        .unwrap();
    assert!(written.starts_with("smoothed sigma=2.000"));

    let changed = other
        .unit(
            "smooth",
            unit.inputs().clone().with("sigma", 3.0),
        )
        .unwrap();
    let third = other.run_with(&changed, RunOptions::default()).unwrap();
    assert!(!third.cache_hit);
    assert_ne!(third.fingerprint, first.fingerprint);
}

#[test]
fn test_identical_content_at_another_path_is_a_hit() {
    let ws = TestWorkspace::new();
    let a = ws.create_file("a/image.nii", "abc123");
    let b = ws.create_file("b/copy.nii", "abc123");

    let executor = builtin_executor(&ws);
    let first = executor
        .unit("smooth", Inputs::new().with("sigma", 2.0).with("image", Value::File(a)))
        .unwrap();
    let second = executor
        .unit("smooth", Inputs::new().with("sigma", 2.0).with("image", Value::File(b)))
        .unwrap();

    assert!(!executor.run_with(&first, RunOptions::default()).unwrap().cache_hit);
    assert!(executor.run_with(&second, RunOptions::default()).unwrap().cache_hit);
}

#[test]
fn test_nohash_inputs_do_not_change_the_fingerprint() {
    let ws = TestWorkspace::new();
    let image = ws.create_file("image.nii", "abc123");
    let registry = builtin_registry();
    let fingerprinter = Fingerprinter::default();

    let base = Inputs::new().with("sigma", 2.0).with("image", Value::File(image));
    let one = registry.instantiate("smooth", base.clone().with("num_threads", 1)).unwrap();
    let eight = registry.instantiate("smooth", base.with("num_threads", 8)).unwrap();

    assert_eq!(
        fingerprinter.fingerprint(&one).unwrap(),
        fingerprinter.fingerprint(&eight).unwrap()
    );
}

#[test]
fn test_concurrent_callers_execute_once() {
    let ws = TestWorkspace::new();
    let (registry, calls) = Counting::registry(Duration::from_millis(300));
    let registry = Arc::new(registry);
    let unit = registry.instantiate("count", Inputs::new().with("x", 21)).unwrap();

    // One executor and store handle per caller, as separate processes would have
    let outputs: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = CacheAwareExecutor::new(
                    Arc::new(ws.store()),
                    Arc::clone(&registry),
                    &ws.store_dir(),
                )
                .with_on_running(wait_quickly());
                let unit = unit.clone();
                scope.spawn(move || executor.run(&unit, true).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for output in &outputs {
        assert_eq!(output.get("doubled"), Some(&Value::Int(42)));
    }
}

#[test]
fn test_stale_reservation_is_recovered() {
    let ws = TestWorkspace::new();
    let options = StoreOptions {
        stale_after: Duration::from_millis(200),
        immutable_success: false,
    };
    let (registry, calls) = Counting::registry(Duration::ZERO);
    let executor = CacheAwareExecutor::new(
        Arc::new(ws.store_with(options)),
        Arc::new(registry),
        &ws.store_dir(),
    )
    .with_on_running(wait_quickly());
    let unit = executor.unit("count", Inputs::new().with("x", 1)).unwrap();
    let fingerprint = executor.fingerprinter().fingerprint(&unit).unwrap();

    // A worker that reserved and then died without a heartbeat
    let crashed = ws.store_with(options);
    crashed
        .begin(&fingerprint, unit.implementation(), BeginOptions::default())
        .unwrap();
    assert!(crashed
        .begin(&fingerprint, unit.implementation(), BeginOptions::default())
        .unwrap_err()
        .is_retryable());

    let outcome = executor.run_with(&unit, RunOptions::default()).unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        executor.store().entry(&fingerprint).unwrap().unwrap().status(),
        EntryStatus::Success
    );
}

#[test]
fn test_panics_are_recorded_and_replayed() {
    let ws = TestWorkspace::new();
    let executor = builtin_executor(&ws);
    let unit = executor
        .unit("fail", Inputs::new().with("message", "kaboom").with("panic", true))
        .unwrap();

    let first = executor.run(&unit, true).unwrap_err();
    let EngineError::ExecutionFailed(recorded) = first else {
        panic!("expected a recorded failure");
    };
    assert_eq!(recorded.kind, FailureKind::Panic);
    assert_eq!(recorded.message, "kaboom");

    let replayed = executor.run(&unit, true).unwrap_err();
    let EngineError::ExecutionFailed(replayed) = replayed else {
        panic!("expected a replayed failure");
    };
    assert_eq!(replayed, recorded);
}

#[test]
fn test_force_rewrites_a_success() {
    let ws = TestWorkspace::new();
    let executor = builtin_executor(&ws);
    let unit = executor.unit("echo", Inputs::new().with("message", "hi")).unwrap();

    let first = executor.run_with(&unit, RunOptions::default()).unwrap();
    let fingerprint = first.fingerprint.unwrap();
    let created = executor.store().entry(&fingerprint).unwrap().unwrap().created_at;

    thread::sleep(Duration::from_millis(10));
    let forced = executor
        .run_with(
            &unit,
            RunOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!forced.cache_hit);
    assert!(executor.store().entry(&fingerprint).unwrap().unwrap().created_at > created);
}

#[test]
fn test_exported_state_round_trip() {
    let ws = TestWorkspace::new();
    let image = ws.create_file("image.nii", "abc123");
    let artifact = ws.export(
        "smooth.json",
        "smooth",
        Inputs::new()
            .with("sigma", 2.0)
            .with("image", Value::File(image))
            .with("num_threads", 4),
    );

    let registry = builtin_registry();
    let exporter = StateExporter::default();
    let exported = exporter.read(&artifact).unwrap();
    let unit = exporter.import(&exported, &registry).unwrap();
    assert_eq!(exporter.verify(&exported, &unit).unwrap(), exported.fingerprint);
    assert_eq!(unit.inputs().get("num_threads"), Some(&Value::Int(4)));

    // Executing the artifact elsewhere makes the original a cache hit
    let store = ws.store();
    let report = run_exported(
        &artifact,
        &store,
        &registry,
        &RunnerOptions {
            work_root: ws.store_dir().join("work"),
            ..Default::default()
        },
    );
    assert!(matches!(report, RunnerReport::Success { .. }));

    let executor = builtin_executor(&ws);
    assert!(executor.run_with(&unit, RunOptions::default()).unwrap().cache_hit);
}

#[test]
fn test_tampered_artifact_fails_integrity() {
    let ws = TestWorkspace::new();
    let artifact = ws.export("echo.json", "echo", Inputs::new().with("message", "original"));

    let content = fs::read_to_string(&artifact).unwrap();
    fs::write(&artifact, content.replace("original", "tampered")).unwrap();

    let exporter = StateExporter::default();
    let exported = exporter.read(&artifact).unwrap();
    let unit = exporter.import(&exported, &builtin_registry()).unwrap();
    let err = exporter.verify(&exported, &unit).unwrap_err();
    assert_eq!(err.kind(), "integrity");
}

#[test]
fn test_non_finite_outputs_are_cached() {
    let ws = TestWorkspace::new();
    let (registry, calls) = Counting::registry(Duration::ZERO);
    let executor = CacheAwareExecutor::new(Arc::new(ws.store()), Arc::new(registry), &ws.store_dir());
    let unit = executor.unit("count", Inputs::new().with("x", 0)).unwrap();

    let first = executor.run_with(&unit, RunOptions::default()).unwrap();
    let second = executor.run_with(&unit, RunOptions::default()).unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.outputs.get("inverse"), Some(&Value::Float(f64::INFINITY)));
}

#[test]
fn test_non_finite_inputs_survive_export() {
    let ws = TestWorkspace::new();
    let artifact = ws.export("nan.json", "echo", Inputs::new().with("message", f64::NAN));

    let registry = builtin_registry();
    let exporter = StateExporter::default();
    let exported = exporter.read(&artifact).unwrap();
    let unit = exporter.import(&exported, &registry).unwrap();
    assert_eq!(exporter.verify(&exported, &unit).unwrap(), exported.fingerprint);

    let report = run_exported(
        &artifact,
        &ws.store(),
        &registry,
        &RunnerOptions {
            work_root: ws.store_dir().join("work"),
            ..Default::default()
        },
    );
    let RunnerReport::Success { outputs, .. } = report else {
        panic!("expected a successful run");
    };
    assert!(outputs.get("message").and_then(Value::as_f64).unwrap().is_nan());
}
