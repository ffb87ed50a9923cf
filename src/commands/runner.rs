/// `ifcache runner` command implementation
///
/// Child side of isolated execution. The exit code carries the outcome; the
/// report file (when requested) carries the details.
use anyhow::Result;
use std::path::Path;

use ifcache::builtin::builtin_registry;
use ifcache::runner::{run_exported, RunnerOptions, RunnerReport, EXIT_ENGINE_ERROR};
use ifcache::store::FilesystemResultStore;

use crate::cli::RunnerArgs;
use crate::commands::Session;

pub async fn run(session: Result<Session>, args: RunnerArgs) -> Result<()> {
    let report_path = args.report.clone();

    let report = match session {
        Ok(session) => tokio::task::spawn_blocking(move || execute(&session, &args))
            .await
            .unwrap_or_else(|e| RunnerReport::EngineError {
                kind: "runner".to_string(),
                message: format!("runner task failed: {}", e),
                retryable: false,
            }),
        Err(e) => config_error(&e),
    };

    finish(&report, report_path.as_deref())
}

fn execute(session: &Session, args: &RunnerArgs) -> RunnerReport {
    let options = match session.config.store_options() {
        Ok(options) => options,
        Err(e) => return config_error(&e),
    };
    let store = match FilesystemResultStore::new(&session.store_dir, options) {
        Ok(store) => store,
        Err(e) => return RunnerReport::engine_error(&e),
    };

    run_exported(
        &args.artifact,
        &store,
        &builtin_registry(),
        &RunnerOptions {
            reservation: args.reservation,
            work_dir: args.work_dir.clone(),
            work_root: session.store_dir.join("work"),
            allow_redundant: args.allow_redundant,
        },
    )
}

fn config_error(err: &anyhow::Error) -> RunnerReport {
    RunnerReport::EngineError {
        kind: "config".to_string(),
        message: format!("{:#}", err),
        retryable: false,
    }
}

fn finish(report: &RunnerReport, report_path: Option<&Path>) -> Result<()> {
    if let Some(path) = report_path {
        if let Err(e) = report.write(path) {
            let unreported = RunnerReport::engine_error(&e);
            eprintln!("{}", serde_json::to_string(&unreported)?);
            std::process::exit(EXIT_ENGINE_ERROR);
        }
    }

    let payload = serde_json::to_string(report)?;
    match report {
        RunnerReport::EngineError { .. } => eprintln!("{}", payload),
        _ => println!("{}", payload),
    }

    std::process::exit(report.exit_code());
}
