//! Pipeline run command.

use anyhow::{Context, Result};
use rollout_core::pipeline::{RunStatus, Trigger, TriggerKind};
use rollout_scheduler::PipelineEvent;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{Stores, load_config, orchestrator};
use crate::output;

/// Run the pipeline for `revision` and print its progress. Ctrl-C requests
/// cancellation instead of killing the run.
pub async fn run(
    config_path: &Path,
    revision: &str,
    trigger_kind: &str,
    database_url: Option<&str>,
) -> Result<RunStatus> {
    let config = load_config(config_path)?;
    let trigger_kind: TriggerKind = trigger_kind.parse()?;
    let trigger = Trigger::new(revision, trigger_kind, config.service.clone());

    println!("Running pipeline: {}", config.name);
    println!("Service: {}", config.service);
    println!("Revision: {revision}");

    let stores = Stores::connect(database_url).await?;
    let orchestrator = orchestrator(config, &stores).await?;
    let mut events = orchestrator.subscribe();

    let handle = orchestrator
        .start(trigger)
        .await
        .context("Failed to start run")?;
    let run_id = handle.id();
    println!("Run: {run_id}\n");

    let join = handle.join();
    tokio::pin!(join);
    let mut cancelling = false;

    let run = loop {
        tokio::select! {
            result = &mut join => break result?,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed run events"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                println!("Cancellation requested, waiting for the run to stop...");
                orchestrator.cancel(run_id)?;
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    println!("\n{}", output::run_report(&run));
    Ok(run.status)
}

fn print_event(event: &PipelineEvent) {
    if let Some(line) = output::event_line(event) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{LOCAL_PIPELINE, write_config};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_pipeline_succeeds() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, LOCAL_PIPELINE);

        let status = run(&path, "abc1234def", "push", None).await.unwrap();

        assert_eq!(status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failing_gate_fails_run() {
        let dir = TempDir::new().unwrap();
        let config = LOCAL_PIPELINE.replace("run \"true\"", "run \"false\"");
        let path = write_config(&dir, &config);

        let status = run(&path, "abc1234def", "manual", None).await.unwrap();

        assert_eq!(status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_trigger_kind_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, LOCAL_PIPELINE);

        assert!(run(&path, "abc1234def", "cron", None).await.is_err());
    }
}
