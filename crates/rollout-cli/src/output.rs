//! Human-readable rendering of runs, events and configuration.

use chrono::{DateTime, Utc};
use rollout_config::{PipelineConfig, PlatformKind};
use rollout_core::pipeline::{Run, RunStatus, StageOutput, StageResult, StageStatus};
use rollout_core::store::DeploymentRecord;
use rollout_scheduler::PipelineEvent;
use std::fmt::Write;

/// Process exit code for a finished run. A rollback restored service but
/// the release still did not ship, so it gets its own code.
pub fn exit_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Succeeded => 0,
        RunStatus::RolledBack => 2,
        _ => 1,
    }
}

fn status_symbol(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Passed => "✓",
        StageStatus::Failed => "✗",
        StageStatus::Skipped => "⊘",
    }
}

fn elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let millis = (end - start).num_milliseconds().max(0);
    format!("{:.1}s", millis as f64 / 1000.0)
}

/// Progress line for a pipeline event. Run-level events are reported by
/// the caller and yield nothing.
pub fn event_line(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::StageStarted { stage, .. } => Some(format!("▶ {stage}")),
        PipelineEvent::StageCompleted { stage, status, .. } => {
            Some(format!("{} {stage} {status}", status_symbol(*status)))
        }
        PipelineEvent::RunStarted { .. } | PipelineEvent::RunCompleted { .. } => None,
    }
}

/// One-line summary used by `runs list`.
pub fn run_line(run: &Run) -> String {
    let stage = run.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<12} {:<10} {:<14} {}",
        run.id,
        run.status,
        stage,
        run.trigger.trigger_kind,
        run.trigger.revision_id
    )
}

fn stage_line(result: &StageResult) -> String {
    let mut line = format!(
        "  {} {:<10} {:<8} {}",
        status_symbol(result.status),
        result.stage,
        result.status,
        elapsed(result.started_at, result.finished_at)
    );
    if result.attempts > 1 {
        let _ = write!(line, " ({} attempts)", result.attempts);
    }
    if let Some(failure) = &result.failure {
        let _ = write!(line, "\n      {}: {}", failure.kind, failure.reason);
    }
    line
}

/// Full report of a run: stages, findings and what was shipped.
pub fn run_report(run: &Run) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run {}", run.id);
    let _ = writeln!(
        out,
        "Service: {}  Revision: {}  Trigger: {}",
        run.service(),
        run.trigger.revision_id,
        run.trigger.trigger_kind
    );
    let _ = writeln!(out, "Status: {}", run.status);
    if let (Some(started), Some(finished)) = (run.started_at, run.finished_at) {
        let _ = writeln!(out, "Duration: {}", elapsed(started, finished));
    }

    if !run.stages.is_empty() {
        let _ = writeln!(out, "\nStages:");
        for result in &run.stages {
            let _ = writeln!(out, "{}", stage_line(result));
        }
    }

    let findings: Vec<_> = run.stages.iter().flat_map(|r| r.findings()).collect();
    if !findings.is_empty() {
        let _ = writeln!(out, "\nFindings:");
        for finding in findings {
            let _ = writeln!(out, "  {finding}");
        }
    }

    for result in &run.stages {
        match &result.output {
            StageOutput::Published { artifact } if result.is_passed() => {
                let _ = writeln!(out, "\nArtifact: {artifact}");
            }
            StageOutput::RolledBack { result } => {
                let _ = writeln!(out, "\nRestored: {}", result.restored);
            }
            _ => {}
        }
    }

    out.trim_end().to_string()
}

pub fn deployment_record(record: &DeploymentRecord) -> String {
    let mut out = format!(
        "Service: {}\nArtifact: {}\nPinned: {}\nRecorded: {}",
        record.service,
        record.artifact,
        record.artifact.pinned(),
        record.updated_at.to_rfc3339()
    );
    if let Some(run_id) = record.run_id {
        let _ = write!(out, "\nRun: {run_id}");
    }
    out
}

pub fn config_summary(config: &PipelineConfig) -> String {
    let gates = &config.gates;
    let platform = match config.deploy.platform {
        PlatformKind::Kubernetes => format!("kubernetes (namespace {})", config.deploy.namespace),
        PlatformKind::Memory => "memory".to_string(),
    };

    let mut out = String::new();
    let _ = writeln!(out, "  Pipeline: {}", config.name);
    let _ = writeln!(out, "  Service: {}", config.service);
    let _ = writeln!(out, "  Source: {}", config.source_dir.display());
    let _ = writeln!(
        out,
        "  Gates: {} check(s), threshold {}{}",
        gates.checks.len(),
        gates.policy.threshold,
        if gates.policy.fail_fast { ", fail-fast" } else { "" }
    );
    for check in &gates.checks {
        let _ = writeln!(out, "    - {} [{}]: {}", check.name, check.category, check.command);
    }
    let _ = writeln!(out, "  Build: {:?}", config.build.backend);
    let _ = writeln!(
        out,
        "  Registry: {:?} {} ({} attempts)",
        config.registry.backend, config.registry.repository, config.registry.retry.max_attempts
    );
    let _ = writeln!(
        out,
        "  Infrastructure: {:?} ({} resources)",
        config.infrastructure.backend,
        config.infrastructure.desired.resources.len()
    );
    let _ = writeln!(out, "  Deploy: {platform}");
    let _ = write!(
        out,
        "  Verify: every {:?}, stable for {:?}, within {:?}",
        config.verify.interval, config.verify.window, config.verify.timeout
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_config::parse_pipeline_config;
    use rollout_core::RunId;
    use rollout_core::gate::{Category, Finding, Severity};
    use rollout_core::pipeline::{FailureKind, Stage, Trigger, TriggerKind};

    fn run_with(stages: Vec<StageResult>, status: RunStatus) -> Run {
        let mut run = Run::new(Trigger::new("abc1234", TriggerKind::Push, "rates"));
        run.stages = stages;
        run.stage = run.stages.last().map(|r| r.stage);
        run.status = status;
        run
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(RunStatus::Succeeded), 0);
        assert_eq!(exit_code(RunStatus::Failed), 1);
        assert_eq!(exit_code(RunStatus::Cancelled), 1);
        assert_eq!(exit_code(RunStatus::RolledBack), 2);
    }

    #[test]
    fn test_event_lines() {
        let run_id = RunId::new();
        let started = PipelineEvent::StageStarted {
            run_id,
            stage: Stage::Build,
        };
        let failed = PipelineEvent::StageCompleted {
            run_id,
            stage: Stage::Verify,
            status: StageStatus::Failed,
        };
        let done = PipelineEvent::RunCompleted {
            run_id,
            status: RunStatus::Succeeded,
        };

        assert_eq!(event_line(&started).as_deref(), Some("▶ build"));
        assert_eq!(event_line(&failed).as_deref(), Some("✗ verify failed"));
        assert!(event_line(&done).is_none());
    }

    #[test]
    fn test_report_lists_failure_and_findings() {
        let now = Utc::now();
        let findings = vec![
            Finding::new(Category::Security, Severity::Critical, "hardcoded password").at("app.py:12"),
        ];
        let gate = StageResult::failed(
            Stage::Gate,
            FailureKind::Gate,
            "1 finding(s) at or above high",
            StageOutput::Findings { findings },
            now,
        );
        let run = run_with(vec![gate], RunStatus::Failed);

        let report = run_report(&run);

        assert!(report.contains("Status: failed"));
        assert!(report.contains("✗ gate"));
        assert!(report.contains("gate failure: 1 finding(s) at or above high"));
        assert!(report.contains("[critical/security] hardcoded password (app.py:12)"));
    }

    #[test]
    fn test_report_shows_retries_and_skips() {
        let now = Utc::now();
        let publish = StageResult::passed(Stage::Publish, StageOutput::None, now).with_attempts(3);
        let verify = StageResult::skipped(Stage::Verify, "cancelled");
        let run = run_with(vec![publish, verify], RunStatus::RolledBack);

        let report = run_report(&run);

        assert!(report.contains("(3 attempts)"));
        assert!(report.contains("⊘ verify"));
        assert!(report.contains("Status: rolled_back"));
    }

    #[test]
    fn test_config_summary_names_checks() {
        let config = parse_pipeline_config(
            r#"
pipeline "rates" {
    service "rates"
}
gates threshold="critical" fail-fast=#false {
    check "lint" category="style" { run "flake8 ." }
}
"#,
        )
        .unwrap();

        let summary = config_summary(&config);

        assert!(summary.contains("Gates: 1 check(s), threshold critical\n"));
        assert!(summary.contains("- lint [style]: flake8 ."));
        assert!(summary.contains("Registry: Memory local/rates (3 attempts)"));
    }
}
