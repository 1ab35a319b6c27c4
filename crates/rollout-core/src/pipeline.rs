//! Runs, stages and stage results.
//!
//! A [`Run`] is one execution of the fixed deployment pipeline:
//! gate, build, publish, provision, deploy, verify. Its stage results form
//! an append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactRef, BuiltArtifact};
use crate::deployer::{DeployResult, RollbackResult, VerifyResult};
use crate::gate::Finding;
use crate::infra::ReconcileResult;
use crate::{Error, Result, RunId};

/// What requested a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Manual,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Push => write!(f, "push"),
            TriggerKind::PullRequest => write!(f, "pull_request"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pr" => Ok(TriggerKind::PullRequest),
            "manual" => Ok(TriggerKind::Manual),
            other => Err(Error::InvalidInput(format!("unknown trigger kind: {other}"))),
        }
    }
}

/// An externally delivered "pipeline run requested" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub revision_id: String,
    pub trigger_kind: TriggerKind,
    pub target_service: String,
}

impl Trigger {
    pub fn new(
        revision_id: impl Into<String>,
        trigger_kind: TriggerKind,
        target_service: impl Into<String>,
    ) -> Self {
        Self {
            revision_id: revision_id.into(),
            trigger_kind,
            target_service: target_service.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.revision_id.trim().is_empty() {
            return Err(Error::InvalidInput("revisionId must not be empty".to_string()));
        }
        if self.target_service.trim().is_empty() {
            return Err(Error::InvalidInput(
                "targetService must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A pipeline stage. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Gate,
    Build,
    Publish,
    Provision,
    Deploy,
    Verify,
    /// Recorded only when a rollback was attempted.
    Rollback,
}

impl Stage {
    /// The forward pipeline, in execution order.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Gate,
        Stage::Build,
        Stage::Publish,
        Stage::Provision,
        Stage::Deploy,
        Stage::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Gate => "gate",
            Stage::Build => "build",
            Stage::Publish => "publish",
            Stage::Provision => "provision",
            Stage::Deploy => "deploy",
            Stage::Verify => "verify",
            Stage::Rollback => "rollback",
        }
    }

    /// Cancellation aborts these stages outright. Later stages either run
    /// to completion or turn the cancel into a rollback.
    pub fn is_abortable(&self) -> bool {
        matches!(self, Stage::Gate | Stage::Build)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gate" => Ok(Stage::Gate),
            "build" => Ok(Stage::Build),
            "publish" => Ok(Stage::Publish),
            "provision" => Ok(Stage::Provision),
            "deploy" => Ok(Stage::Deploy),
            "verify" => Ok(Stage::Verify),
            "rollback" => Ok(Stage::Rollback),
            other => Err(Error::InvalidInput(format!("unknown stage: {other}"))),
        }
    }
}

/// Status of a finished stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Passed => write!(f, "passed"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Quality/security threshold breached. Fixed in source, never retried.
    Gate,
    /// Artifact construction error.
    Build,
    /// Registry push failed after bounded retries.
    Publish,
    /// Infrastructure apply failed for one or more resources.
    Provision,
    /// Platform rejected the update. Nothing new went live.
    Deploy,
    /// New instances unhealthy or not stable in time. Triggers rollback.
    Verify,
    /// Rollback itself failed. Needs an operator.
    Rollback,
    Cancelled,
}

impl FailureKind {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Gate => FailureKind::Gate,
            Stage::Build => FailureKind::Build,
            Stage::Publish => FailureKind::Publish,
            Stage::Provision => FailureKind::Provision,
            Stage::Deploy => FailureKind::Deploy,
            Stage::Verify => FailureKind::Verify,
            Stage::Rollback => FailureKind::Rollback,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Gate => "gate failure",
            FailureKind::Build => "build failure",
            FailureKind::Publish => "publish failure",
            FailureKind::Provision => "provision failure",
            FailureKind::Deploy => "deploy failure",
            FailureKind::Verify => "verify failure",
            FailureKind::Rollback => "rollback failure",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// Structured output of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutput {
    None,
    Findings { findings: Vec<Finding> },
    Built { artifact: BuiltArtifact },
    Published { artifact: ArtifactRef },
    Reconciled { result: ReconcileResult },
    Deployed { result: DeployResult },
    Verified { result: VerifyResult },
    RolledBack { result: RollbackResult },
}

/// Outcome of one stage of a run. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub output: StageOutput,
    pub failure: Option<StageFailure>,
    /// How many times the stage's external call was attempted.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn passed(stage: Stage, output: StageOutput, started_at: DateTime<Utc>) -> Self {
        Self {
            stage,
            status: StageStatus::Passed,
            output,
            failure: None,
            attempts: 1,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        stage: Stage,
        kind: FailureKind,
        reason: impl Into<String>,
        output: StageOutput,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            output,
            failure: Some(StageFailure {
                kind,
                reason: reason.into(),
            }),
            attempts: 1,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(stage: Stage, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stage,
            status: StageStatus::Skipped,
            output: StageOutput::None,
            failure: Some(StageFailure {
                kind: FailureKind::Cancelled,
                reason: reason.into(),
            }),
            attempts: 0,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_passed(&self) -> bool {
        self.status == StageStatus::Passed
    }

    pub fn findings(&self) -> &[Finding] {
        match &self.output {
            StageOutput::Findings { findings } => findings,
            _ => &[],
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::RolledBack | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::RolledBack => write!(f, "rolled_back"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "rolled_back" => Ok(RunStatus::RolledBack),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown run status: {other}"))),
        }
    }
}

/// One execution of the pipeline for a single trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub trigger: Trigger,
    pub status: RunStatus,
    /// Stage currently executing, or the last stage entered once terminal.
    pub stage: Option<Stage>,
    pub stages: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            id: RunId::new(),
            trigger,
            status: RunStatus::Pending,
            stage: None,
            stages: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.trigger.target_service
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the run as started.
    pub fn start(&mut self) -> Result<()> {
        if self.status != RunStatus::Pending {
            return Err(Error::Internal(format!(
                "run {} cannot start from status {}",
                self.id, self.status
            )));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Enter a stage. Forward stages must be entered in pipeline order, each
    /// only after its predecessor passed.
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        self.ensure_open()?;
        if stage != Stage::Rollback {
            let expected = Stage::PIPELINE.get(self.stages.len()).copied();
            let predecessor_passed = self.stages.last().is_none_or(|r| r.is_passed());
            if expected != Some(stage) || !predecessor_passed {
                return Err(Error::Internal(format!(
                    "run {} cannot enter stage {} after {} recorded stages",
                    self.id,
                    stage,
                    self.stages.len()
                )));
            }
        }
        self.stage = Some(stage);
        Ok(())
    }

    /// Append the result of the current stage.
    pub fn record(&mut self, result: StageResult) -> Result<()> {
        self.ensure_open()?;
        if self.stage != Some(result.stage) {
            return Err(Error::Internal(format!(
                "run {} recorded {} while in stage {:?}",
                self.id, result.stage, self.stage
            )));
        }
        if self.stages.iter().any(|r| r.stage == result.stage) {
            return Err(Error::Internal(format!(
                "run {} already has a result for stage {}",
                self.id, result.stage
            )));
        }
        self.stages.push(result);
        Ok(())
    }

    /// Move to a terminal status. A terminal run is immutable.
    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "run {} cannot finish with non-terminal status {}",
                self.id, status
            )));
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// First failed stage, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|r| r.status == StageStatus::Failed)
    }

    /// Artifact published by this run, if it got that far.
    pub fn published_artifact(&self) -> Option<&ArtifactRef> {
        self.stages.iter().find_map(|r| match &r.output {
            StageOutput::Published { artifact } => Some(artifact),
            _ => None,
        })
    }

    /// All gate findings of this run.
    pub fn findings(&self) -> &[Finding] {
        self.result(Stage::Gate)
            .map(|r| r.findings())
            .unwrap_or(&[])
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::Internal(format!(
                "run {} is terminal ({}) and cannot change",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Category, Severity};

    fn trigger() -> Trigger {
        Trigger::new("r1", TriggerKind::Push, "svc1")
    }

    fn pass(run: &mut Run, stage: Stage) {
        run.enter(stage).unwrap();
        run.record(StageResult::passed(stage, StageOutput::None, Utc::now()))
            .unwrap();
    }

    #[test]
    fn test_trigger_uses_wire_field_names() {
        let json = r#"{"revisionId":"abc123","triggerKind":"pull_request","targetService":"rates"}"#;
        let trigger: Trigger = serde_json::from_str(json).unwrap();
        assert_eq!(trigger.revision_id, "abc123");
        assert_eq!(trigger.trigger_kind, TriggerKind::PullRequest);
        assert_eq!(trigger.target_service, "rates");
    }

    #[test]
    fn test_empty_revision_is_invalid() {
        let trigger = Trigger::new(" ", TriggerKind::Manual, "svc");
        assert!(matches!(trigger.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_stages_must_follow_pipeline_order() {
        let mut run = Run::new(trigger());
        run.start().unwrap();
        pass(&mut run, Stage::Gate);

        assert!(run.enter(Stage::Publish).is_err());
        assert!(run.enter(Stage::Build).is_ok());
    }

    #[test]
    fn test_no_stage_after_a_failure() {
        let mut run = Run::new(trigger());
        run.start().unwrap();
        run.enter(Stage::Gate).unwrap();
        run.record(StageResult::failed(
            Stage::Gate,
            FailureKind::Gate,
            "threshold breached",
            StageOutput::None,
            Utc::now(),
        ))
        .unwrap();

        assert!(run.enter(Stage::Build).is_err());
        assert_eq!(run.failed_stage().unwrap().stage, Stage::Gate);
    }

    #[test]
    fn test_rollback_may_follow_failed_verify() {
        let mut run = Run::new(trigger());
        run.start().unwrap();
        for stage in &Stage::PIPELINE[..5] {
            pass(&mut run, *stage);
        }
        run.enter(Stage::Verify).unwrap();
        run.record(StageResult::failed(
            Stage::Verify,
            FailureKind::Verify,
            "timed out",
            StageOutput::None,
            Utc::now(),
        ))
        .unwrap();

        assert!(run.enter(Stage::Rollback).is_ok());
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let mut run = Run::new(trigger());
        run.start().unwrap();
        run.finish(RunStatus::Cancelled).unwrap();

        assert!(run.enter(Stage::Gate).is_err());
        assert!(run.finish(RunStatus::Failed).is_err());
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn test_results_cannot_be_overwritten() {
        let mut run = Run::new(trigger());
        run.start().unwrap();
        pass(&mut run, Stage::Gate);

        let again = StageResult::passed(Stage::Gate, StageOutput::None, Utc::now());
        assert!(run.record(again).is_err());
        assert_eq!(run.stages.len(), 1);
    }

    #[test]
    fn test_exposes_gate_findings() {
        let mut run = Run::new(trigger());
        run.start().unwrap();
        run.enter(Stage::Gate).unwrap();
        let findings = vec![Finding::new(Category::Style, Severity::Low, "line too long")];
        run.record(StageResult::passed(
            Stage::Gate,
            StageOutput::Findings { findings },
            Utc::now(),
        ))
        .unwrap();

        assert_eq!(run.findings().len(), 1);
    }
}
