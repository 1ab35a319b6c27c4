//! Terraform-backed provisioner.
//!
//! A reconcile is `init`, then `plan -detailed-exitcode` into a plan file,
//! then `apply` of exactly that plan. Plan exit code 0 means nothing to do,
//! so an unchanged configuration never reaches apply.

use async_trait::async_trait;
use rollout_core::infra::{DesiredState, Provisioner, ReconcileResult, ResourceFailure, ResourceId};
use rollout_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const PLAN_FILE: &str = "rollout.tfplan";

/// Terraform operation errors.
#[derive(Debug, thiserror::Error)]
pub enum TerraformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("terraform init failed: {0}")]
    InitFailed(String),

    #[error("terraform plan failed: {0}")]
    PlanFailed(String),

    #[error("terraform apply failed: {0}")]
    ApplyFailed(String),
}

impl From<TerraformError> for Error {
    fn from(e: TerraformError) -> Self {
        Error::ProvisionFailed(e.to_string())
    }
}

/// Resource changes a plan intends to make.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PlannedChanges {
    pub has_changes: bool,
    pub resources: Vec<ResourceId>,
}

/// Provisioner that drives the terraform CLI in a working directory.
pub struct TerraformProvisioner {
    working_dir: PathBuf,
    terraform_bin: String,
}

impl TerraformProvisioner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let terraform_bin =
            std::env::var("TERRAFORM_BIN").unwrap_or_else(|_| "terraform".to_string());
        Self::with_binary(working_dir, terraform_bin)
    }

    pub fn with_binary(working_dir: impl Into<PathBuf>, terraform_bin: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            terraform_bin: terraform_bin.into(),
        }
    }

    async fn init(&self) -> std::result::Result<(), TerraformError> {
        info!(dir = %self.working_dir.display(), "Running terraform init");

        let (status, output) = self.run(&["init", "-input=false", "-no-color"]).await?;
        if !status.success() {
            error!(output = %output, "Terraform init failed");
            return Err(TerraformError::InitFailed(output));
        }
        Ok(())
    }

    async fn plan(
        &self,
        variables: &BTreeMap<String, String>,
    ) -> std::result::Result<PlannedChanges, TerraformError> {
        info!(dir = %self.working_dir.display(), "Running terraform plan");

        let mut args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-detailed-exitcode".to_string(),
            format!("-out={PLAN_FILE}"),
        ];
        for (key, value) in variables {
            args.push(format!("-var={key}={value}"));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let (status, output) = self.run(&args).await?;

        // 0 = no changes, 1 = error, 2 = changes present
        match status.code() {
            Some(0) => Ok(PlannedChanges::default()),
            Some(2) => Ok(PlannedChanges {
                has_changes: true,
                resources: parse_planned_resources(&output),
            }),
            _ => {
                error!(output = %output, "Terraform plan failed");
                Err(TerraformError::PlanFailed(output))
            }
        }
    }

    async fn apply(&self) -> std::result::Result<(bool, String), TerraformError> {
        info!(dir = %self.working_dir.display(), "Running terraform apply");
        let (status, output) = self
            .run(&["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE])
            .await?;
        Ok((status.success(), output))
    }

    /// Run terraform, collecting stdout and stderr line by line.
    async fn run(&self, args: &[&str]) -> std::result::Result<(ExitStatus, String), TerraformError> {
        let mut child = Command::new(&self.terraform_bin)
            .args(args)
            .current_dir(&self.working_dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("terraform stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("terraform stderr not captured"))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut output_lines = Vec::new();
        let mut stderr_open = true;

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(line = %line, "terraform");
                            output_lines.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Error reading stdout");
                            break;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => output_lines.push(line),
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(error = %e, "Error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        while stderr_open {
            match stderr_reader.next_line().await {
                Ok(Some(line)) => output_lines.push(line),
                _ => stderr_open = false,
            }
        }

        let status = child.wait().await?;
        Ok((status, output_lines.join("\n")))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    fn name(&self) -> &'static str {
        "terraform"
    }

    async fn reconcile(&self, desired: &DesiredState) -> Result<ReconcileResult> {
        desired.apply_order()?;

        self.init().await?;
        let planned = self.plan(&desired.variables).await?;

        let declared: Vec<ResourceId> = desired.resources.iter().map(|r| r.id.clone()).collect();

        if !planned.has_changes {
            info!("Infrastructure already matches desired state");
            return Ok(ReconcileResult {
                unchanged: declared,
                ..Default::default()
            });
        }

        let (success, output) = self.apply().await?;
        let result = parse_apply_output(&output, &planned.resources, &declared);

        if !success && result.failed.is_empty() {
            error!(output = %output, "Terraform apply failed");
            return Err(TerraformError::ApplyFailed(output).into());
        }

        info!(
            applied = result.applied.len(),
            failed = result.failed.len(),
            "Terraform apply finished"
        );
        Ok(result)
    }
}

/// Addresses from plan lines such as `# aws_ecs_service.app will be created`.
fn parse_planned_resources(output: &str) -> Vec<ResourceId> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("# ")?;
            let (address, action) = rest.split_once(' ')?;
            let changes = ["will be created", "will be updated", "will be destroyed", "must be replaced"];
            changes
                .iter()
                .any(|c| action.contains(c))
                .then(|| ResourceId::new(address))
        })
        .collect()
}

/// Per-resource outcome of an apply.
///
/// Completed resources come from `addr: Creation complete ...` style lines.
/// Errors are attributed through the `with addr,` line terraform prints under
/// each error. Planned resources that neither completed nor failed were
/// skipped because something they depend on failed.
fn parse_apply_output(
    output: &str,
    planned: &[ResourceId],
    declared: &[ResourceId],
) -> ReconcileResult {
    let mut result = ReconcileResult::default();
    let mut last_error: Option<String> = None;

    for line in output.lines() {
        let line = line.trim_start_matches(['│', '╷', '╵', ' ']).trim();

        if let Some(message) = line.strip_prefix("Error: ") {
            last_error = Some(message.to_string());
            continue;
        }

        if let Some(address) = line.strip_prefix("with ").and_then(|l| l.strip_suffix(',')) {
            if let Some(reason) = last_error.take() {
                let id = ResourceId::new(address);
                if !result.failed.iter().any(|f| f.id == id) {
                    result.failed.push(ResourceFailure { id, reason });
                }
            }
            continue;
        }

        let completions = [
            ": Creation complete",
            ": Modifications complete",
            ": Destruction complete",
        ];
        if let Some(address) = completions
            .iter()
            .find_map(|c| line.split_once(c).map(|(addr, _)| addr))
        {
            let id = ResourceId::new(address);
            if !result.applied.contains(&id) {
                result.applied.push(id);
            }
        }
    }

    for id in planned {
        if !result.applied.contains(id) && !result.failed.iter().any(|f| &f.id == id) {
            result.failed.push(ResourceFailure {
                id: id.clone(),
                reason: "not applied (dependency failed)".to_string(),
            });
        }
    }

    result.unchanged = declared
        .iter()
        .filter(|id| !planned.contains(id))
        .cloned()
        .collect();

    result
}
