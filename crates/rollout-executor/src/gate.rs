//! Gate checks executed as shell commands.

use async_trait::async_trait;
use rollout_config::{CheckConfig, CheckFormat, VariableContext};
use rollout_core::gate::{Category, CheckReport, Finding, GateCheck};
use rollout_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::output_tail;

const OUTPUT_TAIL_LINES: usize = 20;

/// Runs a linter, scanner or test suite through `sh -c` in the source
/// checkout and turns its result into a [`CheckReport`].
pub struct CommandCheck {
    config: CheckConfig,
    workdir: PathBuf,
    vars: VariableContext,
}

impl CommandCheck {
    pub fn new(config: CheckConfig, source_dir: &Path, vars: VariableContext) -> Self {
        let workdir = match &config.workdir {
            Some(dir) => source_dir.join(dir),
            None => source_dir.to_path_buf(),
        };
        Self {
            config,
            workdir,
            vars,
        }
    }

    fn command_for(&self, revision: &str) -> String {
        let mut vars = self.vars.clone();
        vars.revision = revision.to_string();
        vars.interpolate(&self.config.command)
    }

    fn exit_code_report(&self, code: Option<i32>, output: &str) -> CheckReport {
        if code == Some(0) {
            return CheckReport::clean();
        }

        let status = code
            .map(|c| format!("exited with status {c}"))
            .unwrap_or_else(|| "was terminated by a signal".to_string());
        let tail = output_tail(output, OUTPUT_TAIL_LINES);
        let message = if tail.is_empty() {
            format!("{} {}", self.config.name, status)
        } else {
            format!("{} {}:\n{}", self.config.name, status, tail)
        };

        CheckReport {
            findings: vec![Finding::new(
                self.config.category,
                self.config.severity,
                message,
            )],
            ok: false,
        }
    }

    fn parse_report(&self, code: Option<i32>, stdout: &str, stderr: &str) -> Result<CheckReport> {
        match serde_json::from_str::<CheckReport>(stdout.trim()) {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(check = %self.config.name, error = %e, "Check produced an unreadable report");
                Err(Error::GateFailed(format!(
                    "{} produced an unreadable report (exit {:?}): {}; {}",
                    self.config.name,
                    code,
                    e,
                    output_tail(stderr, OUTPUT_TAIL_LINES)
                )))
            }
        }
    }
}

#[async_trait]
impl GateCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn category(&self) -> Category {
        self.config.category
    }

    async fn run(&self, revision: &str) -> Result<CheckReport> {
        let command = self.command_for(revision);
        info!(check = %self.config.name, dir = %self.workdir.display(), "Running gate check");
        debug!(check = %self.config.name, command = %command, "Check command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.workdir)
            .env("ROLLOUT_REVISION", revision)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::GateFailed(format!("failed to start {}: {}", self.config.name, e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();

        let report = match self.config.format {
            CheckFormat::ExitCode => {
                self.exit_code_report(code, &format!("{}\n{}", stdout, stderr))
            }
            CheckFormat::Report => self.parse_report(code, &stdout, &stderr)?,
        };

        info!(
            check = %self.config.name,
            ok = report.ok,
            findings = report.findings.len(),
            "Gate check finished"
        );
        Ok(report)
    }
}
