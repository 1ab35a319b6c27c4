//! Gate stage: runs every configured check and applies the severity threshold.

use chrono::Utc;
use futures::FutureExt;
use rollout_config::GatePolicy;
use rollout_core::gate::{CheckReport, Finding, GateCheck, Severity, breaches_threshold};
use rollout_core::pipeline::{FailureKind, Stage, StageOutput, StageResult};
use rollout_core::Result;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Runs gate checks concurrently.
///
/// Findings are reported in check declaration order regardless of which
/// check finishes first.
pub struct GateRunner {
    checks: Vec<Arc<dyn GateCheck>>,
    policy: GatePolicy,
}

impl GateRunner {
    pub fn new(checks: Vec<Arc<dyn GateCheck>>, policy: GatePolicy) -> Self {
        Self { checks, policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check against `revision`.
    pub async fn run_gates(&self, revision: &str) -> StageResult {
        let started_at = Utc::now();

        if self.checks.is_empty() {
            debug!(revision = %revision, "No gate checks configured");
            return StageResult::passed(
                Stage::Gate,
                StageOutput::Findings { findings: Vec::new() },
                started_at,
            );
        }

        let mut set = JoinSet::new();
        for (index, check) in self.checks.iter().enumerate() {
            let check = Arc::clone(check);
            let revision = revision.to_string();
            let limit = self.policy.check_timeout;
            set.spawn(async move {
                let run = AssertUnwindSafe(check.run(&revision)).catch_unwind();
                let outcome = match tokio::time::timeout(limit, run).await {
                    Ok(Ok(result)) => CheckOutcome::Finished(result),
                    Ok(Err(_)) => CheckOutcome::Panicked,
                    Err(_) => CheckOutcome::TimedOut(limit),
                };
                (index, outcome)
            });
        }

        let mut reports: Vec<Option<Vec<Finding>>> = vec![None; self.checks.len()];
        let mut aborted = false;

        while let Some(joined) = set.join_next().await {
            // Tasks never panic (caught above) and are only aborted below.
            let Ok((index, outcome)) = joined else {
                continue;
            };
            let check = &self.checks[index];
            let findings = outcome.into_findings(check.as_ref());

            let critical = findings.iter().any(|f| f.severity == Severity::Critical);
            info!(
                check = check.name(),
                findings = findings.len(),
                critical,
                "Gate check finished"
            );
            reports[index] = Some(findings);

            if critical && self.policy.fail_fast {
                warn!(check = check.name(), "Critical finding, skipping remaining checks");
                set.abort_all();
                aborted = true;
                break;
            }
        }

        let skipped: Vec<&str> = self
            .checks
            .iter()
            .zip(&reports)
            .filter(|(_, report)| report.is_none())
            .map(|(check, _)| check.name())
            .collect();
        let findings: Vec<Finding> = reports.into_iter().flatten().flatten().collect();

        let breached: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.breaches(self.policy.threshold))
            .collect();

        if !breaches_threshold(&findings, self.policy.threshold) {
            return StageResult::passed(Stage::Gate, StageOutput::Findings { findings }, started_at);
        }

        let mut reason = format!(
            "{} finding(s) at or above {}: {}",
            breached.len(),
            self.policy.threshold,
            breached
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        );
        if aborted && !skipped.is_empty() {
            reason.push_str(&format!(" (skipped: {})", skipped.join(", ")));
        }

        StageResult::failed(
            Stage::Gate,
            FailureKind::Gate,
            reason,
            StageOutput::Findings { findings },
            started_at,
        )
    }
}

enum CheckOutcome {
    Finished(Result<CheckReport>),
    Panicked,
    TimedOut(std::time::Duration),
}

impl CheckOutcome {
    fn into_findings(self, check: &dyn GateCheck) -> Vec<Finding> {
        let execution_failed = |detail: String| {
            vec![Finding::new(
                check.category(),
                Severity::Critical,
                format!("{}: check execution failed: {}", check.name(), detail),
            )]
        };

        match self {
            CheckOutcome::Finished(Ok(report)) => {
                if !report.ok && report.findings.is_empty() {
                    vec![Finding::new(
                        check.category(),
                        Severity::High,
                        format!("{}: check reported failure", check.name()),
                    )]
                } else {
                    report.findings
                }
            }
            CheckOutcome::Finished(Err(e)) => execution_failed(e.to_string()),
            CheckOutcome::Panicked => execution_failed("check panicked".to_string()),
            CheckOutcome::TimedOut(limit) => execution_failed(format!("timed out after {limit:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rollout_core::Error;
    use rollout_core::gate::Category;
    use rollout_core::pipeline::StageStatus;
    use std::time::Duration;

    enum Behavior {
        Report(CheckReport),
        Fail(String),
        Hang,
        Panic,
    }

    struct FakeCheck {
        name: &'static str,
        delay: Duration,
        behavior: Behavior,
    }

    impl FakeCheck {
        fn new(name: &'static str, behavior: Behavior) -> Arc<dyn GateCheck> {
            Arc::new(Self {
                name,
                delay: Duration::ZERO,
                behavior,
            })
        }

        fn delayed(name: &'static str, delay: Duration, behavior: Behavior) -> Arc<dyn GateCheck> {
            Arc::new(Self {
                name,
                delay,
                behavior,
            })
        }
    }

    #[async_trait]
    impl GateCheck for FakeCheck {
        fn name(&self) -> &str {
            self.name
        }

        fn category(&self) -> Category {
            Category::Security
        }

        async fn run(&self, _revision: &str) -> Result<CheckReport> {
            tokio::time::sleep(self.delay).await;
            match &self.behavior {
                Behavior::Report(report) => Ok(report.clone()),
                Behavior::Fail(message) => Err(Error::GateFailed(message.clone())),
                Behavior::Hang => std::future::pending().await,
                Behavior::Panic => panic!("check blew up"),
            }
        }
    }

    fn report(findings: Vec<Finding>) -> Behavior {
        Behavior::Report(CheckReport { ok: true, findings })
    }

    fn finding(severity: Severity, message: &str) -> Finding {
        Finding::new(Category::Security, severity, message)
    }

    fn policy(threshold: Severity) -> GatePolicy {
        GatePolicy {
            threshold,
            fail_fast: false,
            check_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_no_checks_passes() {
        let runner = GateRunner::new(Vec::new(), GatePolicy::default());
        let result = runner.run_gates("abc123").await;
        assert!(result.is_passed());
        assert!(result.findings().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_decides_verdict() {
        let checks = || vec![FakeCheck::new("audit", report(vec![finding(Severity::High, "CVE-2024-0001")]))];

        let strict = GateRunner::new(checks(), policy(Severity::High));
        let result = strict.run_gates("abc123").await;
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure.unwrap().kind, FailureKind::Gate);

        let lenient = GateRunner::new(checks(), policy(Severity::Critical));
        let result = lenient.run_gates("abc123").await;
        assert!(result.is_passed());
        assert_eq!(result.findings().len(), 1);
    }

    #[tokio::test]
    async fn test_findings_follow_declaration_order() {
        let checks = vec![
            FakeCheck::delayed("slow", Duration::from_millis(50), report(vec![finding(Severity::Low, "first")])),
            FakeCheck::new("fast", report(vec![finding(Severity::Low, "second")])),
        ];
        let runner = GateRunner::new(checks, policy(Severity::High));

        let result = runner.run_gates("abc123").await;
        let messages: Vec<&str> = result.findings().iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_check_error_is_critical_finding() {
        let checks = vec![FakeCheck::new("lint", Behavior::Fail("exit 127".to_string()))];
        let runner = GateRunner::new(checks, policy(Severity::Critical));

        let result = runner.run_gates("abc123").await;
        assert!(!result.is_passed());
        let findings = result.findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].message.contains("check execution failed"));
    }

    #[tokio::test]
    async fn test_panicking_check_is_critical_finding() {
        let checks = vec![
            FakeCheck::new("boom", Behavior::Panic),
            FakeCheck::new("fine", report(Vec::new())),
        ];
        let runner = GateRunner::new(checks, policy(Severity::Critical));

        let result = runner.run_gates("abc123").await;
        assert!(!result.is_passed());
        assert!(result.findings()[0].message.contains("check panicked"));
    }

    #[tokio::test]
    async fn test_failed_report_without_findings() {
        let checks = vec![FakeCheck::new(
            "tests",
            Behavior::Report(CheckReport {
                ok: false,
                findings: Vec::new(),
            }),
        )];
        let runner = GateRunner::new(checks, policy(Severity::High));

        let result = runner.run_gates("abc123").await;
        assert!(!result.is_passed());
        assert_eq!(result.findings()[0].severity, Severity::High);
        assert_eq!(result.findings()[0].message, "tests: check reported failure");
    }

    #[tokio::test]
    async fn test_hung_check_times_out() {
        let checks = vec![FakeCheck::new("hang", Behavior::Hang)];
        let mut gate_policy = policy(Severity::Critical);
        gate_policy.check_timeout = Duration::from_millis(20);
        let runner = GateRunner::new(checks, gate_policy);

        let result = runner.run_gates("abc123").await;
        assert!(!result.is_passed());
        assert!(result.findings()[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_checks() {
        let checks = vec![
            FakeCheck::new("secrets", report(vec![finding(Severity::Critical, "leaked key")])),
            FakeCheck::new("slow-scan", Behavior::Hang),
        ];
        let runner = GateRunner::new(
            checks,
            GatePolicy {
                threshold: Severity::High,
                fail_fast: true,
                check_timeout: Duration::from_secs(60),
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run_gates("abc123"))
            .await
            .expect("fail-fast gate should not wait for the hung check");
        assert!(!result.is_passed());
        assert_eq!(result.findings().len(), 1);
        assert!(result.failure.unwrap().reason.contains("skipped: slow-scan"));
    }

    #[tokio::test]
    async fn test_below_threshold_findings_are_kept() {
        let checks = vec![FakeCheck::new(
            "style",
            report(vec![finding(Severity::Info, "long line"), finding(Severity::Medium, "unused import")]),
        )];
        let runner = GateRunner::new(checks, policy(Severity::High));

        let result = runner.run_gates("abc123").await;
        assert!(result.is_passed());
        assert_eq!(result.findings().len(), 2);
    }
}
