//! Quality and security gate types.
//!
//! Gate checks (linters, security scanners, dependency audits, test suites)
//! report findings. The gate stage fails when any finding reaches the
//! configured severity threshold.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Severity of a finding, ordered from least to most severe.
/// The default is the default gate threshold.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::InvalidInput(format!("unknown severity: {other}"))),
        }
    }
}

/// What kind of check produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Style,
    Security,
    Dependency,
    Test,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Style => write!(f, "style"),
            Category::Security => write!(f, "security"),
            Category::Dependency => write!(f, "dependency"),
            Category::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "style" => Ok(Category::Style),
            "security" => Ok(Category::Security),
            "dependency" => Ok(Category::Dependency),
            "test" => Ok(Category::Test),
            other => Err(Error::InvalidInput(format!("unknown category: {other}"))),
        }
    }
}

/// A single issue reported by a gate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Finding {
    pub fn new(category: Category, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn breaches(&self, threshold: Severity) -> bool {
        self.severity >= threshold
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.severity, self.category, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}

/// Whether any finding reaches the threshold.
pub fn breaches_threshold(findings: &[Finding], threshold: Severity) -> bool {
    findings.iter().any(|f| f.breaches(threshold))
}

/// Output of a single gate tool: its findings and its own verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub ok: bool,
}

impl CheckReport {
    pub fn clean() -> Self {
        Self {
            findings: Vec::new(),
            ok: true,
        }
    }
}

/// A quality or security check run against a source revision.
///
/// Checks are treated as pure functions of the revision and must be safe to
/// run concurrently with each other.
#[async_trait]
pub trait GateCheck: Send + Sync {
    /// Name of this check (e.g., "flake8").
    fn name(&self) -> &str;

    /// Category assigned to findings this check synthesizes.
    fn category(&self) -> Category;

    /// Run the check against a revision.
    async fn run(&self, revision: &str) -> Result<CheckReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severities_are_ordered() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let findings = vec![Finding::new(Category::Security, Severity::High, "weak hash")];
        assert!(breaches_threshold(&findings, Severity::High));
        assert!(!breaches_threshold(&findings, Severity::Critical));
    }

    #[test]
    fn test_parses_tool_report() {
        let json = r#"{
            "findings": [
                {"category": "dependency", "severity": "medium", "message": "requests < 2.32", "location": "requirements.txt"}
            ],
            "ok": false
        }"#;
        let report: CheckReport = serde_json::from_str(json).unwrap();
        assert!(!report.ok);
        assert_eq!(report.findings[0].severity, Severity::Medium);
        assert_eq!(report.findings[0].location.as_deref(), Some("requirements.txt"));
    }

    #[test]
    fn test_severity_round_trips_through_str() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("urgent".parse::<Severity>().is_err());
    }
}
