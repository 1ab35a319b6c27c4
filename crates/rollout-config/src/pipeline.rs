//! Pipeline configuration parsing.
//!
//! A `rollout.kdl` file describes how one service is gated, built,
//! published, provisioned, deployed and verified:
//!
//! ```kdl
//! pipeline "exchange-rates" {
//!     service "exchange-rates"
//!     source "."
//! }
//!
//! gates threshold="high" fail-fast=#true timeout="15m" {
//!     check "flake8" category="style" severity="medium" {
//!         run "flake8 ."
//!     }
//!     check "bandit" category="security" format="report" {
//!         run "scripts/bandit-report.sh ${revision}"
//!     }
//! }
//!
//! build "docker" {
//!     context "."
//!     dockerfile "Dockerfile"
//!     tag "${revision.short}"
//!     arg "APP_VERSION" "${revision}"
//! }
//!
//! registry "docker" repository="registry.example.com/exchange-rates" url="https://registry.example.com" {
//!     retry attempts=3 backoff="1s" max-backoff="30s"
//! }
//!
//! infrastructure "terraform" dir="infra" {
//!     var "region" "us-east-1"
//! }
//!
//! deploy "kubernetes" namespace="default" container="app" ready-timeout="5m"
//!
//! verify interval="5s" window="30s" timeout="5m" min-healthy=2 max-restarts=3
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use rollout_core::gate::{Category, Severity};
use rollout_core::infra::{DesiredState, ResourceDecl, ResourceId};
use rollout_core::pipeline::Stage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration of one service's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// Target service the pipeline deploys.
    pub service: String,
    /// Source checkout directory gate checks run in.
    pub source_dir: PathBuf,
    pub gates: GateConfig,
    pub build: BuildConfig,
    pub registry: RegistryConfig,
    pub infrastructure: InfraConfig,
    pub deploy: DeployConfig,
    pub verify: VerifyPolicy,
    pub timeouts: StageTimeouts,
}

/// Gate checks and how their findings are judged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    pub policy: GatePolicy,
    pub checks: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Findings at or above this severity fail the gate.
    pub threshold: Severity,
    /// Stop the remaining checks on the first critical finding.
    pub fail_fast: bool,
    /// Per-check time limit.
    pub check_timeout: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            threshold: Severity::High,
            fail_fast: true,
            check_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// How a check's output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckFormat {
    /// Non-zero exit status is a single finding.
    ExitCode,
    /// Stdout is a JSON `{ "findings": [...], "ok": bool }` report.
    Report,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    pub category: Category,
    pub command: String,
    pub format: CheckFormat,
    /// Severity of the finding synthesized for a failing exit-code check.
    pub severity: Severity,
    /// Working directory relative to the source directory.
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildBackend {
    Docker,
    /// Computes a content digest without producing an image. Local dry runs.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub backend: BuildBackend,
    pub context: String,
    pub dockerfile: String,
    /// Tag template, interpolated per run.
    pub tag: String,
    pub args: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            backend: BuildBackend::Memory,
            context: ".".to_string(),
            dockerfile: "Dockerfile".to_string(),
            tag: "${revision.short}".to_string(),
            args: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Docker,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub repository: String,
    /// Registry HTTP endpoint used for manifest lookups.
    pub url: Option<url::Url>,
    pub retry: RetryPolicy,
}

/// Bounded exponential backoff for transient publish failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraBackend {
    Terraform,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraConfig {
    pub backend: InfraBackend,
    /// Directory holding the infrastructure definitions.
    pub dir: PathBuf,
    pub desired: DesiredState,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            backend: InfraBackend::Memory,
            dir: PathBuf::from("infra"),
            desired: DesiredState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Kubernetes,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub platform: PlatformKind,
    pub namespace: String,
    /// Container to update; defaults to the first container of the workload.
    pub container: Option<String>,
    /// How long to wait for the first new instance to become ready.
    pub ready_timeout: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            platform: PlatformKind::Memory,
            namespace: "default".to_string(),
            container: None,
            ready_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Health verification settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    pub interval: Duration,
    /// How long health must hold continuously.
    pub window: Duration,
    pub timeout: Duration,
    /// Healthy instances required; the desired count when unset.
    pub min_healthy: Option<u32>,
    /// Recent restarts above this count are a crash loop.
    pub max_restarts: u32,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            window: Duration::from_secs(30),
            timeout: Duration::from_secs(5 * 60),
            min_healthy: None,
            max_restarts: 3,
        }
    }
}

/// Upper bound on each stage's external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub gate: Duration,
    pub build: Duration,
    pub publish: Duration,
    pub provision: Duration,
    pub deploy: Duration,
    pub verify: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            gate: Duration::from_secs(15 * 60),
            build: Duration::from_secs(30 * 60),
            publish: Duration::from_secs(10 * 60),
            provision: Duration::from_secs(30 * 60),
            deploy: Duration::from_secs(10 * 60),
            verify: Duration::from_secs(15 * 60),
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Gate => self.gate,
            Stage::Build => self.build,
            Stage::Publish => self.publish,
            Stage::Provision => self.provision,
            Stage::Deploy => self.deploy,
            Stage::Verify => self.verify,
            // A rollback redeploys and then verifies.
            Stage::Rollback => self.deploy + self.verify,
        }
    }
}

/// Read and parse a pipeline configuration file.
///
/// A relative source directory is resolved against the directory holding
/// the file.
pub fn load_pipeline_config(path: impl AsRef<Path>) -> ConfigResult<PipelineConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_pipeline_config(&content)?;

    if config.source_dir.is_relative() {
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.source_dir = base.join(&config.source_dir);
    }
    Ok(config)
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline_config(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = None;
    let mut service = None;
    let mut source_dir = PathBuf::from(".");
    let mut gates = GateConfig::default();
    let mut build = BuildConfig::default();
    let mut registry = None;
    let mut infrastructure = InfraConfig::default();
    let mut deploy = DeployConfig::default();
    let mut verify = VerifyPolicy::default();
    let mut timeouts = StageTimeouts::default();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?,
                );
                for child in children(node) {
                    match child.name().value() {
                        "service" => service = get_first_string_arg(child),
                        "source" => {
                            if let Some(dir) = get_first_string_arg(child) {
                                source_dir = PathBuf::from(dir);
                            }
                        }
                        _ => {}
                    }
                }
            }
            "gates" => gates = parse_gates(node)?,
            "build" => build = parse_build(node)?,
            "registry" => registry = Some(parse_registry(node)?),
            "infrastructure" => infrastructure = parse_infrastructure(node)?,
            "deploy" => deploy = parse_deploy(node)?,
            "verify" => verify = parse_verify(node)?,
            "timeouts" => timeouts = parse_timeouts(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    let name = name.ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
    let service = service.unwrap_or_else(|| name.clone());
    if service.trim().is_empty() {
        return Err(ConfigError::MissingField("pipeline service".to_string()));
    }

    let registry = registry.unwrap_or_else(|| RegistryConfig {
        backend: RegistryBackend::Memory,
        repository: format!("local/{service}"),
        url: None,
        retry: RetryPolicy::default(),
    });

    if verify.timeout > timeouts.verify {
        return Err(ConfigError::invalid(
            "verify timeout",
            format!(
                "{:?} exceeds the verify stage timeout of {:?}",
                verify.timeout, timeouts.verify
            ),
        ));
    }

    Ok(PipelineConfig {
        name,
        service,
        source_dir,
        gates,
        build,
        registry,
        infrastructure,
        deploy,
        verify,
        timeouts,
    })
}

fn parse_gates(node: &KdlNode) -> ConfigResult<GateConfig> {
    let mut policy = GatePolicy::default();

    if let Some(threshold) = get_string_prop(node, "threshold") {
        policy.threshold = parse_enum("gates threshold", &threshold)?;
    }
    if let Some(fail_fast) = get_bool_prop(node, "fail-fast") {
        policy.fail_fast = fail_fast;
    }
    if let Some(timeout) = get_string_prop(node, "timeout") {
        policy.check_timeout = parse_duration(&timeout)?;
    }

    let mut checks = Vec::new();
    let mut seen = HashSet::new();
    for child in children(node) {
        if child.name().value() != "check" {
            continue;
        }
        let check = parse_check(child)?;
        if !seen.insert(check.name.clone()) {
            return Err(ConfigError::Duplicate(format!("check '{}'", check.name)));
        }
        checks.push(check);
    }

    Ok(GateConfig { policy, checks })
}

fn parse_check(node: &KdlNode) -> ConfigResult<CheckConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("check name".to_string()))?;

    let category = match get_string_prop(node, "category") {
        Some(c) => parse_enum(&format!("category of check '{name}'"), &c)?,
        None => {
            return Err(ConfigError::MissingField(format!(
                "category for check '{name}'"
            )));
        }
    };

    let format = match get_string_prop(node, "format").as_deref() {
        None | Some("exit-code") => CheckFormat::ExitCode,
        Some("report") => CheckFormat::Report,
        Some(other) => {
            return Err(ConfigError::invalid(
                format!("format of check '{name}'"),
                format!("unknown format: {other}"),
            ));
        }
    };

    let severity = match get_string_prop(node, "severity") {
        Some(s) => parse_enum(&format!("severity of check '{name}'"), &s)?,
        None => Severity::High,
    };

    let mut command = None;
    let mut workdir = None;
    for child in children(node) {
        match child.name().value() {
            "run" => command = get_first_string_arg(child),
            "workdir" => workdir = get_first_string_arg(child),
            _ => {}
        }
    }

    let command =
        command.ok_or_else(|| ConfigError::MissingField(format!("run for check '{name}'")))?;

    Ok(CheckConfig {
        name,
        category,
        command,
        format,
        severity,
        workdir,
    })
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildConfig> {
    let mut build = BuildConfig::default();

    build.backend = match get_first_string_arg(node).as_deref() {
        None | Some("docker") => BuildBackend::Docker,
        Some("memory") => BuildBackend::Memory,
        Some(other) => {
            return Err(ConfigError::UnknownBackend {
                section: "build",
                name: other.to_string(),
            });
        }
    };

    for child in children(node) {
        match child.name().value() {
            "context" => {
                if let Some(context) = get_first_string_arg(child) {
                    build.context = context;
                }
            }
            "dockerfile" => {
                if let Some(dockerfile) = get_first_string_arg(child) {
                    build.dockerfile = dockerfile;
                }
            }
            "tag" => {
                if let Some(tag) = get_first_string_arg(child) {
                    build.tag = tag;
                }
            }
            "arg" => {
                let (key, value) = get_key_value_args(child, "build arg")?;
                build.args.insert(key, value);
            }
            _ => {}
        }
    }

    if build.tag.trim().is_empty() {
        return Err(ConfigError::MissingField("build tag".to_string()));
    }

    Ok(build)
}

fn parse_registry(node: &KdlNode) -> ConfigResult<RegistryConfig> {
    let backend = match get_first_string_arg(node).as_deref() {
        None | Some("docker") => RegistryBackend::Docker,
        Some("memory") => RegistryBackend::Memory,
        Some(other) => {
            return Err(ConfigError::UnknownBackend {
                section: "registry",
                name: other.to_string(),
            });
        }
    };

    let repository = get_string_prop(node, "repository")
        .ok_or_else(|| ConfigError::MissingField("registry repository".to_string()))?;

    let url = get_string_prop(node, "url")
        .map(|u| url::Url::parse(&u).map_err(|e| ConfigError::invalid("registry url", e.to_string())))
        .transpose()?;

    let mut retry = RetryPolicy::default();
    for child in children(node) {
        if child.name().value() != "retry" {
            continue;
        }
        if let Some(attempts) = get_int_prop(child, "attempts") {
            retry.max_attempts = u32::try_from(attempts)
                .ok()
                .filter(|a| *a >= 1)
                .ok_or_else(|| {
                    ConfigError::invalid("retry attempts", "must be a positive integer")
                })?;
        }
        if let Some(backoff) = get_string_prop(child, "backoff") {
            retry.initial_backoff = parse_duration(&backoff)?;
        }
        if let Some(max_backoff) = get_string_prop(child, "max-backoff") {
            retry.max_backoff = parse_duration(&max_backoff)?;
        }
    }

    Ok(RegistryConfig {
        backend,
        repository,
        url,
        retry,
    })
}

fn parse_infrastructure(node: &KdlNode) -> ConfigResult<InfraConfig> {
    let backend = match get_first_string_arg(node).as_deref() {
        None | Some("terraform") => InfraBackend::Terraform,
        Some("memory") => InfraBackend::Memory,
        Some(other) => {
            return Err(ConfigError::UnknownBackend {
                section: "infrastructure",
                name: other.to_string(),
            });
        }
    };

    let dir = get_string_prop(node, "dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("infra"));

    let mut desired = DesiredState::default();
    for child in children(node) {
        match child.name().value() {
            "var" => {
                let (key, value) = get_key_value_args(child, "infrastructure var")?;
                desired.variables.insert(key, value);
            }
            "resource" => {
                let id = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("resource id".to_string()))?;
                let mut properties = serde_json::Map::new();
                for prop in children(child) {
                    if let Some(value) = get_first_string_arg(prop) {
                        properties.insert(
                            prop.name().value().to_string(),
                            serde_json::Value::String(value),
                        );
                    }
                }
                desired.resources.push(ResourceDecl {
                    id: ResourceId::new(id),
                    depends_on: get_string_list_prop(child, "depends-on")
                        .into_iter()
                        .map(ResourceId::new)
                        .collect(),
                    properties: serde_json::Value::Object(properties),
                });
            }
            _ => {}
        }
    }

    desired
        .apply_order()
        .map_err(|e| ConfigError::InvalidReference(e.to_string()))?;

    Ok(InfraConfig {
        backend,
        dir,
        desired,
    })
}

fn parse_deploy(node: &KdlNode) -> ConfigResult<DeployConfig> {
    let mut deploy = DeployConfig::default();

    deploy.platform = match get_first_string_arg(node).as_deref() {
        None | Some("kubernetes") => PlatformKind::Kubernetes,
        Some("memory") => PlatformKind::Memory,
        Some(other) => {
            return Err(ConfigError::UnknownBackend {
                section: "deploy",
                name: other.to_string(),
            });
        }
    };
    if let Some(namespace) = get_string_prop(node, "namespace") {
        deploy.namespace = namespace;
    }
    deploy.container = get_string_prop(node, "container");
    if let Some(timeout) = get_string_prop(node, "ready-timeout") {
        deploy.ready_timeout = parse_duration(&timeout)?;
    }

    Ok(deploy)
}

fn parse_verify(node: &KdlNode) -> ConfigResult<VerifyPolicy> {
    let mut verify = VerifyPolicy::default();

    if let Some(interval) = get_string_prop(node, "interval") {
        verify.interval = parse_duration(&interval)?;
    }
    if let Some(window) = get_string_prop(node, "window") {
        verify.window = parse_duration(&window)?;
    }
    if let Some(timeout) = get_string_prop(node, "timeout") {
        verify.timeout = parse_duration(&timeout)?;
    }
    if let Some(min_healthy) = get_int_prop(node, "min-healthy") {
        verify.min_healthy = Some(
            u32::try_from(min_healthy)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| ConfigError::invalid("min-healthy", "must be at least 1"))?,
        );
    }
    if let Some(max_restarts) = get_int_prop(node, "max-restarts") {
        verify.max_restarts = u32::try_from(max_restarts)
            .map_err(|_| ConfigError::invalid("max-restarts", "must not be negative"))?;
    }

    if verify.interval.is_zero() {
        return Err(ConfigError::invalid("verify interval", "must be positive"));
    }
    if verify.window > verify.timeout {
        return Err(ConfigError::invalid(
            "verify window",
            "stabilization window cannot exceed the verify timeout",
        ));
    }

    Ok(verify)
}

fn parse_timeouts(node: &KdlNode) -> ConfigResult<StageTimeouts> {
    let mut timeouts = StageTimeouts::default();
    for stage in Stage::PIPELINE {
        if let Some(value) = get_string_prop(node, stage.as_str()) {
            let duration = parse_duration(&value)?;
            match stage {
                Stage::Gate => timeouts.gate = duration,
                Stage::Build => timeouts.build = duration,
                Stage::Publish => timeouts.publish = duration,
                Stage::Provision => timeouts.provision = duration,
                Stage::Deploy => timeouts.deploy = duration,
                Stage::Verify | Stage::Rollback => timeouts.verify = duration,
            }
        }
    }
    Ok(timeouts)
}

/// Parse a duration such as `"500ms"`, `"5s"`, `"2m"` or `"1h"`.
/// A bare number is seconds.
pub fn parse_duration(value: &str) -> ConfigResult<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::invalid("duration", format!("'{value}' is not a duration")))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 60 * 60),
        other => {
            return Err(ConfigError::invalid(
                "duration",
                format!("unknown unit '{other}' in '{value}'"),
            ));
        }
    };
    Ok(duration)
}

fn parse_enum<T>(field: &str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr<Err = rollout_core::Error>,
{
    value
        .parse()
        .map_err(|e: rollout_core::Error| ConfigError::invalid(field, e.to_string()))
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .into_iter()
        .flat_map(|doc| doc.nodes().iter())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_key_value_args(node: &KdlNode, what: &str) -> ConfigResult<(String, String)> {
    match get_all_string_args(node).as_slice() {
        [key, value] => Ok((key.clone(), value.clone())),
        _ => Err(ConfigError::invalid(what, "expected a name and a value")),
    }
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

/// Collect a repeated property (`depends-on="a" depends-on="b"`).
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}
