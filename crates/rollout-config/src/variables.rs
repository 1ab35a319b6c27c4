//! Variable interpolation for pipeline configuration values.
//!
//! Supports:
//! - `${revision}` - Source revision being deployed
//! - `${revision.short}` - First 7 characters of the revision
//! - `${service}` - Target service
//! - `${trigger}` - Trigger kind (push, pull_request, manual)
//! - `${run.id}` - Run ID
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${name}` - Custom variable

use regex::Regex;
use rollout_core::RunId;
use rollout_core::pipeline::Trigger;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

/// Values available for interpolation during one run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub revision: String,
    pub service: String,
    pub trigger: String,
    pub run_id: String,
    pub env: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a triggered run.
    pub fn for_run(trigger: &Trigger, run_id: RunId) -> Self {
        Self {
            revision: trigger.revision_id.clone(),
            service: trigger.target_service.clone(),
            trigger: trigger.trigger_kind.to_string(),
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["revision"] => Some(self.revision.clone()),
            ["revision", "short"] => Some(self.revision.chars().take(7).collect()),
            ["service"] => Some(self.service.clone()),
            ["trigger"] => Some(self.trigger.clone()),
            ["run", "id"] => Some(self.run_id.clone()),
            ["env", name] => self.env.get(*name).cloned(),
            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            [name] => self.custom.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as
    /// written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Variables referenced by `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}
