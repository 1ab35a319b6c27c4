//! KDL configuration for rollout.
//!
//! This crate handles:
//! - Pipeline definitions (rollout.kdl)
//! - Stage policies and their defaults
//! - Variable interpolation

pub mod error;
pub mod pipeline;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{
    BuildBackend, BuildConfig, CheckConfig, CheckFormat, DeployConfig, GateConfig, GatePolicy, InfraBackend,
    InfraConfig, PipelineConfig, PlatformKind, RegistryBackend, RegistryConfig, RetryPolicy,
    StageTimeouts, VerifyPolicy, load_pipeline_config, parse_duration, parse_pipeline_config,
};
pub use variables::VariableContext;
