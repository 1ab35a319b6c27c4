//! Core domain types and traits for the rollout deployment pipeline.
//!
//! This crate contains:
//! - Run identifiers and the run/stage record types
//! - Gate findings and the gate check trait
//! - Artifact build and registry traits
//! - Infrastructure desired state and the provisioner trait
//! - Compute platform trait and deploy/verify/rollback results
//! - Persistence traits for run records and deployment state
//! - An injectable clock

pub mod artifact;
pub mod clock;
pub mod deployer;
pub mod error;
pub mod gate;
pub mod id;
pub mod infra;
pub mod pipeline;
pub mod store;

pub use error::{Error, Result};
pub use id::RunId;
