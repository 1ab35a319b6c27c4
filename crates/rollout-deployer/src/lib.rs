//! Compute platform backends for rollout.
//!
//! Provides platform implementations:
//! - Kubernetes deployments (production)
//! - In-memory platform (local dry runs and tests)

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubernetesPlatform;
pub use memory::MemoryPlatform;
pub use rollout_core::deployer::{ComputePlatform, ServiceHealth, TaskSetId};
