//! Infrastructure provisioners for rollout.
//!
//! Both backends reconcile a [`DesiredState`](rollout_core::infra::DesiredState)
//! by diffing first and applying only the delta.

pub mod memory;
pub mod terraform;

pub use memory::MemoryProvisioner;
pub use terraform::{TerraformError, TerraformProvisioner};
