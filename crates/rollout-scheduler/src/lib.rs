//! Pipeline orchestration for rollout.
//!
//! This crate handles:
//! - Running gate checks concurrently and applying the severity threshold
//! - Publishing with bounded retries
//! - Deploying, verifying and rolling back services
//! - Driving runs through their stages, one active run per service
//! - Selecting backends from pipeline configuration

pub mod backends;
pub mod deploy;
pub mod gate;
pub mod orchestrator;
pub mod publish;
pub mod rollback;
pub mod verify;

pub use backends::backends_for;
pub use deploy::ServiceDeployer;
pub use gate::GateRunner;
pub use orchestrator::{
    Backends, PipelineEvent, PipelineOrchestrator, RunHandle, ServicePipeline,
};
pub use publish::{PublishOutcome, RegistryPublisher};
pub use rollback::RollbackController;
pub use verify::HealthVerifier;
