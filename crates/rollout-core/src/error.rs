//! Error types for rollout.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run already in progress for service '{0}'")]
    RunInProgress(String),

    #[error("gate check failed: {0}")]
    GateFailed(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("publish failed: {message}")]
    PublishFailed { message: String, transient: bool },

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    /// The platform accepted the update but no new instance became ready.
    /// The new artifact is live, so this needs a rollback.
    #[error("deployment not ready: {0}")]
    NotReady(String),

    #[error("verification failed: {0}")]
    VerifyFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient publish errors (network, registry 5xx) may be retried.
    pub fn transient_publish(message: impl Into<String>) -> Self {
        Self::PublishFailed {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent_publish(message: impl Into<String>) -> Self {
        Self::PublishFailed {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PublishFailed {
                transient: true,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
