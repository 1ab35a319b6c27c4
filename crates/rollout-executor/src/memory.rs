//! In-memory artifact registry.

use async_trait::async_trait;
use chrono::Utc;
use rollout_core::artifact::{ArtifactRegistry, BuiltArtifact, PushedArtifact};
use rollout_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// Registry that stores artifacts in a map keyed by content digest.
///
/// Failures can be injected so publish retry behavior can be exercised
/// without a network.
pub struct MemoryRegistry {
    repository: String,
    artifacts: Mutex<HashMap<String, PushedArtifact>>,
    transient_failures: AtomicU32,
    permanent_failure: Mutex<Option<String>>,
    pushes: AtomicU32,
}

impl MemoryRegistry {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            artifacts: Mutex::new(HashMap::new()),
            transient_failures: AtomicU32::new(0),
            permanent_failure: Mutex::new(None),
            pushes: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` pushes with a transient error.
    pub fn fail_next_pushes(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Reject every push with a permanent error.
    pub fn reject_pushes(&self, message: impl Into<String>) {
        *self
            .permanent_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Number of distinct artifacts stored.
    pub fn stored_count(&self) -> usize {
        self.artifacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of push calls received, failed ones included.
    pub fn push_count(&self) -> u32 {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactRegistry for MemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn repository(&self) -> &str {
        &self.repository
    }

    async fn exists(&self, digest: &str) -> Result<bool> {
        Ok(self
            .artifacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(digest))
    }

    async fn resolve(&self, digest: &str) -> Result<Option<PushedArtifact>> {
        Ok(self
            .artifacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(digest)
            .cloned())
    }

    async fn push(&self, artifact: &BuiltArtifact) -> Result<PushedArtifact> {
        self.pushes.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self
            .permanent_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(Error::permanent_publish(message));
        }

        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transient_publish("registry unavailable (injected)"));
        }

        let mut artifacts = self.artifacts.lock().unwrap_or_else(|e| e.into_inner());
        let pushed = artifacts
            .entry(artifact.digest.clone())
            .or_insert_with(|| PushedArtifact {
                digest: artifact.digest.clone(),
                tag: artifact.tag.clone(),
                pushed_at: Utc::now(),
            })
            .clone();

        info!(repository = %self.repository, digest = %pushed.digest, "Stored artifact");
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(digest: &str) -> BuiltArtifact {
        BuiltArtifact {
            image: "rates:abc1234".to_string(),
            digest: digest.to_string(),
            tag: "abc1234".to_string(),
            size: 0,
            built_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_push_same_content_twice() {
        let registry = MemoryRegistry::new("local/rates");

        let first = registry.push(&artifact("sha256:aaa")).await.unwrap();
        let second = registry.push(&artifact("sha256:aaa")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.stored_count(), 1);
        assert!(registry.exists("sha256:aaa").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_push_stores_nothing() {
        let registry = MemoryRegistry::new("local/rates");
        registry.fail_next_pushes(1);

        let err = registry.push(&artifact("sha256:aaa")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!registry.exists("sha256:aaa").await.unwrap());

        registry.push(&artifact("sha256:aaa")).await.unwrap();
        assert_eq!(registry.stored_count(), 1);
        assert_eq!(registry.push_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_push_is_permanent() {
        let registry = MemoryRegistry::new("local/rates");
        registry.reject_pushes("denied");

        let err = registry.push(&artifact("sha256:aaa")).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(registry.stored_count(), 0);
    }
}
