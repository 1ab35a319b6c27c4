//! Build artifacts and the artifact registry abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::Result;

/// Everything needed to build an image for one source revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContext {
    /// Source revision being built.
    pub revision: String,
    /// Service the image is for.
    pub service: String,
    /// Build context directory.
    pub context_dir: PathBuf,
    /// Dockerfile path, relative to the context directory.
    pub dockerfile: String,
    /// Tag to apply to the image.
    pub tag: String,
    /// Build arguments. Ordered so the build command is reproducible.
    pub build_args: BTreeMap<String, String>,
}

/// A locally built, content-addressed image that has not been published yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltArtifact {
    /// Local image reference (name:tag).
    pub image: String,
    /// Content digest (e.g., "sha256:...").
    pub digest: String,
    /// Tag the image was built with.
    pub tag: String,
    /// Size in bytes, when known.
    pub size: u64,
    pub built_at: DateTime<Utc>,
}

/// Immutable reference to a published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Registry repository (e.g., "registry.example.com/exchange-rates").
    pub repository: String,
    /// Registry content digest.
    pub digest: String,
    pub tag: String,
    pub published_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Pullable reference pinned by digest.
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.repository, self.tag, self.digest)
    }
}

/// Result of pushing an artifact to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedArtifact {
    pub digest: String,
    pub tag: String,
    /// When the registry first stored this content.
    pub pushed_at: DateTime<Utc>,
}

/// Trait for image builders.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Name of this builder.
    fn name(&self) -> &'static str;

    /// Build an image. Failures are reported whole; a failed build produces
    /// no artifact.
    async fn build(&self, context: &BuildContext) -> Result<BuiltArtifact>;
}

/// Trait for artifact registries.
///
/// A push must be all-or-nothing: when it fails, no reference to the
/// artifact becomes resolvable.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Name of this registry backend.
    fn name(&self) -> &'static str;

    /// Repository that published references point into.
    fn repository(&self) -> &str;

    /// Whether content with this digest is already stored.
    async fn exists(&self, digest: &str) -> Result<bool>;

    /// Look up the registry reference for already stored content.
    async fn resolve(&self, digest: &str) -> Result<Option<PushedArtifact>>;

    /// Push a built artifact.
    async fn push(&self, artifact: &BuiltArtifact) -> Result<PushedArtifact>;
}
