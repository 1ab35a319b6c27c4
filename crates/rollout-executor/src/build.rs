//! Image builders.

use async_trait::async_trait;
use bollard::Docker;
use chrono::Utc;
use rollout_core::artifact::{ArtifactBuilder, BuildContext, BuiltArtifact};
use rollout_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info};

use crate::output_tail;

/// Builds images with the docker CLI and reads the resulting image id back
/// through the Docker API.
pub struct DockerBuilder {
    docker: Docker,
    docker_bin: String,
}

impl DockerBuilder {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    pub fn with_client(docker: Docker) -> Self {
        let docker_bin = std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());
        Self { docker, docker_bin }
    }

    fn image_name(context: &BuildContext) -> String {
        format!("{}:{}", context.service, context.tag)
    }

    /// Arguments for `docker build`. Build args come from an ordered map and
    /// the revision is stamped as a label, so a revision and context always
    /// produce the same invocation.
    fn build_args(context: &BuildContext) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--file".to_string(),
            context
                .context_dir
                .join(&context.dockerfile)
                .display()
                .to_string(),
            "--tag".to_string(),
            Self::image_name(context),
            "--label".to_string(),
            format!("org.opencontainers.image.revision={}", context.revision),
            "--label".to_string(),
            format!("org.opencontainers.image.title={}", context.service),
        ];
        for (key, value) in &context.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(context.context_dir.display().to_string());
        args
    }
}

#[async_trait]
impl ArtifactBuilder for DockerBuilder {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, context: &BuildContext) -> Result<BuiltArtifact> {
        let image = Self::image_name(context);
        info!(image = %image, revision = %context.revision, "Building image");

        let output = Command::new(&self.docker_bin)
            .args(Self::build_args(context))
            .env("DOCKER_BUILDKIT", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::BuildFailed(format!("failed to run docker: {e}")))?;

        if !output.status.success() {
            let combined = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            error!(image = %image, "Image build failed");
            return Err(Error::BuildFailed(output_tail(&combined, 30)));
        }

        let inspect = self
            .docker
            .inspect_image(&image)
            .await
            .map_err(|e| Error::BuildFailed(format!("built image not found: {e}")))?;

        let digest = inspect
            .id
            .ok_or_else(|| Error::BuildFailed(format!("image {image} has no id")))?;
        let size = inspect
            .size
            .and_then(|s| u64::try_from(s).ok())
            .unwrap_or(0);

        info!(image = %image, digest = %digest, size, "Image built");

        Ok(BuiltArtifact {
            image,
            digest,
            tag: context.tag.clone(),
            size,
            built_at: Utc::now(),
        })
    }
}

/// Derives a content digest from the build inputs without running a build.
///
/// Used for local dry runs against the in-memory registry and platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestBuilder;

impl DigestBuilder {
    pub fn digest(context: &BuildContext) -> String {
        let mut hasher = Sha256::new();
        hasher.update(context.service.as_bytes());
        hasher.update([0]);
        hasher.update(context.revision.as_bytes());
        hasher.update([0]);
        hasher.update(context.dockerfile.as_bytes());
        for (key, value) in &context.build_args {
            hasher.update([0]);
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl ArtifactBuilder for DigestBuilder {
    fn name(&self) -> &'static str {
        "digest"
    }

    async fn build(&self, context: &BuildContext) -> Result<BuiltArtifact> {
        if context.tag.trim().is_empty() {
            return Err(Error::BuildFailed("empty image tag".to_string()));
        }
        Ok(BuiltArtifact {
            image: DockerBuilder::image_name(context),
            digest: Self::digest(context),
            tag: context.tag.clone(),
            size: 0,
            built_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn context(revision: &str) -> BuildContext {
        let mut build_args = BTreeMap::new();
        build_args.insert("PYTHON_VERSION".to_string(), "3.12".to_string());
        build_args.insert("APP_VERSION".to_string(), revision.to_string());
        BuildContext {
            revision: revision.to_string(),
            service: "rates".to_string(),
            context_dir: PathBuf::from("app"),
            dockerfile: "Dockerfile".to_string(),
            tag: revision[..7].to_string(),
            build_args,
        }
    }

    #[test]
    fn test_build_args_are_ordered() {
        let args = DockerBuilder::build_args(&context("0123456789"));
        let build_args: Vec<&String> = args
            .iter()
            .skip_while(|a| *a != "--build-arg")
            .filter(|a| *a != "--build-arg")
            .collect();

        assert_eq!(args[0], "build");
        assert!(args.contains(&"rates:0123456".to_string()));
        assert!(args.contains(&"org.opencontainers.image.revision=0123456789".to_string()));
        assert_eq!(build_args[0], "APP_VERSION=0123456789");
        assert_eq!(build_args[1], "PYTHON_VERSION=3.12");
        assert_eq!(args.last().unwrap(), "app");
    }

    #[tokio::test]
    async fn test_digest_builder_is_deterministic() {
        let builder = DigestBuilder;
        let first = builder.build(&context("0123456789")).await.unwrap();
        let second = builder.build(&context("0123456789")).await.unwrap();
        let other = builder.build(&context("9876543210")).await.unwrap();

        assert_eq!(first.digest, second.digest);
        assert_ne!(first.digest, other.digest);
        assert!(first.digest.starts_with("sha256:"));
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_docker_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\nLABEL app=rates\n").unwrap();

        let builder = DockerBuilder::new().unwrap();
        let ctx = BuildContext {
            context_dir: dir.path().to_path_buf(),
            ..context("0123456789")
        };
        let artifact = builder.build(&ctx).await.unwrap();
        assert!(artifact.digest.starts_with("sha256:"));
    }
}
