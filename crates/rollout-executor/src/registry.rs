//! Docker registry publisher.

use async_trait::async_trait;
use bollard::Docker;
use bollard::image::{PushImageOptions, TagImageOptions};
use chrono::Utc;
use futures::StreamExt;
use rollout_core::artifact::{ArtifactRegistry, BuiltArtifact, PushedArtifact};
use rollout_core::{Error, Result};
use tracing::{debug, info, warn};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Pushes locally built images to a Docker registry.
///
/// Pushes are content addressed: the registry only makes a manifest
/// resolvable once every layer of it has been uploaded.
pub struct DockerRegistry {
    docker: Docker,
    repository: String,
    /// Registry API endpoint for manifest lookups.
    url: Option<url::Url>,
    http: reqwest::Client,
}

impl DockerRegistry {
    pub fn new(repository: impl Into<String>, url: Option<url::Url>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker, repository, url))
    }

    pub fn with_client(docker: Docker, repository: impl Into<String>, url: Option<url::Url>) -> Self {
        Self {
            docker,
            repository: repository.into(),
            url,
            http: reqwest::Client::new(),
        }
    }

    /// Repository path inside the registry ("registry.example.com/team/app"
    /// becomes "team/app").
    fn repository_path(&self) -> &str {
        match self.repository.split_once('/') {
            Some((host, path)) if host.contains('.') || host.contains(':') => path,
            _ => &self.repository,
        }
    }

    fn manifest_url(&self, base: &url::Url, reference: &str) -> Result<url::Url> {
        base.join(&format!(
            "v2/{}/manifests/{}",
            self.repository_path(),
            reference
        ))
        .map_err(|e| Error::Internal(format!("invalid registry url: {e}")))
    }

    /// Registry digest recorded on a local image after a push to this
    /// repository.
    async fn local_repo_digest(&self, image: &str) -> Result<Option<String>> {
        let inspect = match self.docker.inspect_image(image).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(classify_docker_error(e)),
        };

        let prefix = format!("{}@", self.repository);
        Ok(inspect
            .repo_digests
            .unwrap_or_default()
            .into_iter()
            .find_map(|d| d.strip_prefix(&prefix).map(str::to_string)))
    }
}

#[async_trait]
impl ArtifactRegistry for DockerRegistry {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn repository(&self) -> &str {
        &self.repository
    }

    async fn exists(&self, digest: &str) -> Result<bool> {
        let Some(base) = &self.url else {
            return Ok(false);
        };

        let url = self.manifest_url(base, digest)?;
        let response = self
            .http
            .head(url)
            .header(reqwest::header::ACCEPT, MANIFEST_MEDIA_TYPES)
            .send()
            .await
            .map_err(|e| Error::transient_publish(format!("registry lookup failed: {e}")))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_server_error() => Err(Error::transient_publish(format!(
                "registry returned {status}"
            ))),
            status => Err(Error::permanent_publish(format!(
                "registry returned {status}"
            ))),
        }
    }

    async fn resolve(&self, digest: &str) -> Result<Option<PushedArtifact>> {
        // The local image id is the build's content digest; a previous push
        // of the same content left the registry digest on the image.
        let Some(repo_digest) = self.local_repo_digest(digest).await? else {
            return Ok(None);
        };

        if self.url.is_some() && !self.exists(&repo_digest).await? {
            debug!(digest = %repo_digest, "Registry no longer holds pushed digest");
            return Ok(None);
        }

        // The daemon does not record when a digest was pushed.
        Ok(Some(PushedArtifact {
            digest: repo_digest,
            tag: String::new(),
            pushed_at: Utc::now(),
        }))
    }

    async fn push(&self, artifact: &BuiltArtifact) -> Result<PushedArtifact> {
        info!(image = %artifact.image, repository = %self.repository, "Pushing image");

        self.docker
            .tag_image(
                &artifact.image,
                Some(TagImageOptions {
                    repo: self.repository.as_str(),
                    tag: artifact.tag.as_str(),
                }),
            )
            .await
            .map_err(|e| Error::permanent_publish(format!("failed to tag image: {e}")))?;

        let mut stream = self.docker.push_image(
            &self.repository,
            Some(PushImageOptions {
                tag: artifact.tag.as_str(),
            }),
            None,
        );

        while let Some(item) = stream.next().await {
            let info = item.map_err(classify_docker_error)?;
            if let Some(message) = info.error {
                warn!(image = %artifact.image, error = %message, "Push failed");
                return Err(classify_push_message(&message));
            }
            if let Some(status) = info.status {
                debug!(status = %status, "Push progress");
            }
        }

        let digest = self
            .local_repo_digest(&artifact.image)
            .await?
            .ok_or_else(|| {
                Error::transient_publish("push finished but no registry digest was recorded")
            })?;

        info!(repository = %self.repository, digest = %digest, "Image pushed");

        Ok(PushedArtifact {
            digest,
            tag: artifact.tag.clone(),
            pushed_at: Utc::now(),
        })
    }
}

fn classify_docker_error(e: bollard::errors::Error) -> Error {
    use bollard::errors::Error as DockerError;

    match &e {
        DockerError::DockerResponseServerError { status_code, .. } if *status_code >= 500 => {
            Error::transient_publish(e.to_string())
        }
        DockerError::RequestTimeoutError => Error::transient_publish(e.to_string()),
        _ => Error::permanent_publish(e.to_string()),
    }
}

/// Registry errors reported inside the push stream are plain text.
fn classify_push_message(message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    let permanent = ["denied", "unauthorized", "forbidden", "not found", "manifest invalid"];
    if permanent.iter().any(|p| lower.contains(p)) {
        Error::permanent_publish(message)
    } else {
        Error::transient_publish(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(repository: &str) -> DockerRegistry {
        let docker = Docker::connect_with_http_defaults().unwrap();
        DockerRegistry::with_client(
            docker,
            repository,
            Some(url::Url::parse("https://registry.example.com/").unwrap()),
        )
    }

    #[test]
    fn test_repository_path_strips_host() {
        assert_eq!(
            registry("registry.example.com/team/rates").repository_path(),
            "team/rates"
        );
        assert_eq!(registry("localhost:5000/rates").repository_path(), "rates");
        assert_eq!(registry("team/rates").repository_path(), "team/rates");
    }

    #[test]
    fn test_manifest_url() {
        let registry = registry("registry.example.com/team/rates");
        let base = url::Url::parse("https://registry.example.com/").unwrap();
        let url = registry.manifest_url(&base, "sha256:abc").unwrap();
        assert_eq!(
            url.as_str(),
            "https://registry.example.com/v2/team/rates/manifests/sha256:abc"
        );
    }

    #[test]
    fn test_push_messages_are_classified() {
        assert!(!classify_push_message("denied: requested access to the resource is denied").is_transient());
        assert!(classify_push_message("received unexpected HTTP status: 503 Service Unavailable").is_transient());
        assert!(classify_push_message("net/http: TLS handshake timeout").is_transient());
    }
}
