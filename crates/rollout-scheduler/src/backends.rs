//! Backend selection from pipeline configuration.

use rollout_config::{
    BuildBackend, InfraBackend, PipelineConfig, PlatformKind, RegistryBackend, VariableContext,
};
use rollout_core::artifact::{ArtifactBuilder, ArtifactRegistry};
use rollout_core::deployer::ComputePlatform;
use rollout_core::gate::GateCheck;
use rollout_core::infra::Provisioner;
use rollout_core::Result;
use rollout_deployer::{KubernetesPlatform, MemoryPlatform};
use rollout_executor::{CommandCheck, DigestBuilder, DockerBuilder, DockerRegistry, MemoryRegistry};
use rollout_infra::{MemoryProvisioner, TerraformProvisioner};
use std::sync::Arc;
use tracing::info;

use crate::orchestrator::Backends;

/// Connect the backends a pipeline is configured with.
pub async fn backends_for(config: &PipelineConfig) -> Result<Backends> {
    let mut vars = VariableContext::new();
    vars.service = config.service.clone();
    vars.populate_env();

    let checks: Vec<Arc<dyn GateCheck>> = config
        .gates
        .checks
        .iter()
        .map(|check| {
            Arc::new(CommandCheck::new(check.clone(), &config.source_dir, vars.clone()))
                as Arc<dyn GateCheck>
        })
        .collect();

    let builder: Arc<dyn ArtifactBuilder> = match config.build.backend {
        BuildBackend::Docker => Arc::new(DockerBuilder::new()?),
        BuildBackend::Memory => Arc::new(DigestBuilder),
    };

    let registry: Arc<dyn ArtifactRegistry> = match config.registry.backend {
        RegistryBackend::Docker => Arc::new(DockerRegistry::new(
            config.registry.repository.clone(),
            config.registry.url.clone(),
        )?),
        RegistryBackend::Memory => Arc::new(MemoryRegistry::new(config.registry.repository.clone())),
    };

    let provisioner: Arc<dyn Provisioner> = match config.infrastructure.backend {
        InfraBackend::Terraform => Arc::new(TerraformProvisioner::new(
            config.source_dir.join(&config.infrastructure.dir),
        )),
        InfraBackend::Memory => Arc::new(MemoryProvisioner::new()),
    };

    let platform: Arc<dyn ComputePlatform> = match config.deploy.platform {
        PlatformKind::Kubernetes => Arc::new(
            KubernetesPlatform::new(config.deploy.namespace.clone(), config.deploy.container.clone())
                .await?,
        ),
        PlatformKind::Memory => Arc::new(MemoryPlatform::default()),
    };

    info!(
        service = %config.service,
        checks = checks.len(),
        builder = builder.name(),
        registry = registry.name(),
        provisioner = provisioner.name(),
        platform = platform.name(),
        "Selected backends"
    );

    Ok(Backends {
        checks,
        builder,
        registry,
        provisioner,
        platform,
    })
}
