//! Application state.

use anyhow::{Context, Result};
use rollout_config::load_pipeline_config;
use rollout_core::clock::{Clock, SystemClock};
use rollout_core::store::{DeploymentStateStore, RunStore};
use rollout_db::{
    MemoryDeploymentState, MemoryRunStore, PgDeploymentState, PgRunStore, create_pool,
    run_migrations,
};
use rollout_scheduler::{PipelineOrchestrator, ServicePipeline, backends_for};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PipelineOrchestrator,
    pub deployments: Arc<dyn DeploymentStateStore>,
}

impl AppState {
    pub fn new(orchestrator: PipelineOrchestrator, deployments: Arc<dyn DeploymentStateStore>) -> Self {
        Self {
            orchestrator,
            deployments,
        }
    }

    pub fn runs(&self) -> Arc<dyn RunStore> {
        self.orchestrator.run_store()
    }

    /// Load one pipeline per configuration file and connect the stores.
    ///
    /// Without a database URL, runs and deployment state live in memory
    /// and are lost on restart.
    pub async fn load(configs: &[PathBuf], database_url: Option<&str>) -> Result<Self> {
        if configs.is_empty() {
            anyhow::bail!("no pipeline configuration given");
        }

        let (runs, deployments) = match database_url {
            Some(url) => {
                info!("Connecting to database...");
                let pool = create_pool(url)
                    .await
                    .context("Failed to connect to database")?;
                run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
                info!("Database connected");
                (
                    Arc::new(PgRunStore::new(pool.clone())) as Arc<dyn RunStore>,
                    Arc::new(PgDeploymentState::new(pool)) as Arc<dyn DeploymentStateStore>,
                )
            }
            None => {
                warn!("DATABASE_URL not set, run records and deployment state are kept in memory");
                (
                    Arc::new(MemoryRunStore::new()) as Arc<dyn RunStore>,
                    Arc::new(MemoryDeploymentState::new()) as Arc<dyn DeploymentStateStore>,
                )
            }
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut services = HashSet::new();
        let mut pipelines = Vec::with_capacity(configs.len());
        for path in configs {
            let config = load_pipeline_config(path)
                .with_context(|| format!("Failed to load pipeline config: {}", path.display()))?;
            if !services.insert(config.service.clone()) {
                anyhow::bail!(
                    "service {} is configured more than once ({})",
                    config.service,
                    path.display()
                );
            }

            let backends = backends_for(&config)
                .await
                .with_context(|| format!("Failed to connect backends for {}", config.service))?;
            info!(service = %config.service, config = %path.display(), "Loaded pipeline");
            pipelines.push(ServicePipeline::new(
                config,
                backends,
                deployments.clone(),
                clock.clone(),
            ));
        }

        Ok(Self::new(PipelineOrchestrator::new(pipelines, runs), deployments))
    }
}
