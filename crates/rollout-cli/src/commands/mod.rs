//! CLI command implementations.

pub mod run;
pub mod runs;

use anyhow::{Context, Result};
use rollout_config::{PipelineConfig, load_pipeline_config};
use rollout_core::clock::{Clock, SystemClock};
use rollout_core::store::{DeploymentStateStore, RunStore};
use rollout_db::{
    MemoryDeploymentState, MemoryRunStore, PgDeploymentState, PgRunStore, create_pool,
    run_migrations,
};
use rollout_scheduler::{PipelineOrchestrator, ServicePipeline, backends_for};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::output;

/// Run records and deployment state, persistent or in-memory.
pub struct Stores {
    pub runs: Arc<dyn RunStore>,
    pub state: Arc<dyn DeploymentStateStore>,
}

impl Stores {
    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        let Some(url) = database_url else {
            warn!("DATABASE_URL not set, run records and deployment state are kept in memory");
            return Ok(Self {
                runs: Arc::new(MemoryRunStore::new()),
                state: Arc::new(MemoryDeploymentState::new()),
            });
        };

        info!("Connecting to database...");
        let pool = create_pool(url)
            .await
            .context("Failed to connect to database")?;
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self {
            runs: Arc::new(PgRunStore::new(pool.clone())),
            state: Arc::new(PgDeploymentState::new(pool)),
        })
    }

    /// Like `connect`, but refuses to fall back to memory for read-only
    /// queries that would always come back empty.
    pub async fn require(database_url: Option<&str>) -> Result<Self> {
        if database_url.is_none() {
            anyhow::bail!("this command reads recorded state and needs DATABASE_URL");
        }
        Self::connect(database_url).await
    }
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    load_pipeline_config(path)
        .with_context(|| format!("Failed to load pipeline config: {}", path.display()))
}

pub async fn orchestrator(config: PipelineConfig, stores: &Stores) -> Result<PipelineOrchestrator> {
    let backends = backends_for(&config)
        .await
        .with_context(|| format!("Failed to connect backends for {}", config.service))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = ServicePipeline::new(config, backends, stores.state.clone(), clock);
    Ok(PipelineOrchestrator::new([pipeline], stores.runs.clone()))
}

pub fn validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("Configuration is valid");
    println!("{}", output::config_summary(&config));
    Ok(())
}

pub async fn state(database_url: Option<&str>, service: &str) -> Result<()> {
    let stores = Stores::require(database_url).await?;
    match stores.state.get(service).await? {
        Some(record) => println!("{}", output::deployment_record(&record)),
        None => println!("No known-good artifact recorded for {service}"),
    }
    Ok(())
}

pub async fn rollback(config_path: &Path, service: &str, database_url: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    if config.service != service {
        anyhow::bail!(
            "{} configures service {}, not {service}",
            config_path.display(),
            config.service
        );
    }

    let stores = Stores::require(database_url).await?;
    let orchestrator = orchestrator(config, &stores).await?;
    let result = orchestrator
        .rollback(service)
        .await
        .with_context(|| format!("Rollback of {service} failed"))?;

    println!("✓ Rolled {} back to {}", result.service, result.restored);
    println!("  {}", result.verify.describe());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) const LOCAL_PIPELINE: &str = r#"
pipeline "rates" {
    service "rates"
    source "app"
}

gates threshold="high" {
    check "lint" category="style" {
        run "true"
    }
}

deploy "memory" ready-timeout="1s"
verify interval="10ms" window="0s" timeout="1s"
"#;

    pub(crate) fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        fs::create_dir_all(dir.path().join("app")).unwrap();
        let path = dir.path().join("rollout.kdl");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_source_dir_is_relative_to_config_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, LOCAL_PIPELINE);

        let config = load_config(&path).unwrap();

        assert_eq!(config.source_dir, dir.path().join("app"));
    }

    #[test]
    fn test_missing_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/rollout.kdl")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rollout.kdl"));
    }

    #[tokio::test]
    async fn test_read_only_commands_need_database() {
        let err = state(None, "rates").await.unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
