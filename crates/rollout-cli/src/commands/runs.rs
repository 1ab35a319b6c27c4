//! Run record queries.

use anyhow::{Context, Result};
use rollout_core::RunId;

use super::Stores;
use crate::output;

pub async fn list(database_url: Option<&str>, service: &str, limit: usize) -> Result<()> {
    let stores = Stores::require(database_url).await?;
    let runs = stores.runs.list_for_service(service, limit).await?;

    if runs.is_empty() {
        println!("No runs recorded for {service}");
        return Ok(());
    }
    for run in &runs {
        println!("{}", output::run_line(run));
    }
    Ok(())
}

pub async fn show(database_url: Option<&str>, id: &str, json: bool) -> Result<()> {
    let run_id: RunId = id.parse().with_context(|| format!("Invalid run ID: {id}"))?;
    let stores = Stores::require(database_url).await?;
    let run = stores.runs.get(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!("{}", output::run_report(&run));
    }
    Ok(())
}
