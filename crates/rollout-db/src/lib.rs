//! Storage for rollout.
//!
//! Run records and deployment state, in PostgreSQL or in memory. Both
//! implement the `RunStore` and `DeploymentStateStore` traits from
//! `rollout-core` with the same semantics.

pub mod error;
pub mod memory;
pub mod runs;
pub mod state;

pub use error::{DbError, DbResult};
pub use memory::{MemoryDeploymentState, MemoryRunStore};
pub use runs::PgRunStore;
pub use state::PgDeploymentState;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
