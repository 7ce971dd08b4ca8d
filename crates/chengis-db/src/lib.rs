//! Storage layer for the Chengis CI engine.
//!
//! Repository traits with two implementations: PostgreSQL for the production
//! store and an in-process memory store for development and tests. The
//! durable build queue, event log, advisory-lock leader election, and the
//! local secret backend live here.

pub mod error;
pub mod leader;
pub mod memory;
pub mod repo;
pub mod secret;

pub use error::{DbError, DbResult};
pub use leader::{DevLeaderLock, LeaderLock, PgLeaderLock};
pub use repo::*;
pub use secret::LocalSecretBackend;

use std::sync::Arc;

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

/// The bundle of store interfaces the engine reads through.
#[derive(Clone)]
pub struct Store {
    pub builds: Arc<dyn BuildRepo>,
    pub events: Arc<dyn EventRepo>,
    pub queue: Arc<dyn QueueRepo>,
    pub agents: Arc<dyn AgentRepo>,
    pub approvals: Arc<dyn ApprovalRepo>,
    pub secrets: Arc<dyn SecretRepo>,
    pub leader: Arc<dyn LeaderLock>,
}

impl Store {
    /// Production store over PostgreSQL.
    pub fn production(pool: PgPool) -> Self {
        Self {
            builds: Arc::new(repo::build::PgBuildRepo::new(pool.clone())),
            events: Arc::new(repo::event::PgEventRepo::new(pool.clone())),
            queue: Arc::new(repo::queue::PgQueueRepo::new(pool.clone())),
            agents: Arc::new(repo::agent::PgAgentRepo::new(pool.clone())),
            approvals: Arc::new(repo::approval::PgApprovalRepo::new(pool.clone())),
            secrets: Arc::new(repo::secrets::PgSecretRepo::new(pool.clone())),
            leader: Arc::new(PgLeaderLock::new(pool)),
        }
    }

    /// Development store: in-process, single-node semantics.
    pub fn development() -> Self {
        let mem = Arc::new(memory::MemoryStore::new());
        Self {
            builds: mem.clone(),
            events: mem.clone(),
            queue: mem.clone(),
            agents: mem.clone(),
            approvals: mem.clone(),
            secrets: mem,
            leader: Arc::new(DevLeaderLock::default()),
        }
    }
}
