use crate::config::Config;
use crate::error::BootstrapError;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::time::Duration;

// Database connection pool
pub type DbPool = Pool<Postgres>;

/// Build the pool used by provisioning steps. The pool connects lazily, so it
/// can be created before the readiness gate has passed.
pub fn lazy_pool(config: &Config) -> Result<DbPool, BootstrapError> {
    let options = config.connect_options()?;
    tracing::debug!("🔧 Database pool for {}", config.database_display());

    Ok(PgPoolOptions::new()
        .max_connections(config.database.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_seconds))
        .connect_lazy_with(options))
}

/// True when `name` is safe to splice into SQL as an unquoted identifier.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub mod maintenance;
pub mod probe;
pub mod seed_store;

pub use maintenance::*;
pub use probe::*;
pub use seed_store::*;
