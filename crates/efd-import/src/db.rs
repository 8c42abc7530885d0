//! Postgres pool and migrations

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

/// Connections of the importer show up under this name in `pg_stat_activity`
pub const APPLICATION_NAME: &str = "efd-import";

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Database configuration error: {0}. Check DATABASE_URL and DB_* settings.")]
    Config(String),
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    /// `None` keeps idle connections forever
    pub idle_timeout_secs: Option<u64>,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// `DATABASE_URL` is required; `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`,
    /// `DB_CONNECT_TIMEOUT` and `DB_IDLE_TIMEOUT` (`0` disables) are optional
    pub fn from_env() -> DbResult<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| DbError::Config("DATABASE_URL not set".to_string()))?;
        let mut config = Self::new(url);

        if let Some(max) = env_number("DB_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(min) = env_number("DB_MIN_CONNECTIONS")? {
            config.min_connections = min;
        }
        if let Some(timeout) = env_number("DB_CONNECT_TIMEOUT")? {
            config.connect_timeout_secs = timeout;
        }
        if let Some(idle) = env_number::<u64>("DB_IDLE_TIMEOUT")? {
            config.idle_timeout_secs = (idle > 0).then_some(idle);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_connections == 0 {
            return Err(DbError::Config("DB_MAX_CONNECTIONS must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::Config(format!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

fn env_number<T: FromStr>(key: &str) -> DbResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DbError::Config(format!("{} is not a valid number: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

pub async fn create_pool(config: &DbConfig) -> DbResult<PgPool> {
    let connect = PgConnectOptions::from_str(&config.url)?.application_name(APPLICATION_NAME);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(config.idle_timeout_secs.map(Duration::from_secs))
        .connect_with(connect)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Apply the workspace migrations
pub async fn migrate(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "DB_MAX_CONNECTIONS",
            "DB_MIN_CONNECTIONS",
            "DB_CONNECT_TIMEOUT",
            "DB_IDLE_TIMEOUT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_new_uses_defaults() {
        let config = DbConfig::new("postgresql://localhost/efd");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.min_connections, DEFAULT_MIN_CONNECTIONS);
        assert_eq!(config.idle_timeout_secs, Some(DEFAULT_IDLE_TIMEOUT_SECS));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        std::env::set_var("DB_MAX_CONNECTIONS", "15");
        std::env::set_var("DB_IDLE_TIMEOUT", "0");

        let config = DbConfig::from_env().unwrap();
        assert_eq!(config.max_connections, 15);
        assert_eq!(config.idle_timeout_secs, None);
        assert!(config.url.contains("localhost/test"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env_rejects_bad_values() {
        clear_env();
        assert!(matches!(DbConfig::from_env(), Err(DbError::Config(_))));

        std::env::set_var("DATABASE_URL", "postgresql://localhost/test");
        std::env::set_var("DB_MAX_CONNECTIONS", "many");
        assert!(DbConfig::from_env().is_err());

        std::env::set_var("DB_MAX_CONNECTIONS", "2");
        std::env::set_var("DB_MIN_CONNECTIONS", "5");
        assert!(DbConfig::from_env().is_err());

        clear_env();
    }
}
