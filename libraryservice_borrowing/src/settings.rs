use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use libraryservice_store::data_store::PostgresDataStoreConfig;

/// Service settings, read from environment variables such as `DB_HOST` or `HTTP_PORT`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppSettings {
    pub use_in_memory_db: bool,
    pub db_host: String,
    pub db_username: String,
    pub db_password: String,
    pub db_operation_timeout_ms: u64,
    pub db_poll_interval_ms: u64,
    pub http_port: u16,
}

impl AppSettings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::default())
    }

    fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("use_in_memory_db", false)?
            .set_default("db_host", "127.0.0.1")?
            .set_default("db_username", "postgres")?
            .set_default("db_password", "postgres")?
            .set_default("db_operation_timeout_ms", 5000)?
            .set_default("db_poll_interval_ms", 1000)?
            .set_default("http_port", 8080)?
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn store_config(&self) -> PostgresDataStoreConfig {
        PostgresDataStoreConfig {
            hostname: self.db_host.clone(),
            username: self.db_username.clone(),
            password: self.db_password.clone(),
            operation_timeout: Duration::from_millis(self.db_operation_timeout_ms),
            poll_interval: Duration::from_millis(self.db_poll_interval_ms),
        }
    }
}
