//! Configuration for the database pool of the Postgres store
//!
//! - `DATABASE_URL`: The URL of the postgres database to use.
//! - `DB_POOL_SIZE`: The maximum number of connections in the pool.

use diesel_async::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::deadpool::Pool;
use lease_queue_env_vars::{required_var, var_parsed_or};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    const DEFAULT_POOL_SIZE: usize = 10;

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: SecretString::from(url.into()),
            pool_size: Self::DEFAULT_POOL_SIZE,
        }
    }

    pub fn from_environment() -> anyhow::Result<Self> {
        let url = required_var("DATABASE_URL")?;
        let pool_size = var_parsed_or("DB_POOL_SIZE", Self::DEFAULT_POOL_SIZE)?;

        Ok(Self {
            url: url.into(),
            pool_size,
        })
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builds the connection pool. Connections are established lazily.
    pub fn build_pool(&self) -> anyhow::Result<Pool<AsyncPgConnection>> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
            self.url.expose_secret(),
        );

        Ok(Pool::builder(manager).max_size(self.pool_size).build()?)
    }
}
