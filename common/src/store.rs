// Redis connection manager wrapper for the dedup guard's backing store

use crate::config::RedisConfig;
use crate::errors::DedupError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection pool wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, DedupError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            DedupError::StoreUnavailable(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            DedupError::StoreUnavailable(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection pool initialized successfully");

        Ok(Self { manager })
    }

    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Health check - verify the Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), DedupError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DedupError::StoreUnavailable(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(DedupError::StoreUnavailable(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}
