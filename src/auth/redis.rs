use super::api_key::{key_digest, ApiKeyRecord, ApiKeyVerification, ApiKeyVerifier};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};

/// Verifier reading key records from Redis
///
/// Records are stored as JSON `ApiKeyRecord` values under
/// `<prefix><sha256(key)>`, so plaintext keys never reach the store.
pub struct RedisApiKeyVerifier {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisApiKeyVerifier {
    /// Connect to Redis
    pub async fn connect(url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Config(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Config(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self { connection, prefix })
    }

    fn storage_key(&self, credential: &str) -> String {
        format!("{}{}", self.prefix, key_digest(credential))
    }
}

#[async_trait]
impl ApiKeyVerifier for RedisApiKeyVerifier {
    async fn verify(&self, credential: &str) -> Result<ApiKeyVerification> {
        let mut conn = self.connection.clone();

        let stored: Option<String> = conn
            .get(self.storage_key(credential))
            .await
            .map_err(|e| GatewayError::AuthUnavailable(format!("Redis error: {}", e)))?;

        match stored {
            Some(json) => {
                let record: ApiKeyRecord = serde_json::from_str(&json).map_err(|e| {
                    GatewayError::AuthUnavailable(format!("Corrupt key record in Redis: {}", e))
                })?;
                Ok(ApiKeyVerification::Valid(record))
            }
            None => Ok(ApiKeyVerification::invalid("Invalid API key")),
        }
    }
}
