use crate::config::StaticApiKey;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

/// Key metadata returned by a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "user")]
    pub user_id: Option<String>,
    #[serde(default, alias = "service")]
    pub service_id: Option<String>,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Required scopes this key does not carry
    pub fn missing_scopes(&self, required: &BTreeSet<String>) -> Vec<String> {
        required.difference(&self.scopes).cloned().collect()
    }
}

impl From<&StaticApiKey> for ApiKeyRecord {
    fn from(key: &StaticApiKey) -> Self {
        Self {
            id: key.id.clone(),
            scopes: key.scopes.clone(),
            rate_limit: key.rate_limit,
            expires_at: key.expires_at,
            user_id: key.user_id.clone(),
            service_id: key.service_id.clone(),
        }
    }
}

/// Result of exchanging a bearer credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyVerification {
    Valid(ApiKeyRecord),
    Invalid { reason: String },
}

impl ApiKeyVerification {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ApiKeyVerification::Invalid {
            reason: reason.into(),
        }
    }
}

/// Exchanges a bearer credential for key metadata
///
/// Implementations must consult their backing store on every call; validity
/// is never cached because keys can be revoked at any time. `Err` means the
/// verifier itself could not answer.
#[async_trait]
pub trait ApiKeyVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<ApiKeyVerification>;
}

/// Hex SHA-256 digest under which keys are stored
pub fn key_digest(credential: &str) -> String {
    format!("{:x}", Sha256::digest(credential.as_bytes()))
}

/// Verifier over keys declared in configuration
pub struct StaticApiKeyVerifier {
    keys: HashMap<String, ApiKeyRecord>,
}

impl StaticApiKeyVerifier {
    pub fn new(keys: &[StaticApiKey]) -> Self {
        let keys = keys
            .iter()
            .map(|k| (key_digest(k.key.expose_secret()), ApiKeyRecord::from(k)))
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl ApiKeyVerifier for StaticApiKeyVerifier {
    async fn verify(&self, credential: &str) -> Result<ApiKeyVerification> {
        Ok(match self.keys.get(&key_digest(credential)) {
            Some(record) => ApiKeyVerification::Valid(record.clone()),
            None => ApiKeyVerification::invalid("Invalid API key"),
        })
    }
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    key: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    key: Option<ApiKeyRecord>,
    #[serde(default)]
    error: Option<String>,
}

/// Verifier backed by an external verification endpoint
///
/// Sends `POST <url>` with `{"key": "<credential>"}` and expects
/// `{"valid": bool, "key": {...}, "error": "..."}`. A rejection may come with a
/// non-2xx status as long as the body has that shape.
pub struct HttpApiKeyVerifier {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpApiKeyVerifier {
    pub fn new(url: String, token: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl ApiKeyVerifier for HttpApiKeyVerifier {
    async fn verify(&self, credential: &str) -> Result<ApiKeyVerification> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&VerifyRequest { key: credential });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::AuthUnavailable(format!("Key verification failed: {}", e)))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            GatewayError::AuthUnavailable(format!("Failed to read verification response: {}", e))
        })?;

        let parsed: VerifyResponse = serde_json::from_slice(&body).map_err(|e| {
            GatewayError::AuthUnavailable(format!(
                "Unexpected verification response (status {}): {}",
                status, e
            ))
        })?;

        debug!(status = %status, valid = parsed.valid, "API key verification answered");

        match parsed {
            VerifyResponse {
                valid: true,
                key: Some(record),
                ..
            } => Ok(ApiKeyVerification::Valid(record)),
            VerifyResponse { valid: true, .. } => Err(GatewayError::AuthUnavailable(
                "Verification response marked key valid without key metadata".to_string(),
            )),
            VerifyResponse { error, .. } => Ok(ApiKeyVerification::invalid(
                error.unwrap_or_else(|| "Invalid API key".to_string()),
            )),
        }
    }
}
