//! Caller authentication and authorization
//!
//! Two independent mechanisms guard routes:
//! - session cookies, checked by a [`SessionVerifier`]; a missing or invalid
//!   session redirects the caller to the login page
//! - bearer API keys, exchanged by an [`ApiKeyVerifier`] for key metadata
//!   whose scopes are then checked against the route's requirements

pub mod api_key;
pub mod redis;
pub mod session;

pub use api_key::{
    key_digest, ApiKeyRecord, ApiKeyVerification, ApiKeyVerifier, HttpApiKeyVerifier,
    StaticApiKeyVerifier,
};
pub use redis::RedisApiKeyVerifier;
pub use session::{cookie_value, JwtSessionVerifier, SessionIdentity, SessionVerifier};

use crate::config::{ApiKeyBackendConfig, GatewayConfig};
use crate::error::{GatewayError, Result};
use axum::http::{header, HeaderMap};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_SESSION_COOKIE: &str = "session_token";
const DEFAULT_LOGIN_PATH: &str = "/auth/signin";
const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// Who the caller turned out to be
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub api_key: Option<ApiKeyRecord>,
}

impl AuthContext {
    pub fn api_key_id(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.id.as_str())
    }

    /// User from the session, or the key's owning user
    pub fn effective_user_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or_else(|| self.api_key.as_ref().and_then(|k| k.user_id.as_deref()))
    }
}

/// Session and API-key checks used by the dispatcher
pub struct AuthVerifier {
    session: Option<Arc<dyn SessionVerifier>>,
    session_cookie: String,
    login_path: String,
    api_keys: Option<Arc<dyn ApiKeyVerifier>>,
    verify_timeout: Duration,
}

impl Default for AuthVerifier {
    fn default() -> Self {
        Self {
            session: None,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            api_keys: None,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }
}

impl AuthVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the verifiers declared in configuration
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut verifier = Self::new();

        if let Some(session) = &config.session {
            verifier.session_cookie = session.cookie_name.clone();
            verifier.login_path = session.login_path.clone();
            verifier.session = Some(Arc::new(JwtSessionVerifier::new(session)?));
            info!(cookie = %session.cookie_name, "Session verification enabled");
        }

        if let Some(api_keys) = &config.api_keys {
            verifier.verify_timeout = api_keys.timeout();
            let backend: Arc<dyn ApiKeyVerifier> = match &api_keys.backend {
                ApiKeyBackendConfig::Http { url, token } => Arc::new(HttpApiKeyVerifier::new(
                    url.clone(),
                    token.clone(),
                    api_keys.timeout(),
                )?),
                ApiKeyBackendConfig::Static { keys } => {
                    info!(keys = keys.len(), "Loaded static API keys");
                    Arc::new(StaticApiKeyVerifier::new(keys))
                }
                ApiKeyBackendConfig::Redis { url, prefix } => {
                    Arc::new(RedisApiKeyVerifier::connect(url, prefix.clone()).await?)
                }
            };
            verifier.api_keys = Some(backend);
        }

        Ok(verifier)
    }

    pub fn with_session_verifier(mut self, verifier: Arc<dyn SessionVerifier>) -> Self {
        self.session = Some(verifier);
        self
    }

    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = name.into();
        self
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn with_api_key_verifier(mut self, verifier: Arc<dyn ApiKeyVerifier>) -> Self {
        self.api_keys = Some(verifier);
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Login page URL that returns the caller to `callback` afterwards
    pub fn login_url(&self, callback: &str) -> String {
        format!(
            "{}?callbackUrl={}",
            self.login_path,
            urlencoding::encode(callback)
        )
    }

    /// Identity from the session cookie, if one is present and valid
    ///
    /// Used for rate-limit keying on routes that do not require a session.
    /// Verifier faults are treated as "no session" here.
    pub async fn identify_session(&self, headers: &HeaderMap) -> Option<SessionIdentity> {
        let verifier = self.session.as_ref()?;
        let token = cookie_value(headers, &self.session_cookie)?;

        match verifier.verify(token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Session verification failed");
                None
            }
        }
    }

    /// Require a valid session, redirecting to the login page otherwise
    ///
    /// `callback` is the original request URI the caller is sent back to.
    pub async fn authenticate_session(
        &self,
        headers: &HeaderMap,
        callback: &str,
    ) -> Result<SessionIdentity> {
        let verifier = self.session.as_ref().ok_or_else(|| {
            GatewayError::Config(
                "Route requires a session but no session verifier is configured".to_string(),
            )
        })?;

        let identity = match cookie_value(headers, &self.session_cookie) {
            Some(token) => verifier.verify(token).await?,
            None => None,
        };

        identity.ok_or_else(|| {
            debug!(callback = %callback, "No valid session, redirecting to login");
            GatewayError::SessionRequired {
                login_url: self.login_url(callback),
            }
        })
    }

    /// Require a valid bearer API key
    ///
    /// Every call consults the verifier; nothing is cached.
    pub async fn authenticate_api_key(&self, headers: &HeaderMap) -> Result<ApiKeyRecord> {
        let credential = bearer_token(headers)?;

        let verifier = self.api_keys.as_ref().ok_or_else(|| {
            GatewayError::Config(
                "Route requires an API key but no key verifier is configured".to_string(),
            )
        })?;

        let verification = tokio::time::timeout(self.verify_timeout, verifier.verify(credential))
            .await
            .map_err(|_| {
                GatewayError::AuthUnavailable(format!(
                    "Key verification timed out after {:?}",
                    self.verify_timeout
                ))
            })??;

        match verification {
            ApiKeyVerification::Valid(record) if record.is_expired_at(Utc::now()) => {
                debug!(key_id = %record.id, "Rejected expired API key");
                Err(GatewayError::InvalidApiKey("API key has expired".to_string()))
            }
            ApiKeyVerification::Valid(record) => Ok(record),
            ApiKeyVerification::Invalid { reason } => Err(GatewayError::InvalidApiKey(reason)),
        }
    }

    /// Check that the key carries every required scope
    pub fn authorize_scopes(
        &self,
        record: &ApiKeyRecord,
        required: &BTreeSet<String>,
    ) -> Result<()> {
        let missing = record.missing_scopes(required);
        if missing.is_empty() {
            Ok(())
        } else {
            debug!(key_id = %record.id, missing = ?missing, "API key lacks required scopes");
            Err(GatewayError::InsufficientScope { missing })
        }
    }
}

/// Credential from an `Authorization: Bearer <key>` header
pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(GatewayError::ApiKeyMissing)?
        .to_str()
        .map_err(|_| GatewayError::InvalidAuthorizationHeader)?;

    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(GatewayError::InvalidAuthorizationHeader),
    }
}
