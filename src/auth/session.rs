use crate::config::SessionConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

/// Identity attached to a valid session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
}

/// Decides whether a session token is valid
///
/// `Ok(None)` means the token is not a valid session; `Err` means the
/// verifier could not decide.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<SessionIdentity>>;
}

/// Session token claims
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Session verifier for HMAC-signed JWT session cookies
pub struct JwtSessionVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtSessionVerifier {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm.to_uppercase()).map_err(|_| {
            GatewayError::Config(format!(
                "Unsupported session token algorithm: {}",
                config.algorithm
            ))
        })?;

        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(GatewayError::Config(format!(
                "Session tokens must use an HMAC algorithm, got {}",
                config.algorithm
            )));
        }

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.secret.expose_secret().as_bytes()),
            validation,
        })
    }
}

#[async_trait]
impl SessionVerifier for JwtSessionVerifier {
    async fn verify(&self, token: &str) -> Result<Option<SessionIdentity>> {
        match decode::<SessionClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(Some(SessionIdentity {
                user_id: data.claims.sub,
            })),
            Err(e) => {
                debug!(error = %e, "Session token rejected");
                Ok(None)
            }
        }
    }
}

/// Value of the named cookie, if the request carries it
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use secrecy::SecretString;

    fn session_config() -> SessionConfig {
        SessionConfig {
            cookie_name: "session_token".to_string(),
            secret: SecretString::new("test-secret".to_string()),
            algorithm: "HS256".to_string(),
            issuer: None,
            audience: None,
            login_path: "/auth/signin".to_string(),
        }
    }

    fn token(secret: &str, sub: &str, exp_offset: i64) -> String {
        let claims = SessionClaims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
            iss: None,
            aud: None,
            extra: HashMap::new(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_session() {
        let verifier = JwtSessionVerifier::new(&session_config()).unwrap();
        let identity = verifier
            .verify(&token("test-secret", "user-1", 3600))
            .await
            .unwrap();
        assert_eq!(
            identity,
            Some(SessionIdentity {
                user_id: "user-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_wrong_secret_and_expired_sessions() {
        let verifier = JwtSessionVerifier::new(&session_config()).unwrap();
        assert_eq!(
            verifier.verify(&token("other-secret", "user-1", 3600)).await.unwrap(),
            None
        );
        assert_eq!(
            verifier.verify(&token("test-secret", "user-1", -3600)).await.unwrap(),
            None
        );
        assert_eq!(verifier.verify("not-a-jwt").await.unwrap(), None);
    }

    #[test]
    fn test_rejects_asymmetric_algorithm() {
        let mut config = session_config();
        config.algorithm = "RS256".to_string();
        assert!(JwtSessionVerifier::new(&config).is_err());
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_token=abc.def.ghi; empty="),
        );

        assert_eq!(cookie_value(&headers, "session_token"), Some("abc.def.ghi"));
        assert_eq!(cookie_value(&headers, "theme"), Some("dark"));
        assert_eq!(cookie_value(&headers, "empty"), None);
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
