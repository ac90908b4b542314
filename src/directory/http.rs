use super::source::RouteSource;
use crate::config::{RouteConfig, ServiceMetadata};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Route source that asks a configuration service over HTTP
///
/// - `GET {base}/routes/lookup?path=<path>&method=<METHOD>` returns a route
/// - `GET {base}/services/{id}` returns service metadata
///
/// `404` means "not found"; any other non-success status is a lookup failure.
pub struct HttpRouteSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpRouteSource {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| {
                GatewayError::RouteLookupFailed(format!("Config service request failed: {}", e))
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json::<T>().await.map(Some).map_err(|e| {
                GatewayError::RouteLookupFailed(format!("Invalid config service response: {}", e))
            }),
            status => Err(GatewayError::RouteLookupFailed(format!(
                "Config service returned {}",
                status
            ))),
        }
    }
}

#[async_trait]
impl RouteSource for HttpRouteSource {
    async fn find_route(&self, path: &str, method: &str) -> Result<Option<RouteConfig>> {
        debug!(path = %path, method = %method, "Looking up route from config service");

        let request = self
            .client
            .get(format!("{}/routes/lookup", self.base_url))
            .query(&[("path", path), ("method", method)]);

        let route: Option<RouteConfig> = self.fetch(request).await?;
        Ok(route.filter(|r| r.is_active))
    }

    async fn find_service(&self, id: &str) -> Result<Option<ServiceMetadata>> {
        let request = self.client.get(format!(
            "{}/services/{}",
            self.base_url,
            urlencoding::encode(id)
        ));
        self.fetch(request).await
    }
}
