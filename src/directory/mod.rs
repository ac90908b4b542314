//! Route resolution with a short-lived cache
//!
//! Inbound paths are stripped of the API prefix and percent-decoded, then
//! looked up by `(METHOD, path)`. Found routes are cached for a short TTL so
//! configuration changes propagate quickly; misses are never cached.

pub mod http;
pub mod source;

pub use http::HttpRouteSource;
pub use source::{RouteSource, RouteTable, StaticRouteSource};

use crate::config::{PipelineConfig, RouteConfig, ServiceMetadata};
use crate::error::{GatewayError, Result};
use axum::http::Method;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum LookupMiss {
    NotFound,
    Failed(String),
}

/// Resolves inbound requests to route configurations
pub struct RouteDirectory {
    source: Arc<dyn RouteSource>,
    routes: Cache<String, Arc<RouteConfig>>,
    services: Cache<String, Arc<ServiceMetadata>>,
    api_prefix: String,
    lookup_timeout: Duration,
}

impl RouteDirectory {
    pub fn new(source: Arc<dyn RouteSource>, config: &PipelineConfig) -> Self {
        let routes = Cache::builder()
            .max_capacity(config.route_cache_capacity)
            .time_to_live(config.route_cache_ttl())
            .build();
        let services = Cache::builder()
            .max_capacity(config.route_cache_capacity)
            .time_to_live(config.route_cache_ttl())
            .build();

        info!(
            api_prefix = %config.api_prefix,
            ttl_ms = config.route_cache_ttl_ms,
            capacity = config.route_cache_capacity,
            "Initialized route directory"
        );

        Self {
            source,
            routes,
            services,
            api_prefix: config.api_prefix.trim_end_matches('/').to_string(),
            lookup_timeout: config.lookup_timeout(),
        }
    }

    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    /// Path relative to the API prefix, still percent-encoded
    ///
    /// `None` when the path is not under the prefix.
    pub fn strip_prefix<'a>(&self, raw_path: &'a str) -> Option<&'a str> {
        let rest = raw_path.strip_prefix(self.api_prefix.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Lookup key for a raw request path
    pub fn normalize(&self, raw_path: &str) -> Option<String> {
        let stripped = self.strip_prefix(raw_path)?;
        Some(match urlencoding::decode(stripped) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => stripped.to_string(),
        })
    }

    /// Resolve the active route for a request
    pub async fn resolve(&self, raw_path: &str, method: &Method) -> Result<Arc<RouteConfig>> {
        let path = self.normalize(raw_path).ok_or_else(|| GatewayError::RouteNotFound {
            method: method.to_string(),
            path: raw_path.to_string(),
        })?;
        let key = format!("{}:{}", method, path);

        if let Some(route) = self.routes.get(&key).await {
            crate::metrics::record_route_cache(true);
            return Ok(route);
        }
        crate::metrics::record_route_cache(false);

        let lookup = async {
            let found = tokio::time::timeout(
                self.lookup_timeout,
                self.source.find_route(&path, method.as_str()),
            )
            .await
            .map_err(|_| {
                LookupMiss::Failed(format!(
                    "Route lookup timed out after {:?}",
                    self.lookup_timeout
                ))
            })?
            .map_err(|e| LookupMiss::Failed(e.to_string()))?;

            match found {
                Some(route) => {
                    debug!(route_id = %route.id, path = %path, method = %method, "Route loaded");
                    Ok(Arc::new(route))
                }
                None => Err(LookupMiss::NotFound),
            }
        };

        self.routes
            .try_get_with(key, lookup)
            .await
            .map_err(|miss| match miss.as_ref() {
                LookupMiss::NotFound => GatewayError::RouteNotFound {
                    method: method.to_string(),
                    path: path.clone(),
                },
                LookupMiss::Failed(reason) => {
                    warn!(path = %path, method = %method, error = %reason, "Route lookup failed");
                    GatewayError::RouteLookupFailed(reason.clone())
                }
            })
    }

    /// Service metadata for a route's backend
    ///
    /// Lookup faults degrade to `None` so route-level settings still apply.
    pub async fn service(&self, id: &str) -> Option<Arc<ServiceMetadata>> {
        let lookup = async {
            let found = tokio::time::timeout(self.lookup_timeout, self.source.find_service(id))
                .await
                .map_err(|_| LookupMiss::Failed("Service lookup timed out".to_string()))?
                .map_err(|e| LookupMiss::Failed(e.to_string()))?;
            found.map(Arc::new).ok_or(LookupMiss::NotFound)
        };

        match self.services.try_get_with(id.to_string(), lookup).await {
            Ok(service) => Some(service),
            Err(miss) => {
                match miss.as_ref() {
                    LookupMiss::NotFound => debug!(service_id = %id, "Unknown service"),
                    LookupMiss::Failed(reason) => {
                        warn!(service_id = %id, error = %reason, "Service lookup failed")
                    }
                }
                None
            }
        }
    }

    /// Drop all cached routes and services
    pub fn invalidate(&self) {
        self.routes.invalidate_all();
        self.services.invalidate_all();
        info!("Invalidated route directory cache");
    }
}
