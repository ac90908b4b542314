use crate::config::{RouteConfig, ServiceMetadata};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Authoritative store of routes and services
///
/// `find_route` only returns active routes. `Ok(None)` means "no such
/// route"; `Err` means the store could not be consulted.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn find_route(&self, path: &str, method: &str) -> Result<Option<RouteConfig>>;

    async fn find_service(&self, id: &str) -> Result<Option<ServiceMetadata>>;
}

/// Immutable snapshot of active routes and known services
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<(String, String), RouteConfig>,
    services: HashMap<String, ServiceMetadata>,
}

impl RouteTable {
    /// Build a table, dropping inactive routes
    pub fn new(routes: Vec<RouteConfig>, services: Vec<ServiceMetadata>) -> Self {
        let routes = routes
            .into_iter()
            .filter(|r| r.is_active)
            .map(|r| ((r.method.to_uppercase(), r.path.clone()), r))
            .collect();
        let services = services.into_iter().map(|s| (s.id.clone(), s)).collect();

        Self { routes, services }
    }

    pub fn route(&self, path: &str, method: &str) -> Option<&RouteConfig> {
        self.routes.get(&(method.to_uppercase(), path.to_string()))
    }

    pub fn service(&self, id: &str) -> Option<&ServiceMetadata> {
        self.services.get(id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Route source backed by configuration, swappable at runtime
#[derive(Default)]
pub struct StaticRouteSource {
    table: RwLock<Arc<RouteTable>>,
}

impl StaticRouteSource {
    pub fn new(routes: Vec<RouteConfig>, services: Vec<ServiceMetadata>) -> Self {
        Self {
            table: RwLock::new(Arc::new(RouteTable::new(routes, services))),
        }
    }

    /// Swap in a new table; in-flight lookups finish against the old one
    pub async fn replace(&self, table: RouteTable) {
        info!(
            routes = table.route_count(),
            services = table.service_count(),
            "Replaced route table"
        );
        *self.table.write().await = Arc::new(table);
    }

    pub async fn snapshot(&self) -> Arc<RouteTable> {
        self.table.read().await.clone()
    }
}

#[async_trait]
impl RouteSource for StaticRouteSource {
    async fn find_route(&self, path: &str, method: &str) -> Result<Option<RouteConfig>> {
        Ok(self.snapshot().await.route(path, method).cloned())
    }

    async fn find_service(&self, id: &str) -> Result<Option<ServiceMetadata>> {
        Ok(self.snapshot().await.service(id).cloned())
    }
}
