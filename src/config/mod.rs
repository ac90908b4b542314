use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Request pipeline settings
    #[serde(default)]
    pub gateway: PipelineConfig,
    /// Session cookie verification
    #[serde(default)]
    pub session: Option<SessionConfig>,
    /// API key verification backend
    #[serde(default)]
    pub api_keys: Option<ApiKeyConfig>,
    /// Audit log emission
    #[serde(default)]
    pub audit: AuditConfig,
    /// Where route definitions come from
    #[serde(default)]
    pub route_source: RouteSourceConfig,
    /// OpenTelemetry export
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    /// Config file watching
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
    /// Route definitions (static route source)
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Service definitions (static route source)
    #[serde(default)]
    pub services: Vec<ServiceMetadata>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Settings that shape the per-request pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Prefix stripped from inbound paths before route lookup
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Paths under this prefix always require an API key
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: Option<String>,
    /// Paths under these prefixes bypass the pipeline entirely
    #[serde(default = "default_internal_prefixes")]
    pub internal_prefixes: Vec<String>,
    /// Where bypassed and non-API traffic is forwarded, if anywhere
    #[serde(default)]
    pub passthrough_url: Option<String>,
    /// Limit applied when neither route, key nor service declares one
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Number of rate limit checks between sweeps of expired windows
    #[serde(default = "default_rate_limit_sweep_interval")]
    pub rate_limit_sweep_interval: u64,
    #[serde(default = "default_route_cache_ttl_ms")]
    pub route_cache_ttl_ms: u64,
    #[serde(default = "default_route_cache_capacity")]
    pub route_cache_capacity: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout_ms: u64,
    /// Take the client address from the first `X-Forwarded-For` hop
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

/// Session cookie configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Secret used to verify HS* signed session tokens
    pub secret: SecretString,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Where unauthenticated dashboard callers are sent
    #[serde(default = "default_login_path")]
    pub login_path: String,
}

/// API key verification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// Upper bound on one verification call
    #[serde(default = "default_verify_timeout_ms")]
    pub timeout_ms: u64,
    pub backend: ApiKeyBackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApiKeyBackendConfig {
    /// Exchange the credential with an external verification endpoint
    Http {
        url: String,
        #[serde(default)]
        token: Option<SecretString>,
    },
    /// Keys declared inline
    Static {
        #[serde(default)]
        keys: Vec<StaticApiKey>,
    },
    /// Key records stored in Redis under `<prefix><sha256(key)>`
    Redis {
        url: String,
        #[serde(default = "default_redis_prefix")]
        prefix: String,
    },
}

/// An API key declared in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct StaticApiKey {
    pub key: SecretString,
    pub id: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub service_id: Option<String>,
}

/// Audit log configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Records buffered between the request path and the writer
    #[serde(default = "default_audit_buffer")]
    pub buffer_size: usize,
    /// Extra delivery attempts after a failed write
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub sink: AuditSinkConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuditSinkConfig {
    /// Emit records as structured tracing events
    #[default]
    Tracing,
    /// POST records to a collector
    Http {
        url: String,
        #[serde(default)]
        token: Option<SecretString>,
        #[serde(default = "default_audit_timeout_ms")]
        timeout_ms: u64,
    },
}

/// Route source configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RouteSourceConfig {
    /// Routes and services from this file
    #[default]
    Static,
    /// Routes and services fetched from a config endpoint
    Http {
        url: String,
        #[serde(default)]
        token: Option<SecretString>,
    },
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

/// Hot reload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Debounce delay in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// One forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    /// Path relative to the API prefix (e.g. "/users")
    pub path: String,
    pub method: String,
    #[serde(alias = "targetUrl")]
    pub target_url: String,
    #[serde(default = "default_true", alias = "isActive")]
    pub is_active: bool,
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: Option<u32>,
    /// Seconds, drives `Cache-Control` on responses
    #[serde(default, alias = "cacheTtl")]
    pub cache_ttl: Option<u64>,
    #[serde(default)]
    pub middleware: MiddlewareSpec,
    #[serde(default, alias = "serviceId")]
    pub service_id: Option<String>,
}

/// Recognised middleware kinds for a route
///
/// Deserialized from the loose `{auth, apiKey, requiredScopes, cors}` shape;
/// anything absent means "not required". Declaring scopes implies API key mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawMiddlewareSpec")]
pub struct MiddlewareSpec {
    pub require_session: bool,
    pub api_key: Option<ApiKeyPolicy>,
    pub cors: Option<CorsPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeyPolicy {
    pub required_scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    pub origin: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMiddlewareSpec {
    #[serde(default)]
    auth: bool,
    #[serde(default, alias = "api_key")]
    api_key: bool,
    #[serde(default, alias = "required_scopes")]
    required_scopes: BTreeSet<String>,
    #[serde(default)]
    cors: Option<RawCors>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCors {
    #[serde(default)]
    origin: Option<String>,
}

impl From<RawMiddlewareSpec> for MiddlewareSpec {
    fn from(raw: RawMiddlewareSpec) -> Self {
        let api_key = if raw.api_key || !raw.required_scopes.is_empty() {
            Some(ApiKeyPolicy {
                required_scopes: raw.required_scopes,
            })
        } else {
            None
        };

        Self {
            require_session: raw.auth,
            api_key,
            cors: raw.cors.map(|c| CorsPolicy {
                origin: c.origin.unwrap_or_else(|| "*".to_string()),
            }),
        }
    }
}

/// Per-backend auth material and defaults
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceMetadata {
    pub id: String,
    /// Header the backend expects its credential in
    #[serde(default, alias = "authHeader")]
    pub auth_header: Option<String>,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<SecretString>,
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_api_key_prefix() -> Option<String> {
    Some("/api/gateway".to_string())
}

fn default_internal_prefixes() -> Vec<String> {
    vec!["/api/auth".to_string(), "/api/internal".to_string()]
}

fn default_rate_limit() -> u32 {
    100
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_sweep_interval() -> u64 {
    1024
}

fn default_route_cache_ttl_ms() -> u64 {
    5_000
}

fn default_route_cache_capacity() -> u64 {
    10_000
}

fn default_lookup_timeout_ms() -> u64 {
    2_000
}

fn default_proxy_timeout_ms() -> u64 {
    5_000
}

fn default_cookie_name() -> String {
    "session_token".to_string()
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_login_path() -> String {
    "/auth/signin".to_string()
}

fn default_verify_timeout_ms() -> u64 {
    3_000
}

fn default_redis_prefix() -> String {
    "gateway:apikey:".to_string()
}

fn default_audit_buffer() -> usize {
    1024
}

fn default_audit_timeout_ms() -> u64 {
    2_000
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "gatekeeper".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            api_key_prefix: default_api_key_prefix(),
            internal_prefixes: default_internal_prefixes(),
            passthrough_url: None,
            default_rate_limit: default_rate_limit(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_sweep_interval: default_rate_limit_sweep_interval(),
            route_cache_ttl_ms: default_route_cache_ttl_ms(),
            route_cache_capacity: default_route_cache_capacity(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            proxy_timeout_ms: default_proxy_timeout_ms(),
            trust_forwarded_for: true,
        }
    }
}

impl PipelineConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn route_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.route_cache_ttl_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: default_audit_buffer(),
            max_retries: 0,
            sink: AuditSinkConfig::default(),
        }
    }
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl ApiKeyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

const VALID_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

impl GatewayConfig {
    /// Load configuration from a YAML file, with `GATEWAY__SECTION__KEY`
    /// environment variables taking precedence
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let gateway = &self.gateway;

        if !gateway.api_prefix.starts_with('/') || gateway.api_prefix.ends_with('/') {
            return Err(GatewayError::Config(format!(
                "API prefix must start with '/' and not end with one: {}",
                gateway.api_prefix
            )));
        }
        if gateway.rate_limit_window_secs == 0 {
            return Err(GatewayError::Config(
                "Rate limit window must be > 0".to_string(),
            ));
        }
        if gateway.route_cache_ttl_ms == 0 {
            return Err(GatewayError::Config(
                "Route cache TTL must be > 0".to_string(),
            ));
        }
        if gateway.lookup_timeout_ms == 0 || gateway.proxy_timeout_ms == 0 {
            return Err(GatewayError::Config("Timeouts must be > 0".to_string()));
        }
        if let Some(url) = &gateway.passthrough_url {
            validate_http_url(url, "passthrough_url")?;
        }

        if let Some(session) = &self.session {
            if !session.algorithm.to_uppercase().starts_with("HS") {
                return Err(GatewayError::Config(format!(
                    "Unsupported session token algorithm: {}",
                    session.algorithm
                )));
            }
        }

        if let Some(api_keys) = &self.api_keys {
            match &api_keys.backend {
                ApiKeyBackendConfig::Http { url, .. } => {
                    validate_http_url(url, "api_keys.backend.url")?
                }
                ApiKeyBackendConfig::Static { keys } => {
                    let mut ids = HashSet::new();
                    for key in keys {
                        if !ids.insert(key.id.as_str()) {
                            return Err(GatewayError::Config(format!(
                                "Duplicate API key id: {}",
                                key.id
                            )));
                        }
                    }
                }
                ApiKeyBackendConfig::Redis { url, .. } => {
                    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                        return Err(GatewayError::Config(format!(
                            "Redis URL must start with redis:// or rediss://: {}",
                            url
                        )));
                    }
                }
            }
        }

        if self.audit.buffer_size == 0 {
            return Err(GatewayError::Config(
                "Audit buffer size must be > 0".to_string(),
            ));
        }
        if let AuditSinkConfig::Http { url, .. } = &self.audit.sink {
            validate_http_url(url, "audit.sink.url")?;
        }
        if let RouteSourceConfig::Http { url, .. } = &self.route_source {
            validate_http_url(url, "route_source.url")?;
        }

        let service_ids: HashSet<&str> = self.services.iter().map(|s| s.id.as_str()).collect();
        if service_ids.len() != self.services.len() {
            return Err(GatewayError::Config("Duplicate service id".to_string()));
        }

        let mut route_ids = HashSet::new();
        let mut active_keys = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                return Err(GatewayError::Config(format!(
                    "Route id cannot be empty for route: {}",
                    route.path
                )));
            }
            if !route_ids.insert(route.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate route id: {}",
                    route.id
                )));
            }
            if !route.path.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "Route path must start with '/': {}",
                    route.path
                )));
            }

            let method = route.method.to_uppercase();
            if !VALID_METHODS.contains(&method.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Invalid HTTP method '{}' for route: {}",
                    route.method, route.path
                )));
            }

            validate_http_url(&route.target_url, &format!("target_url of route {}", route.id))?;

            if let Some(service_id) = &route.service_id {
                if matches!(self.route_source, RouteSourceConfig::Static)
                    && !service_ids.contains(service_id.as_str())
                {
                    return Err(GatewayError::Config(format!(
                        "Route {} references unknown service: {}",
                        route.id, service_id
                    )));
                }
            }

            if route.is_active && !active_keys.insert((method, route.path.clone())) {
                return Err(GatewayError::Config(format!(
                    "Duplicate active route for {} {}",
                    route.method, route.path
                )));
            }
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: PipelineConfig::default(),
            session: None,
            api_keys: None,
            audit: AuditConfig::default(),
            route_source: RouteSourceConfig::default(),
            telemetry: None,
            hot_reload: HotReloadConfig::default(),
            routes: vec![],
            services: vec![],
        }
    }
}

fn validate_http_url(value: &str, field: &str) -> Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(GatewayError::Config(format!(
            "{} must start with http:// or https://: {}",
            field, value
        )));
    }
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| GatewayError::Config(format!("{} is not a valid URL: {}", field, e)))
}
