//! Request pipeline
//!
//! Every request that reaches the fallback handler goes through:
//!
//! 1. skip-internal: paths outside the API prefix, or under an internal
//!    prefix, bypass the pipeline and are passed through (or 404)
//! 2. resolve the route
//! 3. authenticate (session, then API key)
//! 4. authorize API key scopes
//! 5. rate limit
//! 6. forward to the backend and overlay gateway headers
//! 7. audit log
//!
//! Any step may end the request early; the audit record is still written.

use crate::audit::{AuditGuard, AuditLogger, RequestDraft};
use crate::auth::AuthContext;
use crate::config::{GatewayConfig, PipelineConfig, RouteSourceConfig};
use crate::directory::{HttpRouteSource, RouteDirectory, RouteSource, StaticRouteSource};
use crate::error::{GatewayError, Result};
use crate::observability::{RequestId, REQUEST_ID_HEADER};
use crate::proxy::{ForwardRequest, RequestProxy, FORWARDED_FOR_HEADER};
use crate::rate_limit::{
    apply_rate_limit_headers, resolve_limit, FixedWindowLimiter, RateLimitDecision,
    RateLimitIdentity,
};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared state for the gateway handler
#[derive(Clone)]
pub struct GatewayState {
    pub settings: Arc<PipelineConfig>,
    pub directory: Arc<RouteDirectory>,
    pub auth: Arc<crate::auth::AuthVerifier>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub proxy: RequestProxy,
    pub audit: AuditLogger,
    /// Present when routes come from the config file, for hot reload
    pub static_source: Option<Arc<StaticRouteSource>>,
}

impl GatewayState {
    /// Assemble state from explicit components
    pub fn new(
        settings: PipelineConfig,
        source: Arc<dyn RouteSource>,
        auth: crate::auth::AuthVerifier,
        audit: AuditLogger,
    ) -> Result<Self> {
        let directory = RouteDirectory::new(source, &settings);
        let limiter = FixedWindowLimiter::new(settings.rate_limit_window())
            .with_sweep_interval(settings.rate_limit_sweep_interval);
        let proxy = RequestProxy::new(settings.proxy_timeout())?;

        Ok(Self {
            settings: Arc::new(settings),
            directory: Arc::new(directory),
            auth: Arc::new(auth),
            limiter: Arc::new(limiter),
            proxy,
            audit,
            static_source: None,
        })
    }

    /// Build every component described by configuration
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let (source, static_source): (Arc<dyn RouteSource>, Option<Arc<StaticRouteSource>>) =
            match &config.route_source {
                RouteSourceConfig::Static => {
                    let source = Arc::new(StaticRouteSource::new(
                        config.routes.clone(),
                        config.services.clone(),
                    ));
                    info!(
                        routes = config.routes.len(),
                        services = config.services.len(),
                        "Loaded static routes"
                    );
                    (source.clone(), Some(source))
                }
                RouteSourceConfig::Http { url, token } => {
                    info!(url = %url, "Resolving routes from config service");
                    (Arc::new(HttpRouteSource::new(url.clone(), token.clone())?), None)
                }
            };

        let auth = crate::auth::AuthVerifier::from_config(config).await?;
        let audit = AuditLogger::from_config(&config.audit)?;

        let mut state = Self::new(config.gateway.clone(), source, auth, audit)?;
        state.static_source = static_source;
        Ok(state)
    }

    /// Percent-decoded absolute path, or `None` outside the API prefix
    ///
    /// Prefix policies are matched against this form, the same one route
    /// lookup uses, so an encoded segment cannot dodge them.
    fn api_path(&self, raw_path: &str) -> Option<String> {
        self.directory
            .normalize(raw_path)
            .map(|relative| format!("{}{}", self.directory.api_prefix(), relative))
    }

    fn is_api_key_path(&self, api_path: &str) -> bool {
        self.settings
            .api_key_prefix
            .as_deref()
            .is_some_and(|prefix| has_path_prefix(api_path, prefix))
    }

    fn is_internal(&self, api_path: &str) -> bool {
        self.settings
            .internal_prefixes
            .iter()
            .any(|prefix| has_path_prefix(api_path, prefix))
    }
}

/// `path` equals `prefix` or continues it at a segment boundary
fn has_path_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Per-request bookkeeping shared by the pipeline steps
struct RequestContext {
    audit: AuditGuard,
    request_id: String,
    client_ip: String,
    route_id: Option<String>,
    decision: Option<RateLimitDecision>,
}

/// Fallback handler for every path not served by the gateway itself
pub async fn gateway_handler(
    State(state): State<GatewayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let client_ip = client_ip(req.headers(), connect_info, state.settings.trust_forwarded_for);

    let Some(api_path) = state
        .api_path(req.uri().path())
        .filter(|path| !state.is_internal(path))
    else {
        return pass_through(&state, req).await;
    };

    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        method = %method,
        path = %uri.path(),
        client_ip = %client_ip,
        request_id = %request_id,
        "Incoming request"
    );

    let mut ctx = RequestContext {
        audit: state.audit.begin(RequestDraft {
            request_id: request_id.clone(),
            ip: client_ip.clone(),
            user_agent: req
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            method: method.to_string(),
            path: uri.path().to_string(),
            ..RequestDraft::default()
        }),
        request_id,
        client_ip,
        route_id: None,
        decision: None,
    };

    let result = dispatch(&state, &mut ctx, &api_path, req).await;
    let elapsed = ctx.audit.elapsed();

    let (response, error_message) = match result {
        Ok(response) => {
            info!(
                status = %response.status(),
                route_id = ctx.route_id.as_deref().unwrap_or("-"),
                latency_ms = elapsed.as_millis() as u64,
                "Request completed"
            );
            (response, None)
        }
        Err(err) => {
            log_failure(&err, &ctx);
            let message = err.public_message();
            let mut response = err.into_response();
            if let Some(decision) = &ctx.decision {
                apply_rate_limit_headers(response.headers_mut(), decision);
            }
            (response, Some(message))
        }
    };

    let status = response.status().as_u16();
    crate::metrics::record_request(
        ctx.route_id.as_deref().unwrap_or("unmatched"),
        method.as_str(),
        status,
        elapsed,
    );
    ctx.audit.finish(status, error_message);

    response
}

async fn dispatch(
    state: &GatewayState,
    ctx: &mut RequestContext,
    api_path: &str,
    req: Request<Body>,
) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path();

    // Resolve
    let route = state.directory.resolve(path, &parts.method).await?;
    ctx.route_id = Some(route.id.clone());
    ctx.audit.set_route(&route);
    debug!(route_id = %route.id, target = %route.target_url, "Route resolved");

    // Authenticate
    let mut auth = AuthContext::default();
    if route.middleware.require_session {
        let identity = state
            .auth
            .authenticate_session(&parts.headers, &callback_url(&parts.uri))
            .await?;
        auth.user_id = Some(identity.user_id);
    } else if let Some(identity) = state.auth.identify_session(&parts.headers).await {
        auth.user_id = Some(identity.user_id);
    }

    let api_key_policy = route.middleware.api_key.as_ref();
    if api_key_policy.is_some() || state.is_api_key_path(api_path) {
        auth.api_key = Some(state.auth.authenticate_api_key(&parts.headers).await?);
    }
    ctx.audit.set_auth(&auth);

    // Authorize
    if let (Some(policy), Some(key)) = (api_key_policy, &auth.api_key) {
        state.auth.authorize_scopes(key, &policy.required_scopes)?;
    }

    // Rate limit
    let service = match &route.service_id {
        Some(id) => state.directory.service(id).await,
        None => None,
    };
    let (limit, source) = resolve_limit(
        route.rate_limit,
        auth.api_key.as_ref().and_then(|k| k.rate_limit),
        service.as_ref().and_then(|s| s.rate_limit),
        state.settings.default_rate_limit,
    );
    let identity = match (&auth.api_key, &auth.user_id) {
        (Some(key), _) => RateLimitIdentity::ApiKey {
            key_id: key.id.clone(),
            ip: ctx.client_ip.clone(),
        },
        (None, Some(user_id)) => RateLimitIdentity::User(user_id.clone()),
        (None, None) => RateLimitIdentity::Ip(ctx.client_ip.clone()),
    };

    let decision = state.limiter.check(&identity.key(), limit);
    ctx.decision = Some(decision.clone());
    if !decision.allowed {
        crate::metrics::record_rate_limited(&route.id, source.as_str());
        return Err(GatewayError::RateLimitExceeded {
            limit,
            retry_after: retry_after_secs(&decision),
        });
    }
    debug!(
        identity = %identity,
        limit,
        remaining = decision.remaining,
        source = source.as_str(),
        "Rate limit check passed"
    );

    // Proxy
    let body = read_body(body).await?;
    let relative_path = state.directory.strip_prefix(path).unwrap_or("/");

    state
        .proxy
        .forward(ForwardRequest {
            route: &route,
            service: service.as_deref(),
            method: parts.method.clone(),
            path: relative_path,
            query: parts.uri.query(),
            headers: &parts.headers,
            body,
            client_ip: &ctx.client_ip,
            request_id: &ctx.request_id,
            rate_limit: &decision,
            api_prefix: state.directory.api_prefix(),
        })
        .await
}

/// Forward a bypassed request, or 404 when no pass-through target is set
async fn pass_through(state: &GatewayState, req: Request<Body>) -> Response {
    let Some(base_url) = state.settings.passthrough_url.as_deref() else {
        debug!(path = %req.uri().path(), "No pass-through target for non-API path");
        return StatusCode::NOT_FOUND.into_response();
    };

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let result = match read_body(body).await {
        Ok(body) => {
            state
                .proxy
                .passthrough(base_url, parts.method.clone(), path_and_query, &parts.headers, body)
                .await
        }
        Err(e) => Err(e),
    };

    result.unwrap_or_else(|e| {
        warn!(path = %parts.uri.path(), error = %e, "Pass-through request failed");
        StatusCode::BAD_GATEWAY.into_response()
    })
}

async fn read_body(body: Body) -> Result<Bytes> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| GatewayError::Internal(format!("Failed to read request body: {}", e)))
}

/// Caller address: first `X-Forwarded-For` hop when trusted, else the peer
fn client_ip(
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> String {
    let forwarded = trust_forwarded_for
        .then(|| headers.get(FORWARDED_FOR_HEADER))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match (forwarded, connect_info) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(ConnectInfo(addr))) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

fn callback_url(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Whole seconds until the window resets, at least 1
fn retry_after_secs(decision: &RateLimitDecision) -> u64 {
    let secs = decision.reset_after.as_secs();
    if decision.reset_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

fn log_failure(err: &GatewayError, ctx: &RequestContext) {
    let route_id = ctx.route_id.as_deref().unwrap_or("-");
    match err {
        GatewayError::RouteNotFound { method, path } => {
            debug!(method = %method, path = %path, "No route matched")
        }
        GatewayError::SessionRequired { .. } => {
            crate::metrics::record_auth_failure(err.kind());
            debug!(route_id, "Redirecting to login")
        }
        GatewayError::ApiKeyMissing
        | GatewayError::InvalidAuthorizationHeader
        | GatewayError::InvalidApiKey(_)
        | GatewayError::InsufficientScope { .. } => {
            crate::metrics::record_auth_failure(err.kind());
            warn!(route_id, request_id = %ctx.request_id, error = %err, "Request rejected by auth")
        }
        GatewayError::RateLimitExceeded { limit, .. } => {
            warn!(route_id, client_ip = %ctx.client_ip, limit, "Rate limit exceeded")
        }
        GatewayError::AuthUnavailable(detail)
        | GatewayError::RouteLookupFailed(detail)
        | GatewayError::UpstreamUnavailable(detail)
        | GatewayError::InvalidTargetConfiguration(detail) => {
            error!(
                route_id,
                request_id = %ctx.request_id,
                kind = err.kind(),
                detail = %detail,
                "Request failed"
            )
        }
        other => error!(route_id, request_id = %ctx.request_id, error = %other, "Request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration;

    #[test]
    fn test_has_path_prefix() {
        assert!(has_path_prefix("/api/auth", "/api/auth"));
        assert!(has_path_prefix("/api/auth/session", "/api/auth"));
        assert!(has_path_prefix("/api/auth/session", "/api/auth/"));
        assert!(!has_path_prefix("/api/authors", "/api/auth"));
        assert!(!has_path_prefix("/other", "/api/auth"));
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );

        assert_eq!(client_ip(&headers, Some(ConnectInfo(peer)), true), "203.0.113.5");
        assert_eq!(client_ip(&headers, Some(ConnectInfo(peer)), false), "10.1.1.1");
        assert_eq!(client_ip(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateLimitDecision::denied(5, Duration::from_secs(60));
        assert_eq!(retry_after_secs(&decision), 60);

        let decision = RateLimitDecision::denied(5, Duration::from_millis(12_300));
        assert_eq!(retry_after_secs(&decision), 13);

        let decision = RateLimitDecision::denied(5, Duration::ZERO);
        assert_eq!(retry_after_secs(&decision), 1);
    }

    #[test]
    fn test_callback_url_keeps_query() {
        let uri: Uri = "/api/me?tab=keys".parse().unwrap();
        assert_eq!(callback_url(&uri), "/api/me?tab=keys");
    }

    #[tokio::test]
    async fn test_internal_paths() {
        let state = GatewayState::new(
            PipelineConfig::default(),
            Arc::new(StaticRouteSource::default()),
            crate::auth::AuthVerifier::new(),
            AuditLogger::disabled(),
        )
        .unwrap();

        assert_eq!(state.api_path("/dashboard"), None);
        assert!(state.is_internal("/api/auth/session"));
        assert!(state.is_internal("/api/internal/jobs"));
        assert!(!state.is_internal("/api/users"));
        assert!(state.is_api_key_path("/api/gateway/users"));
        assert!(!state.is_api_key_path("/api/users"));
    }

    #[tokio::test]
    async fn test_prefix_policies_see_decoded_path() {
        let state = GatewayState::new(
            PipelineConfig::default(),
            Arc::new(StaticRouteSource::default()),
            crate::auth::AuthVerifier::new(),
            AuditLogger::disabled(),
        )
        .unwrap();

        let api_path = state.api_path("/api/g%61teway/users").unwrap();
        assert_eq!(api_path, "/api/gateway/users");
        assert!(state.is_api_key_path(&api_path));

        let api_path = state.api_path("/api/%61uth/session").unwrap();
        assert!(state.is_internal(&api_path));
    }
}
