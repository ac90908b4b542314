use crate::config::{RouteConfig, ServiceMetadata};
use crate::error::{GatewayError, Result};
use crate::observability::REQUEST_ID_HEADER;
use crate::rate_limit::{apply_rate_limit_headers, RateLimitDecision};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response},
};
use bytes::Bytes;
use reqwest::redirect::Policy;
use secrecy::ExposeSecret;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Marks every response produced or relayed by the gateway
pub const GATEWAY_HEADER: &str = "x-api-gateway";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Everything needed to forward one admitted request
pub struct ForwardRequest<'a> {
    pub route: &'a RouteConfig,
    pub service: Option<&'a ServiceMetadata>,
    pub method: Method,
    /// Path relative to the API prefix, as received
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub client_ip: &'a str,
    pub request_id: &'a str,
    pub rate_limit: &'a RateLimitDecision,
    /// Prefix callers use to reach the gateway, for mapping redirects back
    pub api_prefix: &'a str,
}

/// HTTP client that relays requests to backends
#[derive(Clone)]
pub struct RequestProxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl RequestProxy {
    /// Create a proxy with the given deadline per backend call
    ///
    /// Redirects are never followed; they are relayed to the caller.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward an admitted request to the route's backend
    pub async fn forward(&self, req: ForwardRequest<'_>) -> Result<Response<Body>> {
        let target = build_target_url(&req.route.target_url, req.path, req.query)?;
        let headers = outbound_headers(&req)?;

        debug!(
            route_id = %req.route.id,
            target = %target,
            method = %req.method,
            "Forwarding to backend"
        );

        let response = self
            .send(req.method.clone(), target.clone(), headers, req.body)
            .await
            .map_err(|e| {
                crate::metrics::record_upstream_error(&req.route.id, upstream_reason(&e));
                warn!(
                    route_id = %req.route.id,
                    service_id = req.route.service_id.as_deref().unwrap_or("-"),
                    target = %target,
                    error = %e,
                    "Backend request failed"
                );
                e
            })?;

        let scope = RedirectScope {
            target_url: &req.route.target_url,
            api_prefix: req.api_prefix,
        };
        let mut response = relay_response(response, Some(scope)).await.map_err(|e| {
            crate::metrics::record_upstream_error(&req.route.id, "body");
            e
        })?;
        apply_gateway_headers(response.headers_mut(), req.route, req.rate_limit);

        Ok(response)
    }

    /// Relay a request that bypasses the gateway pipeline
    ///
    /// `path_and_query` is the full original request target. No gateway
    /// headers are added.
    pub async fn passthrough(
        &self,
        base_url: &str,
        method: Method,
        path_and_query: &str,
        inbound: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Body>> {
        let target = Url::parse(&format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            path_and_query
        ))
        .map_err(|e| GatewayError::InvalidTargetConfiguration(format!("{}: {}", base_url, e)))?;

        debug!(target = %target, method = %method, "Passing request through");

        let response = self
            .send(method, target, strip_hop_by_hop(inbound), body)
            .await?;
        relay_response(response, None).await
    }

    async fn send(
        &self,
        method: Method,
        target: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let started = Instant::now();
        let mut request = self.client.request(method.clone(), target).headers(headers);
        if method != Method::GET && method != Method::HEAD {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamUnavailable(format!(
                    "Backend timed out after {:?}",
                    self.timeout
                ))
            } else {
                GatewayError::UpstreamUnavailable(format!("Backend request failed: {}", e))
            }
        })?;

        info!(
            status = %response.status(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Backend responded"
        );

        Ok(response)
    }
}

/// Backend URL for a route: target base, relative path, original query
pub fn build_target_url(target_url: &str, path: &str, query: Option<&str>) -> Result<Url> {
    let mut raw = format!("{}{}", target_url.trim_end_matches('/'), path);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        raw.push('?');
        raw.push_str(q);
    }

    let url = Url::parse(&raw).map_err(|e| {
        GatewayError::InvalidTargetConfiguration(format!(
            "{} is not a valid URL: {}",
            target_url, e
        ))
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(GatewayError::InvalidTargetConfiguration(format!(
            "Unsupported target scheme: {}",
            other
        ))),
    }
}

/// Headers sent to the backend
fn outbound_headers(req: &ForwardRequest<'_>) -> Result<HeaderMap> {
    let mut headers = strip_hop_by_hop(req.headers);

    if let Some(service) = req.service {
        if let Some((name, value)) = service_credential(service)? {
            headers.insert(name, value);
        }
    }

    headers.insert(GATEWAY_HEADER, HeaderValue::from_static("true"));
    apply_rate_limit_headers(&mut headers, req.rate_limit);
    if let Ok(value) = HeaderValue::from_str(req.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(req.client_ip) {
        headers.insert(FORWARDED_FOR_HEADER, value);
    }

    Ok(headers)
}

/// `<auth_header>: Bearer <api_key>` when the service declares both
fn service_credential(service: &ServiceMetadata) -> Result<Option<(HeaderName, HeaderValue)>> {
    let (Some(header_name), Some(api_key)) = (&service.auth_header, &service.api_key) else {
        return Ok(None);
    };

    let name = HeaderName::from_bytes(header_name.as_bytes()).map_err(|_| {
        GatewayError::InvalidTargetConfiguration(format!(
            "Service {} has an invalid auth header name",
            service.id
        ))
    })?;
    let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
        .map_err(|_| {
            GatewayError::InvalidTargetConfiguration(format!(
                "Service {} has an invalid API key",
                service.id
            ))
        })?;
    value.set_sensitive(true);

    Ok(Some((name, value)))
}

/// Copy of `headers` without hop-by-hop, `Host` and `Content-Length`
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if !is_hop_by_hop_header(name_str)
            && *name != header::HOST
            && *name != header::CONTENT_LENGTH
        {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Where the caller reaches a backend, used to map redirects back
struct RedirectScope<'a> {
    target_url: &'a str,
    api_prefix: &'a str,
}

/// Turn a backend response into a caller response
///
/// With a `scope`, an absolute `Location` on a 3xx that points at the
/// backend's origin is mapped back under the API prefix. Relative and foreign
/// locations are relayed unchanged.
async fn relay_response(
    response: reqwest::Response,
    scope: Option<RedirectScope<'_>>,
) -> Result<Response<Body>> {
    let status = response.status();
    let mut headers = strip_hop_by_hop(response.headers());

    let mapped = scope
        .filter(|_| status.is_redirection())
        .and_then(|scope| {
            let location = headers.get(header::LOCATION)?.to_str().ok()?;
            external_location(location, scope.target_url, scope.api_prefix)
        })
        .and_then(|location| HeaderValue::from_str(&location).ok());
    if let Some(mapped) = mapped {
        debug!(status = %status, location = ?mapped, "Mapped backend redirect");
        headers.insert(header::LOCATION, mapped);
    }

    let body = response.bytes().await.map_err(|e| {
        GatewayError::UpstreamUnavailable(format!("Failed to read backend response: {}", e))
    })?;

    let mut relayed = Response::new(Body::from(body));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    Ok(relayed)
}

/// Caller-facing form of an absolute backend `Location`
///
/// `None` when the location is relative or points somewhere other than the
/// backend, in which case it is relayed as is.
pub fn external_location(location: &str, target_url: &str, api_prefix: &str) -> Option<String> {
    let location = Url::parse(location).ok()?;
    let target = Url::parse(target_url).ok()?;
    if location.origin() != target.origin() {
        return None;
    }

    let base = target.path().trim_end_matches('/');
    let path = location.path();
    let relative = match path.strip_prefix(base) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    };

    let mut mapped = format!(
        "{}{}",
        api_prefix.trim_end_matches('/'),
        if relative.is_empty() { "/" } else { relative }
    );
    if let Some(query) = location.query() {
        mapped.push('?');
        mapped.push_str(query);
    }
    if let Some(fragment) = location.fragment() {
        mapped.push('#');
        mapped.push_str(fragment);
    }
    Some(mapped)
}

/// Overlay gateway headers on a relayed response
pub fn apply_gateway_headers(
    headers: &mut HeaderMap,
    route: &RouteConfig,
    decision: &RateLimitDecision,
) {
    headers.insert(GATEWAY_HEADER, HeaderValue::from_static("true"));
    apply_rate_limit_headers(headers, decision);

    if let Some(ttl) = route.cache_ttl {
        if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", ttl)) {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }

    if let Some(cors) = &route.middleware.cors {
        if let Ok(value) = HeaderValue::from_str(&cors.origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
}

fn upstream_reason(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::UpstreamUnavailable(msg) if msg.contains("timed out") => "timeout",
        GatewayError::UpstreamUnavailable(_) => "network",
        _ => "other",
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
