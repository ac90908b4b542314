use std::fmt;
use std::time::{Duration, Instant};

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitIdentity {
    /// Caller with a verified session
    User(String),
    /// API key caller, bucketed per source address
    ApiKey { key_id: String, ip: String },
    /// Anonymous caller
    Ip(String),
}

impl RateLimitIdentity {
    /// Key used to bucket counters
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RateLimitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitIdentity::User(id) => write!(f, "user:{}", id),
            RateLimitIdentity::ApiKey { key_id, ip } => write!(f, "apiKey:{}:{}", key_id, ip),
            RateLimitIdentity::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// Where the effective limit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Route,
    ApiKey,
    Service,
    Default,
}

impl LimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitSource::Route => "route",
            LimitSource::ApiKey => "api_key",
            LimitSource::Service => "service",
            LimitSource::Default => "default",
        }
    }
}

/// Resolve the effective limit: route, then API key, then service, then the
/// configured default. An explicit zero at any level wins over later levels.
pub fn resolve_limit(
    route: Option<u32>,
    api_key: Option<u32>,
    service: Option<u32>,
    default: u32,
) -> (u32, LimitSource) {
    if let Some(limit) = route {
        return (limit, LimitSource::Route);
    }
    if let Some(limit) = api_key {
        return (limit, LimitSource::ApiKey);
    }
    if let Some(limit) = service {
        return (limit, LimitSource::Service);
    }
    (default, LimitSource::Default)
}

/// Counter state for one identity key
#[derive(Debug, Clone, Copy)]
pub struct RateWindowEntry {
    pub count: u32,
    pub reset_at: Instant,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// The limit that was enforced
    pub limit: u32,
    /// Time until the current window resets
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Create an allowed result
    pub fn allowed(remaining: u32, limit: u32, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_after,
        }
    }

    /// Create a denied result
    pub fn denied(limit: u32, reset_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_after,
        }
    }
}
