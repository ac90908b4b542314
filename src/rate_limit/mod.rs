//! Rate limiting module
//!
//! Fixed-window counters keyed by an identity string:
//!
//! - `user:<id>` for callers with a verified session
//! - `apiKey:<id>:<ip>` for API key callers, so each source address of a key
//!   is throttled on its own
//! - `ip:<addr>` for everyone else
//!
//! Each identity key is an independent counter; switching identity never
//! transfers quota. A window starts with the first admitted request and lasts
//! a fixed duration (60 seconds by default). Bursts across a window boundary
//! are admitted, which is the accepted trade-off for O(1) memory and check
//! cost per key.
//!
//! # Example
//!
//! ```rust
//! use gatekeeper::rate_limit::{FixedWindowLimiter, RateLimitIdentity};
//! use std::time::Duration;
//!
//! let limiter = FixedWindowLimiter::new(Duration::from_secs(60));
//! let identity = RateLimitIdentity::Ip("203.0.113.7".to_string());
//!
//! let decision = limiter.check(&identity.key(), 2);
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 1);
//! ```

pub mod headers;
pub mod local;
pub mod types;

// Re-export commonly used types
pub use headers::apply_rate_limit_headers;
pub use local::FixedWindowLimiter;
pub use types::{resolve_limit, LimitSource, RateLimitDecision, RateLimitIdentity, RateWindowEntry};
