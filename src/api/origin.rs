// WebSocket origin validation middleware.

use axum::{extract::Request, middleware::Next, response::Response};

use super::error::ApiError;

/// Browser origins allowed to open a collaboration socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OriginPolicy {
    #[default]
    Any,
    List(Vec<OriginPattern>),
}

/// An exact origin, or `scheme://*.suffix` matching any subdomain of suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPattern {
    Exact(String),
    Subdomain { scheme: String, suffix: String },
}

impl OriginPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim_end_matches('/');
        if let Some((scheme, rest)) = pattern.split_once("://") {
            if let Some(suffix) = rest.strip_prefix("*.") {
                return OriginPattern::Subdomain {
                    scheme: scheme.to_ascii_lowercase(),
                    suffix: suffix.to_ascii_lowercase(),
                };
            }
        }
        OriginPattern::Exact(pattern.to_ascii_lowercase())
    }

    pub fn matches(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/').to_ascii_lowercase();
        match self {
            OriginPattern::Exact(exact) => *exact == origin,
            OriginPattern::Subdomain { scheme, suffix } => {
                let Some((origin_scheme, host)) = origin.split_once("://") else {
                    return false;
                };
                // `*.example.com` does not match the apex `example.com`.
                origin_scheme == scheme
                    && host
                        .strip_suffix(suffix.as_str())
                        .and_then(|sub| sub.strip_suffix('.'))
                        .is_some_and(|sub| !sub.is_empty())
            }
        }
    }
}

impl OriginPolicy {
    /// Build a policy from configured patterns. No patterns means any origin.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        if patterns.is_empty() {
            return OriginPolicy::Any;
        }
        OriginPolicy::List(patterns.iter().map(|p| OriginPattern::parse(p.as_ref())).collect())
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            OriginPolicy::Any => true,
            OriginPolicy::List(patterns) => patterns.iter().any(|p| p.matches(origin)),
        }
    }
}

/// Check the Origin header on WebSocket upgrade requests.
///
/// - Non-WebSocket requests: pass through (CORS handles HTTP)
/// - No Origin header: pass through (non-browser clients)
/// - Origin allowed by the policy: pass through
/// - Otherwise: reject with 403
pub async fn check_ws_origin(
    policy: OriginPolicy,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let is_ws_upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return Ok(next.run(req).await);
    }

    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o.to_string(),
    };

    if policy.allows(&origin) {
        return Ok(next.run(req).await);
    }

    tracing::warn!(origin = %origin, "rejected websocket upgrade from disallowed origin");
    Err(ApiError::OriginNotAllowed)
}
