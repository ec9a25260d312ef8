use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use base64::prelude::{Engine, BASE64_STANDARD};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::server::error::ApiError;
use crate::server::AppState;

/// Basic-auth gate for the admin surface. An unset admin password locks the
/// surface entirely rather than leaving it open.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let (user, password) = parse_basic_auth(header_value).ok_or(ApiError::Unauthorized)?;

    if state.config.admin_password.is_empty()
        || user != state.config.admin_user
        || password != state.config.admin_password
    {
        warn!("Admin auth rejected for user {:?}", user);
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

pub fn parse_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Caller IP for rate limiting: first X-Forwarded-For hop when the frontend
/// proxy adds one, else the socket peer.
pub fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_basic_auth() {
        // admin:secret
        let header = format!("Basic {}", BASE64_STANDARD.encode("admin:secret"));
        assert_eq!(
            parse_basic_auth(&header),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn password_may_contain_colons() {
        let header = format!("Basic {}", BASE64_STANDARD.encode("admin:a:b:c"));
        assert_eq!(
            parse_basic_auth(&header),
            Some(("admin".to_string(), "a:b:c".to_string()))
        );
    }

    #[test]
    fn rejects_non_basic_schemes() {
        assert_eq!(parse_basic_auth("Bearer abc"), None);
        assert_eq!(parse_basic_auth("Basic not-base64!!"), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.5, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, &addr), "10.0.0.5");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, &addr), "127.0.0.1");
    }
}
