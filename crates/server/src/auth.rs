//! Handshake credential extraction and the dispatch API token guard.
//!
//! WebSocket clients cannot always set headers during the upgrade, so the
//! credential rides in the `Auth` query parameter (`?Auth=Bearer+<token>`).
//! An `Authorization: Bearer <token>` header is honored when present.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

/// Query parameter carrying the handshake credential
pub const AUTH_QUERY_PARAM: &str = "Auth";

/// Strip the `Bearer ` scheme from a credential value.
pub fn parse_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Find the bearer token for an upgrade request: header first, then the
/// already-decoded `Auth` query value.
pub fn handshake_bearer<'a>(
    headers: &'a HeaderMap,
    auth_param: Option<&'a str>,
) -> Option<&'a str> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer)
    {
        return Some(token);
    }
    auth_param.and_then(parse_bearer)
}

/// Axum middleware guarding the dispatch API with a shared service token.
pub async fn dispatch_token_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer);

    if presented == Some(expected_token.as_str()) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.dispatch.rejected",
        path = %req.uri().path(),
        has_credential = presented.is_some(),
        "Rejected dispatch API request"
    );
    Err(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_bearer_scheme_case_insensitively() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer  abc "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc"), None);
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(
            handshake_bearer(&headers, Some("Bearer from-query")),
            Some("from-header")
        );
    }

    #[test]
    fn falls_back_to_query_param() {
        let headers = HeaderMap::new();
        // `+` has already been decoded to a space by the query extractor.
        assert_eq!(handshake_bearer(&headers, Some("Bearer tok")), Some("tok"));
        assert_eq!(handshake_bearer(&headers, None), None);
        assert_eq!(handshake_bearer(&headers, Some("tok")), None);
    }
}
