use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use crate::responses::ApiError;
use crate::AppState;

/// First forwarded address, then `x-real-ip`, then the socket peer.
pub(crate) fn extract_client_addr<B>(req: &Request<B>) -> Option<String> {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.split(',').find_map(|part| {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        });
    if forwarded.is_some() {
        return forwarded;
    }

    if let Some(real) = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(real);
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

fn user_from_headers(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Per-IP window first, then the per-user in-flight cap for identified users.
pub(crate) async fn admission_mw(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = extract_client_addr(&req).unwrap_or_else(|| "unknown".into());
    if let Err(err) = state.rate.check(&ip, req.uri().path()) {
        return ApiError::from(err).into_response();
    }
    let permit = match user_from_headers(req.headers(), &state.user_header) {
        Some(user) => match state.inflight.try_acquire(&user) {
            Ok(permit) => Some(permit),
            Err(err) => return ApiError::from(err).into_response(),
        },
        None => None,
    };
    let res = next.run(req).await;
    drop(permit);
    res
}

pub(crate) async fn headers_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut res = next.run(req).await;
    let h = res.headers_mut();
    let add_hdr = |h: &mut HeaderMap, name: &'static str, val: &'static str| {
        let name = HeaderName::from_static(name);
        if !h.contains_key(&name) {
            h.insert(name, HeaderValue::from_static(val));
        }
    };
    add_hdr(h, "x-content-type-options", "nosniff");
    add_hdr(h, "x-frame-options", "DENY");
    add_hdr(h, "referrer-policy", "no-referrer");
    if std::env::var("DECODE_HSTS").ok().as_deref() == Some("1") {
        add_hdr(
            h,
            "strict-transport-security",
            "max-age=31536000; includeSubDomains",
        );
    }
    res
}

/// Identity set by the authenticating proxy in front of the service.
pub(crate) struct CurrentUser(pub String);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        user_from_headers(&parts.headers, &state.user_header)
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", " , 203.0.113.9, 10.0.0.1")
            .header("x-real-ip", "198.51.100.1")
            .body(Body::empty())
            .expect("request");
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 5000))));
        assert_eq!(extract_client_addr(&req).as_deref(), Some("203.0.113.9"));

        req.headers_mut().remove("x-forwarded-for");
        assert_eq!(extract_client_addr(&req).as_deref(), Some("198.51.100.1"));

        req.headers_mut().remove("x-real-ip");
        assert_eq!(extract_client_addr(&req).as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn blank_user_header_is_anonymous() {
        let name = HeaderName::from_static("x-decode-user");
        let mut headers = HeaderMap::new();
        assert_eq!(user_from_headers(&headers, &name), None);
        headers.insert(name.clone(), HeaderValue::from_static("  "));
        assert_eq!(user_from_headers(&headers, &name), None);
        headers.insert(name.clone(), HeaderValue::from_static("42"));
        assert_eq!(user_from_headers(&headers, &name).as_deref(), Some("42"));
    }
}
