//! Session gate.
//!
//! A single shared-secret login protecting the panel. A successful login
//! sets the `auth` cookie; the page shell and the VM API routes check it.
//! The secrets are explicit configuration handed in at startup, never
//! ambient process state.

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use vmrunner_common::error::Result;

use crate::server::WebServerState;

/// Session cookie name; the value is the fixed flag `"true"`.
pub const SESSION_COOKIE: &str = "auth";

/// Fixed session lifetime; the cookie is never refreshed.
pub const SESSION_TTL_SECS: i64 = 60 * 60 * 24;

/// Login secrets and cookie policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub password: String,
    /// Mark the cookie Secure; on in production deployments.
    pub secure_cookies: bool,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

fn parse_login(body: &[u8]) -> Result<LoginRequest> {
    Ok(serde_json::from_slice(body)?)
}

/// Set-Cookie value for a fresh session.
fn session_cookie(secure: bool) -> String {
    let mut value = format!(
        "{}=true; Max-Age={}; Path=/; HttpOnly; SameSite=Strict",
        SESSION_COOKIE, SESSION_TTL_SECS
    );
    if secure {
        value.push_str("; Secure");
    }
    value
}

/// Set-Cookie value that expires the session immediately.
fn clear_session_cookie(secure: bool) -> String {
    let mut value = format!(
        "{}=; Max-Age=0; Path=/; HttpOnly; SameSite=Strict",
        SESSION_COOKIE
    );
    if secure {
        value.push_str("; Secure");
    }
    value
}

pub fn is_authenticated(jar: &CookieJar) -> bool {
    jar.get(SESSION_COOKIE).map(|c| c.value()) == Some("true")
}

/// POST /api/auth/login
///
/// The body is parsed by hand so a malformed request surfaces as a server
/// error, not a framework rejection. A credential mismatch never says
/// which of the two values was wrong.
pub(crate) async fn login_handler(
    State(state): State<Arc<WebServerState>>,
    body: Bytes,
) -> impl IntoResponse {
    let req = match parse_login(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed login request: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "message": "Something went wrong"})),
            )
                .into_response();
        }
    };

    let session = &state.cfg.session;
    if req.username == session.username && req.password == session.password {
        info!("operator logged in");
        return (
            StatusCode::OK,
            [(header::SET_COOKIE, session_cookie(session.secure_cookies))],
            Json(serde_json::json!({"success": true})),
        )
            .into_response();
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"success": false, "message": "Invalid credentials"})),
    )
        .into_response()
}

/// POST /api/auth/logout
pub(crate) async fn logout_handler(
    State(state): State<Arc<WebServerState>>,
) -> impl IntoResponse {
    info!("operator logged out");
    (
        StatusCode::OK,
        [(
            header::SET_COOKIE,
            clear_session_cookie(state.cfg.session.secure_cookies),
        )],
        Json(serde_json::json!({"success": true})),
    )
}

/// Middleware for the VM API routes: no session cookie, no service.
pub async fn require_session(req: Request, next: Next) -> Response {
    let jar = CookieJar::from_headers(req.headers());
    if !is_authenticated(&jar) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "authentication required"})),
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie(false);
        assert!(cookie.starts_with("auth=true; "));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(!cookie.contains("Secure"));

        assert!(session_cookie(true).ends_with("; Secure"));
    }

    #[test]
    fn test_clear_cookie_expires_immediately() {
        let cookie = clear_session_cookie(false);
        assert!(cookie.starts_with("auth=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn test_parse_login() {
        let req = parse_login(br#"{"username": "op", "password": "pw"}"#).unwrap();
        assert_eq!(req.username, "op");
        assert_eq!(req.password, "pw");

        assert!(parse_login(b"not json").is_err());
        assert!(parse_login(br#"{"username": "op"}"#).is_err());
    }

    #[test]
    fn test_is_authenticated() {
        let jar = CookieJar::default();
        assert!(!is_authenticated(&jar));

        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::COOKIE, "auth=true".parse().unwrap());
        assert!(is_authenticated(&CookieJar::from_headers(&headers)));

        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::COOKIE, "auth=false".parse().unwrap());
        assert!(!is_authenticated(&CookieJar::from_headers(&headers)));
    }
}
