//! Client authentication.
//!
//! Three ways in: a signed session token (cookie or bearer header) minted by
//! `POST /login` or a `?key=` magic link, or a request that comes straight
//! from the local network without passing through a proxy. With no password
//! configured, everything is allowed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use mirror_relay_core::config::Config;

use crate::state::RelayState;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "mirror_session";

/// Headers whose presence means the peer address is a proxy, not the client.
const PROXY_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "forwarded",
    "cf-connecting-ip",
];

/// Paths reachable without a session.
const PUBLIC_PATHS: &[&str] = &[
    "/health",
    "/login",
    "/logout",
    "/login.html",
    "/style.css",
    "/bridge",
    "/metrics",
];

/// Password and token-signing key for this relay.
pub struct AuthKeys {
    password: Option<String>,
    secret: Vec<u8>,
    max_age_secs: i64,
}

impl AuthKeys {
    pub fn new(password: Option<String>, secret: Option<String>, max_age_days: u32) -> Self {
        let secret = match secret {
            Some(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                let mut key = [0u8; 32];
                rand::rng().fill(&mut key);
                key.to_vec()
            }
        };
        Self {
            password: password.filter(|p| !p.is_empty()),
            secret,
            max_age_secs: i64::from(max_age_days) * 86_400,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let secret = config
            .relay
            .as_ref()
            .and_then(|r| r.auth.as_ref())
            .and_then(|a| a.resolve_session_secret());
        Self::new(
            config.relay_password(),
            secret,
            config.session_max_age_days(),
        )
    }

    pub fn enabled(&self) -> bool {
        self.password.is_some()
    }

    pub fn max_age_secs(&self) -> i64 {
        self.max_age_secs
    }

    /// Compare SHA-256 digests in constant time.
    pub fn check_password(&self, candidate: &str) -> bool {
        let Some(expected) = &self.password else {
            return false;
        };
        let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
        let provided_hash = format!("{:x}", Sha256::digest(candidate.as_bytes()));
        constant_time_eq(&expected_hash, &provided_hash)
    }

    /// Mint a session token: `<issued-at>.<hex hmac>`.
    pub fn issue(&self) -> String {
        self.issue_at(chrono::Utc::now().timestamp())
    }

    fn issue_at(&self, issued: i64) -> String {
        let issued = issued.to_string();
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mut mac) => {
                mac.update(issued.as_bytes());
                format!("{issued}.{}", hex::encode(mac.finalize().into_bytes()))
            }
            // HMAC accepts keys of any length.
            Err(_) => format!("{issued}."),
        }
    }

    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now: i64) -> bool {
        let Some((issued, signature)) = token.split_once('.') else {
            return false;
        };
        let Ok(issued_at) = issued.parse::<i64>() else {
            return false;
        };
        if issued_at > now + 60 || now - issued_at > self.max_age_secs {
            return false;
        }
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(issued.as_bytes());
        mac.verify_slice(&signature).is_ok()
    }

    /// Whether a request from `peer` with `headers` may use the relay.
    pub fn is_authorized(&self, peer: IpAddr, headers: &HeaderMap) -> bool {
        if !self.enabled() || is_local_request(peer, headers) {
            return true;
        }
        token_from_headers(headers).is_some_and(|t| self.verify(&t))
    }
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}

/// A direct, unproxied request from a loopback or private address.
pub fn is_local_request(peer: IpAddr, headers: &HeaderMap) -> bool {
    if PROXY_HEADERS.iter().any(|h| headers.contains_key(*h)) {
        return false;
    }
    is_private_ip(peer)
}

/// Session token from `Authorization: Bearer` or the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

pub fn session_cookie(token: &str, max_age_secs: i64) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}")
}

pub fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// Drop `key=...` from a raw query string.
fn strip_key_param(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("key="))
        .collect::<Vec<_>>()
        .join("&")
}

fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

/// Gate every route behind a session, a local origin, or a magic key.
///
/// `/ws` is let through: the socket handler reports the failure in-band.
pub async fn require_auth(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let auth = &state.auth;
    let path = req.uri().path().to_string();

    if let Ok(Query(params)) = Query::<HashMap<String, String>>::try_from_uri(req.uri()) {
        if let Some(key) = params.get("key").filter(|_| auth.enabled()) {
            if auth.check_password(key) {
                let rest = strip_key_param(req.uri().query().unwrap_or(""));
                let clean = if rest.is_empty() {
                    path.clone()
                } else {
                    format!("{path}?{rest}")
                };
                info!(peer = %peer.ip(), "Session minted from magic link");
                return with_cookie(
                    Redirect::to(&clean).into_response(),
                    &session_cookie(&auth.issue(), auth.max_age_secs()),
                );
            }
            warn!(peer = %peer.ip(), "Invalid magic link key");
        }
    }

    if is_public(&path) || path == "/ws" || auth.is_authorized(peer.ip(), req.headers()) {
        return next.run(req).await;
    }

    debug!(peer = %peer.ip(), path = %path, "Unauthorized request");
    if path.starts_with("/api/") {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response()
    } else {
        Redirect::to("/login.html").into_response()
    }
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

/// `POST /login`: exchange the password for a session token.
pub async fn login_handler(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let auth = &state.auth;
    if !auth.enabled() {
        return Json(json!({ "ok": true, "token": null })).into_response();
    }
    if !auth.check_password(&body.password) {
        warn!(peer = %peer.ip(), "Login failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "invalid_password" })),
        )
            .into_response();
    }

    let token = auth.issue();
    info!(peer = %peer.ip(), "Login succeeded");
    with_cookie(
        Json(json!({ "ok": true, "token": token })).into_response(),
        &session_cookie(&token, auth.max_age_secs()),
    )
}

/// `POST /logout`: clear the session cookie.
pub async fn logout_handler() -> impl IntoResponse {
    with_cookie(Json(json!({ "ok": true })).into_response(), &clear_cookie())
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn keys() -> AuthKeys {
        AuthKeys::new(Some("hunter2".into()), Some("signing-key".into()), 30)
    }

    fn public_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn test_token_roundtrip_and_tamper() {
        let keys = keys();
        let token = keys.issue();
        assert!(keys.verify(&token));

        let (issued, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{sig}", issued.parse::<i64>().unwrap() + 1);
        assert!(!keys.verify(&forged));
        assert!(!keys.verify("garbage"));
        assert!(!keys.verify(""));

        let other = AuthKeys::new(Some("hunter2".into()), Some("another-key".into()), 30);
        assert!(!other.verify(&token));
    }

    #[test]
    fn test_token_expiry() {
        let keys = keys();
        let now = 1_700_000_000;
        let token = keys.issue_at(now - 31 * 86_400);
        assert!(!keys.verify_at(&token, now));
        let token = keys.issue_at(now - 29 * 86_400);
        assert!(keys.verify_at(&token, now));
    }

    #[test]
    fn test_password_check() {
        let keys = keys();
        assert!(keys.check_password("hunter2"));
        assert!(!keys.check_password("hunter3"));
        let open = AuthKeys::new(None, None, 30);
        assert!(!open.enabled());
        assert!(!open.check_password(""));
    }

    #[test]
    fn test_local_origin_exemption() {
        let empty = HeaderMap::new();
        assert!(is_local_request(IpAddr::V4(Ipv4Addr::LOCALHOST), &empty));
        assert!(is_local_request(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), &empty));
        assert!(is_local_request(IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1)), &empty));
        assert!(is_local_request(IpAddr::V6(Ipv6Addr::LOCALHOST), &empty));
        assert!(is_local_request("fd12::1".parse().unwrap(), &empty));
        assert!(is_local_request("::ffff:10.0.0.2".parse().unwrap(), &empty));
        assert!(!is_local_request(public_ip(), &empty));
        assert!(!is_local_request("2001:db8::1".parse().unwrap(), &empty));

        let mut proxied = HeaderMap::new();
        proxied.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert!(!is_local_request(IpAddr::V4(Ipv4Addr::LOCALHOST), &proxied));
    }

    #[test]
    fn test_authorization_sources() {
        let keys = keys();
        let token = keys.issue();

        assert!(!keys.is_authorized(public_ip(), &HeaderMap::new()));

        let mut bearer = HeaderMap::new();
        bearer.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert!(keys.is_authorized(public_ip(), &bearer));

        let mut cookie = HeaderMap::new();
        cookie.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={token}")).unwrap(),
        );
        assert!(keys.is_authorized(public_ip(), &cookie));

        let open = AuthKeys::new(None, None, 30);
        assert!(open.is_authorized(public_ip(), &HeaderMap::new()));
    }

    #[test]
    fn test_strip_key_param() {
        assert_eq!(strip_key_param("key=abc"), "");
        assert_eq!(strip_key_param("a=1&key=abc&b=2"), "a=1&b=2");
        assert_eq!(strip_key_param("monkey=1"), "monkey=1");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("hello", "hello"));
        assert!(!constant_time_eq("hello", "world"));
        assert!(!constant_time_eq("hello", "hell"));
    }
}
