use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use time::Duration;

use crate::handshake::{self, HandshakeInfo};
use crate::types::{Session, Token};

pub(super) const ACCESS_TOKEN_COOKIE: &str = "sAccessToken";
pub(super) const REFRESH_TOKEN_COOKIE: &str = "sRefreshToken";
pub(super) const ID_REFRESH_TOKEN_COOKIE: &str = "sIdRefreshToken";

pub(super) const ANTI_CSRF_HEADER: HeaderName = HeaderName::from_static("anti-csrf");
pub(super) const ID_REFRESH_TOKEN_HEADER: HeaderName = HeaderName::from_static("id-refresh-token");

/// Session credentials presented by a request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(super) struct RequestTokens {
    pub(super) access_token: Option<String>,
    pub(super) refresh_token: Option<String>,
    pub(super) id_refresh_token: Option<String>,
    pub(super) anti_csrf_token: Option<String>,
}

/// Read session cookies and the anti-CSRF header.
pub(super) fn read_tokens(headers: &HeaderMap) -> RequestTokens {
    let jar = CookieJar::from_headers(headers);
    let cookie = |name: &str| {
        jar.get(name)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
    };

    RequestTokens {
        access_token: cookie(ACCESS_TOKEN_COOKIE),
        refresh_token: cookie(REFRESH_TOKEN_COOKIE),
        id_refresh_token: cookie(ID_REFRESH_TOKEN_COOKIE),
        anti_csrf_token: headers
            .get(&ANTI_CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    }
}

fn same_site(value: handshake::SameSite) -> SameSite {
    match value {
        handshake::SameSite::Lax => SameSite::Lax,
        handshake::SameSite::Strict => SameSite::Strict,
        handshake::SameSite::None => SameSite::None,
    }
}

fn base_cookie(name: &'static str, value: String, path: &str, info: &HandshakeInfo) -> Cookie<'static> {
    let mut builder = Cookie::build((name, value))
        .http_only(true)
        .secure(info.cookie_secure)
        .same_site(same_site(info.cookie_same_site))
        .path(path.to_string());
    if let Some(domain) = &info.cookie_domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

/// Create a cookie carrying `token` until it expires.
fn token_cookie(name: &'static str, token: &Token, path: &str, info: &HandshakeInfo) -> Cookie<'static> {
    let mut cookie = base_cookie(name, token.value.clone(), path, info);
    cookie.set_expires(token.expires_at);
    cookie
}

/// Create removal cookie for `name`.
fn removal_cookie(name: &'static str, path: &str, info: &HandshakeInfo) -> Cookie<'static> {
    let mut cookie = base_cookie(name, String::new(), path, info);
    cookie.set_max_age(Duration::ZERO);
    cookie
}

/// Cookies for every token the session carries.
///
/// The refresh token is scoped to the refresh path so it is only ever sent there.
pub(super) fn session_cookies(session: &Session, info: &HandshakeInfo) -> Vec<Cookie<'static>> {
    let mut cookies = Vec::new();
    if let Some(token) = &session.access_token {
        cookies.push(token_cookie(ACCESS_TOKEN_COOKIE, token, &info.access_token_path, info));
    }
    if let Some(token) = &session.refresh_token {
        cookies.push(token_cookie(REFRESH_TOKEN_COOKIE, token, &info.refresh_token_path, info));
    }
    if let Some(token) = &session.id_refresh_token {
        cookies.push(token_cookie(ID_REFRESH_TOKEN_COOKIE, token, &info.access_token_path, info));
    }
    cookies
}

/// Removal cookies for all session tokens.
pub(super) fn clear_session_cookies(info: &HandshakeInfo) -> Vec<Cookie<'static>> {
    vec![
        removal_cookie(ACCESS_TOKEN_COOKIE, &info.access_token_path, info),
        removal_cookie(REFRESH_TOKEN_COOKIE, &info.refresh_token_path, info),
        removal_cookie(ID_REFRESH_TOKEN_COOKIE, &info.access_token_path, info),
    ]
}

fn append_cookies(response: &mut Response, cookies: Vec<Cookie<'static>>) {
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(cookie = cookie.name(), error = %e, "Skipping unencodable cookie"),
        }
    }
}

/// Write rotated tokens of `session` onto `response`.
pub(super) fn write_session(response: &mut Response, session: &Session, info: &HandshakeInfo) {
    append_cookies(response, session_cookies(session, info));

    let headers = response.headers_mut();
    if let Some(csrf) = &session.anti_csrf_token {
        if let Ok(value) = HeaderValue::from_str(csrf) {
            headers.insert(ANTI_CSRF_HEADER, value);
        }
    }
    if let Some(id_refresh) = &session.id_refresh_token {
        if let Ok(value) = HeaderValue::from_str(&id_refresh.value) {
            headers.insert(ID_REFRESH_TOKEN_HEADER, value);
        }
    }
}

/// Clear all session cookies on `response` and tell the client its session is gone.
pub(super) fn clear_session(response: &mut Response, info: &HandshakeInfo) {
    append_cookies(response, clear_session_cookies(info));
    response
        .headers_mut()
        .insert(ID_REFRESH_TOKEN_HEADER, HeaderValue::from_static("remove"));
}
