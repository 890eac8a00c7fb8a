use std::time::Duration;

use tower_cookies::cookie::time::{self, OffsetDateTime};
use tower_cookies::cookie::SameSite;
use tower_cookies::Cookie;

const SEPARATOR: char = '|';

/// Cookie value carrying a session: `sessionId|rawToken`.
pub fn encode_session(session_id: &str, raw_token: &str) -> String {
    format!("{}{}{}", session_id, SEPARATOR, raw_token)
}

/// Splits a cookie value into `(session_id, raw_token)`.
///
/// Both halves must be present. A percent-encoded separator is accepted too.
pub fn decode_session(value: &str) -> Option<(String, String)> {
    let value = value.replace("%7C", "|").replace("%7c", "|");
    let (id, token) = value.split_once(SEPARATOR)?;
    if id.is_empty() || token.is_empty() {
        return None;
    }
    Some((id.to_string(), token.to_string()))
}

/// Settings shared by every session cookie the server emits.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    pub path: String,
    pub secure: bool,
    pub max_age: Option<Duration>,
}

impl CookieSettings {
    fn base(&self, value: String) -> Cookie<'static> {
        let path = if self.path.is_empty() { "/".to_string() } else { self.path.clone() };
        let mut cookie = Cookie::new(self.name.clone(), value);
        cookie.set_path(path);
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_secure(self.secure);
        cookie
    }

    /// The cookie set after a successful login.
    pub fn session(&self, session_id: &str, raw_token: &str) -> Cookie<'static> {
        let mut cookie = self.base(encode_session(session_id, raw_token));
        if let Some(max_age) = self.max_age {
            cookie.set_max_age(time::Duration::seconds(max_age.as_secs() as i64));
        }
        cookie
    }

    /// An empty, already expired cookie that makes the client drop its session.
    pub fn cleared(&self) -> Cookie<'static> {
        let mut cookie = self.base(String::new());
        cookie.set_expires(OffsetDateTime::UNIX_EPOCH);
        cookie
    }
}
