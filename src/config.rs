use std::env;
use std::time::Duration;

use crate::policy::SecurityMode;
use crate::Result;

pub const DEFAULT_STORE_URL: &str = "data";
pub const DEFAULT_COOKIE_NAME: &str = "next-api-auth";
pub const DEFAULT_MOUNT_PATH: &str = "/api";

/// Argon2id cost used when hashing passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordCost {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for PasswordCost {
    // roughly 100ms per verification on current hardware
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
        }
    }
}

impl PasswordCost {
    /// Minimal cost, for tests only.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
        }
    }
}

/// Runtime settings consumed by the dispatcher and the binaries.
#[derive(Debug, Clone)]
pub struct Config {
    /// `memory:`, a data directory, or `file://<dir>`.
    pub store_url: String,
    pub security: SecurityMode,
    pub cookie_name: String,
    /// Sessions older than this are rejected. `None` keeps them forever.
    pub session_lifetime: Option<Duration>,
    /// URL prefix the collections are served under, also used as cookie path.
    pub mount_path: String,
    pub secure_cookies: bool,
    pub password_cost: PasswordCost,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            security: SecurityMode::default(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            session_lifetime: None,
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            secure_cookies: false,
            password_cost: PasswordCost::default(),
        }
    }
}

impl Config {
    /// Builds a config from `DOCAPI_*` environment variables, falling back to defaults.
    ///
    /// - `DOCAPI_STORE_URL`
    /// - `DOCAPI_SECURITY` (`open`, `owner-sandbox`, `read-all-write-own` or `0`-`2`)
    /// - `DOCAPI_COOKIE_NAME`
    /// - `DOCAPI_SESSION_LIFETIME_SECS`
    /// - `DOCAPI_MOUNT_PATH`
    /// - `DOCAPI_SECURE_COOKIES` (`true` / `1`)
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(url) = var("DOCAPI_STORE_URL") {
            config.store_url = url;
        }
        if let Some(mode) = var("DOCAPI_SECURITY") {
            config.security = mode.parse()?;
        }
        if let Some(name) = var("DOCAPI_COOKIE_NAME") {
            config.cookie_name = name;
        }
        if let Some(secs) = var("DOCAPI_SESSION_LIFETIME_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                crate::Error::InvalidInput(format!("DOCAPI_SESSION_LIFETIME_SECS is not a number: {}", secs))
            })?;
            config.session_lifetime = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(path) = var("DOCAPI_MOUNT_PATH") {
            config.mount_path = normalize_mount_path(&path);
        }
        if let Some(flag) = var("DOCAPI_SECURE_COOKIES") {
            config.secure_cookies = matches!(flag.as_str(), "true" | "1");
        }

        Ok(config)
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Ensures a leading slash and strips trailing ones. The root mount is `""`.
pub fn normalize_mount_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
