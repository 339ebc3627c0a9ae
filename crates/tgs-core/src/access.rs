//! Stateless password gate.
//!
//! The session is a client cookie holding the configured password and the check is a
//! plain equality. This keeps the worker free of server-side session state but it is
//! not cryptographically hardened: anyone who sees the cookie knows the password.

use crate::config::ServiceConfig;

/// Name of both the cookie and the query/form parameter.
pub const PASSWORD_PARAM: &str = "p";

/// Cookie lifetime.
pub const COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    /// Gate disabled or cookie matches.
    Allow,
    /// Query parameter matched: let the request through and issue the cookie.
    AllowAndSetCookie(String),
    /// Root path without credentials: show the password prompt.
    Prompt,
    /// Any other path without credentials: 401.
    Deny,
}

#[derive(Clone, Debug, Default)]
pub struct AccessGuard {
    password: Option<String>,
}

impl AccessGuard {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(cfg.password().map(str::to_string))
    }

    pub fn is_active(&self) -> bool {
        self.password.is_some()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        matches!(&self.password, Some(p) if p == candidate)
    }

    /// Decide a request given its path, raw `Cookie` header and `p` query parameter.
    pub fn check(
        &self,
        path: &str,
        cookie_header: Option<&str>,
        query_password: Option<&str>,
    ) -> AccessDecision {
        if !self.is_active() {
            return AccessDecision::Allow;
        }

        if let Some(value) = cookie_header.and_then(|h| cookie_value(h, PASSWORD_PARAM)) {
            if self.matches(&value) {
                return AccessDecision::Allow;
            }
        }

        if let Some(q) = query_password {
            if self.matches(q) {
                return AccessDecision::AllowAndSetCookie(self.session_cookie(q));
            }
        }

        if path == "/" || path.is_empty() {
            AccessDecision::Prompt
        } else {
            AccessDecision::Deny
        }
    }

    /// `Set-Cookie` value for a verified password.
    pub fn session_cookie(&self, password: &str) -> String {
        format!(
            "{PASSWORD_PARAM}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}",
            urlencoding::encode(password)
        )
    }
}

/// Find a cookie in a `Cookie` header and URL-decode its value.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        if k.trim() != name {
            return None;
        }
        let v = v.trim().trim_matches('"');
        Some(
            urlencoding::decode(v)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| v.to_string()),
        )
    })
}
