//! Portal endpoints, required headers and client configuration.
//!
//! The endpoint paths and the header set are an external contract of the
//! remote portal. Its access control is known to key off the webview
//! User-Agent and the `X-Requested-With` app identifier; omitting them causes
//! silent failures, not loud errors, so the literals here must byte-match the
//! known embedded-webview client.

use reqwest::header::{self, HeaderMap, HeaderValue};
use std::time::Duration;

pub const BASE_URL: &str = "https://mpot.knue.ac.kr";

pub const LOGIN_PATH: &str = "/common/login";
pub const LOGOUT_PATH: &str = "/common/logout";
pub const SESSION_PROBE_PATH: &str = "/dormitory/student/trip?menuId=341";
pub const TRIP_PAGE_PATH: &str = "/dormitory/student/trip?menuId=341&tab=1";
pub const TRIP_LIST_PATH: &str = "/dormitory/student/trip?menuId=341&tab=2";
pub const TRIP_APPLY_PATH: &str = "/dormitory/student/trip/apply";
pub const TRIP_CANCEL_PATH: &str = "/dormitory/student/trip/cancel?menuId=341";

pub const LOGIN_REFERER: &str = "https://mpot.knue.ac.kr/common/login";
pub const TRIP_REFERER: &str = "https://mpot.knue.ac.kr/dormitory/student/trip?menuId=341";
pub const TRIP_LIST_REFERER: &str = "https://mpot.knue.ac.kr/dormitory/student/trip?menuId=341&tab=2";

pub const MENU_ID: &str = "341";

pub const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 5.1.1; SM-G977N Build/LMY48Z; wv) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Chrome/74.0.3729.136 Mobile Safari/537.36 acanet/knue";
pub const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3";
pub const ACCEPT_LANGUAGE: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";
pub const X_REQUESTED_WITH: &str = "kr.acanet.knueapp";

/// How cookies travel between the store and the wire.
///
/// Two divergent networking backends exist in this domain: one with a native
/// automatic cookie jar and one that requires reading `set-cookie` response
/// headers and injecting a `Cookie` request header manually. The adapter is
/// the only place that knows which is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieMode {
    /// Attach the persisted cookies as a `Cookie` header on every request.
    Manual,
    /// Let the transport's cookie jar attach cookies; still harvest
    /// `set-cookie` into the store so state survives a restart.
    AutoJar,
}

/// Configuration for the HTTP adapter.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    /// General request timeout.
    pub request_timeout: Duration,
    /// Shorter timeout for lightweight session-probe calls.
    pub probe_timeout: Duration,
    /// Bounded number of redirect hops the adapter will follow.
    pub max_redirects: u32,
    pub cookie_mode: CookieMode,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            max_redirects: 5,
            cookie_mode: CookieMode::Manual,
        }
    }
}

impl PortalConfig {
    /// Configuration pointing at a different host, used by tests against an
    /// in-process mock portal.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// The fixed header set attached to every request.
    pub fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static(ACCEPT_LANGUAGE),
        );
        headers.insert("x-requested-with", HeaderValue::from_static(X_REQUESTED_WITH));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            "upgrade-insecure-requests",
            HeaderValue::from_static("1"),
        );
        if let Ok(origin) = HeaderValue::from_str(self.base_url.trim_end_matches('/')) {
            headers.insert(header::ORIGIN, origin);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PortalConfig::default();
        assert_eq!(config.base_url, "https://mpot.knue.ac.kr");
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.cookie_mode, CookieMode::Manual);
    }

    #[test]
    fn test_default_headers_carry_the_webview_identity() {
        let headers = PortalConfig::default().default_headers();
        assert!(headers
            .get(header::USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("acanet/knue"));
        assert_eq!(
            headers.get("x-requested-with").unwrap(),
            "kr.acanet.knueapp"
        );
        assert_eq!(
            headers.get(header::ORIGIN).unwrap(),
            "https://mpot.knue.ac.kr"
        );
    }
}
