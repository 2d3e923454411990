//! HTTP adapter for the portal.
//!
//! One configured request pipeline: base host, the fixed header set, timeouts
//! and bounded redirect following. Cookies cross the wire through a
//! [`CookieTransport`]; every request attaches the current store contents and
//! every response — success, redirect hop or error alike — has its
//! `set-cookie` headers merged back into the store. A session-expiry redirect
//! still carries cookie updates that must not be dropped, which is why
//! redirects are followed manually instead of inside the transport.

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{redirect, Client, Method, StatusCode, Url};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::{CookieMode, PortalConfig};
use crate::store::SessionStore;
use crate::PortalError;

/// Cookie attribute names that must not be mistaken for cookie names.
const COOKIE_ATTRIBUTES: [&str; 7] = [
    "path", "expires", "domain", "secure", "httponly", "max-age", "samesite",
];

/// How cookies move between the [`SessionStore`] and the wire.
///
/// The adapter is the only component that knows which implementation is
/// active; the session manager never forks by backend.
pub trait CookieTransport: Send + Sync {
    /// Attach the stored cookies to an outgoing request's headers.
    fn attach(&self, cookies: &HashMap<String, String>, headers: &mut HeaderMap);

    /// Extract cookie pairs from a response's `set-cookie` headers.
    fn harvest(&self, headers: &HeaderMap) -> HashMap<String, String>;
}

/// Manual propagation: builds the `Cookie` header itself and reads
/// `set-cookie` back out.
pub struct ManualCookies;

impl CookieTransport for ManualCookies {
    fn attach(&self, cookies: &HashMap<String, String>, headers: &mut HeaderMap) {
        if cookies.is_empty() {
            return;
        }
        let cookie_header = cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        match HeaderValue::from_str(&cookie_header) {
            Ok(value) => {
                headers.insert(header::COOKIE, value);
            }
            Err(e) => warn!(error = %e, "stored cookies contain an invalid header byte; skipping"),
        }
    }

    fn harvest(&self, headers: &HeaderMap) -> HashMap<String, String> {
        parse_set_cookie_headers(headers)
    }
}

/// Transport-managed jar: the underlying client attaches cookies on its own;
/// `set-cookie` is still harvested into the store so the session survives a
/// process restart.
pub struct JarCookies;

impl CookieTransport for JarCookies {
    fn attach(&self, _cookies: &HashMap<String, String>, _headers: &mut HeaderMap) {
        // The transport's jar attaches cookies itself.
    }

    fn harvest(&self, headers: &HeaderMap) -> HashMap<String, String> {
        parse_set_cookie_headers(headers)
    }
}

/// Pull `name=value` pairs out of every `set-cookie` header, skipping cookie
/// attributes.
fn parse_set_cookie_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for value in headers.get_all(header::SET_COOKIE) {
        let raw = match value.to_str() {
            Ok(s) => s,
            Err(_) => continue,
        };
        // The cookie pair is the first `;`-separated segment.
        let pair = raw.split(';').next().unwrap_or("");
        if let Some((name, val)) = pair.split_once('=') {
            let name = name.trim();
            if name.is_empty() || COOKIE_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            cookies.insert(name.to_string(), val.trim().to_string());
        }
    }
    cookies
}

/// Resolve a `Location` header against the URL it was served from. Handles
/// both host-relative and absolute targets.
fn resolve_location(current: &Url, location: &str) -> Result<Url, PortalError> {
    current
        .join(location)
        .map_err(|e| PortalError::Parse(format!("unresolvable redirect target {location:?}: {e}")))
}

/// Outcome of one portal exchange, after redirect following.
#[derive(Debug)]
pub struct PortalResponse {
    /// Final status after following redirects.
    pub status: StatusCode,
    /// Number of redirect hops that were followed.
    pub redirects: u32,
    /// Names of cookies the portal set anywhere during the exchange.
    pub cookies_set: Vec<String>,
    pub body: String,
}

impl PortalResponse {
    /// 2xx and 3xx are both non-error outcomes for this portal.
    pub fn is_ok(&self) -> bool {
        self.status.is_success() || self.status.is_redirection()
    }
}

/// Single point of contact with the remote host.
#[derive(Clone)]
pub struct PortalHttp {
    client: Client,
    config: PortalConfig,
    store: SessionStore,
    transport: Arc<dyn CookieTransport>,
}

impl PortalHttp {
    /// Build the configured pipeline. With [`CookieMode::AutoJar`] the
    /// transport jar is seeded from the store so a restarted process resumes
    /// its previous session.
    pub async fn new(config: PortalConfig, store: SessionStore) -> Result<Self, PortalError> {
        debug!(base_url = %config.base_url, mode = ?config.cookie_mode, "creating portal http adapter");
        let mut builder = Client::builder()
            .default_headers(config.default_headers())
            .timeout(config.request_timeout)
            .redirect(redirect::Policy::none());

        let transport: Arc<dyn CookieTransport> = match config.cookie_mode {
            CookieMode::Manual => Arc::new(ManualCookies),
            CookieMode::AutoJar => {
                let jar = Arc::new(reqwest::cookie::Jar::default());
                if let Ok(base) = Url::parse(&config.base_url) {
                    for (name, value) in store.load_cookies().await {
                        jar.add_cookie_str(&format!("{}={}", name, value), &base);
                    }
                }
                builder = builder.cookie_provider(jar);
                Arc::new(JarCookies)
            }
        };

        let client = builder.build()?;
        Ok(Self {
            client,
            config,
            store,
            transport,
        })
    }

    /// GET a path, following redirects; 4xx/5xx surface as errors.
    pub async fn get(
        &self,
        path: &str,
        referer: Option<&str>,
    ) -> Result<PortalResponse, PortalError> {
        self.execute(Method::GET, path, None, referer, None).await
    }

    /// POST a URL-encoded form, following redirects.
    pub async fn post(
        &self,
        path: &str,
        form: &[(&str, String)],
        referer: Option<&str>,
    ) -> Result<PortalResponse, PortalError> {
        self.execute(Method::POST, path, Some(form), referer, None)
            .await
    }

    /// GET that returns the raw HTML body. The portal always answers with an
    /// HTML document, never JSON.
    pub async fn get_html(
        &self,
        path: &str,
        referer: Option<&str>,
    ) -> Result<String, PortalError> {
        Ok(self.get(path, referer).await?.body)
    }

    /// POST that returns the raw HTML body.
    pub async fn post_html(
        &self,
        path: &str,
        form: &[(&str, String)],
        referer: Option<&str>,
    ) -> Result<String, PortalError> {
        Ok(self.post(path, form, referer).await?.body)
    }

    /// Lightweight GET with the short probe timeout, for session checks.
    pub async fn probe(&self, path: &str) -> Result<PortalResponse, PortalError> {
        self.execute(
            Method::GET,
            path,
            None,
            None,
            Some(self.config.probe_timeout),
        )
        .await
    }

    #[instrument(level = "debug", skip(self, form))]
    async fn execute(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
        referer: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<PortalResponse, PortalError> {
        let mut url = self.absolute_url(path)?;
        let mut method = method;
        let mut redirects = 0u32;
        let mut cookies_set = Vec::new();

        loop {
            let stored = self.store.load_cookies().await;
            let mut headers = HeaderMap::new();
            self.transport.attach(&stored, &mut headers);
            if let Some(referer) = referer {
                if let Ok(value) = HeaderValue::from_str(referer) {
                    headers.insert(header::REFERER, value);
                }
            }

            let mut request = self.client.request(method.clone(), url.clone());
            request = request.headers(headers);
            if method == Method::POST {
                if let Some(form) = form {
                    request = request.form(form);
                }
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let response = request.send().await?;
            let status = response.status();

            // Merge cookies before any status evaluation: error responses and
            // expiry redirects still carry updates.
            let harvested = self.transport.harvest(response.headers());
            if !harvested.is_empty() {
                cookies_set.extend(harvested.keys().cloned());
                self.store.save_cookies(&harvested).await;
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if let Some(location) = location {
                    if redirects >= self.config.max_redirects {
                        warn!(hops = redirects, "redirect limit exceeded");
                        return Err(PortalError::RedirectLimit(redirects));
                    }
                    url = resolve_location(&url, &location)?;
                    redirects += 1;
                    // 307/308 preserve the method and body; everything else
                    // downgrades to GET.
                    if status != StatusCode::TEMPORARY_REDIRECT
                        && status != StatusCode::PERMANENT_REDIRECT
                    {
                        method = Method::GET;
                    }
                    debug!(hop = redirects, target = %url, "following redirect");
                    continue;
                }
                // A 3xx without Location is still a non-error outcome here.
            }

            let body = response.text().await?;

            if status.is_client_error() || status.is_server_error() {
                warn!(status = %status, url = %url, "portal answered with error status");
                return Err(PortalError::Status(status));
            }

            debug!(
                status = %status,
                redirects,
                body_length = body.len(),
                "portal exchange completed"
            );
            return Ok(PortalResponse {
                status,
                redirects,
                cookies_set,
                body,
            });
        }
    }

    fn absolute_url(&self, path: &str) -> Result<Url, PortalError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
        };
        Url::parse(&raw).map_err(|e| PortalError::Parse(format!("invalid URL {raw:?}: {e}")))
    }
}
