//! Session lifecycle against the portal: login, logout, validation and
//! opt-in credential persistence.
//!
//! The manager is the only component permitted to assert "the user is logged
//! in". It never throws login failures at callers — every outcome is a plain
//! boolean so the presentation layer has one uniform "please log in again"
//! path.
//!
//! Not reentrant by design: callers must not start a second `login` or
//! `logout` while one is in flight. Individual store operations are the unit
//! of atomicity; there is no internal mutual exclusion.

use tracing::{debug, info, instrument, warn};

use crate::config::{LOGIN_PATH, LOGIN_REFERER, LOGOUT_PATH, SESSION_PROBE_PATH};
use crate::http::{PortalHttp, PortalResponse};
use crate::store::{Credentials, SessionStore, LOGGED_IN_KEY, USER_NO_KEY};
use crate::{PortalError, SuccessSignal};

/// Decide whether a login exchange succeeded, and on what evidence.
///
/// The portal signals success inconsistently: a plain 2xx, a redirect to the
/// main page, or — on some responses — nothing but the session cookie itself.
/// The cookie is treated as ground truth when status and redirect are silent.
pub fn evaluate_login(response: &PortalResponse) -> Option<SuccessSignal> {
    if response.redirects > 0 || response.status.is_redirection() {
        return Some(SuccessSignal::Redirect);
    }
    if response.status.is_success() {
        return Some(SuccessSignal::Status);
    }
    if !response.cookies_set.is_empty() {
        return Some(SuccessSignal::BodyDerived);
    }
    None
}

/// Orchestrates login, logout, session validation and credential persistence.
#[derive(Clone)]
pub struct SessionManager {
    http: PortalHttp,
    store: SessionStore,
}

impl SessionManager {
    pub fn new(http: PortalHttp, store: SessionStore) -> Self {
        Self { http, store }
    }

    /// Post credentials to the login endpoint and persist the session state.
    ///
    /// Returns `false` on any failure — network errors are caught and
    /// converted, never propagated. With `remember_credentials` the pair is
    /// also written to the secret half of the store for later auto-login.
    #[instrument(level = "info", skip(self, password))]
    pub async fn login(&self, user_no: &str, password: &str, remember_credentials: bool) -> bool {
        match self
            .try_login(user_no, password, remember_credentials)
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, network = e.is_network(), "login failed");
                false
            }
        }
    }

    async fn try_login(
        &self,
        user_no: &str,
        password: &str,
        remember_credentials: bool,
    ) -> Result<bool, PortalError> {
        let form = [
            ("userNo", user_no.to_string()),
            ("password", password.to_string()),
            ("rememberMe", "N".to_string()),
        ];
        let response = self.http.post(LOGIN_PATH, &form, Some(LOGIN_REFERER)).await?;

        let signal = match evaluate_login(&response) {
            Some(signal) => signal,
            None => {
                warn!(status = %response.status, "login rejected by the portal");
                return Ok(false);
            }
        };
        info!(?signal, cookies = response.cookies_set.len(), "login accepted");

        self.store.set(LOGGED_IN_KEY, "true").await?;
        self.store.set(USER_NO_KEY, user_no).await?;

        if remember_credentials {
            let creds = Credentials {
                user_no: user_no.to_string(),
                password: password.to_string(),
            };
            self.store.save_credentials(&creds).await?;
        }

        Ok(true)
    }

    /// Replay a saved credential pair. `None` when nothing is saved.
    pub async fn auto_login(&self) -> Option<bool> {
        let creds = self.store.load_credentials().await?;
        debug!(user_no = %creds.user_no, "attempting auto-login with saved credentials");
        Some(self.login(&creds.user_no, &creds.password, false).await)
    }

    /// Log out locally, best-effort remotely.
    ///
    /// The remote call is allowed to fail — logging out locally proceeds
    /// regardless. Returns `false` only when local storage itself fails.
    /// Stored credentials are deleted only when `clear_credentials` is set.
    #[instrument(level = "info", skip(self))]
    pub async fn logout(&self, clear_credentials: bool) -> bool {
        if let Err(e) = self.http.get(LOGOUT_PATH, None).await {
            debug!(error = %e, "remote logout failed (ignored)");
        }

        if let Err(e) = self.store.remove(LOGGED_IN_KEY).await {
            warn!(error = %e, "failed to clear logged-in flag");
            return false;
        }
        if let Err(e) = self.store.clear_cookies().await {
            warn!(error = %e, "failed to clear cookie state");
            return false;
        }
        if clear_credentials {
            if let Err(e) = self.store.clear_credentials().await {
                warn!(error = %e, "failed to clear saved credentials");
                return false;
            }
        }
        info!("logged out");
        true
    }

    /// The locally persisted flag; does not probe the network.
    pub async fn is_logged_in(&self) -> bool {
        self.store.get(LOGGED_IN_KEY).await.as_deref() == Some("true")
    }

    /// The saved credential pair, or `None` when either half is missing.
    pub async fn get_saved_credentials(&self) -> Option<Credentials> {
        self.store.load_credentials().await
    }

    /// Probe the portal with the short timeout. Any error — including
    /// timeout — means "session invalid" and is never propagated.
    #[instrument(level = "debug", skip(self))]
    pub async fn validate_session(&self) -> bool {
        match self.http.probe(SESSION_PROBE_PATH).await {
            Ok(response) => {
                // An expired session bounces to the login page, which renders
                // the userNo input; a live one renders the menu instead.
                let valid = response.is_ok() && !response.body.contains(r#"name="userNo""#);
                debug!(status = %response.status, valid, "session probe completed");
                valid
            }
            Err(e) => {
                debug!(error = %e, network = e.is_network(), "session probe failed");
                false
            }
        }
    }
}
