//! # KNUE Portal Client
//!
//! A Rust client library for the KNUE dormitory web portal (`mpot.knue.ac.kr`).
//! The portal is a server-rendered HTML application with session cookies and no
//! JSON API; this crate turns it into a typed, programmatically usable resource:
//! login and automatic re-authentication, cross-request cookie persistence, and
//! extraction of trip/leave request records from server HTML fragments.

pub mod config;
pub mod http;
pub mod scrape;
pub mod session;
pub mod store;
pub mod trip;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// Re-export main types for convenience
pub use config::{CookieMode, PortalConfig};
pub use http::{CookieTransport, JarCookies, ManualCookies, PortalHttp, PortalResponse};
pub use scrape::{extract_form_token, format_date_safely, DocumentExtractor, TripHistoryParser};
pub use session::SessionManager;
pub use store::{Credentials, SessionStore};
pub use trip::{
    validate_cancellation_window, validate_submission_window, TripActionResult, TripOutcome,
    TripRuleViolation, TripService, TripSubmission,
};

/// Error types for the portal client
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("portal answered with error status {0}")]
    Status(reqwest::StatusCode),

    #[error("redirect limit exceeded after {0} hops")]
    RedirectLimit(u32),

    #[error("HTML parsing failed: {0}")]
    Parse(String),

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no stored user identifier; log in first")]
    NotLoggedIn,

    #[error("form token missing from the request page")]
    MissingFormToken,
}

impl PortalError {
    /// True when no response reached the client at all, as opposed to the
    /// portal answering with an error status. The session manager uses this
    /// to tell "network unreachable" apart from "session expired".
    pub fn is_network(&self) -> bool {
        match self {
            PortalError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

/// How the portal signalled that an operation worked.
///
/// The portal is inconsistent: login success may arrive as a plain 2xx, as a
/// 3xx redirect, or only as a session cookie on an otherwise unhelpful
/// response, and submit/cancel outcomes are only knowable from the refreshed
/// list. The ambiguity is kept visible rather than normalised away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessSignal {
    /// A plain 2xx status.
    Status,
    /// A 3xx redirect used by the portal as a success signal.
    Redirect,
    /// Truth re-derived from the response body or the re-parsed trip list.
    BodyDerived,
}

/// Inferred state of a submitted trip request.
///
/// The portal never declares a status field; it is derived from the presence
/// of an approval marker and a live cancel affordance in the HTML fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripStatus {
    Approved,
    Cancelable,
    Pending,
}

impl TripStatus {
    /// Korean label as rendered by the original portal UI.
    pub fn label(&self) -> &'static str {
        match self {
            TripStatus::Approved => "승인됨",
            TripStatus::Cancelable => "취소 가능",
            TripStatus::Pending => "대기중",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One leave/overnight-stay request as rendered by the portal.
///
/// Reconstructed fresh on every list parse and never persisted; identity
/// across requests is by `seq` only. Dates stay in the portal's `YY.MM.DD`
/// form; fields whose pattern failed to match hold a sentinel string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRequest {
    /// Server-assigned sequence id, unique within one list snapshot.
    pub seq: String,
    /// Category label with the leading "N. " ordinal stripped.
    pub trip_type: String,
    pub target_place: String,
    /// Departure date in the portal's `YY.MM.DD` format.
    pub start_date: String,
    /// Return date in the portal's `YY.MM.DD` format.
    pub end_date: String,
    pub status: TripStatus,
}
