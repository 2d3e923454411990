//! Trip request workflow: list, submit and cancel, plus the client-side
//! time-window rules the portal does not enforce.
//!
//! The portal's HTTP status alone does not reliably indicate business-level
//! success, so submit and cancel re-derive the truth from the parsed list:
//! presence of the just-submitted date range, or absence of the cancelled
//! sequence id. Any network or parse failure falls back to re-fetching the
//! canonical list so callers never see stale optimistic state.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{
    MENU_ID, TRIP_APPLY_PATH, TRIP_CANCEL_PATH, TRIP_LIST_PATH, TRIP_LIST_REFERER, TRIP_PAGE_PATH,
    TRIP_REFERER,
};
use crate::http::PortalHttp;
use crate::scrape::{extract_form_token, TripHistoryParser};
use crate::store::{SessionStore, FORM_TOKEN_KEY, LOGGED_IN_KEY, USER_NO_KEY};
use crate::{PortalError, SuccessSignal, TripRequest, TripStatus};

/// Same-day submissions and cancellations close at 23:30 local time.
fn curfew() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 30, 0).expect("valid curfew time")
}

/// Consecutive empty list fetches (while logged in) before warning that the
/// extraction patterns may have silently stopped matching.
const EMPTY_STREAK_WARNING: u32 = 5;

/// A business rule the portal does not enforce client-side; the `Display`
/// text is the user-facing rejection reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TripRuleViolation {
    #[error("지난 날짜로는 외박을 신청할 수 없습니다.")]
    PastDate,
    #[error("23시 30분 이후에는 당일 신청 및 취소가 불가능합니다.")]
    AfterCurfew,
    #[error("이미 승인된 외박은 취소할 수 없습니다.")]
    AlreadyApproved,
    #[error("날짜 형식을 해석할 수 없습니다: {0}")]
    MalformedDate(String),
}

/// Accept or reject a new submission for `start_date` as of `now`.
///
/// Rejected when the start date is strictly before today, or when it is
/// today and the local time is at or past the curfew cutoff.
pub fn validate_submission_window(
    start_date: NaiveDate,
    now: NaiveDateTime,
) -> Result<(), TripRuleViolation> {
    let today = now.date();
    if start_date < today {
        return Err(TripRuleViolation::PastDate);
    }
    if start_date == today && now.time() >= curfew() {
        return Err(TripRuleViolation::AfterCurfew);
    }
    Ok(())
}

/// Accept or reject cancelling `item` as of `now`.
///
/// Approved requests are never cancelable, independent of dates. The parsed
/// `YY.MM.DD` start date must not be in the past, and same-day cancellation
/// honours the curfew cutoff.
pub fn validate_cancellation_window(
    item: &TripRequest,
    now: NaiveDateTime,
) -> Result<(), TripRuleViolation> {
    if item.status == TripStatus::Approved {
        return Err(TripRuleViolation::AlreadyApproved);
    }
    let start_date = parse_portal_date(&item.start_date)
        .ok_or_else(|| TripRuleViolation::MalformedDate(item.start_date.clone()))?;
    validate_submission_window(start_date, now)
}

/// Parse the portal's `YY.MM.DD` form, assuming the `20` century prefix.
/// Not Y2K-safe beyond 2099, which is acceptable for this domain.
pub fn parse_portal_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("20{raw}"), "%Y.%m.%d").ok()
}

/// Convert `YY.MM.DD` to the `20YY-MM-DD` form the cancel endpoint expects.
/// Anything else passes through unchanged.
fn to_full_date(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() == 3 {
        format!("20{}-{}-{}", parts[0], parts[1], parts[2])
    } else {
        raw.to_string()
    }
}

/// A new overnight-stay request to submit.
#[derive(Debug, Clone)]
pub struct TripSubmission {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Business-level outcome of a submit or cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripOutcome {
    /// The refreshed list confirms the action took effect.
    Confirmed(SuccessSignal),
    /// The portal processed the request but the refreshed list does not
    /// confirm it; callers should surface "processed but unconfirmed".
    Unconfirmed,
    /// Rejected client-side before any request was sent.
    Rejected(TripRuleViolation),
    /// The exchange failed; the list was re-fetched so the caller is not
    /// left with stale optimistic state.
    Failed(String),
}

/// A workflow outcome together with the freshest list the service could get.
#[derive(Debug)]
pub struct TripActionResult {
    pub outcome: TripOutcome,
    pub trips: Vec<TripRequest>,
}

/// Composes the HTTP adapter, the store and the extraction engine into the
/// trip business operations.
pub struct TripService {
    http: PortalHttp,
    store: SessionStore,
    parser: TripHistoryParser,
    empty_streak: AtomicU32,
}

impl TripService {
    pub fn new(http: PortalHttp, store: SessionStore) -> Result<Self, PortalError> {
        Ok(Self {
            http,
            store,
            parser: TripHistoryParser::new()?,
            empty_streak: AtomicU32::new(0),
        })
    }

    /// Fetch and parse the canonical trip list.
    ///
    /// An empty result is indistinguishable from the extraction patterns
    /// having silently stopped matching; a persistent empty streak while
    /// logged in is logged as a monitoring signal, not treated as an error.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_trip_list(&self) -> Result<Vec<TripRequest>, PortalError> {
        let html = self.http.get_html(TRIP_LIST_PATH, Some(TRIP_REFERER)).await?;
        let trips = self.parser.parse_trip_history(&html);
        info!(trips = trips.len(), "trip list fetched");

        if trips.is_empty() {
            if self.store.get(LOGGED_IN_KEY).await.as_deref() == Some("true") {
                let streak = self.empty_streak.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= EMPTY_STREAK_WARNING {
                    warn!(
                        streak,
                        "trip list has been empty repeatedly while logged in; \
                         the portal markup may have drifted"
                    );
                }
            }
        } else {
            self.empty_streak.store(0, Ordering::Relaxed);
        }
        Ok(trips)
    }

    /// The cached form token, fetching the request page when absent.
    pub async fn ensure_form_token(&self) -> Result<String, PortalError> {
        if let Some(token) = self.store.get(FORM_TOKEN_KEY).await {
            debug!("using cached form token");
            return Ok(token);
        }
        let html = self.http.get_html(TRIP_PAGE_PATH, Some(TRIP_REFERER)).await?;
        match extract_form_token(&html) {
            Some(token) => {
                debug!("form token extracted from request page");
                if let Err(e) = self.store.set(FORM_TOKEN_KEY, &token).await {
                    warn!(error = %e, "failed to cache form token");
                }
                Ok(token)
            }
            None => Err(PortalError::MissingFormToken),
        }
    }

    /// Submit a new request and confirm it against the re-parsed list.
    ///
    /// Failures never escape as errors: business-rule rejections abort before
    /// any request is sent, and network/parse failures fold into
    /// [`TripOutcome::Failed`] with a best-effort list refresh.
    #[instrument(level = "info", skip(self))]
    pub async fn submit(&self, submission: &TripSubmission) -> TripActionResult {
        let now = Local::now().naive_local();
        if let Err(violation) = validate_submission_window(submission.start_date, now) {
            info!(%violation, "submission rejected client-side");
            return TripActionResult {
                outcome: TripOutcome::Rejected(violation),
                trips: Vec::new(),
            };
        }

        match self.try_submit(submission).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, network = e.is_network(), "submit failed; refreshing list");
                self.failed(e).await
            }
        }
    }

    async fn try_submit(&self, submission: &TripSubmission) -> Result<TripActionResult, PortalError> {
        let user_no = self
            .store
            .get(USER_NO_KEY)
            .await
            .ok_or(PortalError::NotLoggedIn)?;
        let token = self.ensure_form_token().await?;

        let start = submission.start_date.format("%Y-%m-%d").to_string();
        let end = submission.end_date.format("%Y-%m-%d").to_string();
        let form = [
            ("tripType", "2".to_string()),
            ("tripTargetPlace", "1".to_string()),
            ("startDate", start),
            ("endDate", end),
            ("tripReason", "외박".to_string()),
            ("menuId", MENU_ID.to_string()),
            ("enteranceInfoSeq", token),
            ("hakbeon", user_no),
        ];

        let html = self
            .http
            .post_html(TRIP_APPLY_PATH, &form, Some(TRIP_REFERER))
            .await?;
        let trips = self.parser.parse_trip_history(&html);

        // The portal's status code says nothing about business success; look
        // for the just-submitted date range in the refreshed list instead.
        let needle_start = submission.start_date.format("%m.%d").to_string();
        let needle_end = submission.end_date.format("%m.%d").to_string();
        let registered = trips.iter().any(|t| {
            t.start_date.contains(&needle_start) && t.end_date.contains(&needle_end)
        });

        if registered {
            info!("submission confirmed by the refreshed list");
            Ok(TripActionResult {
                outcome: TripOutcome::Confirmed(SuccessSignal::BodyDerived),
                trips,
            })
        } else {
            // The token may be session-stale; drop the cache so the next
            // attempt re-fetches the form page.
            if let Err(e) = self.store.remove(FORM_TOKEN_KEY).await {
                warn!(error = %e, "failed to invalidate form token");
            }
            info!("submission processed but not visible in the list");
            let trips = self.fetch_trip_list().await.unwrap_or(trips);
            Ok(TripActionResult {
                outcome: TripOutcome::Unconfirmed,
                trips,
            })
        }
    }

    /// Cancel an existing request and confirm by its absence from the list.
    #[instrument(level = "info", skip(self, item), fields(seq = %item.seq))]
    pub async fn cancel(&self, item: &TripRequest) -> TripActionResult {
        let now = Local::now().naive_local();
        if let Err(violation) = validate_cancellation_window(item, now) {
            info!(%violation, "cancellation rejected client-side");
            return TripActionResult {
                outcome: TripOutcome::Rejected(violation),
                trips: Vec::new(),
            };
        }

        match self.try_cancel(item).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, network = e.is_network(), "cancel failed; refreshing list");
                self.failed(e).await
            }
        }
    }

    async fn try_cancel(&self, item: &TripRequest) -> Result<TripActionResult, PortalError> {
        let form = [
            ("seq", item.seq.clone()),
            ("startDate", to_full_date(&item.start_date)),
            ("endDate", to_full_date(&item.end_date)),
            ("menuId", MENU_ID.to_string()),
        ];

        let html = self
            .http
            .post_html(TRIP_CANCEL_PATH, &form, Some(TRIP_LIST_REFERER))
            .await?;
        let trips = self.parser.parse_trip_history(&html);

        let cancelled = !trips.iter().any(|t| t.seq == item.seq);
        if cancelled {
            info!("cancellation confirmed by the refreshed list");
            Ok(TripActionResult {
                outcome: TripOutcome::Confirmed(SuccessSignal::BodyDerived),
                trips,
            })
        } else {
            info!("cancelled item still present in the list");
            let trips = self.fetch_trip_list().await.unwrap_or(trips);
            Ok(TripActionResult {
                outcome: TripOutcome::Unconfirmed,
                trips,
            })
        }
    }

    async fn failed(&self, error: PortalError) -> TripActionResult {
        let trips = self.fetch_trip_list().await.unwrap_or_default();
        TripActionResult {
            outcome: TripOutcome::Failed(error.to_string()),
            trips,
        }
    }
}
