//! Pure HTML extraction for the portal's trip pages.
//!
//! Not a general HTML parser: the portal's markup is an unversioned, brittle
//! structural contract, so extraction relies on a fixed set of patterns and
//! every field is captured independently. Small markup drift degrades a
//! single field to a sentinel string instead of crashing the whole list view,
//! and a document with no recognizable fragments parses to an empty list, not
//! an error. No I/O happens here.

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, warn};

use crate::{PortalError, TripRequest, TripStatus};

/// Sentinel for a text field whose pattern failed to match.
pub const MISSING_INFO: &str = "정보 없음";
/// Sentinel for a date cell whose pattern failed to match.
pub const MISSING_DATE: &str = "날짜 없음";
/// Sentinel for a fragment without a readable sequence id.
pub const MISSING_SEQ: &str = "시퀀스 없음";

/// Exact approval marker the portal renders inside an approved fragment.
const APPROVED_MARKER: &str = "<font color=blue><b>외박신청이 승인되었습니다.</b></font>";
/// Live cancel affordance; only meaningful when not commented out.
const CANCEL_AFFORDANCE: &str = r#"class="tripCancelBtn">신청취소</a>"#;
/// An HTML-commented-out anchor disables the cancel affordance.
const COMMENTED_ANCHOR: &str = "<!-- <a";

/// Fields extractable from one trip fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripField {
    TripType,
    TargetPlace,
    StartDate,
    EndDate,
    Seq,
}

/// Capability-scoped extraction interface.
///
/// The matching strategy (regex today) can be swapped for a structural HTML
/// query without changing the workflow's contract.
pub trait DocumentExtractor {
    /// Every self-contained trip fragment in the document.
    fn extract_fragments<'a>(&self, html: &'a str) -> Vec<&'a str>;

    /// One field from one fragment; `None` when the pattern does not match.
    fn extract_field(&self, fragment: &str, field: TripField) -> Option<String>;
}

/// Pattern-based parser for the trip history page.
pub struct TripHistoryParser {
    fragment_re: Regex,
    trip_type_re: Regex,
    target_place_re: Regex,
    start_date_re: Regex,
    end_date_re: Regex,
    seq_re: Regex,
    ordinal_re: Regex,
}

impl TripHistoryParser {
    pub fn new() -> Result<Self, PortalError> {
        let compile = |name: &str, pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| PortalError::Parse(format!("invalid {name} pattern: {e}")))
        };
        Ok(Self {
            fragment_re: compile(
                "fragment",
                r#"(?s)<form id="tripCancelForm" class="tripCancelForm" data-ajax="false">.*?</form>"#,
            )?,
            trip_type_re: compile("trip type", r"<th>외박구분</th>\s*<td>(.*?)</td>")?,
            target_place_re: compile("target place", r"<th>외박지역</th>\s*<td>(.*?)</td>")?,
            start_date_re: compile(
                "start date",
                r"(?s)<th>출관일시</th>\s*<td>.*?(\d{2}\.\d{2}\.\d{2}).*?</td>",
            )?,
            end_date_re: compile(
                "end date",
                r"(?s)<th>귀관일시</th>\s*<td>.*?(\d{2}\.\d{2}\.\d{2}).*?</td>",
            )?,
            seq_re: compile("seq", r#"<input type="hidden" name="seq" value="(\d+)">"#)?,
            ordinal_re: compile("ordinal", r"^\d+\.\s*")?,
        })
    }

    /// Parse every trip fragment in `html` into a record.
    ///
    /// Fragments are parsed independently: one malformed fragment degrades to
    /// sentinel fields without affecting the others. No fragments at all
    /// yields an empty list.
    pub fn parse_trip_history(&self, html: &str) -> Vec<TripRequest> {
        let fragments = self.extract_fragments(html);
        if fragments.is_empty() {
            debug!("no trip fragments found in document");
            return Vec::new();
        }
        debug!(fragments = fragments.len(), "parsing trip fragments");
        fragments
            .into_iter()
            .map(|fragment| self.parse_fragment(fragment))
            .collect()
    }

    fn parse_fragment(&self, fragment: &str) -> TripRequest {
        let trip_type = match self.extract_field(fragment, TripField::TripType) {
            // Strip the leading "N. " ordinal (e.g. "1. 주중외박" -> "주중외박").
            Some(label) => self.ordinal_re.replace(&label, "").into_owned(),
            None => {
                warn!("trip type field did not match");
                MISSING_INFO.to_string()
            }
        };
        let target_place = self
            .extract_field(fragment, TripField::TargetPlace)
            .unwrap_or_else(|| MISSING_INFO.to_string());
        let start_date = self
            .extract_field(fragment, TripField::StartDate)
            .unwrap_or_else(|| MISSING_DATE.to_string());
        let end_date = self
            .extract_field(fragment, TripField::EndDate)
            .unwrap_or_else(|| MISSING_DATE.to_string());
        let seq = self
            .extract_field(fragment, TripField::Seq)
            .unwrap_or_else(|| MISSING_SEQ.to_string());

        // Status priority: approval marker wins over everything; a live
        // (non-commented) cancel affordance means cancelable; otherwise the
        // request is still pending.
        let status = if fragment.contains(APPROVED_MARKER) {
            TripStatus::Approved
        } else if fragment.contains(CANCEL_AFFORDANCE) && !fragment.contains(COMMENTED_ANCHOR) {
            TripStatus::Cancelable
        } else {
            TripStatus::Pending
        };

        TripRequest {
            seq,
            trip_type,
            target_place,
            start_date,
            end_date,
            status,
        }
    }
}

impl DocumentExtractor for TripHistoryParser {
    fn extract_fragments<'a>(&self, html: &'a str) -> Vec<&'a str> {
        self.fragment_re
            .find_iter(html)
            .map(|m| m.as_str())
            .collect()
    }

    fn extract_field(&self, fragment: &str, field: TripField) -> Option<String> {
        let re = match field {
            TripField::TripType => &self.trip_type_re,
            TripField::TargetPlace => &self.target_place_re,
            TripField::StartDate => &self.start_date_re,
            TripField::EndDate => &self.end_date_re,
            TripField::Seq => &self.seq_re,
        };
        re.captures(fragment)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    }
}

impl Default for TripHistoryParser {
    fn default() -> Self {
        Self::new().expect("trip history patterns are valid")
    }
}

/// Locate the session-scoped hidden form token (`enteranceInfoSeq`) in the
/// request-page HTML. `None` means the form page must be re-fetched, not a
/// fatal condition.
pub fn extract_form_token(html: &str) -> Option<String> {
    let re = Regex::new(r#"<input[^>]*name="enteranceInfoSeq"[^>]*value="([^"]+)""#).unwrap();
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Format an optional date, degrading to an empty string instead of failing.
pub fn format_date_safely(date: Option<NaiveDate>, pattern: &str) -> String {
    date.map(|d| d.format(pattern).to_string())
        .unwrap_or_default()
}
