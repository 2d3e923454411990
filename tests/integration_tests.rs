//! Integration tests for knue-portal
//!
//! These run the full login / list / submit / cancel workflows against an
//! in-process mock portal that speaks just enough HTTP/1.1 and answers with
//! canned server-rendered HTML, the way the real portal does.

use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use knue_portal::store::{FORM_TOKEN_KEY, LOGGED_IN_KEY, USER_NO_KEY};
use knue_portal::{
    PortalConfig, PortalHttp, SessionManager, SessionStore, SuccessSignal, TripOutcome,
    TripService, TripStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// One canned response the mock portal serves for a method+path pair.
#[derive(Clone)]
struct Canned {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Canned {
    fn html(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A request the mock portal observed.
#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

/// Minimal HTTP/1.1 listener serving canned responses.
struct MockPortal {
    base_url: String,
    routes: Arc<Mutex<HashMap<String, Canned>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockPortal {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<HashMap<String, Canned>>> = Arc::new(Mutex::new(HashMap::new()));
        let requests: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_routes = routes.clone();
        let accept_requests = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = accept_routes.clone();
                let requests = accept_requests.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, routes, requests).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            routes,
            requests,
        }
    }

    async fn route(&self, method: &str, path: &str, canned: Canned) {
        self.routes
            .lock()
            .await
            .insert(format!("{} {}", method, path), canned);
    }

    async fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().await.clone()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, Canned>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_blank_line(&buf) {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..header_end + content_length.min(buf.len() - header_end)])
        .to_string();

    requests.lock().await.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
    });

    let canned = routes
        .lock()
        .await
        .get(&format!("{} {}", method, path))
        .cloned()
        .unwrap_or(Canned::html(404, "not found"));

    let mut response = format!(
        "HTTP/1.1 {} MockPortal\r\nContent-Length: {}\r\nConnection: close\r\n",
        canned.status,
        canned.body.len()
    );
    for (name, value) in &canned.headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(&canned.body);

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Build one trip fragment the way the portal renders it.
fn trip_fragment(seq: &str, start: &str, end: &str, approved: bool, cancelable: bool) -> String {
    let approval = if approved {
        "<font color=blue><b>외박신청이 승인되었습니다.</b></font>"
    } else {
        ""
    };
    let cancel = if cancelable {
        r##"<a href="#" class="tripCancelBtn">신청취소</a>"##
    } else {
        r##"<!-- <a href="#" class="tripCancelBtn">신청취소</a> -->"##
    };
    format!(
        r#"<form id="tripCancelForm" class="tripCancelForm" data-ajax="false">
<table>
<tr><th>외박구분</th><td>1. 주중외박</td></tr>
<tr><th>외박지역</th><td>타지역</td></tr>
<tr><th>출관일시</th><td> {start} (수) 18:00 </td></tr>
<tr><th>귀관일시</th><td> {end} (목) 09:00 </td></tr>
</table>
{approval}
<input type="hidden" name="seq" value="{seq}">
{cancel}
</form>"#
    )
}

fn request_page_html(token: &str) -> String {
    format!(
        r#"<html><body><form id="tripForm">
<input type="hidden" id="enteranceInfoSeq" name="enteranceInfoSeq" value="{token}">
</form></body></html>"#
    )
}

fn portal_date(date: NaiveDate) -> String {
    date.format("%y.%m.%d").to_string()
}

async fn client_for(portal: &MockPortal) -> (SessionStore, PortalHttp) {
    let store = SessionStore::in_memory();
    let config = PortalConfig::with_base_url(&portal.base_url);
    let http = PortalHttp::new(config, store.clone()).await.unwrap();
    (store, http)
}

#[tokio::test]
async fn test_login_with_set_cookie_succeeds() {
    let portal = MockPortal::start().await;
    portal
        .route(
            "POST",
            "/common/login",
            Canned::html(200, "").with_header("Set-Cookie", "JSESSIONID=abc; Path=/; HttpOnly"),
        )
        .await;

    let (store, http) = client_for(&portal).await;
    let session = SessionManager::new(http, store.clone());

    assert!(session.login("20231234", "hunter2", true).await);
    assert!(session.is_logged_in().await);

    let cookies = store.load_cookies().await;
    assert_eq!(cookies.get("JSESSIONID").map(String::as_str), Some("abc"));
    assert_eq!(store.get(USER_NO_KEY).await.as_deref(), Some("20231234"));

    // Credentials were remembered for auto-login.
    let creds = session.get_saved_credentials().await.unwrap();
    assert_eq!(creds.user_no, "20231234");

    // The login post carried the portal's access-control headers and the
    // URL-encoded credential form.
    let recorded = portal.requests().await;
    let login = &recorded[0];
    assert_eq!(login.method, "POST");
    assert_eq!(
        login.headers.get("x-requested-with").map(String::as_str),
        Some("kr.acanet.knueapp")
    );
    assert!(login.body.contains("userNo=20231234"));
    assert!(login.body.contains("rememberMe=N"));
}

#[tokio::test]
async fn test_login_redirect_is_equivalent_to_status_success() {
    let portal = MockPortal::start().await;
    portal
        .route(
            "POST",
            "/common/login",
            Canned::html(302, "")
                .with_header("Set-Cookie", "JSESSIONID=redir; Path=/")
                .with_header("Location", "/common/main"),
        )
        .await;
    portal
        .route("GET", "/common/main", Canned::html(200, "<html>main</html>"))
        .await;

    let (store, http) = client_for(&portal).await;
    let session = SessionManager::new(http, store.clone());

    assert!(session.login("20231234", "hunter2", false).await);
    assert!(session.is_logged_in().await);
    // The cookie set on the intermediate hop was not dropped.
    assert_eq!(
        store.load_cookies().await.get("JSESSIONID").map(String::as_str),
        Some("redir")
    );
    // No opt-in, no stored secret.
    assert!(session.get_saved_credentials().await.is_none());
}

#[tokio::test]
async fn test_rejected_login_reports_false_without_panicking() {
    let portal = MockPortal::start().await;
    portal
        .route("POST", "/common/login", Canned::html(401, "denied"))
        .await;

    let (store, http) = client_for(&portal).await;
    let session = SessionManager::new(http, store.clone());

    assert!(!session.login("20231234", "wrong", true).await);
    assert!(!session.is_logged_in().await);
    assert!(session.get_saved_credentials().await.is_none());
}

#[tokio::test]
async fn test_stored_cookies_ride_along_on_later_requests() {
    let portal = MockPortal::start().await;
    portal
        .route(
            "POST",
            "/common/login",
            Canned::html(200, "").with_header("Set-Cookie", "JSESSIONID=abc; Path=/"),
        )
        .await;
    portal
        .route(
            "GET",
            "/dormitory/student/trip?menuId=341&tab=2",
            Canned::html(200, "<html>empty</html>"),
        )
        .await;

    let (store, http) = client_for(&portal).await;
    let session = SessionManager::new(http.clone(), store.clone());
    assert!(session.login("20231234", "hunter2", false).await);

    let service = TripService::new(http, store).unwrap();
    let trips = service.fetch_trip_list().await.unwrap();
    assert!(trips.is_empty());

    let recorded = portal.requests().await;
    let list = recorded.iter().find(|r| r.path.contains("tab=2")).unwrap();
    assert_eq!(
        list.headers.get("cookie").map(String::as_str),
        Some("JSESSIONID=abc")
    );
}

#[tokio::test]
async fn test_submit_confirmed_by_refreshed_list() {
    let portal = MockPortal::start().await;
    let start = Local::now().date_naive() + ChronoDuration::days(1);
    let end = start + ChronoDuration::days(1);

    portal
        .route(
            "GET",
            "/dormitory/student/trip?menuId=341&tab=1",
            Canned::html(200, &request_page_html("98765")),
        )
        .await;
    portal
        .route(
            "POST",
            "/dormitory/student/trip/apply",
            Canned::html(
                200,
                &trip_fragment("555", &portal_date(start), &portal_date(end), false, true),
            ),
        )
        .await;

    let (store, http) = client_for(&portal).await;
    store.set(LOGGED_IN_KEY, "true").await.unwrap();
    store.set(USER_NO_KEY, "20231234").await.unwrap();

    let service = TripService::new(http, store.clone()).unwrap();
    let result = service
        .submit(&knue_portal::TripSubmission {
            start_date: start,
            end_date: end,
        })
        .await;

    assert_eq!(
        result.outcome,
        TripOutcome::Confirmed(SuccessSignal::BodyDerived)
    );
    assert_eq!(result.trips.len(), 1);
    assert_eq!(result.trips[0].seq, "555");
    assert_eq!(result.trips[0].status, TripStatus::Cancelable);

    // The form token was fetched once and cached.
    assert_eq!(store.get(FORM_TOKEN_KEY).await.as_deref(), Some("98765"));
    let recorded = portal.requests().await;
    let apply = recorded.iter().find(|r| r.path.ends_with("/apply")).unwrap();
    assert!(apply.body.contains("enteranceInfoSeq=98765"));
    assert!(apply.body.contains("hakbeon=20231234"));
    assert!(apply
        .body
        .contains(&format!("startDate={}", start.format("%Y-%m-%d"))));
}

#[tokio::test]
async fn test_unconfirmed_submit_refreshes_list_and_drops_token() {
    let portal = MockPortal::start().await;
    let start = Local::now().date_naive() + ChronoDuration::days(1);
    let end = start + ChronoDuration::days(1);
    let unrelated_start = start + ChronoDuration::days(30);
    let unrelated_end = unrelated_start + ChronoDuration::days(1);

    portal
        .route(
            "GET",
            "/dormitory/student/trip?menuId=341&tab=1",
            Canned::html(200, &request_page_html("98765")),
        )
        .await;
    // The apply response shows only an unrelated request.
    portal
        .route(
            "POST",
            "/dormitory/student/trip/apply",
            Canned::html(
                200,
                &trip_fragment(
                    "999",
                    &portal_date(unrelated_start),
                    &portal_date(unrelated_end),
                    false,
                    true,
                ),
            ),
        )
        .await;
    portal
        .route(
            "GET",
            "/dormitory/student/trip?menuId=341&tab=2",
            Canned::html(
                200,
                &trip_fragment(
                    "999",
                    &portal_date(unrelated_start),
                    &portal_date(unrelated_end),
                    false,
                    true,
                ),
            ),
        )
        .await;

    let (store, http) = client_for(&portal).await;
    store.set(LOGGED_IN_KEY, "true").await.unwrap();
    store.set(USER_NO_KEY, "20231234").await.unwrap();

    let service = TripService::new(http, store.clone()).unwrap();
    let result = service
        .submit(&knue_portal::TripSubmission {
            start_date: start,
            end_date: end,
        })
        .await;

    assert_eq!(result.outcome, TripOutcome::Unconfirmed);
    assert_eq!(result.trips.len(), 1);

    // The canonical list was re-fetched and the possibly stale token dropped.
    let recorded = portal.requests().await;
    assert!(recorded.iter().any(|r| r.path.contains("tab=2")));
    assert!(store.get(FORM_TOKEN_KEY).await.is_none());
}

#[tokio::test]
async fn test_cancel_confirmed_by_absence() {
    let portal = MockPortal::start().await;
    let start = Local::now().date_naive() + ChronoDuration::days(1);
    let end = start + ChronoDuration::days(1);

    // After cancellation the portal renders a list without the item.
    portal
        .route(
            "POST",
            "/dormitory/student/trip/cancel?menuId=341",
            Canned::html(200, "<html><body>외박 신청 내역이 없습니다.</body></html>"),
        )
        .await;

    let (store, http) = client_for(&portal).await;
    let service = TripService::new(http, store).unwrap();

    let item = knue_portal::TripRequest {
        seq: "555".to_string(),
        trip_type: "주중외박".to_string(),
        target_place: "타지역".to_string(),
        start_date: portal_date(start),
        end_date: portal_date(end),
        status: TripStatus::Cancelable,
    };
    let result = service.cancel(&item).await;

    assert_eq!(
        result.outcome,
        TripOutcome::Confirmed(SuccessSignal::BodyDerived)
    );
    assert!(result.trips.is_empty());

    // The 2-digit portal dates were widened for the cancel form.
    let recorded = portal.requests().await;
    let cancel = recorded.iter().find(|r| r.method == "POST").unwrap();
    assert!(cancel.body.contains("seq=555"));
    assert!(cancel
        .body
        .contains(&format!("startDate={}", start.format("%Y-%m-%d"))));
}

#[tokio::test]
async fn test_cancel_of_approved_item_never_reaches_the_portal() {
    let portal = MockPortal::start().await;
    let (store, http) = client_for(&portal).await;
    let service = TripService::new(http, store).unwrap();

    let item = knue_portal::TripRequest {
        seq: "555".to_string(),
        trip_type: "주중외박".to_string(),
        target_place: "타지역".to_string(),
        start_date: "25.03.12".to_string(),
        end_date: "25.03.13".to_string(),
        status: TripStatus::Approved,
    };
    let result = service.cancel(&item).await;

    match result.outcome {
        TripOutcome::Rejected(_) => {}
        other => panic!("expected client-side rejection, got {:?}", other),
    }
    assert!(portal.requests().await.is_empty());
}

#[tokio::test]
async fn test_validate_session_distinguishes_login_page() {
    let portal = MockPortal::start().await;
    portal
        .route(
            "GET",
            "/dormitory/student/trip?menuId=341",
            Canned::html(200, "<html><body>외박 메뉴</body></html>"),
        )
        .await;

    let (store, http) = client_for(&portal).await;
    let session = SessionManager::new(http, store);
    assert!(session.validate_session().await);

    // An expired session lands on the login form instead.
    portal
        .route(
            "GET",
            "/dormitory/student/trip?menuId=341",
            Canned::html(200, r#"<html><form><input name="userNo"></form></html>"#),
        )
        .await;
    assert!(!session.validate_session().await);
}

#[tokio::test]
async fn test_validate_session_fails_closed_when_unreachable() {
    // Nothing is listening on this store's base URL.
    let store = SessionStore::in_memory();
    let config = PortalConfig::with_base_url("http://127.0.0.1:9");
    let http = PortalHttp::new(config, store.clone()).await.unwrap();
    let session = SessionManager::new(http, store);
    assert!(!session.validate_session().await);
}

#[tokio::test]
async fn test_logout_clears_local_state_even_if_remote_fails() {
    let portal = MockPortal::start().await;
    // No logout route: the remote call 404s and is ignored.
    let (store, http) = client_for(&portal).await;
    store.set(LOGGED_IN_KEY, "true").await.unwrap();
    let mut cookies = HashMap::new();
    cookies.insert("JSESSIONID".to_string(), "abc".to_string());
    store.save_cookies(&cookies).await;
    store
        .save_credentials(&knue_portal::Credentials {
            user_no: "20231234".to_string(),
            password: "hunter2".to_string(),
        })
        .await
        .unwrap();

    let session = SessionManager::new(http, store.clone());

    assert!(session.logout(false).await);
    assert!(!session.is_logged_in().await);
    assert!(store.load_cookies().await.is_empty());
    // Credentials survive unless their deletion was requested.
    assert!(session.get_saved_credentials().await.is_some());

    assert!(session.logout(true).await);
    assert!(session.get_saved_credentials().await.is_none());
}
