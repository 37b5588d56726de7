//! HTTP half of the fetch session: retrying client, cookie persistence,
//! form login and transparent re-authentication. The browser half lives in
//! [`crate::browser`]; both return the same [`FetchResult`].
//!
//! No other component in the workspace retries HTTP — the retry policy
//! lives here and nowhere else.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::header::SET_COOKIE;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Session cookies persisted to disk are trusted for this long.
pub const COOKIE_TTL_HOURS: i64 = 4;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Exponential backoff with jitter, shared by HTTP and browser fetches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt,
    /// +/-20% jitter, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(5)) as u64;
        let jitter: f64 = rand::rng().random_range(-0.2..=0.2);
        let jittered = (exp as f64 * (1.0 + jitter)) as u64;
        Duration::from_millis(jittered.min(self.max_delay.as_millis() as u64))
    }
}

/// What both transport modes hand back to the crawlers.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub html: String,
    pub final_url: String,
    pub status: u16,
    pub cookies: Vec<CookieRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
}

/// On-disk cookie jar: `{cookies: [...], created_at}`. A jar older than
/// [`COOKIE_TTL_HOURS`] is treated as expired on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieJarFile {
    pub cookies: Vec<CookieRecord>,
    pub created_at: DateTime<Utc>,
}

impl CookieJarFile {
    pub fn load(path: &Path) -> Option<CookieJarFile> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self).unwrap_or_default())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > ChronoDuration::hours(COOKIE_TTL_HOURS)
    }
}

/// Portal login form description. Field names follow the portal's
/// server-rendered form; hidden inputs are echoed back on submit.
#[derive(Debug, Clone)]
pub struct LoginSpec {
    pub login_url: String,
    pub username_field: String,
    pub password_field: String,
}

/// Fingerprint of the portal's login page showing up where content was
/// requested — the signal that the session has expired server-side.
pub fn looks_like_login_page(html: &str) -> bool {
    let doc = Html::parse_document(html);
    let password_sel = Selector::parse(r#"input[type="password"]"#).expect("selector");
    if doc.select(&password_sel).next().is_none() {
        return false;
    }
    let form_sel = Selector::parse("form").expect("selector");
    doc.select(&form_sel).any(|form| {
        form.value()
            .attr("action")
            .map(|a| {
                let a = a.to_lowercase();
                a.contains("login") || a.contains("logon") || a.contains("najava")
            })
            .unwrap_or(true)
    })
}

/// Authenticated, retrying HTTP session with a persistent cookie jar.
pub struct FetchSession {
    client: Client,
    jar: Arc<Jar>,
    jar_path: Option<PathBuf>,
    cookies: Vec<CookieRecord>,
    credentials: Option<(String, String)>,
    login: Option<LoginSpec>,
    retry: RetryPolicy,
    timeout: Duration,
    /// Consecutive login-page detections; the second one aborts the run.
    auth_failures: u32,
}

impl FetchSession {
    /// Anonymous session (portal B, document downloads).
    pub fn new(retry: RetryPolicy) -> Result<Self, FetchError> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(jar.clone())
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(FetchSession {
            client,
            jar,
            jar_path: None,
            cookies: Vec::new(),
            credentials: None,
            login: None,
            retry,
            timeout: Duration::from_secs(60),
            auth_failures: 0,
        })
    }

    /// Logged-in session for portal A. Reuses the persisted jar when it is
    /// fresher than the TTL, otherwise performs the form login.
    pub async fn authenticated_session(
        jar_path: PathBuf,
        username: String,
        password: String,
        login: LoginSpec,
        retry: RetryPolicy,
    ) -> Result<Self, FetchError> {
        let mut session = FetchSession::new(retry)?;
        session.jar_path = Some(jar_path.clone());
        session.credentials = Some((username, password));
        session.login = Some(login);

        match CookieJarFile::load(&jar_path) {
            Some(saved) if !saved.is_expired(Utc::now()) => {
                info!("Reusing persisted session ({} cookies)", saved.cookies.len());
                session.seed_cookies(&saved.cookies);
                session.cookies = saved.cookies;
            }
            Some(_) => {
                info!("Persisted session older than {}h, logging in", COOKIE_TTL_HOURS);
                session.do_login().await?;
            }
            None => {
                info!("No persisted session, logging in");
                session.do_login().await?;
            }
        }
        Ok(session)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn cookies(&self) -> &[CookieRecord] {
        &self.cookies
    }

    fn seed_cookies(&mut self, cookies: &[CookieRecord]) {
        for cookie in cookies {
            let host = cookie.domain.trim_start_matches('.');
            if let Ok(url) = Url::parse(&format!("https://{}/", host)) {
                let header = format!(
                    "{}={}; Domain={}; Path={}",
                    cookie.name, cookie.value, cookie.domain, cookie.path
                );
                self.jar.add_cookie_str(&header, &url);
            }
        }
    }

    /// Fetch a content page. Retries transient failures per policy, detects
    /// the login-page fingerprint and re-authenticates once before failing
    /// the run with [`FetchError::AuthExpired`].
    pub async fn fetch(&mut self, url: &str) -> Result<FetchResult, FetchError> {
        let result = self.fetch_with_retries(url).await?;
        if self.credentials.is_some() && looks_like_login_page(&result.html) {
            self.auth_failures += 1;
            if self.auth_failures > 1 {
                warn!("Login page seen twice in a row, aborting run");
                return Err(FetchError::AuthExpired);
            }
            info!("Session expired server-side, re-authenticating");
            self.invalidate_session();
            self.do_login().await?;
            let retried = self.fetch_with_retries(url).await?;
            if looks_like_login_page(&retried.html) {
                return Err(FetchError::AuthExpired);
            }
            self.auth_failures = 0;
            return Ok(retried);
        }
        self.auth_failures = 0;
        Ok(result)
    }

    async fn fetch_with_retries(&mut self, url: &str) -> Result<FetchResult, FetchError> {
        let mut last_err = FetchError::Network("no attempts made".to_string());
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.backoff_delay(attempt - 1);
                debug!("Retry {} for {} after {:?}", attempt, url, delay);
                tokio::time::sleep(delay).await;
            }
            match self.fetch_once(url).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() => {
                    warn!("Attempt {} for {} failed: {}", attempt + 1, url, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn fetch_once(&mut self, url: &str) -> Result<FetchResult, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(FetchError::AuthExpired);
        }
        if status.is_client_error() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        self.record_set_cookies(&response);
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(FetchResult {
            html,
            final_url,
            status: status.as_u16(),
            cookies: self.cookies.clone(),
        })
    }

    /// POST a server-side form (dropdown pagination, filter selection).
    pub async fn post_form(
        &mut self,
        url: &str,
        form: &HashMap<String, String>,
    ) -> Result<FetchResult, FetchError> {
        let mut last_err = FetchError::Network("no attempts made".to_string());
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff_delay(attempt - 1)).await;
            }
            let sent = self
                .client
                .post(url)
                .timeout(self.timeout)
                .form(form)
                .send()
                .await;
            match sent {
                Ok(response) if response.status().is_server_error() => {
                    last_err = FetchError::HttpStatus(response.status().as_u16());
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    self.record_set_cookies(&response);
                    let final_url = response.url().to_string();
                    let html = response
                        .text()
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()))?;
                    return Ok(FetchResult {
                        html,
                        final_url,
                        status,
                        cookies: self.cookies.clone(),
                    });
                }
                Err(e) => last_err = FetchError::Network(e.to_string()),
            }
        }
        Err(last_err)
    }

    /// Download a binary document, honoring a byte cap.
    pub async fn download(&mut self, url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
        let mut last_err = FetchError::Network("no attempts made".to_string());
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff_delay(attempt - 1)).await;
            }
            let sent = self.client.get(url).timeout(self.timeout).send().await;
            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(FetchError::AuthExpired);
                    }
                    if status.is_server_error() {
                        last_err = FetchError::HttpStatus(status.as_u16());
                        continue;
                    }
                    if !status.is_success() {
                        return Err(FetchError::HttpStatus(status.as_u16()));
                    }
                    if let Some(len) = response.content_length() {
                        if len > max_bytes {
                            return Err(FetchError::TooLarge {
                                limit: max_bytes,
                                got: len,
                            });
                        }
                    }
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()))?;
                    if bytes.len() as u64 > max_bytes {
                        return Err(FetchError::TooLarge {
                            limit: max_bytes,
                            got: bytes.len() as u64,
                        });
                    }
                    return Ok(bytes.to_vec());
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_err = FetchError::Network(e.to_string());
                }
                Err(e) => return Err(FetchError::Network(e.to_string())),
            }
        }
        Err(last_err)
    }

    /// Cheap cloneable handle for bounded-concurrency detail fetches.
    /// Shares this session's cookie jar; performs no auth handling itself —
    /// the caller inspects results for the login fingerprint and asks the
    /// session to [`FetchSession::relogin`].
    pub fn detail_client(&self) -> DetailClient {
        DetailClient {
            client: self.client.clone(),
            retry: self.retry.clone(),
            timeout: self.timeout,
        }
    }

    /// Drop the current session state and log in again. Used when a detail
    /// fetch came back as the login page.
    pub async fn relogin(&mut self) -> Result<(), FetchError> {
        self.auth_failures += 1;
        if self.auth_failures > 1 {
            return Err(FetchError::AuthExpired);
        }
        self.invalidate_session();
        self.do_login().await?;
        Ok(())
    }

    /// Reset the consecutive-failure counter after a successful recovery.
    pub fn mark_authenticated(&mut self) {
        self.auth_failures = 0;
    }

    fn invalidate_session(&mut self) {
        self.cookies.clear();
        self.jar = Arc::new(Jar::default());
        if let Ok(client) = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(self.jar.clone())
            .timeout(Duration::from_secs(60))
            .build()
        {
            self.client = client;
        }
        if let Some(path) = &self.jar_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Form login: GET the login page, echo its hidden inputs back with the
    /// credentials, then persist the resulting cookies.
    async fn do_login(&mut self) -> Result<(), FetchError> {
        let (username, password) = self
            .credentials
            .clone()
            .ok_or(FetchError::AuthExpired)?;
        let login = self.login.clone().ok_or(FetchError::AuthExpired)?;

        let page = self.fetch_with_retries(&login.login_url).await?;
        let mut form = hidden_form_fields(&page.html);
        form.insert(login.username_field.clone(), username);
        form.insert(login.password_field.clone(), password);

        let response = self.post_form(&login.login_url, &form).await?;
        if looks_like_login_page(&response.html) {
            warn!("Login POST returned the login page again");
            return Err(FetchError::AuthExpired);
        }

        if let Some(path) = self.jar_path.clone() {
            let jar_file = CookieJarFile {
                cookies: self.cookies.clone(),
                created_at: Utc::now(),
            };
            if let Err(e) = jar_file.save(&path) {
                warn!("Could not persist cookie jar to {:?}: {}", path, e);
            }
        }
        info!("Login successful ({} cookies)", self.cookies.len());
        Ok(())
    }

    fn record_set_cookies(&mut self, response: &reqwest::Response) {
        let domain = response.url().host_str().unwrap_or_default().to_string();
        for value in response.headers().get_all(SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                if let Some(record) = parse_set_cookie(raw, &domain) {
                    self.cookies.retain(|c| c.name != record.name);
                    self.cookies.push(record);
                }
            }
        }
    }
}

/// Clone-per-task fetcher for dossier detail pages. Retries transient
/// failures with the same policy as the owning session.
#[derive(Clone)]
pub struct DetailClient {
    client: Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl DetailClient {
    pub async fn fetch(&self, url: &str) -> Result<FetchResult, FetchError> {
        let mut last_err = FetchError::Network("no attempts made".to_string());
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff_delay(attempt - 1)).await;
            }
            let sent = self.client.get(url).timeout(self.timeout).send().await;
            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        last_err = FetchError::HttpStatus(status.as_u16());
                        continue;
                    }
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(FetchError::AuthExpired);
                    }
                    if !status.is_success() {
                        return Err(FetchError::HttpStatus(status.as_u16()));
                    }
                    let final_url = response.url().to_string();
                    let html = response
                        .text()
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()))?;
                    return Ok(FetchResult {
                        html,
                        final_url,
                        status: status.as_u16(),
                        cookies: Vec::new(),
                    });
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_err = FetchError::Network(e.to_string());
                }
                Err(e) => return Err(FetchError::Network(e.to_string())),
            }
        }
        Err(last_err)
    }
}

/// Hidden inputs of the first form on the page, name -> value. ASP.NET
/// state fields (__VIEWSTATE and friends) must be echoed on every POST.
pub fn hidden_form_fields(html: &str) -> HashMap<String, String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse(r#"input[type="hidden"]"#).expect("selector");
    let mut fields = HashMap::new();
    for input in doc.select(&sel) {
        if let Some(name) = input.value().attr("name") {
            let value = input.value().attr("value").unwrap_or("");
            fields.insert(name.to_string(), value.to_string());
        }
    }
    fields
}

fn parse_set_cookie(raw: &str, default_domain: &str) -> Option<CookieRecord> {
    let mut parts = raw.split(';');
    let pair = parts.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let mut record = CookieRecord {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        domain: default_domain.to_string(),
        path: "/".to_string(),
        expires: None,
    };
    for attr in parts {
        let attr = attr.trim();
        if let Some((key, val)) = attr.split_once('=') {
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => record.domain = val.trim().to_string(),
                "path" => record.path = val.trim().to_string(),
                "expires" => {
                    record.expires = DateTime::parse_from_rfc2822(val.trim())
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc));
                }
                _ => {}
            }
        }
    }
    if record.name.is_empty() {
        return None;
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jar_file_expires_after_ttl() {
        let jar = CookieJarFile {
            cookies: vec![],
            created_at: Utc::now() - ChronoDuration::hours(5),
        };
        assert!(jar.is_expired(Utc::now()));

        let fresh = CookieJarFile {
            cookies: vec![],
            created_at: Utc::now() - ChronoDuration::hours(3),
        };
        assert!(!fresh.is_expired(Utc::now()));
    }

    #[test]
    fn jar_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_cookies.json");
        let jar = CookieJarFile {
            cookies: vec![CookieRecord {
                name: "ASP.NET_SessionId".to_string(),
                value: "abc123".to_string(),
                domain: "e-nabavki.gov.mk".to_string(),
                path: "/".to_string(),
                expires: None,
            }],
            created_at: Utc::now(),
        };
        jar.save(&path).unwrap();
        let loaded = CookieJarFile::load(&path).unwrap();
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(loaded.cookies[0].name, "ASP.NET_SessionId");
    }

    #[test]
    fn detects_login_page() {
        let login = r#"<html><body>
            <form action="/Account/Login" method="post">
              <input type="text" name="UserName"/>
              <input type="password" name="Password"/>
            </form></body></html>"#;
        assert!(looks_like_login_page(login));

        let content = r#"<html><body><table><tr><td>Јавна набавка</td></tr></table></body></html>"#;
        assert!(!looks_like_login_page(content));
    }

    #[test]
    fn parses_set_cookie_header() {
        let record = parse_set_cookie(
            "session=xyz; Domain=.e-nabavki.gov.mk; Path=/; HttpOnly",
            "e-nabavki.gov.mk",
        )
        .unwrap();
        assert_eq!(record.name, "session");
        assert_eq!(record.value, "xyz");
        assert_eq!(record.domain, ".e-nabavki.gov.mk");
    }

    #[test]
    fn hidden_fields_are_collected() {
        let html = r#"<form>
            <input type="hidden" name="__VIEWSTATE" value="abc"/>
            <input type="hidden" name="__EVENTVALIDATION" value="def"/>
            <input type="text" name="visible" value="x"/>
        </form>"#;
        let fields = hidden_form_fields(html);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["__VIEWSTATE"], "abc");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let first = policy.backoff_delay(0);
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        let capped = policy.backoff_delay(10);
        assert!(capped <= Duration::from_secs(30));
    }
}
