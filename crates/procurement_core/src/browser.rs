//! Headless-browser transport for the JavaScript-rendered portal. One
//! browser per crawler process, one page reused across navigations —
//! dropdown pagination is stateful server-side, so the page must live
//! through the whole listing traversal.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::Page;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::fetch::{CookieRecord, FetchResult};

/// How long to poll for a selector before giving up with ContentTimeout.
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What to wait for after navigation settles.
#[derive(Debug, Clone, Default)]
pub struct WaitStrategy {
    /// CSS selector that must appear before the page counts as rendered.
    pub selector: Option<String>,
    /// Fixed delay applied after load (for portals with no stable anchor).
    pub delay: Option<Duration>,
}

pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl BrowserSession {
    pub async fn launch() -> Result<Self, FetchError> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1440, 900)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .build()
            .map_err(FetchError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;

        Ok(BrowserSession {
            browser,
            handler_task,
            page,
        })
    }

    /// Navigate and wait for the content to actually render.
    pub async fn navigate(
        &self,
        url: &str,
        wait: &WaitStrategy,
        timeout: Duration,
    ) -> Result<FetchResult, FetchError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let _ = self.page.wait_for_navigation().await;
        self.settle(wait, timeout).await?;
        self.snapshot().await
    }

    /// Re-read the current DOM without navigating (after a postback).
    pub async fn snapshot(&self) -> Result<FetchResult, FetchError> {
        let html = self
            .page
            .content()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;
        let final_url = self
            .page
            .url()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?
            .unwrap_or_default();
        Ok(FetchResult {
            html,
            final_url,
            status: 200,
            cookies: self.cookies().await.unwrap_or_default(),
        })
    }

    async fn settle(&self, wait: &WaitStrategy, timeout: Duration) -> Result<(), FetchError> {
        if let Some(selector) = &wait.selector {
            self.wait_for_selector(selector, timeout).await?;
        }
        if let Some(delay) = wait.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Poll until the selector matches; the portals inject listing tables
    /// well after the load event fires.
    pub async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FetchError::ContentTimeout(timeout.as_secs()));
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    /// Click an element and let any resulting postback settle.
    pub async fn click(&self, selector: &str) -> Result<(), FetchError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| FetchError::Browser(format!("{}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    /// Set a `<select>` to `value` and fire the change event. Returns false
    /// when the dropdown or the option is missing — the caller reloads the
    /// landing page and re-applies its filters.
    pub async fn select_option(&self, selector: &str, value: &str) -> Result<bool, FetchError> {
        let script = format!(
            r#"(function() {{
                var el = document.querySelector({sel});
                if (!el) return false;
                var found = false;
                for (var i = 0; i < el.options.length; i++) {{
                    if (el.options[i].value === {val}) {{ found = true; break; }}
                }}
                if (!found) return false;
                el.value = {val};
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = serde_json::to_string(selector).unwrap_or_default(),
            val = serde_json::to_string(value).unwrap_or_default(),
        );
        let accepted: bool = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?
            .into_value()
            .unwrap_or(false);
        if accepted {
            // Change handlers on this portal trigger a server roundtrip.
            let _ = self.page.wait_for_navigation().await;
        } else {
            debug!("Dropdown {} rejected value {}", selector, value);
        }
        Ok(accepted)
    }

    /// Visible text of the first element matching `selector`.
    pub async fn inner_text(&self, selector: &str) -> Option<String> {
        let element = self.page.find_element(selector).await.ok()?;
        element.inner_text().await.ok().flatten()
    }

    /// Seed the browser with cookies from the HTTP session's jar so the
    /// rendered portal sees the same login.
    pub async fn set_cookies(&self, cookies: &[CookieRecord]) -> Result<(), FetchError> {
        for cookie in cookies {
            let param = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.trim_start_matches('.').to_string())
                .path(cookie.path.clone())
                .build()
                .map_err(FetchError::Browser)?;
            self.page
                .set_cookie(param)
                .await
                .map_err(|e| FetchError::Browser(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn cookies(&self) -> Result<Vec<CookieRecord>, FetchError> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;
        Ok(cookies
            .into_iter()
            .map(|c| CookieRecord {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: if c.expires > 0.0 {
                    DateTime::<Utc>::from_timestamp(c.expires as i64, 0)
                } else {
                    None
                },
            })
            .collect())
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}
