use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use std::ffi::OsString;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use tavreg_core::config::BrowserConfig;
use tavreg_core::RegisterError;

/// One browser session. Every wait takes an explicit bound supplied by the
/// caller and fails with `ElementNotFound` or `NavigationTimeout` instead
/// of hanging.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), RegisterError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), RegisterError>;
    async fn click(&self, selector: &str) -> Result<(), RegisterError>;
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), RegisterError>;
    async fn page_html(&self) -> Result<String, RegisterError>;
    async fn current_url(&self) -> Result<String, RegisterError>;
    /// Run a JS expression and return its string value, if any.
    async fn evaluate(&self, js: &str) -> Result<Option<String>, RegisterError>;
    /// PNG capture of the viewport around `selector` (used for captcha
    /// images).
    async fn capture_png(&self, selector: &str) -> Result<Vec<u8>, RegisterError>;
    /// Release the session. Also invoked implicitly on drop.
    async fn close(&self);
}

pub struct HeadlessBrowser {
    browser: Browser,
    tab: Mutex<Option<Arc<Tab>>>,
}

impl HeadlessBrowser {
    pub fn new(config: &BrowserConfig) -> Result<Self, RegisterError> {
        let mut extra_args: Vec<OsString> = Vec::new();

        // Required when running inside containers
        extra_args.push(OsString::from("--no-sandbox"));
        extra_args.push(OsString::from("--disable-dev-shm-usage"));
        extra_args.push(OsString::from("--disable-gpu"));
        extra_args.push(OsString::from(format!(
            "--user-agent={}",
            config.user_agent
        )));

        let mut builder = headless_chrome::LaunchOptionsBuilder::default();
        builder
            .headless(config.headless)
            .window_size(Some((config.window_width, config.window_height)))
            .args(extra_args.iter().map(|a| a.as_ref()).collect());

        // CHROME_PATH env var for Docker/custom installs
        if let Ok(chrome_path) = std::env::var("CHROME_PATH") {
            builder.path(Some(std::path::PathBuf::from(chrome_path)));
        }

        let launch_options = builder
            .build()
            .map_err(|e| RegisterError::Browser(e.to_string()))?;

        let browser =
            Browser::new(launch_options).map_err(|e| RegisterError::Browser(e.to_string()))?;

        Ok(Self {
            browser,
            tab: Mutex::new(None),
        })
    }

    fn tab(&self) -> Result<Arc<Tab>, RegisterError> {
        let mut guard = self.tab.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let tab = self
                .browser
                .new_tab()
                .map_err(|e| RegisterError::Browser(e.to_string()))?;
            *guard = Some(tab);
        }
        Ok(guard.as_ref().cloned().unwrap())
    }
}

#[async_trait]
impl BrowserDriver for HeadlessBrowser {
    /// Navigate and wait for the page to settle: DOM ready, no interstitial
    /// "please wait" screen, substantial content rendered.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), RegisterError> {
        let tab = self.tab()?;

        info!(url, "navigating");

        tab.navigate_to(url)
            .map_err(|e| RegisterError::Browser(e.to_string()))?;
        tab.wait_until_navigated()
            .map_err(|e| RegisterError::Browser(e.to_string()))?;

        let wait_start = std::time::Instant::now();
        loop {
            if wait_start.elapsed() > timeout {
                warn!(url, "timeout waiting for content");
                return Err(RegisterError::NavigationTimeout(timeout.as_secs()));
            }

            let html = tab
                .get_content()
                .map_err(|e| RegisterError::Browser(e.to_string()))?;

            if !has_waiting_screen(&html) && html.len() > 2000 {
                break;
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), RegisterError> {
        let tab = self.tab()?;
        let result = tab.evaluate(
            &format!(
                r#"
                const elem = document.querySelector('{sel}');
                if (elem) {{
                    elem.value = '{val}';
                    elem.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    elem.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    true;
                }} else {{
                    false;
                }}
                "#,
                sel = escape_js(selector),
                val = escape_js(value),
            ),
            false,
        );

        match result {
            Ok(obj) => {
                if obj.value.and_then(|v| v.as_bool()) == Some(true) {
                    Ok(())
                } else {
                    Err(RegisterError::ElementNotFound(selector.to_string()))
                }
            }
            Err(e) => Err(RegisterError::Browser(e.to_string())),
        }
    }

    async fn click(&self, selector: &str) -> Result<(), RegisterError> {
        let tab = self.tab()?;
        let result = tab.evaluate(
            &format!(
                r#"
                const elem = document.querySelector('{sel}');
                if (elem) {{ elem.click(); true; }} else {{ false; }}
                "#,
                sel = escape_js(selector),
            ),
            false,
        );

        match result {
            Ok(obj) => {
                if obj.value.and_then(|v| v.as_bool()) == Some(true) {
                    Ok(())
                } else {
                    Err(RegisterError::ElementNotFound(selector.to_string()))
                }
            }
            Err(e) => Err(RegisterError::Browser(e.to_string())),
        }
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<(), RegisterError> {
        let tab = self.tab()?;
        tab.wait_for_element_with_custom_timeout(selector, timeout)
            .map(|_| ())
            .map_err(|_| RegisterError::ElementNotFound(selector.to_string()))
    }

    async fn page_html(&self) -> Result<String, RegisterError> {
        let tab = self.tab()?;
        tab.get_content()
            .map_err(|e| RegisterError::Browser(e.to_string()))
    }

    async fn current_url(&self) -> Result<String, RegisterError> {
        let tab = self.tab()?;
        Ok(tab.get_url())
    }

    async fn evaluate(&self, js: &str) -> Result<Option<String>, RegisterError> {
        let tab = self.tab()?;
        let result = tab
            .evaluate(js, true)
            .map_err(|e| RegisterError::Browser(e.to_string()))?;
        Ok(result.value.and_then(|v| v.as_str().map(String::from)))
    }

    async fn capture_png(&self, selector: &str) -> Result<Vec<u8>, RegisterError> {
        let tab = self.tab()?;

        // Scroll the element into view so the capture contains it. A
        // viewport capture is enough for the OCR service; element-bound
        // cropping is not worth the CDP round trips.
        tab.evaluate(
            &format!(
                r#"
                const elem = document.querySelector('{sel}');
                if (elem) {{ elem.scrollIntoView(); }}
                "#,
                sel = escape_js(selector),
            ),
            false,
        )
        .map_err(|e| RegisterError::Browser(e.to_string()))?;

        tab.capture_screenshot(
            headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption::Png,
            None,
            None,
            true,
        )
        .map_err(|e| RegisterError::Browser(e.to_string()))
    }

    async fn close(&self) {
        let tab = {
            let mut guard = self.tab.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(tab) = tab {
            tab.close(true).ok();
        }
        // The chromium process itself is reaped when `Browser` drops.
    }
}

/// Detect interstitial waiting/challenge screens that render before the
/// real page.
pub fn has_waiting_screen(html: &str) -> bool {
    let html_lower = html.to_lowercase();

    html_lower.contains("please wait")
        || html_lower.contains("checking your browser")
        || html_lower.contains("ddos protection")
        || html_lower.contains("just a moment")
        || html_lower.contains("verifying you are human")
}

fn escape_js(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
