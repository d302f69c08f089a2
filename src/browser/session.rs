use anyhow::{Result, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::browser::behavior::BehaviorSimulator;
use crate::browser::fingerprint::Fingerprint;
use crate::bypass::{ChallengeKind, ChallengePage};
use crate::cli::config::BrowserSettings;
use crate::crawler::options::Geolocation;
use crate::error::CrawlError;
use crate::proxy::ProxyLease;

/// Collects uncaught script errors from the first script of every document
const ERROR_HOOK: &str = r#"
window.__clonerErrors = [];
window.addEventListener('error', function (e) {
  window.__clonerErrors.push(String(e.message || e));
});
window.addEventListener('unhandledrejection', function (e) {
  window.__clonerErrors.push('unhandled rejection: ' + String(e.reason));
});
"#;

/// Fills every known solver response field and submits the enclosing form
const SUBMIT_TOKEN: &str = r#"
var token = arguments[0];
var form = null;
['g-recaptcha-response', 'h-captcha-response', 'cf-turnstile-response'].forEach(function (name) {
  document.querySelectorAll('[name="' + name + '"]').forEach(function (el) {
    el.value = token;
    form = form || el.form;
  });
});
if (form) { form.submit(); return true; }
return false;
"#;

const NAVIGATION_STATUS: &str = r#"
var entry = performance.getEntriesByType('navigation')[0];
return entry && entry.responseStatus ? entry.responseStatus : 200;
"#;

/// One WebDriver-controlled Chrome instance
pub struct BrowserSession {
    driver: Option<WebDriver>,

    fingerprint: Fingerprint,

    /// Proxy the browser was started with; fixed for its lifetime
    proxy_id: Option<String>,

    page_load_timeout: Duration,

    geolocation: Option<Geolocation>,
}

impl BrowserSession {
    /// Start a browser with the given identity and egress
    pub async fn launch(settings: &BrowserSettings, fingerprint: Fingerprint, proxy: Option<&ProxyLease>) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--user-agent={}", fingerprint.user_agent))?;
        caps.add_chrome_arg(&format!("--lang={}", fingerprint.language()))?;
        caps.add_chrome_arg(&format!("--window-size={},{}", fingerprint.viewport.width, fingerprint.viewport.height))?;

        if settings.headless {
            caps.set_headless()?;
        }

        if let Some(proxy) = proxy {
            caps.add_chrome_arg(&format!("--proxy-server={}", proxy.url))?;
        }

        // Hide the automation flags most interstitials probe for
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_option("excludeSwitches", json!(["enable-automation"]))?;
        caps.add_chrome_option("useAutomationExtension", json!(false))?;

        let driver = WebDriver::new(&settings.webdriver_url, caps).await
            .context(format!("Failed to connect to WebDriver at {}", settings.webdriver_url))?;

        let page_load_timeout = Duration::from_secs(settings.page_load_timeout_secs);
        driver.set_page_load_timeout(page_load_timeout).await?;

        let dev_tools = ChromeDevTools::new(driver.handle.clone());
        dev_tools.execute_cdp_with_params(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": ERROR_HOOK }),
        )
        .await
        .context("Failed to install script error hook")?;

        debug!("Browser session started with fingerprint: {}", fingerprint.name);

        Ok(Self {
            driver: Some(driver),
            fingerprint,
            proxy_id: proxy.map(|p| p.id.clone()),
            page_load_timeout,
            geolocation: None,
        })
    }

    pub fn proxy_id(&self) -> Option<&str> {
        self.proxy_id.as_deref()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn driver(&self) -> Result<&WebDriver, CrawlError> {
        self.driver.as_ref()
            .ok_or_else(|| CrawlError::Infrastructure("browser session is closed".to_string()))
    }

    /// Map a WebDriver failure onto the crawl error taxonomy
    fn driver_error(&self, action: &str, err: WebDriverError) -> CrawlError {
        let message = err.to_string();
        if message.to_ascii_lowercase().contains("timeout") {
            CrawlError::timeout(self.page_load_timeout)
        } else {
            CrawlError::Network(format!("{} failed: {}", action, message))
        }
    }

    /// Report a fixed position through the DevTools protocol
    pub async fn set_geolocation(&mut self, geolocation: Option<Geolocation>) -> Result<(), CrawlError> {
        if self.geolocation == geolocation {
            return Ok(());
        }

        let dev_tools = ChromeDevTools::new(self.driver()?.handle.clone());
        let params = match geolocation {
            Some(geo) => json!({
                "latitude": geo.latitude,
                "longitude": geo.longitude,
                "accuracy": geo.accuracy,
            }),
            // No parameters clears the override
            None => json!({}),
        };

        dev_tools.execute_cdp_with_params("Emulation.setGeolocationOverride", params)
            .await
            .map_err(|e| self.driver_error("geolocation override", e))?;

        self.geolocation = geolocation;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
        debug!("Navigating to: {}", url);
        self.driver()?.goto(url).await
            .map_err(|e| self.driver_error("navigation", e))
    }

    pub async fn source(&self) -> Result<String, CrawlError> {
        self.driver()?.source().await
            .map_err(|e| self.driver_error("reading page source", e))
    }

    pub async fn url(&self) -> Result<String, CrawlError> {
        self.driver()?.current_url().await
            .map(|url| url.to_string())
            .map_err(|e| self.driver_error("reading current URL", e))
    }

    /// HTTP status of the current document, 200 when the browser does not expose it
    pub async fn status(&self) -> Result<u16, CrawlError> {
        self.execute::<u16>(NAVIGATION_STATUS, Vec::new()).await
    }

    /// Execute JavaScript on the page
    pub async fn execute<T: DeserializeOwned>(&self, script: &str, args: Vec<serde_json::Value>) -> Result<T, CrawlError> {
        let ret = self.driver()?.execute(script, args).await
            .map_err(|e| self.driver_error("script execution", e))?;

        serde_json::from_value(ret.json().clone())
            .map_err(|e| CrawlError::Parse(format!("unexpected script result: {}", e)))
    }

    /// Uncaught errors raised by the current document so far
    pub async fn script_errors(&self) -> Result<Vec<String>, CrawlError> {
        self.execute("return window.__clonerErrors || [];", Vec::new()).await
    }

    pub async fn load_lazy_content(&self, behavior: &BehaviorSimulator) -> Result<(), CrawlError> {
        behavior.load_lazy_content(self.driver()?)
            .await
            .map_err(|e| CrawlError::Network(format!("scrolling failed: {}", e)))
    }

    /// Quit the browser
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

#[async_trait]
impl ChallengePage for BrowserSession {
    async fn current_url(&mut self) -> Result<String, CrawlError> {
        self.url().await
    }

    async fn content(&mut self) -> Result<String, CrawlError> {
        self.source().await
    }

    async fn wait(&mut self, duration: Duration) -> Result<(), CrawlError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), CrawlError> {
        self.driver()?.refresh().await
            .map_err(|e| self.driver_error("reload", e))
    }

    async fn submit_token(&mut self, kind: ChallengeKind, token: &str) -> Result<(), CrawlError> {
        let submitted: bool = self.execute(SUBMIT_TOKEN, vec![json!(token)]).await?;
        if !submitted {
            warn!("No {:?} response field to submit the token through", kind);
        }
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}
