use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;
use url::Url;

use crate::browser::fetcher::{is_html_content_type, FetchRequest, FetchedAsset, FetchedPage, PageFetcher};
use crate::bypass::{classify, ChallengeBypass, ChallengeKind, ChallengePage};
use crate::error::CrawlError;
use crate::proxy::{ProxyLease, ProxyPool};

/// Fetcher that talks HTTP directly, without script execution
pub struct HttpFetcher {
    user_agent: String,

    accept_language: String,

    /// Whole-request timeout
    timeout: Duration,

    proxies: Option<Arc<ProxyPool>>,

    bypass: ChallengeBypass,

    /// One client per egress, keyed by proxy URL ("" for direct)
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            timeout,
            proxies: None,
            bypass: ChallengeBypass::default(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn with_bypass(mut self, bypass: ChallengeBypass) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_accept_language(mut self, accept_language: &str) -> Self {
        self.accept_language = accept_language.to_string();
        self
    }

    /// Pick the egress for a request
    async fn lease(&self, request: &FetchRequest) -> Result<Option<ProxyLease>, CrawlError> {
        let (pool, selection) = match (&self.proxies, request.proxy_selection()) {
            (Some(pool), Some(selection)) => (pool, selection),
            _ => return Ok(None),
        };

        match pool.select(&selection).await {
            Some(lease) => Ok(Some(lease)),
            None => Err(CrawlError::Network("no healthy proxy available".to_string())),
        }
    }

    async fn client(&self, lease: Option<&ProxyLease>) -> Result<Client, CrawlError> {
        let key = lease.map(|l| l.url.clone()).unwrap_or_default();

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"));
        if let Ok(value) = HeaderValue::from_str(&self.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }

        let mut builder = Client::builder()
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .timeout(self.timeout)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(lease) = lease {
            let proxy = reqwest::Proxy::all(&lease.url)
                .map_err(|e| CrawlError::Infrastructure(format!("invalid proxy {}: {}", lease.id, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()
            .map_err(|e| CrawlError::Infrastructure(format!("failed to create HTTP client: {}", e)))?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Feed the request outcome into proxy health
    async fn report<T>(&self, lease: Option<&ProxyLease>, result: &Result<T, CrawlError>, latency: Duration) {
        let (pool, lease) = match (&self.proxies, lease) {
            (Some(pool), Some(lease)) => (pool, lease),
            _ => return,
        };

        match result {
            Err(CrawlError::Network(_))
            | Err(CrawlError::Timeout(_))
            | Err(CrawlError::Blocked(_))
            | Err(CrawlError::RateLimited { .. }) => pool.report_failure(&lease.id).await,
            _ => pool.report_success(&lease.id, latency).await,
        }
    }

    async fn fetch_document(&self, client: &Client, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
        let mut get = client.get(request.url.clone());
        if let Some(etag) = &request.etag {
            get = get.header(IF_NONE_MATCH, etag.as_str());
        }
        let response = get.send().await.map_err(|e| self.request_error(e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let etag = header(&response, ETAG.as_str());

        if status == StatusCode::NOT_MODIFIED {
            debug!("Not modified: {}", request.url);
            return Ok(FetchedPage {
                final_url,
                status: status.as_u16(),
                html: String::new(),
                etag: etag.or_else(|| request.etag.clone()),
                not_modified: true,
                bypass: None,
                proxy: None,
            });
        }

        let content_type = header(&response, CONTENT_TYPE.as_str());
        let retry_after_ms = retry_after_ms(response.headers(), Utc::now());
        let html = response.text().await.map_err(|e| self.request_error(e))?;

        // Interstitials are often served with 403/503
        if classify(&html).is_challenge() {
            let bypass = self.bypass.for_job(request.profile.bypass.enabled, request.profile.bypass.max_attempts);
            let mut page = HttpChallengePage {
                fetcher: self,
                client: client.clone(),
                url: request.url.clone(),
                final_url: final_url.clone(),
                status: status.as_u16(),
                html: html.clone(),
            };
            let (html, outcome) = bypass.resolve(&mut page, html).await?;

            return Ok(FetchedPage {
                final_url: page.final_url,
                status: page.status,
                html,
                etag: None,
                not_modified: false,
                bypass: outcome,
                proxy: None,
            });
        }

        check_status(status, retry_after_ms)?;

        if !is_html_content_type(content_type.as_deref()) {
            return Err(CrawlError::Parse(format!(
                "{} is {} rather than HTML",
                request.url,
                content_type.unwrap_or_default()
            )));
        }

        Ok(FetchedPage {
            final_url,
            status: status.as_u16(),
            html,
            etag,
            not_modified: false,
            bypass: None,
            proxy: None,
        })
    }

    fn request_error(&self, error: reqwest::Error) -> CrawlError {
        match CrawlError::from(error) {
            CrawlError::Timeout(_) => CrawlError::timeout(self.timeout),
            other => other,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
        let lease = self.lease(request).await?;
        let client = self.client(lease.as_ref()).await?;

        let started = Instant::now();
        let result = self.fetch_document(&client, request).await;
        self.report(lease.as_ref(), &result, started.elapsed()).await;

        result.map(|page| FetchedPage { proxy: lease.map(|l| l.id), ..page })
    }

    async fn fetch_asset(&self, request: &FetchRequest) -> Result<FetchedAsset, CrawlError> {
        let lease = self.lease(request).await?;
        let client = self.client(lease.as_ref()).await?;

        let started = Instant::now();
        let result = async {
            let response = client.get(request.url.clone())
                .send()
                .await
                .map_err(|e| self.request_error(e))?;

            check_status(response.status(), retry_after_ms(response.headers(), Utc::now()))?;

            let final_url = response.url().to_string();
            let content_type = header(&response, CONTENT_TYPE.as_str());
            let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;

            Ok(FetchedAsset { final_url, content_type, bytes: bytes.to_vec() })
        }
        .await;
        self.report(lease.as_ref(), &result, started.elapsed()).await;

        result
    }
}

/// Challenge handling over plain HTTP: waiting and re-requesting with the
/// cookies the interstitial set, or posting a solver token back
struct HttpChallengePage<'a> {
    fetcher: &'a HttpFetcher,
    client: Client,
    url: Url,
    final_url: String,
    status: u16,
    html: String,
}

impl HttpChallengePage<'_> {
    async fn absorb(&mut self, response: Response) -> Result<(), CrawlError> {
        self.status = response.status().as_u16();
        self.final_url = response.url().to_string();
        self.html = response.text().await.map_err(|e| self.fetcher.request_error(e))?;
        Ok(())
    }
}

#[async_trait]
impl ChallengePage for HttpChallengePage<'_> {
    async fn current_url(&mut self) -> Result<String, CrawlError> {
        Ok(self.final_url.clone())
    }

    async fn content(&mut self) -> Result<String, CrawlError> {
        Ok(self.html.clone())
    }

    async fn wait(&mut self, duration: Duration) -> Result<(), CrawlError> {
        sleep(duration).await;
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), CrawlError> {
        let response = self.client.get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.fetcher.request_error(e))?;
        self.absorb(response).await
    }

    async fn submit_token(&mut self, kind: ChallengeKind, token: &str) -> Result<(), CrawlError> {
        let field = match kind {
            ChallengeKind::InteractiveWidget => "cf-turnstile-response",
            _ => "g-recaptcha-response",
        };

        let response = self.client.post(self.url.clone())
            .form(&[(field, token)])
            .send()
            .await
            .map_err(|e| self.fetcher.request_error(e))?;
        self.absorb(response).await
    }
}

fn header(response: &Response, name: &str) -> Option<String> {
    response.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Map a non-success status to its error kind
fn check_status(status: StatusCode, retry_after_ms: Option<u64>) -> Result<(), CrawlError> {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(CrawlError::RateLimited { status: status.as_u16(), retry_after_ms });
    }
    if !status.is_success() {
        return Err(CrawlError::Http(status.as_u16()));
    }
    Ok(())
}

/// Retry-After as delta-seconds or an HTTP date
fn retry_after_ms(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).num_milliseconds().max(0) as u64)
}
