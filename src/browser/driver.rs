use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::browser::behavior::BehaviorSimulator;
use crate::browser::fetcher::{FetchRequest, FetchedAsset, FetchedPage, PageFetcher};
use crate::browser::fingerprint::FingerprintManager;
use crate::browser::http::HttpFetcher;
use crate::browser::pool::{PooledSession, SessionPool};
use crate::browser::session::BrowserSession;
use crate::bypass::ChallengeBypass;
use crate::cli::config::BrowserSettings;
use crate::error::CrawlError;
use crate::proxy::{ProxyLease, ProxyPool};
use crate::verify::ScriptProbe;

/// Fetcher that renders pages in pooled browser sessions.
///
/// Assets do not need rendering and go through the HTTP fetcher.
pub struct BrowserFetcher {
    settings: BrowserSettings,

    pool: SessionPool<BrowserSession>,

    fingerprints: FingerprintManager,

    behavior: BehaviorSimulator,

    proxies: Option<Arc<ProxyPool>>,

    bypass: ChallengeBypass,

    assets: HttpFetcher,
}

impl BrowserFetcher {
    pub fn new(settings: BrowserSettings, assets: HttpFetcher) -> Self {
        Self {
            pool: SessionPool::new(settings.pool_size),
            fingerprints: FingerprintManager::new(settings.fingerprints.clone(), settings.viewport.clone())
                .with_pinned(settings.pinned_fingerprint.clone()),
            behavior: BehaviorSimulator::new(settings.behavior.clone()),
            proxies: None,
            bypass: ChallengeBypass::default(),
            assets,
            settings,
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

    async fn session(&self, lease: Option<&ProxyLease>) -> Result<PooledSession<BrowserSession>, CrawlError> {
        self.pool
            .acquire(lease.map(|l| l.id.as_str()), || async {
                let fingerprint = self.fingerprints.select()?;
                BrowserSession::launch(&self.settings, fingerprint, lease).await
            })
            .await
            .map_err(|e| CrawlError::Network(format!("browser session unavailable: {:#}", e)))
    }

    /// Navigate, clear any challenge, load lazy content and read the DOM
    async fn capture(&self, session: &mut BrowserSession, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
        session.set_geolocation(request.profile.geolocation).await?;
        session.navigate(request.url.as_str()).await?;

        let html = session.source().await?;
        let bypass = self.bypass.for_job(request.profile.bypass.enabled, request.profile.bypass.max_attempts);
        let (_, outcome) = bypass.resolve(session, html).await?;

        session.load_lazy_content(&self.behavior).await?;

        Ok(FetchedPage {
            final_url: session.url().await?,
            status: session.status().await?,
            html: session.source().await?,
            etag: None,
            not_modified: false,
            bypass: outcome,
            proxy: session.proxy_id().map(str::to_string),
        })
    }

    /// Quit idle browsers
    pub async fn shutdown(&self) {
        for mut session in self.pool.drain() {
            session.close().await;
        }
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    async fn fetch_page(&self, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
        let lease = self.lease(request).await?;
        let mut session = self.session(lease.as_ref()).await?;

        let started = Instant::now();
        let result = self.capture(&mut session, request).await;

        if let (Some(pool), Some(lease)) = (&self.proxies, &lease) {
            match &result {
                Err(CrawlError::Network(_)) | Err(CrawlError::Timeout(_)) | Err(CrawlError::Blocked(_)) => {
                    pool.report_failure(&lease.id).await
                }
                _ => pool.report_success(&lease.id, started.elapsed()).await,
            }
        }

        // A blocked or broken browser is not handed to the next fetch
        if let Err(err) = &result {
            if matches!(err, CrawlError::Blocked(_) | CrawlError::Network(_) | CrawlError::Timeout(_)) {
                debug!("Discarding browser session after: {}", err);
                session.discard();
            }
        }

        result
    }

    async fn fetch_asset(&self, request: &FetchRequest) -> Result<FetchedAsset, CrawlError> {
        self.assets.fetch_asset(request).await
    }
}

/// Reloads mirrored pages in an isolated browser and collects uncaught script errors
pub struct BrowserScriptProbe {
    settings: BrowserSettings,

    pool: SessionPool<BrowserSession>,

    fingerprints: FingerprintManager,

    /// Time scripts get to run after load
    wait: Duration,
}

impl BrowserScriptProbe {
    pub fn new(settings: BrowserSettings, wait: Duration) -> Self {
        Self {
            pool: SessionPool::new(1),
            fingerprints: FingerprintManager::new(settings.fingerprints.clone(), settings.viewport.clone())
                .with_pinned(settings.pinned_fingerprint.clone()),
            settings,
            wait,
        }
    }

    pub async fn shutdown(&self) {
        for mut session in self.pool.drain() {
            session.close().await;
        }
    }
}

#[async_trait]
impl ScriptProbe for BrowserScriptProbe {
    async fn script_errors(&self, page: &Path) -> Result<Vec<String>, CrawlError> {
        let url = Url::from_file_path(page)
            .map_err(|_| CrawlError::Verification(format!("not an absolute path: {}", page.display())))?;

        let session = self.pool
            .acquire(None, || async {
                let fingerprint = self.fingerprints.select()?;
                BrowserSession::launch(&self.settings, fingerprint, None).await
            })
            .await
            .map_err(|e| CrawlError::Verification(format!("no browser for script check: {:#}", e)))?;

        session.navigate(url.as_str()).await?;
        tokio::time::sleep(self.wait).await;

        let errors = session.script_errors().await?;
        if !errors.is_empty() {
            warn!("{} script errors on {}", errors.len(), page.display());
        }
        Ok(errors)
    }
}
