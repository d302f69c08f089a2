use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::assets::optimize::optimize;
use crate::assets::table::AssetTable;
use crate::assets::{asset_key, AssetRecord};
use crate::browser::{FetchProfile, FetchRequest, FetchedAsset, PageFetcher};
use crate::crawler::extract::{css_references, resolve};
use crate::crawler::retry::{with_retry, RetryPolicy};
use crate::crawler::target::is_internal_host;
use crate::error::CrawlError;
use crate::mirror::{asset_path, classify_asset, mirror_file, rewrite_css, AssetCategory};
use crate::utils::{content_hash, write_atomic, FetchMetrics};

/// How deep `@import` / `url()` chains of stylesheets are followed
const MAX_STYLESHEET_NESTING: u32 = 3;

/// Asset that could not be captured
#[derive(Debug, Clone, PartialEq)]
pub struct AssetFailure {
    pub url: String,
    pub error: CrawlError,
    pub attempts: u32,
}

/// What resolving the assets of one page did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PageAssets {
    /// References now served from the mirror
    pub captured: usize,

    /// Downloads performed
    pub downloaded: u32,

    pub bytes: u64,

    /// Extra attempts spent by the retry policy
    pub retries: u32,

    pub failures: Vec<AssetFailure>,
}

impl PageAssets {
    fn merge(&mut self, other: PageAssets) {
        self.captured += other.captured;
        self.downloaded += other.downloaded;
        self.bytes += other.bytes;
        self.retries += other.retries;
        self.failures.extend(other.failures);
    }

    fn failed(url: String, error: CrawlError, attempts: u32) -> Self {
        Self { failures: vec![AssetFailure { url, error, attempts }], ..Self::default() }
    }
}

/// Downloads, deduplicates and stores the assets referenced by pages.
///
/// Downloads share one concurrency budget. Stylesheets are scanned for
/// their own references, which are captured before the stylesheet is
/// rewritten and stored.
pub struct AssetPipeline {
    fetcher: Arc<dyn PageFetcher>,

    table: Arc<AssetTable>,

    output_dir: PathBuf,

    permits: Arc<Semaphore>,

    retry: RetryPolicy,

    cancel: CancellationToken,

    job_id: String,

    profile: FetchProfile,

    optimize: bool,

    /// Fetch assets on loopback or private addresses
    allow_private: bool,

    metrics: FetchMetrics,
}

impl AssetPipeline {
    pub fn new(fetcher: Arc<dyn PageFetcher>, table: Arc<AssetTable>, output_dir: PathBuf, job_id: &str) -> Self {
        Self {
            fetcher,
            table,
            output_dir,
            permits: Arc::new(Semaphore::new(4)),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            job_id: job_id.to_string(),
            profile: FetchProfile::default(),
            optimize: false,
            allow_private: false,
            metrics: FetchMetrics::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(concurrency.max(1)));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_profile(mut self, profile: FetchProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_metrics(mut self, metrics: FetchMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn allow_private(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    pub fn table(&self) -> &Arc<AssetTable> {
        &self.table
    }

    /// Resolve every asset a page references.
    ///
    /// Each distinct URL counts one reference for this page, whether it is
    /// downloaded now or already stored.
    pub async fn process_page(&self, page_url: &Url, references: &[String]) -> PageAssets {
        let mut seen = HashSet::new();
        let urls: Vec<Url> = references
            .iter()
            .filter_map(|raw| resolve(page_url, raw))
            .filter(|url| seen.insert(asset_key(url)))
            .collect();

        let mut report = PageAssets::default();
        for outcome in join_all(urls.into_iter().map(|url| self.capture(url, 0))).await {
            report.merge(outcome);
        }

        if !report.failures.is_empty() {
            debug!("{} of the assets of {} could not be captured", report.failures.len(), page_url);
        }
        report
    }

    fn capture(&self, url: Url, nesting: u32) -> BoxFuture<'_, PageAssets> {
        async move {
            let key = asset_key(&url);

            // Already stored under this URL
            if let Some(revived) = self.table.add_reference(&key) {
                let mut report = PageAssets { captured: 1, ..PageAssets::default() };
                if nesting < MAX_STYLESHEET_NESTING {
                    let children = revived.iter().filter_map(|child| Url::parse(child).ok());
                    for outcome in join_all(children.map(|child| self.capture(child, nesting + 1))).await {
                        report.merge(outcome);
                    }
                }
                return report;
            }

            if !self.allow_private && is_internal_host(&url) {
                let error = CrawlError::Blocked("asset on an internal network address".to_string());
                return PageAssets::failed(key, error, 0);
            }

            let (result, attempts) = self.download(&key).await;
            let asset = match result {
                Ok(asset) => asset,
                Err(error) => {
                    warn!("Failed to download asset {}: {}", key, error);
                    return PageAssets { retries: attempts.saturating_sub(1), ..PageAssets::failed(key, error, attempts) };
                }
            };

            let mut report = PageAssets {
                downloaded: 1,
                bytes: asset.bytes.len() as u64,
                retries: attempts.saturating_sub(1),
                ..PageAssets::default()
            };

            match self.store(&key, asset, nesting).await {
                Ok(nested) => {
                    report.captured += 1;
                    report.merge(nested);
                }
                Err(error) => report.failures.push(AssetFailure { url: key, error, attempts }),
            }
            report
        }
        .boxed()
    }

    /// Fetch under the retry policy, holding a download slot only meanwhile
    async fn download(&self, key: &str) -> (Result<FetchedAsset, CrawlError>, u32) {
        let url = match Url::parse(key) {
            Ok(url) => url,
            Err(e) => return (Err(CrawlError::Parse(e.to_string())), 0),
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return (Err(CrawlError::Cancelled), 0),
        };

        let request = FetchRequest::new(url, &self.job_id, self.profile.clone());
        let timer = self.metrics.start_timer();
        let outcome = with_retry(&self.retry, &self.cancel, key, |_| self.fetcher.fetch_asset(&request)).await;

        let bytes = outcome.result.as_ref().map(|asset| asset.bytes.len() as u64).unwrap_or(0);
        self.metrics.record_request(outcome.result.is_ok(), timer.end(), None, bytes).await;
        self.metrics.record_retries(outcome.attempts.saturating_sub(1)).await;

        (outcome.result, outcome.attempts)
    }

    /// Write downloaded bytes into the mirror unless identical content is stored
    async fn store(&self, key: &str, asset: FetchedAsset, nesting: u32) -> Result<PageAssets, CrawlError> {
        let hash = content_hash(&asset.bytes);

        if let Some(existing) = self.table.lookup_hash(&hash) {
            debug!("Asset {} duplicates {}", key, existing.source_url);
            self.table.insert_or_ref(key, existing);
            return Ok(PageAssets::default());
        }

        let source = Url::parse(&asset.final_url)
            .or_else(|_| Url::parse(key))
            .map_err(|e| CrawlError::Parse(e.to_string()))?;
        let (category, ext) = classify_asset(&source, asset.content_type.as_deref(), &asset.bytes);
        let local_path = asset_path(&hash, category, &ext);

        let mut nested = PageAssets::default();
        let mut references = Vec::new();
        let (bytes, optimized) = if category == AssetCategory::Styles {
            let css = String::from_utf8_lossy(&asset.bytes).into_owned();

            if nesting < MAX_STYLESHEET_NESTING {
                let mut seen = HashSet::new();
                let children: Vec<Url> = css_references(&css)
                    .iter()
                    .filter_map(|raw| resolve(&source, raw))
                    .filter(|url| seen.insert(asset_key(url)))
                    .collect();
                references = children.iter().map(asset_key).collect();

                for outcome in join_all(children.into_iter().map(|url| self.capture(url, nesting + 1))).await {
                    nested.merge(outcome);
                }
            }

            let table = &self.table;
            let (rewritten, _) = rewrite_css(&css, &source, &local_path, &|url| table.local_path(&asset_key(url)));
            (rewritten.into_bytes(), false)
        } else if self.optimize {
            let result = optimize(&ext, &asset.bytes);
            (result.bytes, result.applied)
        } else {
            (asset.bytes, false)
        };

        let path = mirror_file(&self.output_dir, &local_path)
            .map_err(|e| CrawlError::Infrastructure(format!("{:#}", e)))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| CrawlError::Infrastructure(format!("{:#}", e)))?;

        let record = AssetRecord {
            source_url: key.to_string(),
            content_hash: hash,
            stored_hash: content_hash(&bytes),
            byte_size: bytes.len() as u64,
            local_path,
            optimized,
            ref_count: 1,
            content_type: asset.content_type,
            aliases: Vec::new(),
            references,
        };
        self.table.insert_or_ref(key, record);

        Ok(nested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFetcher;

    const CSS: &str = r#"body { background: url("../img/bg.png") } .logo { background: url(/img/logo.png) }"#;

    fn site() -> FakeFetcher {
        FakeFetcher::new()
            .asset("https://example.com/img/logo.png", "image/png", b"logo-bytes")
            .asset("https://cdn.example.com/logo-copy.png", "image/png", b"logo-bytes")
            .asset("https://example.com/img/bg.png", "image/png", b"background")
            .asset("https://example.com/css/site.css", "text/css", CSS.as_bytes())
    }

    fn pipeline(fetcher: Arc<FakeFetcher>, dir: &std::path::Path) -> AssetPipeline {
        let retry = RetryPolicy { max_attempts: 2, initial_backoff_ms: 1, jitter: 0.0, ..RetryPolicy::default() };
        AssetPipeline::new(fetcher, Arc::new(AssetTable::new()), dir.to_path_buf(), "job-1")
            .with_retry(retry)
            .with_concurrency(2)
    }

    #[tokio::test]
    async fn test_identical_bytes_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(site());
        let pipeline = pipeline(Arc::clone(&fetcher), dir.path());

        let page_a = Url::parse("https://example.com/a").unwrap();
        let page_b = Url::parse("https://example.com/b").unwrap();
        let first = pipeline.process_page(&page_a, &["https://example.com/img/logo.png".to_string()]).await;
        let second = pipeline
            .process_page(&page_b, &[
                "https://cdn.example.com/logo-copy.png".to_string(),
                "https://example.com/img/logo.png#frag".to_string(),
            ])
            .await;

        assert_eq!(first.downloaded, 1);
        assert_eq!(second.downloaded, 1);
        assert_eq!(second.captured, 2);

        let records = pipeline.table().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ref_count, 3);
        assert_eq!(records[0].aliases, vec!["https://cdn.example.com/logo-copy.png".to_string()]);

        let stored = std::fs::read_dir(dir.path().join("assets/images")).unwrap().count();
        assert_eq!(stored, 1);
        assert_eq!(fetcher.asset_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_stylesheet_references_are_captured_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(Arc::new(site()), dir.path());

        let page = Url::parse("https://example.com/").unwrap();
        let report = pipeline.process_page(&page, &["css/site.css".to_string()]).await;

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.downloaded, 3);
        assert_eq!(report.captured, 3);

        let again = pipeline.process_page(&page, &["/img/logo.png".to_string()]).await;
        assert_eq!(again.downloaded, 0);

        let table = pipeline.table();
        let css_record = table.lookup_url("https://example.com/css/site.css").unwrap();
        assert!(css_record.local_path.starts_with("assets/styles/"));
        assert_ne!(css_record.stored_hash, css_record.content_hash);

        let stored_css = std::fs::read_to_string(dir.path().join(&css_record.local_path)).unwrap();
        let bg = table.local_path("https://example.com/img/bg.png").unwrap();
        let expected = format!("url(\"../images/{}\")", bg.rsplit('/').next().unwrap());
        assert!(stored_css.contains(&expected), "{}", stored_css);

        // Stylesheet and page both reference the logo
        assert_eq!(table.lookup_url("https://example.com/img/logo.png").unwrap().ref_count, 2);
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = site().failing("https://example.com/img/bg.png", vec![CrawlError::Network("reset".into())]);
        let pipeline = pipeline(Arc::new(fetcher), dir.path());

        let page = Url::parse("https://example.com/").unwrap();
        let report = pipeline
            .process_page(&page, &[
                "/img/bg.png".to_string(),
                "/missing.js".to_string(),
                "http://127.0.0.1/internal.png".to_string(),
            ])
            .await;

        // Transient failure retried once, 404 recorded, internal address refused
        assert_eq!(report.captured, 1);
        assert_eq!(report.retries, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|f| f.error == CrawlError::Http(404)));
        assert!(report.failures.iter().any(|f| matches!(f.error, CrawlError::Blocked(_))));
    }
}
