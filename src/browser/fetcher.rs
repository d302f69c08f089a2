use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::bypass::BypassOutcome;
use crate::crawler::options::{BypassOptions, Geolocation, JobOptions, ProxyOptions};
use crate::error::CrawlError;
use crate::proxy::ProxySelection;

/// Per-job access settings that travel with every fetch, including to remote workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FetchProfile {
    pub proxy: ProxyOptions,
    pub bypass: BypassOptions,
    pub geolocation: Option<Geolocation>,
}

impl FetchProfile {
    pub fn from_options(options: &JobOptions) -> Self {
        Self {
            proxy: options.proxy.clone(),
            bypass: options.cloudflare_bypass.clone(),
            geolocation: options.geolocation,
        }
    }
}

/// One page or asset fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: Url,

    pub job_id: String,

    /// Cached ETag for a conditional request
    pub etag: Option<String>,

    pub profile: FetchProfile,
}

impl FetchRequest {
    pub fn new(url: Url, job_id: &str, profile: FetchProfile) -> Self {
        Self { url, job_id: job_id.to_string(), etag: None, profile }
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Proxy selection context, `None` when the job does not use proxies
    pub fn proxy_selection(&self) -> Option<ProxySelection> {
        if !self.profile.proxy.enabled {
            return None;
        }

        Some(ProxySelection {
            job_id: Some(self.job_id.clone()),
            host: self.url.host_str().map(str::to_string),
            country: self.profile.proxy.country.clone(),
            policy: self.profile.proxy.rotation,
        })
    }
}

/// Document as seen after redirects and challenge handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub final_url: String,

    pub status: u16,

    /// Empty when `not_modified`
    pub html: String,

    pub etag: Option<String>,

    /// Server answered 304 to a conditional request
    pub not_modified: bool,

    pub bypass: Option<BypassOutcome>,

    /// Proxy the page was fetched through
    pub proxy: Option<String>,
}

/// Raw bytes of a downloaded asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedAsset {
    pub final_url: String,

    pub content_type: Option<String>,

    pub bytes: Vec<u8>,
}

/// Page and asset retrieval, over plain HTTP or a browser session
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, request: &FetchRequest) -> Result<FetchedPage, CrawlError>;

    async fn fetch_asset(&self, request: &FetchRequest) -> Result<FetchedAsset, CrawlError>;
}

/// Whether a Content-Type header denotes an HTML document
pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        // Missing header: let the parser decide
        None => true,
        Some(value) => {
            let mime = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            mime == "text/html" || mime == "application/xhtml+xml"
        }
    }
}
