use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::browser::{FetchRequest, FetchedAsset, FetchedPage, PageFetcher};
use crate::error::CrawlError;

/// In-memory site for orchestrator and pipeline tests
#[derive(Default)]
pub(crate) struct FakeFetcher {
    pages: HashMap<String, String>,

    assets: HashMap<String, (Option<String>, Vec<u8>)>,

    /// Errors returned before the real response, per URL
    failures: Mutex<HashMap<String, Vec<CrawlError>>>,

    page_requests: Mutex<Vec<String>>,

    asset_requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }

    pub fn asset(mut self, url: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.assets.insert(url.to_string(), (Some(content_type.to_string()), bytes.to_vec()));
        self
    }

    /// Fail the next requests for `url` with these errors, in order
    pub fn failing(self, url: &str, errors: Vec<CrawlError>) -> Self {
        self.failures.lock().unwrap().insert(url.to_string(), errors);
        self
    }

    pub fn page_requests(&self) -> Vec<String> {
        self.page_requests.lock().unwrap().clone()
    }

    pub fn asset_requests(&self) -> Vec<String> {
        self.asset_requests.lock().unwrap().clone()
    }

    fn scripted_failure(&self, url: &str) -> Option<CrawlError> {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.get_mut(url)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch_page(&self, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
        let url = request.url.to_string();
        self.page_requests.lock().unwrap().push(url.clone());

        if let Some(error) = self.scripted_failure(&url) {
            return Err(error);
        }
        let html = self.pages.get(&url).ok_or(CrawlError::Http(404))?;

        Ok(FetchedPage {
            final_url: url,
            status: 200,
            html: html.clone(),
            etag: None,
            not_modified: false,
            bypass: None,
            proxy: None,
        })
    }

    async fn fetch_asset(&self, request: &FetchRequest) -> Result<FetchedAsset, CrawlError> {
        let url = request.url.to_string();
        self.asset_requests.lock().unwrap().push(url.clone());

        if let Some(error) = self.scripted_failure(&url) {
            return Err(error);
        }
        let (content_type, bytes) = self.assets.get(&url).ok_or(CrawlError::Http(404))?;

        Ok(FetchedAsset { final_url: url, content_type: content_type.clone(), bytes: bytes.clone() })
    }
}
