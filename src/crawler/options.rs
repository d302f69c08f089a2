use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::RotationPolicy;

/// Rejected job submission
#[derive(Debug, Error, PartialEq)]
pub enum OptionsError {
    #[error("malformed job options: {0}")]
    Malformed(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid target URL: {0}")]
    InvalidUrl(String),
}

/// How the finished mirror is packaged by the export layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    #[default]
    Directory,
    Zip,
    Tar,
    SingleFile,
}

/// Where page fetches run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlMode {
    /// Fetch in-process through the local fetcher
    #[default]
    Local,
    /// Fan page fetches out through the task broker to remote workers
    Distributed,
}

/// Per-job proxy usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyOptions {
    pub enabled: bool,
    /// Overrides the pool's default rotation policy for this job
    pub rotation: Option<RotationPolicy>,
    /// Prefer proxies tagged with this country
    pub country: Option<String>,
}

/// Per-job challenge bypass settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BypassOptions {
    pub enabled: bool,
    /// Attempts for script challenges before giving up with a blocked error
    pub max_attempts: u32,
}

impl Default for BypassOptions {
    fn default() -> Self {
        Self { enabled: true, max_attempts: 2 }
    }
}

/// Per-job cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheOptions {
    /// Use cached hashes to skip unchanged pages
    pub enabled: bool,
    /// Entry lifetime; `None` uses the engine default
    pub ttl_secs: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { enabled: true, ttl_secs: None }
    }
}

/// Geolocation reported by browser sessions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
}

fn default_accuracy() -> f64 {
    50.0
}

/// Options accepted with a job submission.
///
/// Every recognised option is enumerated here; unknown fields are rejected
/// when parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct JobOptions {
    pub max_pages: u32,
    pub max_depth: u32,
    /// Concurrent page fetches
    pub concurrency: u32,
    /// Concurrent asset downloads, defaults to `concurrency`
    pub asset_concurrency: Option<u32>,
    pub export_format: ExportFormat,
    pub incremental: bool,
    pub mode: CrawlMode,
    /// Treat URLs that differ only by query string as distinct pages
    pub query_significant: bool,
    /// Extra registrable domains that are in scope
    pub allowed_domains: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub optimize_assets: bool,
    /// Reload mirrored pages in a sandboxed browser during verification
    pub javascript_check: bool,
    pub proxy: ProxyOptions,
    pub cloudflare_bypass: BypassOptions,
    pub cache: CacheOptions,
    pub geolocation: Option<Geolocation>,
    /// Mirror location; defaults to `<output root>/<host>`
    pub output_dir: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_depth: 3,
            concurrency: 4,
            asset_concurrency: None,
            export_format: ExportFormat::Directory,
            incremental: false,
            mode: CrawlMode::Local,
            query_significant: true,
            allowed_domains: Vec::new(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            optimize_assets: true,
            javascript_check: false,
            proxy: ProxyOptions::default(),
            cloudflare_bypass: BypassOptions::default(),
            cache: CacheOptions::default(),
            geolocation: None,
            output_dir: None,
        }
    }
}

impl JobOptions {
    /// Parse the JSON submission contract and validate it.
    ///
    /// Returns the options together with non-fatal warnings.
    pub fn from_json(json: &str) -> Result<(Self, Vec<String>), OptionsError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| OptionsError::Malformed(e.to_string()))?;
        let warnings = options.validate()?;
        Ok((options, warnings))
    }

    /// Validate field ranges and combinations.
    pub fn validate(&self) -> Result<Vec<String>, OptionsError> {
        let mut warnings = Vec::new();

        if self.max_pages == 0 {
            return Err(invalid("maxPages", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.asset_concurrency == Some(0) {
            return Err(invalid("assetConcurrency", "must be at least 1"));
        }

        if let Some(geo) = &self.geolocation {
            if !geo.latitude.is_finite() || !(-90.0..=90.0).contains(&geo.latitude) {
                return Err(invalid("geolocation.latitude", "must be within -90..=90"));
            }
            if !geo.longitude.is_finite() || !(-180.0..=180.0).contains(&geo.longitude) {
                return Err(invalid("geolocation.longitude", "must be within -180..=180"));
            }
            if !geo.accuracy.is_finite() || geo.accuracy < 0.0 {
                return Err(invalid("geolocation.accuracy", "must be a non-negative number"));
            }
        }

        for domain in &self.allowed_domains {
            if domain.is_empty() || domain.contains("://") || domain.contains('/') {
                return Err(invalid("allowedDomains", &format!("'{}' is not a bare domain", domain)));
            }
        }

        for (field, patterns) in [
            ("includePatterns", &self.include_patterns),
            ("excludePatterns", &self.exclude_patterns),
        ] {
            for pattern in patterns {
                if let Err(e) = Regex::new(pattern) {
                    return Err(invalid(field, &format!("'{}': {}", pattern, e)));
                }
            }
        }

        if self.incremental && !self.cache.enabled {
            warnings.push("incremental=true has no effect while caching is disabled".to_string());
        }
        if self.cache.ttl_secs == Some(0) {
            warnings.push("cache.ttlSecs=0 expires every entry immediately".to_string());
        }
        if self.cloudflare_bypass.enabled && self.cloudflare_bypass.max_attempts == 0 {
            warnings.push("cloudflareBypass.maxAttempts=0 reports every challenge as blocked".to_string());
        }
        if !self.proxy.enabled && (self.proxy.country.is_some() || self.proxy.rotation.is_some()) {
            warnings.push("proxy settings are ignored while proxy.enabled=false".to_string());
        }
        if self.javascript_check && self.mode == CrawlMode::Distributed {
            warnings.push("javascriptCheck runs on the orchestrator host, not on workers".to_string());
        }

        Ok(warnings)
    }

    /// Effective asset download budget
    pub fn asset_budget(&self) -> usize {
        self.asset_concurrency.unwrap_or(self.concurrency).max(1) as usize
    }
}

fn invalid(field: &'static str, reason: &str) -> OptionsError {
    OptionsError::Invalid { field, reason: reason.to_string() }
}
