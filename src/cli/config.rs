use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{debug, info};
use std::collections::HashMap;

use crate::crawler::options::JobOptions;
use crate::crawler::retry::RetryPolicy;
use crate::proxy::{HealthPolicy, RotationPolicy};
use crate::verify::ScoreWeights;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub crawler: CrawlerSettings,
    pub browser: BrowserSettings,
    pub proxy: ProxySettings,
    pub bypass: BypassSettings,
    pub cache: CacheSettings,
    pub retry: RetryPolicy,
    pub storage: StorageSettings,
    pub verification: VerificationSettings,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Mirrors are written under `<output_root>/<host>` unless a job says otherwise
    pub output_root: String,
    pub max_depth: u32,
    pub max_pages: u32,
    pub concurrency: u32,
    /// "http" or "browser"
    pub fetcher: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Persist a checkpoint every N accepted pages
    pub checkpoint_interval: u32,
    /// Allow targets on loopback/private networks
    pub allow_private_networks: bool,
    pub allowed_domains: Vec<String>,
    pub url_patterns: UrlPatterns,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Browser session settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    /// Maximum concurrent browser sessions
    pub pool_size: usize,
    pub page_load_timeout_secs: u64,
    pub viewport: Viewport,
    pub fingerprints: Vec<BrowserFingerprint>,
    /// Always present this fingerprint instead of rotating
    pub pinned_fingerprint: Option<String>,
    pub behavior: BrowserBehavior,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// Page interaction before capture
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrowserBehavior {
    /// Scroll through the page so lazy content loads
    pub lazy_scroll: bool,
    pub scroll_step_px: u32,
    /// Min and max delay between scroll steps in milliseconds
    pub scroll_delay: (u64, u64),
    pub max_scroll_steps: u32,
    /// Extra settle time after scrolling in milliseconds
    pub settle_ms: u64,
}

/// Proxy settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub rotation: RotationPolicy,
    pub health: HealthPolicy,
    /// URL used by `probe_all`
    pub check_url: Option<String>,
    pub proxy_list: Vec<ProxyConfig>,
}

/// Individual proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    pub proxy_type: String, // "http", "https", "socks5"
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub country: Option<String>,
}

/// Challenge bypass settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BypassSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub challenge_wait_secs: u64,
    pub solver: Option<SolverSettings>,
}

/// External challenge solver
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SolverSettings {
    pub url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_solver_timeout")]
    pub timeout_secs: u64,
}

fn default_solver_timeout() -> u64 {
    120
}

/// Content cache settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    /// "disk" or "memory"
    pub backend: String,
    pub path: String,
    /// Entry lifetime when a job does not set one
    pub default_ttl_secs: Option<u64>,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageSettings {
    pub queue: QueueSettings,
    pub jobs: JobStoreSettings,
}

/// Queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub redis_url: String,
    /// Time to live for per-job keys in seconds
    pub task_ttl: u64,
    pub key_prefix: String,
    /// Lease granted to a worker per task
    pub lease_secs: u64,
}

/// Job store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JobStoreSettings {
    /// "file", "mongodb" or "memory"
    pub backend: String,
    pub path: String,
    pub connection_string: String,
    pub database_name: String,
    pub collection_prefix: String,
}

/// Verification settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VerificationSettings {
    pub weights: ScoreWeights,
    /// Time a page gets to report script errors
    pub javascript_wait_ms: u64,
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            output_root: data_path("mirrors"),
            max_depth: 3,
            max_pages: 100,
            concurrency: 4,
            fetcher: "http".to_string(),
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            checkpoint_interval: 10,
            allow_private_networks: false,
            allowed_domains: vec![],
            url_patterns: UrlPatterns::default(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            pool_size: 4,
            page_load_timeout_secs: 30,
            viewport: Viewport { width: 1920, height: 1080 },
            fingerprints: vec![
                BrowserFingerprint {
                    name: "windows_chrome".to_string(),
                    user_agent: DEFAULT_USER_AGENT.to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    platform: "Win32".to_string(),
                    extra_headers: HashMap::new(),
                },
            ],
            pinned_fingerprint: None,
            behavior: BrowserBehavior::default(),
        }
    }
}

impl Default for BrowserBehavior {
    fn default() -> Self {
        Self {
            lazy_scroll: true,
            scroll_step_px: 800,
            scroll_delay: (150, 400),
            max_scroll_steps: 30,
            settle_ms: 500,
        }
    }
}

impl Default for BypassSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            challenge_wait_secs: 5,
            solver: None,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: "disk".to_string(),
            path: data_path("cache"),
            default_ttl_secs: Some(7 * 24 * 3600),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            task_ttl: 86400,
            key_prefix: "cloner".to_string(),
            lease_secs: 120,
        }
    }
}

impl Default for JobStoreSettings {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: data_path("jobs"),
            connection_string: "mongodb://localhost:27017".to_string(),
            database_name: "cloner".to_string(),
            collection_prefix: "cloner".to_string(),
        }
    }
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            javascript_wait_ms: 1500,
        }
    }
}

/// Path under the per-user data directory
fn data_path(name: &str) -> String {
    directories::ProjectDirs::from("com", "site-cloner", "site-cloner")
        .map(|dirs| dirs.data_dir().join(name))
        .unwrap_or_else(|| PathBuf::from("./data").join(name))
        .to_string_lossy()
        .into_owned()
}

const DEFAULT_FILE: &str = "default.yaml";
const PROFILES_DIR: &str = "sites";

fn config_root() -> PathBuf {
    directories::ProjectDirs::from("com", "site-cloner", "site-cloner")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./config"))
}

/// File of a named profile; names are plain file stems
fn profile_path(root: &Path, name: &str) -> Result<PathBuf> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        anyhow::bail!("Invalid profile name '{}': use letters, digits, '-' or '_'", name);
    }
    Ok(root.join(PROFILES_DIR).join(format!("{}.yaml", name)))
}

impl AppConfig {
    /// Configuration in effect: a named profile, or the default file,
    /// which is written out on first use
    pub fn load(profile: Option<&str>) -> Result<Self> {
        let root = config_root();
        match profile {
            Some(name) => Self::load_profile_in(&root, name),
            None => Self::load_default_in(&root),
        }
    }

    pub fn load_profile(name: &str) -> Result<Self> {
        Self::load_profile_in(&config_root(), name)
    }

    /// Write this configuration as a named profile, returning its path
    pub fn save_as_profile(&self, name: &str) -> Result<PathBuf> {
        let path = profile_path(&config_root(), name)?;
        self.save_to_file(&path)?;
        Ok(path)
    }

    /// Names of the stored profiles, sorted
    pub fn list_profiles() -> Result<Vec<String>> {
        Self::profiles_in(&config_root())
    }

    fn load_default_in(root: &Path) -> Result<Self> {
        let path = root.join(DEFAULT_FILE);
        if path.is_file() {
            return Self::load_from_file(&path);
        }

        info!("No configuration at {}, writing defaults", path.display());
        let config = Self::default();
        config.save_to_file(&path)?;
        Ok(config)
    }

    fn load_profile_in(root: &Path, name: &str) -> Result<Self> {
        let path = profile_path(root, name)?;
        if !path.is_file() {
            anyhow::bail!("Profile '{}' not found at {}", name, path.display());
        }
        Self::load_from_file(&path)
    }

    fn profiles_in(root: &Path) -> Result<Vec<String>> {
        let dir = root.join(PROFILES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(format!("Failed to read profiles in {}", dir.display())),
        };

        let mut profiles: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "yaml"))
            .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string))
            .collect();
        profiles.sort();
        Ok(profiles)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let yaml = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;
        serde_yaml::from_str(&yaml).context(format!("Invalid configuration in {}", path.display()))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize configuration")?;
        fs::write(path, yaml).context(format!("Failed to write configuration file: {}", path.display()))
    }

    /// Job options seeded from this configuration
    pub fn job_defaults(&self) -> JobOptions {
        JobOptions {
            max_pages: self.crawler.max_pages,
            max_depth: self.crawler.max_depth,
            concurrency: self.crawler.concurrency,
            allowed_domains: self.crawler.allowed_domains.clone(),
            include_patterns: self.crawler.url_patterns.include.clone(),
            exclude_patterns: self.crawler.url_patterns.exclude.clone(),
            proxy: crate::crawler::options::ProxyOptions {
                enabled: self.proxy.enabled,
                ..Default::default()
            },
            cloudflare_bypass: crate::crawler::options::BypassOptions {
                enabled: self.bypass.enabled,
                max_attempts: self.bypass.max_attempts,
            },
            cache: crate::crawler::options::CacheOptions {
                enabled: true,
                ttl_secs: self.cache.default_ttl_secs,
            },
            ..JobOptions::default()
        }
    }
}
