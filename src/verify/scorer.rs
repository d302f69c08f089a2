use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use url::Url;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};

use crate::assets::AssetRecord;
use crate::crawler::extract::parse_srcset;
use crate::crawler::frontier::canonicalize;
use crate::crawler::task::PageRecord;
use crate::error::CrawlError;
use crate::mirror::{mirror_file, MirrorIndex};
use crate::utils::content_hash;
use crate::verify::report::{
    ratio, AssetStats, IntegrityStats, IssueCategory, LinkStats, ScoreComponents, ScoreWeights, ScriptCheck,
    VerificationIssue, VerificationReport,
};
use crate::verify::ScriptProbe;

/// Attributes of a mirrored page that must resolve inside the mirror
const REFERENCE_ATTRIBUTES: &[(&str, &str)] = &[
    ("[href]", "href"),
    ("[src]", "src"),
    ("[poster]", "poster"),
    ("object[data]", "data"),
];

static SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:").expect("hardcoded scheme pattern is valid")
});

static SRCSET: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("[srcset]").expect("hardcoded selector is valid")
});

/// Path part of a reference that points into the mirror, if it does
fn local_target(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') || raw.starts_with("//") || SCHEME.is_match(raw) {
        return None;
    }
    let end = raw.find(|c| c == '#' || c == '?').unwrap_or(raw.len());
    let path = &raw[..end];
    (!path.is_empty()).then_some(path)
}

/// Relative references of a mirrored page, in document order
fn local_references(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut references = Vec::new();

    for (css, attribute) in REFERENCE_ATTRIBUTES {
        let selector = match Selector::parse(css) {
            Ok(selector) => selector,
            Err(_) => continue,
        };
        for element in document.select(&selector) {
            if let Some(target) = element.value().attr(attribute).and_then(local_target) {
                references.push(target.to_string());
            }
        }
    }

    for element in document.select(&SRCSET) {
        if let Some(srcset) = element.value().attr("srcset") {
            for (raw, _) in parse_srcset(srcset) {
                if let Some(target) = local_target(&raw) {
                    references.push(target.to_string());
                }
            }
        }
    }

    references
}

/// Scores a finished mirror against what the crawl captured
pub struct Verifier {
    weights: ScoreWeights,

    /// Script check, when enabled for the job
    probe: Option<Arc<dyn ScriptProbe>>,

    query_significant: bool,
}

impl Verifier {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights, probe: None, query_significant: true }
    }

    /// Match page links the way the crawl deduplicated them
    pub fn with_query_significant(mut self, query_significant: bool) -> Self {
        self.query_significant = query_significant;
        self
    }

    /// Captured pages, keyed by requested and final URL
    fn page_index(&self, pages: &[PageRecord]) -> MirrorIndex {
        let mut index = MirrorIndex::new(self.query_significant);
        for page in pages {
            index.add_page(&page.canonical, &page.local_path);
            if let Ok(final_url) = Url::parse(&page.final_url) {
                index.add_page(&canonicalize(&final_url, self.query_significant), &page.local_path);
            }
        }
        index
    }

    pub fn with_probe(mut self, probe: Arc<dyn ScriptProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Check every page, reference and asset of the mirror in `output_dir`.
    ///
    /// Internal links of the original pages must land on mirrored files, as
    /// must every relative reference of the written pages. Missing files and
    /// mismatched hashes become issues and lower the score; only an
    /// unreadable mirror or a failed script check is an error.
    pub async fn verify(
        &self,
        output_dir: &Path,
        pages: &[PageRecord],
        assets: &[AssetRecord],
    ) -> Result<VerificationReport, CrawlError> {
        if !tokio::fs::metadata(output_dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(CrawlError::Verification(format!("output directory {} does not exist", output_dir.display())));
        }

        let mut issues = Vec::new();
        let mut links = LinkStats::default();
        let mut asset_stats = AssetStats::default();
        let mut page_files = Vec::new();

        let by_url: HashMap<&str, &AssetRecord> = assets
            .iter()
            .flat_map(|record| {
                std::iter::once(record.source_url.as_str())
                    .chain(record.aliases.iter().map(String::as_str))
                    .map(move |url| (url, record))
            })
            .collect();

        let index = self.page_index(pages);
        let mut seen_pages = HashSet::new();
        for page in pages.iter().filter(|page| seen_pages.insert(page.local_path.as_str())) {
            let path = mirror_file(output_dir, &page.local_path)
                .map_err(|e| CrawlError::Verification(format!("{:#}", e)))?;

            let html = match tokio::fs::read_to_string(&path).await {
                Ok(html) => html,
                Err(e) => {
                    issues.push(VerificationIssue {
                        category: IssueCategory::MissingPage,
                        page: None,
                        target: page.local_path.clone(),
                        detail: Some(e.to_string()),
                    });
                    continue;
                }
            };
            let page_dir = path.parent().unwrap_or(output_dir).to_path_buf();

            for reference in local_references(&html) {
                links.total += 1;
                if tokio::fs::try_exists(page_dir.join(&reference)).await.unwrap_or(false) {
                    links.valid += 1;
                } else {
                    links.broken += 1;
                    issues.push(VerificationIssue {
                        category: IssueCategory::BrokenLink,
                        page: Some(page.local_path.clone()),
                        target: reference,
                        detail: None,
                    });
                }
            }

            let mut seen_links = HashSet::new();
            for link in &page.links {
                let url = match Url::parse(link) {
                    Ok(url) => url,
                    Err(_) => continue,
                };
                if !seen_links.insert(canonicalize(&url, self.query_significant)) {
                    continue;
                }

                links.total += 1;
                let mirrored = match index.resolve(&url).map(|target| mirror_file(output_dir, &target)) {
                    Some(Ok(file)) => tokio::fs::try_exists(file).await.unwrap_or(false),
                    _ => false,
                };
                if mirrored {
                    links.valid += 1;
                } else {
                    links.broken += 1;
                    issues.push(VerificationIssue {
                        category: IssueCategory::BrokenLink,
                        page: Some(page.local_path.clone()),
                        target: link.clone(),
                        detail: Some("linked page is not in the mirror".to_string()),
                    });
                }
            }

            let mut seen_assets = HashSet::new();
            for url in page.assets.iter().filter(|url| seen_assets.insert(url.as_str())) {
                asset_stats.expected += 1;
                let present = match by_url.get(url.as_str()) {
                    Some(record) => tokio::fs::try_exists(output_dir.join(&record.local_path)).await.unwrap_or(false),
                    None => false,
                };
                if present {
                    asset_stats.found += 1;
                } else {
                    issues.push(VerificationIssue {
                        category: IssueCategory::MissingAsset,
                        page: Some(page.local_path.clone()),
                        target: url.clone(),
                        detail: None,
                    });
                }
            }

            page_files.push((page.local_path.clone(), path));
        }

        let mut integrity = IntegrityStats::default();
        for record in assets {
            let bytes = match tokio::fs::read(output_dir.join(&record.local_path)).await {
                Ok(bytes) => bytes,
                // Absence is counted as a missing asset
                Err(_) => continue,
            };
            integrity.checked += 1;
            if content_hash(&bytes) != record.stored_hash {
                integrity.mismatched += 1;
                issues.push(VerificationIssue {
                    category: IssueCategory::IntegrityMismatch,
                    page: None,
                    target: record.local_path.clone(),
                    detail: Some(format!("expected {}", record.stored_hash)),
                });
            }
        }

        let javascript = match &self.probe {
            Some(probe) => {
                let mut check = ScriptCheck::default();
                for (local_path, path) in &page_files {
                    let errors = probe.script_errors(path).await?;
                    check.pages_checked += 1;
                    if !errors.is_empty() {
                        check.pages_with_errors += 1;
                    }
                    for error in errors {
                        issues.push(VerificationIssue {
                            category: IssueCategory::ScriptError,
                            page: Some(local_path.clone()),
                            target: local_path.clone(),
                            detail: Some(error),
                        });
                    }
                }
                Some(check)
            }
            None => None,
        };

        let components = ScoreComponents {
            links: ratio(links.valid, links.total),
            assets: ratio(asset_stats.found, asset_stats.expected),
            integrity: ratio(integrity.checked - integrity.mismatched, integrity.checked),
            javascript: javascript
                .as_ref()
                .map(|check| ratio(check.pages_checked - check.pages_with_errors, check.pages_checked)),
        };
        let score = self.weights.combine(&components);

        debug!("Verification components: {:?}", components);
        info!(
            "Verified {}: score {:.2}, {} issues",
            output_dir.display(),
            score,
            issues.len()
        );

        Ok(VerificationReport {
            links,
            assets: asset_stats,
            integrity,
            javascript,
            components,
            score,
            issues,
            verified_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::MockScriptProbe;

    fn page(url: &str, local_path: &str, assets: &[&str]) -> PageRecord {
        PageRecord {
            url: url.to_string(),
            final_url: url.to_string(),
            canonical: url.to_string(),
            dedup_key: url.to_string(),
            depth: 0,
            status: 200,
            content_hash: String::new(),
            links: Vec::new(),
            assets: assets.iter().map(|a| a.to_string()).collect(),
            fetch_duration_ms: 0,
            bypass: None,
            cached: false,
            local_path: local_path.to_string(),
            fetched_at: Utc::now(),
        }
    }

    fn asset(url: &str, local_path: &str, bytes: &[u8]) -> AssetRecord {
        AssetRecord {
            source_url: url.to_string(),
            content_hash: content_hash(bytes),
            stored_hash: content_hash(bytes),
            byte_size: bytes.len() as u64,
            local_path: local_path.to_string(),
            optimized: false,
            ref_count: 1,
            content_type: None,
            aliases: Vec::new(),
            references: Vec::new(),
        }
    }

    fn write(root: &Path, path: &str, content: &[u8]) {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture(root: &Path) -> (Vec<PageRecord>, Vec<AssetRecord>) {
        write(root, "index.html", br#"<a href="about/index.html#team">About</a><img src="assets/images/logo.png"><a href="https://elsewhere.org/">x</a>"#);
        write(root, "about/index.html", br#"<a href="../index.html">Home</a><img srcset="../assets/images/logo.png 1x">"#);
        write(root, "assets/images/logo.png", b"logo");

        let pages = vec![
            page("https://example.com/", "index.html", &["https://example.com/logo.png"]),
            page("https://example.com/about", "about/index.html", &["https://example.com/logo.png"]),
        ];
        let assets = vec![asset("https://example.com/logo.png", "assets/images/logo.png", b"logo")];
        (pages, assets)
    }

    #[tokio::test]
    async fn test_complete_mirror_scores_100() {
        let dir = tempfile::tempdir().unwrap();
        let (pages, assets) = fixture(dir.path());

        let report = Verifier::new(ScoreWeights::default()).verify(dir.path(), &pages, &assets).await.unwrap();

        assert_eq!(report.links, LinkStats { total: 4, valid: 4, broken: 0 });
        assert_eq!(report.assets, AssetStats { expected: 2, found: 2 });
        assert_eq!(report.integrity, IntegrityStats { checked: 1, mismatched: 0 });
        assert!(report.javascript.is_none());
        assert!(report.issues.is_empty());
        assert_eq!(report.score, 100.0);
    }

    #[tokio::test]
    async fn test_corruption_and_missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pages, assets) = fixture(dir.path());
        write(dir.path(), "assets/images/logo.png", b"tampered");
        std::fs::remove_file(dir.path().join("about/index.html")).unwrap();
        pages[0].assets.push("https://example.com/never-downloaded.js".to_string());

        let report = Verifier::new(ScoreWeights::default()).verify(dir.path(), &pages, &assets).await.unwrap();

        assert_eq!(report.issue_count(IssueCategory::MissingPage), 1);
        assert_eq!(report.issue_count(IssueCategory::BrokenLink), 1);
        assert_eq!(report.issue_count(IssueCategory::MissingAsset), 1);
        assert_eq!(report.issue_count(IssueCategory::IntegrityMismatch), 1);
        assert!(report.score < 100.0);
    }

    #[tokio::test]
    async fn test_script_errors_lower_score() {
        let dir = tempfile::tempdir().unwrap();
        let (pages, assets) = fixture(dir.path());

        let mut probe = MockScriptProbe::new();
        probe.expect_script_errors().times(2).returning(|path| {
            if path.ends_with("about/index.html") {
                Ok(vec!["ReferenceError: analytics is not defined".to_string()])
            } else {
                Ok(Vec::new())
            }
        });

        let report = Verifier::new(ScoreWeights::default())
            .with_probe(Arc::new(probe))
            .verify(dir.path(), &pages, &assets)
            .await
            .unwrap();

        assert_eq!(report.javascript, Some(ScriptCheck { pages_checked: 2, pages_with_errors: 1 }));
        assert_eq!(report.components.javascript, Some(0.5));
        assert_eq!(report.score, 95.0);
        assert_eq!(report.issue_count(IssueCategory::ScriptError), 1);
    }

    #[tokio::test]
    async fn test_links_to_uncaptured_pages_are_broken() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pages, assets) = fixture(dir.path());
        pages[0].links = vec![
            "https://example.com/about#team".to_string(),
            "https://example.com/about".to_string(),
            "https://example.com/gone".to_string(),
        ];
        pages[1].links = vec!["https://example.com/".to_string()];

        let report = Verifier::new(ScoreWeights::default()).verify(dir.path(), &pages, &assets).await.unwrap();

        // 4 relative references plus 3 distinct page links
        assert_eq!(report.links, LinkStats { total: 7, valid: 6, broken: 1 });
        let broken: Vec<_> = report.issues.iter().filter(|i| i.category == IssueCategory::BrokenLink).collect();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].target, "https://example.com/gone");
        assert_eq!(broken[0].page.as_deref(), Some("index.html"));
        assert!(report.score < 100.0);
    }

    #[tokio::test]
    async fn test_missing_output_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing-here");
        let result = Verifier::new(ScoreWeights::default()).verify(&missing, &[], &[]).await;
        assert!(matches!(result, Err(CrawlError::Verification(_))));
    }
}
