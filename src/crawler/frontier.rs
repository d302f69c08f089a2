use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::crawler::options::JobOptions;
use crate::utils::short_hash;

/// Public suffixes with two labels that we recognise when computing the
/// registrable domain.
const TWO_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "com.au", "net.au", "org.au",
    "co.nz", "co.jp", "ne.jp", "com.br", "com.cn", "com.mx", "co.in", "co.za",
    "com.tr", "com.ar", "co.kr",
];

/// A discovered URL awaiting or in fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierEntry {
    /// URL to fetch (fragment removed)
    pub url: String,

    /// Canonical form used for dedup and mirror paths
    pub canonical: String,

    /// Discovery depth (0 for the root)
    pub depth: u32,

    /// Page that linked here, for diagnostics
    pub parent_url: Option<String>,

    /// Hash of the canonical form
    pub dedup_key: String,
}

/// Result of offering a URL to the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    Duplicate,
    OutOfScope,
    TooDeep,
}

/// Persistable frontier state for checkpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    pub pending: Vec<FrontierEntry>,
    pub seen: Vec<String>,
    pub visited: Vec<String>,
}

/// Canonicalize a URL: no fragment, no trailing slash, sorted or dropped query.
pub fn canonicalize(url: &Url, query_significant: bool) -> String {
    let mut normalized = url.clone();

    // Remove fragments (anchors)
    normalized.set_fragment(None);

    if query_significant {
        // Sort query parameters so that ordering does not create new keys
        let mut params: Vec<(String, String)> = normalized
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if params.is_empty() {
            normalized.set_query(None);
        } else {
            params.sort();
            normalized.query_pairs_mut().clear().extend_pairs(params.iter());
        }
    } else {
        normalized.set_query(None);
    }

    // Remove trailing slash from non-root paths
    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(path.trim_end_matches('/'));
    }

    normalized.to_string()
}

/// Dedup key for a canonical URL
pub fn dedup_key(canonical: &str) -> String {
    short_hash(canonical, 16)
}

/// Registrable domain of a host ("blog.example.co.uk" -> "example.co.uk").
pub fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_lowercase();
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return host;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }

    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if TWO_LABEL_SUFFIXES.contains(&last_two.as_str()) { 3 } else { 2 };
    labels[labels.len() - keep.min(labels.len())..].join(".")
}

/// Which URLs belong to the crawl
#[derive(Debug, Clone)]
pub struct ScopeRules {
    root_domain: String,

    /// Extra domains; subdomains of these are in scope as well
    allowed_domains: HashSet<String>,

    include_patterns: Vec<Regex>,

    exclude_patterns: Vec<Regex>,
}

impl ScopeRules {
    pub fn new(root: &Url, options: &JobOptions) -> Self {
        let compile = |patterns: &[String], kind: &str| -> Vec<Regex> {
            patterns.iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Invalid {} pattern '{}': {}", kind, pattern, e);
                        None
                    }
                })
                .collect()
        };

        Self {
            root_domain: registrable_domain(root.host_str().unwrap_or_default()),
            allowed_domains: options.allowed_domains.iter().map(|d| d.to_lowercase()).collect(),
            include_patterns: compile(&options.include_patterns, "include"),
            exclude_patterns: compile(&options.exclude_patterns, "exclude"),
        }
    }

    /// Decide whether a canonical URL is part of the crawl
    pub fn in_scope(&self, url: &Url, canonical: &str) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }

        let host = match url.host_str() {
            Some(host) => host.to_lowercase(),
            None => return false,
        };

        let same_site = registrable_domain(&host) == self.root_domain;
        let widened = self.allowed_domains.iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)));
        if !same_site && !widened {
            debug!("Skipping URL outside crawl scope: {}", canonical);
            return false;
        }

        if self.exclude_patterns.iter().any(|p| p.is_match(canonical)) {
            debug!("Skipping URL matching exclusion pattern: {}", canonical);
            return false;
        }

        if !self.include_patterns.is_empty() && !self.include_patterns.iter().any(|p| p.is_match(canonical)) {
            debug!("Skipping URL not matching any inclusion pattern: {}", canonical);
            return false;
        }

        true
    }
}

/// Breadth-first crawl frontier.
///
/// The frontier is a set keyed by dedup key: a URL is accepted at most once
/// per job, whether it is still queued or already visited.
#[derive(Debug, Clone)]
pub struct Frontier {
    /// Pending entries grouped by depth, FIFO within a depth
    queues: BTreeMap<u32, VecDeque<FrontierEntry>>,

    /// Dedup keys that were ever queued
    seen: HashSet<String>,

    /// Dedup keys whose fetch completed
    visited: HashSet<String>,

    scope: ScopeRules,

    max_depth: u32,

    query_significant: bool,
}

impl Frontier {
    pub fn new(root: &Url, options: &JobOptions) -> Self {
        Self {
            queues: BTreeMap::new(),
            seen: HashSet::new(),
            visited: HashSet::new(),
            scope: ScopeRules::new(root, options),
            max_depth: options.max_depth,
            query_significant: options.query_significant,
        }
    }

    /// Canonical form of a URL under this crawl's query policy
    pub fn canonical(&self, url: &Url) -> String {
        canonicalize(url, self.query_significant)
    }

    /// Whether a URL falls inside this crawl's scope
    pub fn in_scope(&self, url: &Url) -> bool {
        self.scope.in_scope(url, &self.canonical(url))
    }

    /// Offer a discovered URL at the given depth
    pub fn offer(&mut self, url: &Url, depth: u32, parent_url: Option<&str>) -> Offer {
        if depth > self.max_depth {
            return Offer::TooDeep;
        }

        let canonical = self.canonical(url);
        let key = dedup_key(&canonical);

        if self.seen.contains(&key) {
            return Offer::Duplicate;
        }

        if !self.scope.in_scope(url, &canonical) {
            return Offer::OutOfScope;
        }

        let mut fetch_url = url.clone();
        fetch_url.set_fragment(None);

        self.seen.insert(key.clone());
        self.queues.entry(depth).or_default().push_back(FrontierEntry {
            url: fetch_url.to_string(),
            canonical,
            depth,
            parent_url: parent_url.map(str::to_string),
            dedup_key: key,
        });

        Offer::Queued
    }

    /// Pop the shallowest, oldest pending entry
    pub fn pop(&mut self) -> Option<FrontierEntry> {
        let depth = *self.queues.iter().find(|(_, q)| !q.is_empty())?.0;
        let queue = self.queues.get_mut(&depth)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&depth);
        }
        entry
    }

    /// Put an entry back at the front of its depth (used when a fetch is abandoned)
    pub fn requeue(&mut self, entry: FrontierEntry) {
        if !self.visited.contains(&entry.dedup_key) {
            self.queues.entry(entry.depth).or_default().push_front(entry);
        }
    }

    pub fn mark_visited(&mut self, key: &str) -> bool {
        self.visited.insert(key.to_string())
    }

    pub fn is_visited(&self, key: &str) -> bool {
        self.visited.contains(key)
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Capture pending entries plus the given in-flight ones
    pub fn snapshot(&self, in_flight: impl IntoIterator<Item = FrontierEntry>) -> FrontierSnapshot {
        let mut pending: Vec<FrontierEntry> = in_flight.into_iter().collect();
        pending.extend(self.queues.values().flat_map(|q| q.iter().cloned()));
        pending.sort_by_key(|e| e.depth);

        FrontierSnapshot {
            pending,
            seen: self.seen.iter().cloned().collect(),
            visited: self.visited.iter().cloned().collect(),
        }
    }

    /// Rebuild state from a checkpoint; visited entries are never re-queued
    pub fn restore(&mut self, snapshot: FrontierSnapshot) {
        self.seen = snapshot.seen.into_iter().collect();
        self.visited = snapshot.visited.into_iter().collect();
        self.queues.clear();

        for entry in snapshot.pending {
            if self.visited.contains(&entry.dedup_key) {
                continue;
            }
            self.seen.insert(entry.dedup_key.clone());
            self.queues.entry(entry.depth).or_default().push_back(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn frontier(options: JobOptions) -> Frontier {
        Frontier::new(&url("https://example.com/"), &options)
    }

    #[test]
    fn test_trailing_slash_and_fragment_share_a_key() {
        let mut f = frontier(JobOptions::default());

        assert_eq!(f.offer(&url("https://example.com/docs/"), 1, None), Offer::Queued);
        assert_eq!(f.offer(&url("https://example.com/docs"), 1, None), Offer::Duplicate);
        assert_eq!(f.offer(&url("https://example.com/docs#intro"), 1, None), Offer::Duplicate);
        assert_eq!(f.offer(&url("https://EXAMPLE.com:443/docs/"), 1, None), Offer::Duplicate);
    }

    #[test]
    fn test_query_significance() {
        let mut f = frontier(JobOptions::default());
        assert_eq!(f.offer(&url("https://example.com/s?b=2&a=1"), 1, None), Offer::Queued);
        assert_eq!(f.offer(&url("https://example.com/s?a=1&b=2"), 1, None), Offer::Duplicate);
        assert_eq!(f.offer(&url("https://example.com/s?a=2"), 1, None), Offer::Queued);

        let mut f = frontier(JobOptions { query_significant: false, ..JobOptions::default() });
        assert_eq!(f.offer(&url("https://example.com/s?a=1"), 1, None), Offer::Queued);
        assert_eq!(f.offer(&url("https://example.com/s?a=2"), 1, None), Offer::Duplicate);
    }

    #[test]
    fn test_depth_limit_drops_silently() {
        let mut f = frontier(JobOptions { max_depth: 1, ..JobOptions::default() });
        assert_eq!(f.offer(&url("https://example.com/a"), 1, None), Offer::Queued);
        assert_eq!(f.offer(&url("https://example.com/b"), 2, None), Offer::TooDeep);
        assert_eq!(f.pending(), 1);
    }

    #[test]
    fn test_scope_is_registrable_domain() {
        let mut f = frontier(JobOptions::default());
        assert_eq!(f.offer(&url("https://blog.example.com/x"), 1, None), Offer::Queued);
        assert_eq!(f.offer(&url("https://other.org/x"), 1, None), Offer::OutOfScope);
        assert_eq!(f.offer(&url("mailto:someone@example.com"), 1, None), Offer::OutOfScope);

        let mut f = frontier(JobOptions {
            allowed_domains: vec!["cdn-example.net".to_string()],
            ..JobOptions::default()
        });
        assert_eq!(f.offer(&url("https://static.cdn-example.net/p"), 1, None), Offer::Queued);
    }

    #[test]
    fn test_exclusion_patterns() {
        let mut f = frontier(JobOptions {
            exclude_patterns: vec![r"/private/".to_string()],
            ..JobOptions::default()
        });
        assert_eq!(f.offer(&url("https://example.com/private/a"), 1, None), Offer::OutOfScope);
        assert_eq!(f.offer(&url("https://example.com/public/a"), 1, None), Offer::Queued);
    }

    #[test]
    fn test_pop_is_breadth_first() {
        let mut f = frontier(JobOptions::default());
        f.offer(&url("https://example.com/deep"), 2, None);
        f.offer(&url("https://example.com/a"), 1, None);
        f.offer(&url("https://example.com/b"), 1, None);
        f.offer(&url("https://example.com/"), 0, None);

        let order: Vec<String> = std::iter::from_fn(|| f.pop()).map(|e| e.canonical).collect();
        assert_eq!(
            order,
            vec![
                "https://example.com/",
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/deep",
            ]
        );
    }

    #[test]
    fn test_restore_skips_visited() {
        let mut f = frontier(JobOptions::default());
        f.offer(&url("https://example.com/a"), 1, None);
        f.offer(&url("https://example.com/b"), 1, None);
        let a = f.pop().unwrap();
        f.mark_visited(&a.dedup_key);

        let mut snapshot = f.snapshot(Vec::new());
        // a stale copy of a visited entry must not come back
        snapshot.pending.push(a.clone());

        let mut restored = frontier(JobOptions::default());
        restored.restore(snapshot);
        assert_eq!(restored.pending(), 1);
        assert_eq!(restored.offer(&url("https://example.com/a"), 1, None), Offer::Duplicate);
        assert!(restored.is_visited(&a.dedup_key));
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("www.example.com"), "example.com");
        assert_eq!(registrable_domain("a.b.example.co.uk"), "example.co.uk");
        assert_eq!(registrable_domain("localhost"), "localhost");
        assert_eq!(registrable_domain("127.0.0.1"), "127.0.0.1");
    }
}
