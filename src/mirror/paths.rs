use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::utils::short_hash;

/// Top-level names pages may not take, since the mirror uses them
const RESERVED_ROOTS: &[&str] = &["assets", ".mirror"];

/// Where an asset lives under `assets/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Images,
    Styles,
    Scripts,
    Fonts,
    Media,
    Other,
}

impl AssetCategory {
    pub fn dir(self) -> &'static str {
        match self {
            AssetCategory::Images => "images",
            AssetCategory::Styles => "styles",
            AssetCategory::Scripts => "scripts",
            AssetCategory::Fonts => "fonts",
            AssetCategory::Media => "media",
            AssetCategory::Other => "other",
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif" | "bmp" => AssetCategory::Images,
            "css" => AssetCategory::Styles,
            "js" | "mjs" => AssetCategory::Scripts,
            "woff" | "woff2" | "ttf" | "otf" | "eot" => AssetCategory::Fonts,
            "mp4" | "webm" | "mp3" | "ogg" | "wav" | "vtt" => AssetCategory::Media,
            _ => AssetCategory::Other,
        }
    }
}

/// Extension for a MIME type
fn mime_extension(mime: &str) -> Option<&'static str> {
    Some(match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
        "image/avif" => "avif",
        "image/bmp" => "bmp",
        "text/css" => "css",
        "text/javascript" | "application/javascript" | "application/x-javascript" => "js",
        "font/woff" | "application/font-woff" => "woff",
        "font/woff2" => "woff2",
        "font/ttf" | "application/x-font-ttf" => "ttf",
        "font/otf" => "otf",
        "application/vnd.ms-fontobject" => "eot",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" => "wav",
        "text/vtt" => "vtt",
        "application/json" => "json",
        "application/manifest+json" => "webmanifest",
        "application/pdf" => "pdf",
        _ => return None,
    })
}

/// Lowercased extension of the last path segment, if it looks like one
fn url_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.last()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(ext)
    } else {
        None
    }
}

/// Category and file extension of a downloaded asset.
///
/// The URL extension wins when it names a known type; otherwise the
/// Content-Type header, then the sniffed bytes.
pub fn classify_asset(url: &Url, content_type: Option<&str>, bytes: &[u8]) -> (AssetCategory, String) {
    let from_url = url_extension(url);
    if let Some(ext) = &from_url {
        let category = AssetCategory::from_extension(ext);
        if category != AssetCategory::Other {
            return (category, ext.clone());
        }
    }

    let declared = content_type
        .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .and_then(|mime| mime_extension(&mime));
    let sniffed = || infer::get(bytes).and_then(|kind| mime_extension(kind.mime_type()));

    let ext = declared
        .or_else(sniffed)
        .map(str::to_string)
        .or(from_url)
        .unwrap_or_else(|| "bin".to_string());

    (AssetCategory::from_extension(&ext), ext)
}

/// Mirror-relative path of a stored asset
pub fn asset_path(content_hash: &str, category: AssetCategory, ext: &str) -> String {
    format!("assets/{}/{}.{}", category.dir(), &content_hash[..16.min(content_hash.len())], ext)
}

/// Keep path components portable across filesystems
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~') { c } else { '_' })
        .collect()
}

/// Maps page URLs to their files in the mirror
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    /// host[:port] of the crawl root; other hosts get their own subtree
    root_host: String,

    query_significant: bool,

    /// Page files handed out so far -> canonical URL owning each
    claimed: HashMap<String, String>,
}

fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

impl MirrorLayout {
    pub fn new(root: &Url, query_significant: bool) -> Self {
        Self { root_host: host_key(root), query_significant, claimed: HashMap::new() }
    }

    /// File for a page, unique among the pages of this mirror.
    ///
    /// When the natural path already belongs to another URL (`/a%20b` and
    /// `/a_20b`, `/feed.php` and `/feed.php.html`) the file stem gets a hash
    /// of the canonical URL.
    pub fn claim_page_path(&mut self, url: &Url, canonical: &str) -> String {
        let natural = self.page_path(url);
        let path = match self.claimed.get(&natural) {
            Some(owner) if owner != canonical => disambiguate(&natural, canonical),
            _ => natural,
        };
        self.reserve(&path, canonical);
        path
    }

    /// Record a page file assigned before, e.g. by an interrupted run
    pub fn reserve(&mut self, path: &str, canonical: &str) {
        self.claimed.entry(path.to_string()).or_insert_with(|| canonical.to_string());
    }

    /// Mirror-relative file of a page.
    ///
    /// `/` -> `index.html`, `/docs/` and `/docs` -> `docs/index.html`,
    /// `/a.html` stays, `/feed.php` -> `feed.php.html`.
    pub fn page_path(&self, url: &Url) -> String {
        let raw_path = url.path();
        let mut segments: Vec<String> = raw_path
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .map(sanitize_segment)
            .collect();

        let mut file = match segments.pop() {
            None => "index.html".to_string(),
            Some(last) if raw_path.ends_with('/') => {
                segments.push(last);
                "index.html".to_string()
            }
            Some(last) => match last.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
                Some(ext) if ext == "html" || ext == "htm" => last,
                Some(ext) if !ext.is_empty() => format!("{}.html", last),
                _ => {
                    segments.push(last);
                    "index.html".to_string()
                }
            },
        };

        if self.query_significant {
            if url.query().map_or(false, |q| !q.is_empty()) {
                let mut pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
                pairs.sort();
                let key = short_hash(&format!("{:?}", pairs), 8);
                let stem = file.rsplit_once('.').map(|(stem, _)| stem.to_string()).unwrap_or_else(|| file.clone());
                let ext = file.rsplit_once('.').map(|(_, ext)| ext.to_string()).unwrap_or_else(|| "html".to_string());
                file = format!("{}__q{}.{}", stem, key, ext);
            }
        }

        let host = host_key(url);
        if host != self.root_host {
            segments.insert(0, sanitize_segment(&host));
        } else if let Some(first) = segments.first_mut() {
            if RESERVED_ROOTS.contains(&first.as_str()) {
                first.insert(0, '_');
            }
        }

        segments.push(file);
        segments.join("/")
    }
}

fn disambiguate(path: &str, canonical: &str) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    let (stem, ext) = file.rsplit_once('.').unwrap_or((file, "html"));
    let file = format!("{}__u{}.{}", stem, short_hash(canonical, 8), ext);
    match dir {
        Some(dir) => format!("{}/{}", dir, file),
        None => file,
    }
}

/// Relative reference from one mirror file to another, with `/` separators
pub fn relative_href(from_file: &str, to_file: &str) -> String {
    let from_dir = Path::new(from_file).parent().unwrap_or_else(|| Path::new(""));
    match pathdiff::diff_paths(Path::new(to_file), from_dir) {
        Some(path) => path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        None => to_file.to_string(),
    }
}
