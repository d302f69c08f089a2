use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// Attributes that reference sub-resources: (selector, attribute)
const ASSET_ATTRIBUTES: &[(&str, &str)] = &[
    ("link[href]", "href"),
    ("script[src]", "src"),
    ("img[src]", "src"),
    ("source[src]", "src"),
    ("video[src]", "src"),
    ("video[poster]", "poster"),
    ("audio[src]", "src"),
    ("track[src]", "src"),
    ("embed[src]", "src"),
    ("object[data]", "data"),
    ("input[type=image][src]", "src"),
];

/// `link` relations whose target is a sub-resource, not a page
const ASSET_LINK_RELS: &[&str] = &["stylesheet", "icon", "shortcut", "apple-touch-icon", "preload", "manifest", "mask-icon"];

pub(crate) static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("hardcoded css url pattern is valid")
});

pub(crate) static CSS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).expect("hardcoded css import pattern is valid")
});

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| selector("a[href], area[href]"));
static BASE: LazyLock<Selector> = LazyLock::new(|| selector("base[href]"));
static SRCSET: LazyLock<Selector> = LazyLock::new(|| selector("img[srcset], source[srcset]"));
static STYLED: LazyLock<Selector> = LazyLock::new(|| selector("[style]"));
static STYLE_BLOCK: LazyLock<Selector> = LazyLock::new(|| selector("style"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("hardcoded selector is valid")
}

/// Page links and asset references found in a document
#[derive(Debug, Default, Clone, PartialEq)]
pub struct References {
    pub links: Vec<Url>,
    pub assets: Vec<Url>,
}

/// Whether a raw reference can never be fetched
pub fn is_unfetchable(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    lower.is_empty()
        || lower.starts_with('#')
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:")
        || lower.starts_with("about:")
        || lower.starts_with("blob:")
}

/// Resolve a raw reference against a base, keeping only http(s) targets
pub fn resolve(base: &Url, raw: &str) -> Option<Url> {
    if is_unfetchable(raw) {
        return None;
    }
    let url = base.join(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Split a `srcset` value into (url, descriptor) candidates
pub fn parse_srcset(value: &str) -> Vec<(String, Option<String>)> {
    value.split(',')
        .filter_map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = parts.next()?.to_string();
            let descriptor = parts.next().map(str::to_string);
            Some((url, descriptor))
        })
        .collect()
}

/// `url(...)` and `@import` targets in a stylesheet
pub fn css_references(css: &str) -> Vec<String> {
    CSS_URL.captures_iter(css)
        .chain(CSS_IMPORT.captures_iter(css))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|raw| !is_unfetchable(raw))
        .collect()
}

/// Base URL that relative references resolve against
pub fn document_base(document: &Html, page_url: &Url) -> Url {
    document.select(&BASE)
        .next()
        .and_then(|base| base.value().attr("href"))
        .and_then(|href| page_url.join(href).ok())
        .unwrap_or_else(|| page_url.clone())
}

/// Extract page links and asset references from HTML
pub fn extract_references(html: &str, page_url: &Url) -> References {
    let document = Html::parse_document(html);
    let base = document_base(&document, page_url);

    let mut links = Ordered::default();
    let mut assets = Ordered::default();

    for element in document.select(&ANCHOR) {
        if let Some(url) = element.value().attr("href").and_then(|href| resolve(&base, href)) {
            links.push(url);
        }
    }

    for (css, attribute) in ASSET_ATTRIBUTES {
        for element in document.select(&selector(css)) {
            if element.value().name() == "link" && !is_asset_link(element.value().attr("rel")) {
                continue;
            }
            if let Some(url) = element.value().attr(attribute).and_then(|raw| resolve(&base, raw)) {
                assets.push(url);
            }
        }
    }

    for element in document.select(&SRCSET) {
        if let Some(srcset) = element.value().attr("srcset") {
            for (raw, _) in parse_srcset(srcset) {
                if let Some(url) = resolve(&base, &raw) {
                    assets.push(url);
                }
            }
        }
    }

    let inline_styles = document.select(&STYLED)
        .filter_map(|element| element.value().attr("style").map(str::to_string))
        .chain(document.select(&STYLE_BLOCK).map(|element| element.text().collect::<String>()));
    for css in inline_styles {
        for raw in css_references(&css) {
            if let Some(url) = resolve(&base, &raw) {
                assets.push(url);
            }
        }
    }

    References { links: links.into_vec(), assets: assets.into_vec() }
}

fn is_asset_link(rel: Option<&str>) -> bool {
    rel.map_or(false, |rel| {
        rel.split_whitespace()
            .any(|token| ASSET_LINK_RELS.iter().any(|known| token.eq_ignore_ascii_case(known)))
    })
}

/// Insertion-ordered set of URLs with fragments removed
#[derive(Default)]
struct Ordered {
    seen: HashSet<String>,
    items: Vec<Url>,
}

impl Ordered {
    fn push(&mut self, mut url: Url) {
        url.set_fragment(None);
        if self.seen.insert(url.to_string()) {
            self.items.push(url);
        }
    }

    fn into_vec(self) -> Vec<Url> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html><head>
  <link rel="stylesheet" href="/css/site.css">
  <link rel="canonical" href="https://example.com/about">
  <link rel="icon" href="favicon.ico">
  <script src="https://cdn.example.net/app.js"></script>
  <style>body { background: url('/img/bg.png') }</style>
</head><body>
  <a href="/about#team">About</a>
  <a href="contact">Contact</a>
  <a href="mailto:hi@example.com">Mail</a>
  <a href="javascript:void(0)">Nothing</a>
  <a href="/about">Again</a>
  <img src="/img/logo.png" srcset="/img/logo.png 1x, /img/logo@2x.png 2x">
  <div style="background-image: url(&quot;/img/hero.jpg&quot;)"></div>
  <img src="data:image/png;base64,AAAA">
</body></html>"#;

    #[test]
    fn test_extracts_links_and_assets() {
        let page = Url::parse("https://example.com/docs/").unwrap();
        let refs = extract_references(PAGE, &page);

        let links: Vec<&str> = refs.links.iter().map(Url::as_str).collect();
        assert_eq!(links, vec!["https://example.com/about", "https://example.com/docs/contact"]);

        let assets: Vec<&str> = refs.assets.iter().map(Url::as_str).collect();
        assert!(assets.contains(&"https://example.com/css/site.css"));
        assert!(assets.contains(&"https://example.com/docs/favicon.ico"));
        assert!(assets.contains(&"https://cdn.example.net/app.js"));
        assert!(assets.contains(&"https://example.com/img/logo@2x.png"));
        assert!(assets.contains(&"https://example.com/img/bg.png"));
        assert!(assets.contains(&"https://example.com/img/hero.jpg"));
        assert!(!assets.iter().any(|a| a.contains("canonical") || a.ends_with("/about")));
        assert_eq!(assets.iter().filter(|a| a.ends_with("/img/logo.png")).count(), 1);
    }

    #[test]
    fn test_base_href_changes_resolution() {
        let html = r#"<html><head><base href="https://example.com/v2/"></head>
            <body><a href="guide">Guide</a></body></html>"#;
        let refs = extract_references(html, &Url::parse("https://example.com/").unwrap());
        assert_eq!(refs.links[0].as_str(), "https://example.com/v2/guide");
    }

    #[test]
    fn test_css_references() {
        let css = r#"@import "print.css";
            .a { background: url(../img/a.png) }
            .b { background: url("data:image/gif;base64,R0lG") }
            @font-face { src: url('/fonts/x.woff2') format('woff2') }"#;
        assert_eq!(css_references(css), vec!["../img/a.png", "/fonts/x.woff2", "print.css"]);
    }

    #[test]
    fn test_parse_srcset() {
        assert_eq!(
            parse_srcset("a.png 1x, b.png 2x,c.png"),
            vec![
                ("a.png".to_string(), Some("1x".to_string())),
                ("b.png".to_string(), Some("2x".to_string())),
                ("c.png".to_string(), None),
            ]
        );
    }
}
