use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use lol_html::errors::AttributeNameError;
use lol_html::html_content::{ContentType, Element};
use lol_html::{element, text, HtmlRewriter, Settings};
use regex::Captures;
use scraper::Html;
use url::Url;

use crate::crawler::extract::{document_base, parse_srcset, resolve as resolve_reference, CSS_IMPORT, CSS_URL};
use crate::crawler::frontier::canonicalize;
use crate::mirror::paths::relative_href;

/// Attributes holding a single URL: (selector, attribute)
const URL_ATTRIBUTES: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("area[href]", "href"),
    ("link[href]", "href"),
    ("img[src]", "src"),
    ("script[src]", "src"),
    ("source[src]", "src"),
    ("video[src]", "src"),
    ("video[poster]", "poster"),
    ("audio[src]", "src"),
    ("track[src]", "src"),
    ("embed[src]", "src"),
    ("iframe[src]", "src"),
    ("input[src]", "src"),
    ("object[data]", "data"),
];

/// Captured pages, keyed the way links to them resolve
#[derive(Debug, Clone, Default)]
pub struct MirrorIndex {
    /// canonical page URL -> mirror path
    pages: HashMap<String, String>,

    query_significant: bool,
}

impl MirrorIndex {
    pub fn new(query_significant: bool) -> Self {
        Self { query_significant, ..Self::default() }
    }

    /// Register a page; the first path registered for a URL wins
    pub fn add_page(&mut self, canonical: &str, path: &str) {
        self.pages.entry(canonical.to_string()).or_insert_with(|| path.to_string());
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Mirror path of the page a link points to, if it was captured
    pub fn resolve(&self, url: &Url) -> Option<String> {
        self.pages.get(&canonicalize(url, self.query_significant)).cloned()
    }
}

/// New value for one reference and whether it now points into the mirror.
///
/// References the mirror does not hold become absolute so they keep
/// working after `<base>` is dropped and the file has moved.
fn rewrite_reference(
    raw: &str,
    base: &Url,
    from_file: &str,
    resolve: &dyn Fn(&Url) -> Option<String>,
) -> Option<(String, bool)> {
    let url = resolve_reference(base, raw)?;
    let fragment = url.fragment().map(|f| format!("#{}", f)).unwrap_or_default();
    match resolve(&url) {
        Some(path) => Some((format!("{}{}", relative_href(from_file, &path), fragment), true)),
        None => Some((url.to_string(), false)),
    }
}

/// Point `url(...)` and `@import` references of a stylesheet at the mirror.
///
/// `from_file` is the mirror path of the stylesheet, or of the page for
/// inline styles. Returns the rewritten CSS and how many references now
/// point into the mirror.
pub fn rewrite_css(css: &str, base: &Url, from_file: &str, resolve: &dyn Fn(&Url) -> Option<String>) -> (String, usize) {
    let rewritten = Cell::new(0);

    let css = CSS_URL.replace_all(css, |caps: &Captures| {
        match rewrite_reference(&caps[1], base, from_file, resolve) {
            Some((value, inside)) => {
                if inside {
                    rewritten.set(rewritten.get() + 1);
                }
                format!("url(\"{}\")", value)
            }
            None => caps[0].to_string(),
        }
    });

    let css = CSS_IMPORT.replace_all(&css, |caps: &Captures| {
        match rewrite_reference(&caps[1], base, from_file, resolve) {
            Some((value, inside)) => {
                if inside {
                    rewritten.set(rewritten.get() + 1);
                }
                format!("@import \"{}\"", value)
            }
            None => caps[0].to_string(),
        }
    });

    (css.into_owned(), rewritten.get())
}

/// Rewrite every reference in a page so the mirror works offline.
///
/// `page_path` is where the page is written in the mirror. `<base>` is
/// removed and subresource integrity attributes are dropped, since stored
/// bytes may differ from the originals. Returns the new HTML and how many
/// references now point into the mirror.
pub fn rewrite_html(
    html: &str,
    page_url: &Url,
    page_path: &str,
    resolve: &dyn Fn(&Url) -> Option<String>,
) -> Result<(String, usize)> {
    let base = document_base(&Html::parse_document(html), page_url);
    let rewritten = Cell::new(0usize);
    let style_buffer = RefCell::new(String::new());

    let count = |inside: bool| {
        if inside {
            rewritten.set(rewritten.get() + 1);
        }
    };

    let rewrite_attribute = |el: &mut Element, attribute: &str| -> Result<(), AttributeNameError> {
        if let Some(raw) = el.get_attribute(attribute) {
            if let Some((value, inside)) = rewrite_reference(&raw, &base, page_path, resolve) {
                el.set_attribute(attribute, &value)?;
                count(inside);
            }
        }
        Ok(())
    };
    let rewrite_attribute = &rewrite_attribute;

    let mut handlers = vec![
        element!("base", |el| {
            el.remove();
            Ok(())
        }),
        element!("[integrity]", |el| {
            el.remove_attribute("integrity");
            Ok(())
        }),
        element!("[srcset]", |el| {
            if let Some(srcset) = el.get_attribute("srcset") {
                let candidates: Vec<String> = parse_srcset(&srcset)
                    .into_iter()
                    .map(|(raw, descriptor)| {
                        let value = match rewrite_reference(&raw, &base, page_path, resolve) {
                            Some((value, inside)) => {
                                count(inside);
                                value
                            }
                            None => raw,
                        };
                        match descriptor {
                            Some(descriptor) => format!("{} {}", value, descriptor),
                            None => value,
                        }
                    })
                    .collect();
                el.set_attribute("srcset", &candidates.join(", "))?;
            }
            Ok(())
        }),
        element!("[style]", |el| {
            if let Some(style) = el.get_attribute("style") {
                let (css, n) = rewrite_css(&style, &base, page_path, resolve);
                rewritten.set(rewritten.get() + n);
                el.set_attribute("style", &css)?;
            }
            Ok(())
        }),
    ];

    for (selector, attribute) in URL_ATTRIBUTES {
        handlers.push(element!(*selector, move |el| {
            rewrite_attribute(el, attribute)?;
            Ok(())
        }));
    }

    // Style blocks arrive in chunks; rewrite once the whole text is in
    handlers.push(text!("style", |t| {
        style_buffer.borrow_mut().push_str(t.as_str());
        if t.last_in_text_node() {
            let css = std::mem::take(&mut *style_buffer.borrow_mut());
            let (css, n) = rewrite_css(&css, &base, page_path, resolve);
            rewritten.set(rewritten.get() + n);
            t.replace(&css, ContentType::Html);
        } else {
            t.remove();
        }
        Ok(())
    }));

    let mut output = Vec::with_capacity(html.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter.write(html.as_bytes())
        .map_err(|e| anyhow!("HTML rewrite error: {}", e))?;
    rewriter.end()
        .map_err(|e| anyhow!("HTML rewrite finalization error: {}", e))?;

    let result = String::from_utf8(output).context("Invalid UTF-8 in rewritten HTML")?;
    Ok((result, rewritten.get()))
}
