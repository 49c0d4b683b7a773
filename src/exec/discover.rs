// src/exec/discover.rs

//! Media discovery for bulk scrapes.
//!
//! Starting from one page, collect the media it references: `img`
//! (`src`, `data-src`, `data-lazy`, `srcset`), `source`, `video` (including
//! `poster`), `audio`, `iframe`, and `url(...)` inside inline `style`
//! attributes. With link following on, same-host `<a href>` targets are
//! visited breadth-first up to the requested depth and page budget.
//!
//! Markup is scanned with regexes rather than parsed into a tree; attribute
//! values are all that is needed.

use std::collections::{HashSet, VecDeque};

use futures::StreamExt;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::Timestamp;

/// Pages larger than this are scanned only up to the limit.
const MAX_PAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    /// `<source>`, which may sit under `<picture>`, `<video>` or `<audio>`.
    Mixed,
    Iframe,
    StyleBackground,
}

/// Attributes that name media, per tag.
const MEDIA_ATTRS: &[(&str, &str, MediaKind)] = &[
    ("img", "src", MediaKind::Image),
    ("img", "data-src", MediaKind::Image),
    ("img", "data-lazy", MediaKind::Image),
    ("source", "src", MediaKind::Mixed),
    ("video", "src", MediaKind::Video),
    ("video", "poster", MediaKind::Image),
    ("audio", "src", MediaKind::Audio),
    ("iframe", "src", MediaKind::Iframe),
];

/// One media reference found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub url: String,
    pub kind: MediaKind,
    /// Where on the page it was found, e.g. `<img src>`.
    pub context: String,
    pub source_page: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFailure {
    pub url: String,
    pub error: String,
}

/// Result of a discovery run; stored as the scrape's `manifest.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub start_url: String,
    pub collected_at: Timestamp,
    pub pages_visited: Vec<String>,
    pub pages_failed: Vec<PageFailure>,
    pub total_media: usize,
    pub media: Vec<MediaItem>,
}

/// How far a discovery run may go.
#[derive(Debug, Clone, Copy)]
pub struct CrawlLimits {
    pub depth: u32,
    pub follow_links: bool,
    pub max_pages: usize,
}

/// What happened to one visited page.
#[derive(Debug)]
pub enum PageEvent<'a> {
    Scanned { url: &'a Url, media: usize },
    Failed { url: &'a Url, error: &'a str },
}

/// Visit `start` (and, if asked, same-host pages it links to) and collect
/// the media they reference. Each media URL is reported once, for the
/// first page it was seen on.
pub async fn discover<F>(
    client: &Client,
    scanner: &PageScanner,
    start: &Url,
    limits: CrawlLimits,
    mut on_page: F,
) -> Manifest
where
    F: FnMut(PageEvent<'_>),
{
    let mut queue: VecDeque<(Url, u32)> = VecDeque::from([(start.clone(), 0)]);
    let mut visited: HashSet<Url> = HashSet::new();
    let mut seen_media: HashSet<String> = HashSet::new();
    let mut manifest = Manifest {
        start_url: start.to_string(),
        collected_at: chrono::Utc::now(),
        pages_visited: Vec::new(),
        pages_failed: Vec::new(),
        total_media: 0,
        media: Vec::new(),
    };

    while let Some((url, hops)) = queue.pop_front() {
        if visited.len() >= limits.max_pages {
            debug!(max_pages = limits.max_pages, queued = queue.len() + 1, "page budget spent");
            break;
        }
        if !visited.insert(url.clone()) {
            continue;
        }

        let html = match fetch_page(client, &url).await {
            Ok(html) => html,
            Err(error) => {
                warn!(%url, %error, "failed to read page");
                on_page(PageEvent::Failed { url: &url, error: &error });
                manifest.pages_failed.push(PageFailure {
                    url: url.to_string(),
                    error,
                });
                continue;
            }
        };

        let found: Vec<MediaItem> = scanner
            .media(&html, &url)
            .into_iter()
            .filter(|item| seen_media.insert(item.url.clone()))
            .collect();
        info!(%url, media = found.len(), "scanned page");
        on_page(PageEvent::Scanned { url: &url, media: found.len() });
        manifest.media.extend(found);
        manifest.pages_visited.push(url.to_string());

        if limits.follow_links && hops < limits.depth {
            for link in scanner.links(&html, &url) {
                if same_site(&link, start) && !visited.contains(&link) {
                    queue.push_back((link, hops + 1));
                }
            }
        }
    }

    manifest.total_media = manifest.media.len();
    manifest
}

async fn fetch_page(client: &Client, url: &Url) -> Result<String, String> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| match e.status() {
            Some(status) => format!("server answered {status}"),
            None => e.to_string(),
        })?;

    let mut body: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("reading page: {e}"))?;
        let room = MAX_PAGE_BYTES - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            debug!(%url, limit = MAX_PAGE_BYTES, "page truncated");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Compiled patterns for pulling tags and attribute values out of markup.
#[derive(Debug, Clone)]
pub struct PageScanner {
    strip: Regex,
    tag: Regex,
    attr: Regex,
    style_url: Regex,
}

impl PageScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            strip: Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>")?,
            tag: Regex::new(r"(?s)<([A-Za-z][A-Za-z0-9-]*)\b([^>]*)>")?,
            attr: Regex::new(
                r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#,
            )?,
            style_url: Regex::new(r#"(?i)url\(\s*['"]?([^'")]+?)['"]?\s*\)"#)?,
        })
    }

    /// Media referenced by one page, first occurrence of each URL only.
    pub fn media(&self, html: &str, page: &Url) -> Vec<MediaItem> {
        let mut media = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut register = |raw: &str, kind: MediaKind, context: String| {
            if let Some(url) = normalize(page, raw) {
                let url = url.to_string();
                if seen.insert(url.clone()) {
                    media.push(MediaItem {
                        url,
                        kind,
                        context,
                        source_page: page.to_string(),
                    });
                }
            }
        };

        for (tag, attrs) in self.tags(html) {
            for (name, value) in &attrs {
                if let Some((_, _, kind)) = MEDIA_ATTRS
                    .iter()
                    .find(|(t, a, _)| *t == tag.as_str() && *a == name.as_str())
                {
                    register(value, *kind, format!("<{tag} {name}>"));
                }
            }

            if matches!(tag.as_str(), "img" | "source") {
                let kind = if tag == "img" { MediaKind::Image } else { MediaKind::Mixed };
                if let Some(srcset) = attr(&attrs, "srcset") {
                    for candidate in srcset.split(',') {
                        if let Some(src) = candidate.split_whitespace().next() {
                            register(src, kind, format!("<{tag} srcset>"));
                        }
                    }
                }
            }

            if let Some(style) = attr(&attrs, "style") {
                for cap in self.style_url.captures_iter(style) {
                    register(&cap[1], MediaKind::StyleBackground, format!("<{tag} style>"));
                }
            }
        }
        media
    }

    /// Absolute targets of `<a href>` on a page, minus `mailto:` and
    /// `javascript:` links.
    pub fn links(&self, html: &str, page: &Url) -> Vec<Url> {
        self.tags(html)
            .into_iter()
            .filter(|(tag, _)| tag == "a")
            .filter_map(|(_, attrs)| attr(&attrs, "href").map(str::to_string))
            .filter(|href| {
                let lower = href.trim().to_ascii_lowercase();
                !lower.starts_with("mailto:") && !lower.starts_with("javascript:")
            })
            .filter_map(|href| normalize(page, &href))
            .collect()
    }

    /// Lower-cased tag names with their decoded attributes, in document
    /// order. Comments and scripts are skipped.
    fn tags(&self, html: &str) -> Vec<(String, Vec<(String, String)>)> {
        let html = self.strip.replace_all(html, "");
        self.tag
            .captures_iter(&html)
            .map(|cap| {
                let attrs = self
                    .attr
                    .captures_iter(&cap[2])
                    .map(|a| {
                        let value = a
                            .get(2)
                            .or_else(|| a.get(3))
                            .or_else(|| a.get(4))
                            .map_or("", |m| m.as_str());
                        (a[1].to_ascii_lowercase(), decode_entities(value))
                    })
                    .collect();
                (cap[1].to_ascii_lowercase(), attrs)
            })
            .collect()
    }
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Resolve `link` against `page`, dropping the fragment. Only absolute
/// http(s) URLs with a host survive.
fn normalize(page: &Url, link: &str) -> Option<Url> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }
    let mut url = page.join(link).ok()?;
    url.set_fragment(None);
    let has_host = url.host_str().is_some_and(|h| !h.is_empty());
    (has_host && matches!(url.scheme(), "http" | "https")).then_some(url)
}

fn same_site(link: &Url, start: &Url) -> bool {
    link.host_str() == start.host_str() && link.port_or_known_default() == start.port_or_known_default()
}
