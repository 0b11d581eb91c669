//! Quiz page fetching and question extraction
//!
//! Pages are static HTML (or raw JSON). Text is recovered by dropping
//! scripts and styles, stripping tags and collapsing whitespace; links and
//! images are resolved against the page URL.

use std::sync::LazyLock;
use std::time::Duration;

use provider::BoxFuture;
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use tracing::{info, instrument};

use crate::error::{Error, Result};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Extensions treated as downloadable data files.
const FILE_EXTENSIONS: &[&str] = &[
    ".json", ".csv", ".pdf", ".png", ".jpg", ".jpeg", ".gif", ".mp3", ".wav", ".opus", ".ogg",
    ".zip", ".txt", ".xml", ".xlsx",
];

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|noscript)\b.*?</(script|style|noscript)\s*>").expect("script regex is valid"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex is valid"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("href regex is valid")
});
static IMG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["'][^>]*>"#).expect("img regex is valid")
});
static TEXT_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>"'\]]+"#).expect("url regex is valid"));
static SUBMIT_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)POST\s+(?:to\s+)?[`"']?(https?://[^\s`"']+)"#,
        r#"(?i)submit\s+(?:to\s+)?[`"']?(https?://[^\s`"']+)"#,
        r#"(?i)url\s*[=:]\s*[`"']?(https?://[^\s`"']+)"#,
        r#"(?i)endpoint[:\s]+[`"']?(https?://[^\s`"']+)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("submit regex is valid"))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuizPage {
    pub url: String,
    pub text: String,
    pub submit_url: String,
    pub file_links: Vec<String>,
    pub image_urls: Vec<String>,
}

pub trait PageFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<QuizPage>>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPageFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    #[instrument(skip(self))]
    async fn fetch_page(&self, url: &str) -> Result<QuizPage> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::PageFetch(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::PageFetch(format!("{url}: HTTP {}", status.as_u16())));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let body = response
            .text()
            .await
            .map_err(|e| Error::PageFetch(format!("{url}: {e}")))?;

        let page = if is_json {
            parse_json_page(url, &body)
        } else {
            parse_html_page(url, &body)
        };
        info!(
            text_len = page.text.len(),
            submit_url = %page.submit_url,
            file_links = page.file_links.len(),
            images = page.image_urls.len(),
            "quiz page parsed"
        );
        Ok(page)
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<QuizPage>> {
        Box::pin(self.fetch_page(url))
    }
}

/// Build a `QuizPage` from an HTML document.
pub fn parse_html_page(url: &str, html: &str) -> QuizPage {
    let text = html_to_text(html);
    let links = extract_links(html, url);
    let image_urls = extract_images(html, url);
    QuizPage {
        url: url.to_string(),
        submit_url: extract_submit_url(&text, &links, url),
        file_links: extract_file_links(&text, &links),
        text,
        image_urls,
    }
}

/// JSON pages are presented to the model as pretty-printed text.
fn parse_json_page(url: &str, body: &str) -> QuizPage {
    let text = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| body.to_string());
    QuizPage {
        url: url.to_string(),
        submit_url: extract_submit_url(&text, &[], url),
        file_links: extract_file_links(&text, &[]),
        text,
        image_urls: Vec::new(),
    }
}

pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, " ");
    let text = TAG_RE.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

fn resolve(base: &str, href: &str) -> Option<String> {
    Url::parse(base).ok()?.join(href).ok().map(String::from)
}

/// Absolute `href` targets, skipping anchors, `javascript:` and `mailto:`.
pub fn extract_links(html: &str, base: &str) -> Vec<String> {
    HREF_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|href| {
            !href.starts_with('#') && !href.starts_with("javascript:") && !href.starts_with("mailto:")
        })
        .filter_map(|href| resolve(base, href))
        .collect()
}

/// Absolute `<img src>` targets, skipping inline `data:` images.
pub fn extract_images(html: &str, base: &str) -> Vec<String> {
    IMG_RE
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|src| !src.starts_with("data:"))
        .filter_map(|src| resolve(base, src))
        .collect()
}

/// Where answers for this page are posted.
///
/// Explicit instructions in the text win, then links mentioning submit or
/// answer, then `{origin}/submit`.
pub fn extract_submit_url(text: &str, links: &[String], page_url: &str) -> String {
    for re in SUBMIT_RES.iter() {
        if let Some(m) = re.captures(text).and_then(|c| c.get(1)) {
            return m
                .as_str()
                .trim_end_matches(['`', '"', '\'', '.', ',', ';'])
                .to_string();
        }
    }

    if let Some(link) = links.iter().find(|l| {
        let lower = l.to_lowercase();
        lower.contains("submit") || lower.contains("answer")
    }) {
        return link.clone();
    }

    match Url::parse(page_url) {
        Ok(url) => format!("{}/submit", url.origin().ascii_serialization()),
        Err(_) => format!("{}/submit", page_url.trim_end_matches('/')),
    }
}

/// Data file URLs from links and in-text URLs, first-seen order, no duplicates.
pub fn extract_file_links(text: &str, links: &[String]) -> Vec<String> {
    let from_text = TEXT_URL_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', ')', ']']));

    let mut found: Vec<String> = Vec::new();
    for candidate in links.iter().map(String::as_str).chain(from_text) {
        let lower = candidate.to_lowercase();
        if FILE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
            && !found.iter().any(|f| f == candidate)
        {
            found.push(candidate.to_string());
        }
    }
    found
}
