//! Page content extraction.
//!
//! Picks the most likely content container of a parsed page, copies it without
//! navigation, advertising and other page furniture, and flattens the copy into
//! a bounded block of text that can be handed to the model as context. The
//! parsed document is only ever read.

use chrono::{SecondsFormat, Utc};
use lazy_static::lazy_static;
use reqwest::Client;
use scraper::{ElementRef, Html, Node, Selector};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// User-Agent string used when fetching pages
const USER_AGENT: &str = concat!(
    "callosum/",
    env!("CARGO_PKG_VERSION"),
    " (https://github.com/cladam/callosum)"
);

/// Default timeout for page fetches
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Character cap used by [`page_text`].
pub const RAW_MAX_CHARS: usize = 20_000;

/// Suffix appended to content cut at the character budget.
pub const TRUNCATION_MARKER: &str = "... [content truncated]";

/// Content containers, highest priority first. `body` is the fallback.
const CANDIDATE_SELECTORS: &[&str] = &[
    "main",
    "article",
    ".main-content",
    ".article",
    ".post",
    "#content",
    "#main",
];

const NOISE_TAGS: &[&str] = &[
    "script", "style", "noscript", "link", "meta", "svg", "img", "picture", "iframe", "video",
    "audio", "canvas", "figure", "nav", "header", "footer", "aside", "form", "button", "input",
    "select", "textarea", "label",
];

const NOISE_ROLES: &[&str] = &[
    "navigation",
    "banner",
    "contentinfo",
    "complementary",
    "dialog",
    "alertdialog",
];

/// Class names that mark an element as page furniture when matched exactly.
const NOISE_CLASSES: &[&str] = &[
    "ad",
    "advertisement",
    "ads",
    "ad-container",
    "ad-wrapper",
    "sidebar",
    "related-posts",
    "related-articles",
    "related-content",
    "comments",
    "comment-section",
    "social-share",
    "sharing",
    "newsletter",
    "newsletter-signup",
    "newsletter-form",
    "modal",
    "popup",
    "lightbox",
    "cookie-banner",
    "cookie-consent",
    "privacy-banner",
    "gdpr-banner",
    "cc_banner",
    "cc-window",
    "notification",
    "alert",
    "banner",
    "promo",
    "promotion",
    "recommendations",
    "trending",
    "popular",
    "most-read",
    "pagination",
    "pager",
    "page-nav",
    "pagination-container",
    "breadcrumbs",
    "breadcrumb",
    "navigation",
    "nav-links",
    "menu",
    "main-menu",
    "submenu",
    "footer-menu",
    "hidden",
    "sr-only",
    "visually-hidden",
    "d-none",
    "is-hidden",
];

/// Substrings of the class attribute (lowercased) that mark noise.
const NOISE_CLASS_FRAGMENTS: &[&str] = &[
    "ad-",
    "banner",
    "popup",
    "modal",
    "cookie",
    "gdpr",
    "privacy",
    "consent",
    "newsletter",
    "promo",
];

lazy_static! {
    static ref CANDIDATES: Vec<Selector> = CANDIDATE_SELECTORS
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect();
    static ref BODY: Selector = Selector::parse("body").unwrap();
    static ref TITLE: Selector = Selector::parse("title").unwrap();
    static ref META_DESCRIPTION: Selector = Selector::parse(r#"meta[name="description"]"#).unwrap();
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to fetch URL: {0}")]
    FetchError(#[from] reqwest::Error),
}

/// Everything gathered from a page for one request. Built fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedContext {
    pub title: String,
    pub url: String,
    /// Meta description, empty when the page has none
    pub description: String,
    /// Cleaned main content, possibly truncated
    pub content: String,
    /// Text the user selected, trimmed
    pub selection: String,
    /// Extraction time, ISO-8601 in UTC
    pub timestamp: String,
}

/// Owned copy of a cleaned subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum CleanNode {
    Element {
        name: String,
        attrs: Vec<(String, String)>,
        children: Vec<CleanNode>,
    },
    Text(String),
}

impl CleanNode {
    /// Concatenated text of all descendant text nodes, unnormalized.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            CleanNode::Text(text) => out.push_str(text),
            CleanNode::Element { children, .. } => {
                for child in children {
                    child.collect_text(out);
                }
            }
        }
    }
}

/// Build the full context for a page.
///
/// `selection` is whatever text the user has highlighted, if any.
pub fn extract_page_context(
    document: &Html,
    url: &str,
    selection: Option<&str>,
    max_chars: usize,
) -> ExtractedContext {
    ExtractedContext {
        title: page_title(document),
        url: url.to_string(),
        description: meta_description(document),
        content: extract_main_content(document, max_chars),
        selection: selection.map(str::trim).unwrap_or_default().to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Cleaned, normalized and truncated text of the main content container.
/// Returns an empty string when the document has no candidate at all.
pub fn extract_main_content(document: &Html, max_chars: usize) -> String {
    let Some(element) = main_content_element(document) else {
        return String::new();
    };

    let cleaned = clean_copy(element);
    let text = normalize_whitespace(&cleaned.text());
    debug!(
        element = element.value().name(),
        chars = text.chars().count(),
        "extracted main content"
    );
    truncate(&text, max_chars)
}

/// Main content with the larger raw cap.
pub fn page_text(document: &Html) -> String {
    extract_main_content(document, RAW_MAX_CHARS)
}

/// First element matching the candidate selectors in priority order, falling
/// back to `body`.
pub fn main_content_element(document: &Html) -> Option<ElementRef<'_>> {
    CANDIDATES
        .iter()
        .chain(std::iter::once(&*BODY))
        .find_map(|selector| document.select(selector).next())
}

/// Copy `element` and its descendants, leaving out noise elements and
/// stripping inline styles and event-handler attributes. The root is always
/// kept.
pub fn clean_copy(element: ElementRef<'_>) -> CleanNode {
    let mut children = Vec::new();
    for child in element.children() {
        match child.value() {
            Node::Text(text) => children.push(CleanNode::Text(String::from(&**text))),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    if !is_noise(child_element) {
                        children.push(clean_copy(child_element));
                    }
                }
            }
            _ => {}
        }
    }

    let attrs = element
        .value()
        .attrs()
        .filter(|(name, _)| !is_stripped_attr(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    CleanNode::Element {
        name: element.value().name().to_string(),
        attrs,
        children,
    }
}

fn is_stripped_attr(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "style" || name.starts_with("on")
}

fn is_noise(element: ElementRef<'_>) -> bool {
    let value = element.value();

    if NOISE_TAGS.contains(&value.name()) {
        return true;
    }

    if let Some(role) = value.attr("role") {
        let role = role.to_ascii_lowercase();
        if role
            .split_whitespace()
            .any(|role| NOISE_ROLES.contains(&role))
        {
            return true;
        }
    }

    let Some(class) = value.attr("class") else {
        return false;
    };
    let class = class.to_lowercase();
    class
        .split_whitespace()
        .any(|name| NOISE_CLASSES.contains(&name))
        || NOISE_CLASS_FRAGMENTS
            .iter()
            .any(|fragment| class.contains(fragment))
}

/// Collapse every whitespace run (newlines included) to one space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to `max_chars` characters and append [`TRUNCATION_MARKER`].
///
/// The cut counts characters, not words, so it may land mid-word. That keeps
/// the result deterministic for a given input and budget.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Document title, trimmed. Empty when absent.
pub fn page_title(document: &Html) -> String {
    document
        .select(&TITLE)
        .next()
        .map(element_text)
        .unwrap_or_default()
}

/// Content of `<meta name="description">`, empty when absent.
pub fn meta_description(document: &Html) -> String {
    document
        .select(&META_DESCRIPTION)
        .next()
        .and_then(|element| element.value().attr("content"))
        .map(|content| content.trim().to_string())
        .unwrap_or_default()
}

/// Whitespace-normalized text of an element, without any cleaning.
pub fn element_text(element: ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<String>())
}

/// Create a configured HTTP client for page fetches
fn create_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Fetch the raw HTML of a page.
pub async fn fetch_html(url: &str) -> Result<String, ExtractError> {
    let client = create_client()?;
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.text().await?)
}
