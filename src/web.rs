// src/web.rs
//
// Default web collaborators for the lookup resolver: DuckDuckGo-HTML
// search and page fetch with pack/UOM snippet extraction. All failures
// are logged and surface as empty results; the resolver treats those as
// negative outcomes.

use crate::lookup::{EvidenceSnippet, SearchProvider, SnippetFetcher};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};
use urlencoding::encode;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_TIMEOUT: Duration = Duration::from_secs(8);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; InvoiceEnrich/0.1; +internal-use-only)";
/// Context window around a pattern match, in bytes (clamped to chars).
const SNIPPET_BEFORE: usize = 100;
const SNIPPET_AFTER: usize = 150;
/// Matches taken per page.
const MATCHES_PER_PAGE: usize = 3;

lazy_static! {
    static ref RESULT_LINK_RE: Regex =
        Regex::new(r#"(?is)<a[^>]*class="[^"]*result__a[^"]*"[^>]*href="([^"]+)""#).unwrap();
    static ref SCRIPT_RE: Regex = Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap();
    static ref STYLE_RE: Regex = Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap();
    static ref NAV_RE: Regex = Regex::new(r"(?is)<nav[^>]*>.*?</nav>").unwrap();
    static ref FOOTER_RE: Regex = Regex::new(r"(?is)<footer[^>]*>.*?</footer>").unwrap();
    static ref HEADER_RE: Regex = Regex::new(r"(?is)<header[^>]*>.*?</header>").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref WS_RE: Regex = Regex::new(r"\s+").unwrap();
    // Fixed pack/UOM vocabulary for evidence snippets.
    static ref PACK_SNIPPET_RE: Regex = Regex::new(
        r"(?i)(?:\d+\s*/\s*(?:CS|CASE|BX|BOX|PK|PACK|PKG|EA|EACH|UNIT|ROLL|BAG|CT|DZ))|(?:(?:PK|PACK|PKG)\s*\d+)|(?:(?:CASE|BOX|PACK|PACKAGE|PKG)\s+OF\s+\d+)|(?:\d+\s+PER\s+(?:PACK|CASE|BOX|PACKAGE|PKG|ROLL|BAG))|(?:\d+\s+(?:EA|EACH|UNIT|PC|PCS))",
    )
    .unwrap();
}

pub struct HttpWebClient {
    client: Client,
}

impl HttpWebClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpWebClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull result hrefs out of a DuckDuckGo HTML page.
fn parse_result_links(html: &str, max_results: usize) -> Vec<String> {
    RESULT_LINK_RE
        .captures_iter(html)
        .map(|caps| caps[1].to_string())
        .filter(|href| href.starts_with("http"))
        .take(max_results)
        .collect()
}

/// Reduce an HTML page to visible text.
fn strip_tags(html: &str) -> String {
    let mut text = SCRIPT_RE.replace_all(html, " ").to_string();
    text = STYLE_RE.replace_all(&text, " ").to_string();
    text = NAV_RE.replace_all(&text, " ").to_string();
    text = FOOTER_RE.replace_all(&text, " ").to_string();
    text = HEADER_RE.replace_all(&text, " ").to_string();
    text = TAG_RE.replace_all(&text, " ").to_string();
    WS_RE.replace_all(&text, " ").trim().to_string()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Find pack/UOM pattern matches in page text and cut context windows
/// around the first few.
fn scan_snippets(url: &str, text: &str, max_matches: usize) -> Vec<EvidenceSnippet> {
    let mut snippets = Vec::new();
    for m in PACK_SNIPPET_RE.find_iter(text).take(max_matches) {
        let start = floor_char_boundary(text, m.start().saturating_sub(SNIPPET_BEFORE));
        let end = ceil_char_boundary(text, m.end() + SNIPPET_AFTER);
        snippets.push(EvidenceSnippet {
            url: url.to_string(),
            snippet: text[start..end].trim().to_string(),
        });
    }
    snippets
}

#[async_trait]
impl SearchProvider for HttpWebClient {
    async fn search(&self, query: &str, max_results: usize) -> Vec<String> {
        let url = format!("https://html.duckduckgo.com/html/?q={}", encode(query));
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "text/html")
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await;

        let html = match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Search response body unreadable");
                    return Vec::new();
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "Search returned non-OK status");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Search request failed");
                return Vec::new();
            }
        };

        parse_result_links(&html, max_results)
    }
}

#[async_trait]
impl SnippetFetcher for HttpWebClient {
    async fn fetch_snippets(&self, urls: &[String], max_snippets: usize) -> Vec<EvidenceSnippet> {
        let mut snippets: Vec<EvidenceSnippet> = Vec::new();

        for url in urls {
            let response = self
                .client
                .get(url)
                .header("User-Agent", USER_AGENT)
                .header("Accept", "text/html")
                .timeout(FETCH_TIMEOUT)
                .send()
                .await;

            let html = match response {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(url = %url, error = %e, "Fetch body unreadable");
                        continue;
                    }
                },
                Ok(resp) => {
                    debug!(url = %url, status = %resp.status(), "Fetch returned non-OK status");
                    continue;
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Fetch failed");
                    continue;
                }
            };

            let text = strip_tags(&html);
            let found = scan_snippets(url, &text, MATCHES_PER_PAGE);
            if !found.is_empty() {
                snippets.extend(found);
                // One page with matches is enough.
                break;
            }
        }

        snippets.truncate(max_snippets);
        snippets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_links_extracted_and_filtered() {
        let html = r#"
            <a class="result__a" href="https://supplier.example/product">A</a>
            <a class="result__a" href="//relative.example/x">B</a>
            <a class="other" href="https://ignored.example">C</a>
            <a class="result__a" href="https://second.example/y">D</a>
        "#;
        let links = parse_result_links(html, 3);
        assert_eq!(
            links,
            vec![
                "https://supplier.example/product".to_string(),
                "https://second.example/y".to_string(),
            ]
        );
    }

    #[test]
    fn max_results_respected() {
        let html = r#"
            <a class="result__a" href="https://a.example">1</a>
            <a class="result__a" href="https://b.example">2</a>
            <a class="result__a" href="https://c.example">3</a>
            <a class="result__a" href="https://d.example">4</a>
        "#;
        assert_eq!(parse_result_links(html, 3).len(), 3);
    }

    #[test]
    fn strip_tags_drops_scripts_and_chrome() {
        let html = r#"<html><head><style>.x{color:red}</style>
            <script>alert("hi")</script></head>
            <body><nav>menu</nav><p>Sold as   24/CS</p><footer>foot</footer></body></html>"#;
        let text = strip_tags(html);
        assert!(text.contains("Sold as 24/CS"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("menu"));
        assert!(!text.contains("foot"));
    }

    #[test]
    fn snippet_windows_cut_around_matches() {
        let text = format!(
            "{} packaging info: case of 12 per carton {}",
            "x".repeat(300),
            "y".repeat(300)
        );
        let snippets = scan_snippets("https://a.example", &text, 3);
        assert!(!snippets.is_empty());
        assert!(snippets[0].snippet.contains("case of 12"));
        assert!(snippets[0].snippet.len() < 300);
    }

    #[test]
    fn no_match_means_no_snippets() {
        let snippets = scan_snippets("https://a.example", "nothing relevant here", 3);
        assert!(snippets.is_empty());
    }

    #[test]
    fn snippet_vocabulary_covers_pack_forms() {
        for text in [
            "25/CS",
            "PACK 10",
            "CASE OF 12",
            "6 PER PACK",
            "100 EA",
        ] {
            assert!(
                PACK_SNIPPET_RE.is_match(text),
                "{text:?} should match the snippet vocabulary"
            );
        }
    }
}
