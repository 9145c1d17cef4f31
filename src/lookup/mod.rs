// src/lookup/mod.rs
//
// Agentic lookup for missing UOM / pack quantity. Flow per query:
//   1) build normalised query (mpn > sku > cleaned description)
//   2) cache
//   3) online search (top 3, with a fixed pack/UOM hint)
//   4) fetch pages → evidence snippets
//   5) regex-first extraction from snippets
//   6) LLM only if regex is inconclusive and the per-document budget allows
// Every terminal outcome is cached, including negatives.

pub mod cache;

use crate::llm::{LlmBudget, LlmCallResult, LlmCallStatus, LlmClient, LlmEvidence};
use crate::uom::parse_uom_and_pack;
use async_trait::async_trait;
use cache::{LookupCache, LookupResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Appended to every search query.
const SEARCH_HINT: &str = "pack size UOM";
const MAX_SEARCH_RESULTS: usize = 3;
const MAX_SNIPPETS: usize = 5;
/// Queries shorter than this (after cleaning) are unusable.
const MIN_QUERY_LEN: usize = 5;
/// Descriptions are truncated to this many tokens.
const MAX_QUERY_TOKENS: usize = 10;

/// One piece of fetched page evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSnippet {
    pub url: String,
    pub snippet: String,
}

/// Returns top result URLs for a query. Failures are logged internally
/// and surface as an empty list.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Vec<String>;
}

/// Fetches page text and extracts snippets matching the pack/UOM
/// vocabulary, stopping once one page yields matches.
#[async_trait]
pub trait SnippetFetcher: Send + Sync {
    async fn fetch_snippets(&self, urls: &[String], max_snippets: usize) -> Vec<EvidenceSnippet>;
}

/// What one resolution produced, cache-backed or fresh.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub pack_qty: Option<u32>,
    pub uom: Option<String>,
    pub lookup_sources: Vec<EvidenceSnippet>,
    pub llm: LlmEvidence,
}

impl ResolveOutcome {
    fn empty(reason: &str) -> Self {
        Self {
            pack_qty: None,
            uom: None,
            lookup_sources: Vec::new(),
            llm: LlmCallResult::not_needed(reason).to_evidence(),
        }
    }

    /// True when the lookup produced usable pack or UOM evidence.
    pub fn matched(&self) -> bool {
        self.pack_qty.is_some() || self.uom.is_some()
    }
}

lazy_static! {
    static ref QUERY_CLEAN_RE: Regex = Regex::new(r"[^\w\s\-/]").unwrap();
}

/// Lookup resolver with caching and per-document LLM budget tracking.
/// Construct one per document run; the cache, limiter-backed LLM client,
/// and web collaborators are shared across documents.
pub struct LookupAgent {
    cache: Arc<LookupCache>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn SnippetFetcher>,
    llm: Arc<dyn LlmClient>,
    budget: LlmBudget,
}

impl LookupAgent {
    pub fn new(
        cache: Arc<LookupCache>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn SnippetFetcher>,
        llm: Arc<dyn LlmClient>,
        max_llm_calls: u32,
    ) -> Self {
        Self {
            cache,
            search,
            fetcher,
            llm,
            budget: LlmBudget::new(max_llm_calls),
        }
    }

    pub fn llm_budget_remaining(&self) -> u32 {
        self.budget.remaining()
    }

    /// Build a normalised search query. Precedence: mpn > sku > cleaned
    /// description. Returns `None` when no usable handle exists.
    pub fn build_query(description: &str, sku: Option<&str>, mpn: Option<&str>) -> Option<String> {
        if let Some(mpn) = mpn {
            let trimmed = mpn.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if let Some(sku) = sku {
            let trimmed = sku.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }

        let cleaned = QUERY_CLEAN_RE.replace_all(description, " ");
        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        let joined = tokens.join(" ");
        if joined.len() < MIN_QUERY_LEN {
            return None;
        }
        Some(tokens.into_iter().take(MAX_QUERY_TOKENS).collect::<Vec<_>>().join(" "))
    }

    /// Resolve UOM + pack quantity for one product. Side-effecting:
    /// network, cache, and the per-document LLM budget.
    pub async fn resolve(
        &self,
        description: &str,
        sku: Option<&str>,
        mpn: Option<&str>,
    ) -> ResolveOutcome {
        let Some(query) = Self::build_query(description, sku, mpn) else {
            return ResolveOutcome::empty("no usable query handle");
        };

        // 1) Cache.
        match self.cache.get(&query) {
            Ok(Some(cached)) => {
                info!(query = %query, "Lookup cache hit");
                return ResolveOutcome {
                    pack_qty: cached.pack_qty,
                    uom: cached.uom,
                    lookup_sources: cached.evidence_snippets,
                    llm: LlmCallResult::not_needed("cache hit").to_evidence(),
                };
            }
            Ok(None) => {}
            Err(e) => warn!(query = %query, error = %e, "Cache read failed, treating as miss"),
        }

        // 2) Online search.
        let urls = self
            .search
            .search(&format!("{query} {SEARCH_HINT}"), MAX_SEARCH_RESULTS)
            .await;
        if urls.is_empty() {
            self.cache_put(LookupResult {
                query: query.clone(),
                ..LookupResult::default()
            });
            return ResolveOutcome::empty("no search results");
        }

        // 3) Fetch pages and extract evidence snippets.
        let snippets = self.fetcher.fetch_snippets(&urls, MAX_SNIPPETS).await;
        if snippets.is_empty() {
            self.cache_put(LookupResult {
                query: query.clone(),
                source_urls: urls,
                ..LookupResult::default()
            });
            return ResolveOutcome::empty("no relevant snippets found");
        }
        let source_urls: Vec<String> = snippets.iter().map(|s| s.url.clone()).collect();

        // 4) Regex-first extraction: first snippet yielding both pack and
        // canonical UOM wins.
        let regex_hit = snippets.iter().find_map(|snippet| {
            let parsed = parse_uom_and_pack(&snippet.snippet);
            match (parsed.detected_pack_quantity, parsed.canonical_uom) {
                (Some(pack_qty), Some(uom)) => Some((pack_qty, uom)),
                _ => None,
            }
        });
        if let Some((pack_qty, uom)) = regex_hit {
            info!(query = %query, pack_qty, uom = %uom, "Resolved via snippet regex");
            self.cache_put(LookupResult {
                query: query.clone(),
                pack_qty: Some(pack_qty),
                uom: Some(uom.clone()),
                evidence_snippets: snippets.clone(),
                source_urls,
                llm_used: false,
                timestamp: 0.0,
            });
            return ResolveOutcome {
                pack_qty: Some(pack_qty),
                uom: Some(uom),
                lookup_sources: snippets,
                llm: LlmCallResult::not_needed("regex extraction successful").to_evidence(),
            };
        }

        // 5) LLM, if the per-document budget allows.
        if self.budget.remaining() == 0 {
            self.cache_put(LookupResult {
                query: query.clone(),
                evidence_snippets: snippets.clone(),
                source_urls,
                ..LookupResult::default()
            });
            return ResolveOutcome {
                pack_qty: None,
                uom: None,
                lookup_sources: snippets,
                llm: LlmCallResult::skipped_rate_limit("per-document LLM budget exhausted", 0)
                    .to_evidence(),
            };
        }

        let llm_result = self
            .llm
            .resolve_uom(description, mpn, &snippets, &self.budget)
            .await;

        let (pack_qty, uom) = match (&llm_result.status, &llm_result.data) {
            (LlmCallStatus::Success, Some(answer)) if answer.is_trustworthy() => {
                (answer.pack_quantity, answer.uom.clone())
            }
            _ => (None, None),
        };

        self.cache_put(LookupResult {
            query,
            pack_qty,
            uom: uom.clone(),
            evidence_snippets: snippets.clone(),
            source_urls,
            llm_used: true,
            timestamp: 0.0,
        });

        ResolveOutcome {
            pack_qty,
            uom,
            lookup_sources: snippets,
            llm: llm_result.to_evidence(),
        }
    }

    fn cache_put(&self, result: LookupResult) {
        if let Err(e) = self.cache.put(&result) {
            warn!(query = %result.query, error = %e, "Cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{DocExtraction, LlmConfidence, UomAnswer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSearch {
        urls: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(&self, _query: &str, _max_results: usize) -> Vec<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.clone()
        }
    }

    struct StubFetcher {
        snippets: Vec<EvidenceSnippet>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnippetFetcher for StubFetcher {
        async fn fetch_snippets(
            &self,
            _urls: &[String],
            _max_snippets: usize,
        ) -> Vec<EvidenceSnippet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.snippets.clone()
        }
    }

    struct StubLlm {
        answer: Option<UomAnswer>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn resolve_uom(
            &self,
            _description: &str,
            _mpn: Option<&str>,
            _snippets: &[EvidenceSnippet],
            budget: &LlmBudget,
        ) -> LlmCallResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            budget.try_consume();
            match &self.answer {
                Some(answer) => LlmCallResult {
                    status: LlmCallStatus::Success,
                    data: Some(answer.clone()),
                    reason: None,
                    attempts: 1,
                },
                None => LlmCallResult::failed_other("stub failure".to_string(), 1),
            }
        }

        async fn extract_document(&self, _raw_text: &str, _doc_name: &str) -> DocExtraction {
            DocExtraction::default()
        }
    }

    fn agent(
        search_urls: Vec<&str>,
        snippets: Vec<(&str, &str)>,
        answer: Option<UomAnswer>,
        max_llm_calls: u32,
    ) -> (LookupAgent, Arc<StubSearch>, Arc<StubFetcher>, Arc<StubLlm>) {
        let cache = Arc::new(LookupCache::in_memory().unwrap());
        let search = Arc::new(StubSearch {
            urls: search_urls.into_iter().map(String::from).collect(),
            calls: AtomicUsize::new(0),
        });
        let fetcher = Arc::new(StubFetcher {
            snippets: snippets
                .into_iter()
                .map(|(url, text)| EvidenceSnippet {
                    url: url.to_string(),
                    snippet: text.to_string(),
                })
                .collect(),
            calls: AtomicUsize::new(0),
        });
        let llm = Arc::new(StubLlm {
            answer,
            calls: AtomicUsize::new(0),
        });
        let agent = LookupAgent::new(
            cache,
            search.clone(),
            fetcher.clone(),
            llm.clone(),
            max_llm_calls,
        );
        (agent, search, fetcher, llm)
    }

    #[test]
    fn query_precedence_mpn_sku_description() {
        assert_eq!(
            LookupAgent::build_query("Nitrile Gloves", Some("SK-1"), Some("MFR-9")),
            Some("MFR-9".to_string())
        );
        assert_eq!(
            LookupAgent::build_query("Nitrile Gloves", Some("SK-1"), None),
            Some("SK-1".to_string())
        );
        assert_eq!(
            LookupAgent::build_query("Nitrile Gloves (Large)!", None, None),
            Some("Nitrile Gloves Large".to_string())
        );
    }

    #[test]
    fn short_description_has_no_handle() {
        assert_eq!(LookupAgent::build_query("abc", None, None), None);
        assert_eq!(LookupAgent::build_query("", None, Some("  ")), None);
    }

    #[test]
    fn long_descriptions_truncate_to_ten_tokens() {
        let desc = "one two three four five six seven eight nine ten eleven twelve";
        let query = LookupAgent::build_query(desc, None, None).unwrap();
        assert_eq!(query.split_whitespace().count(), 10);
    }

    #[tokio::test]
    async fn invalid_query_makes_no_external_calls() {
        let (agent, search, fetcher, llm) = agent(vec!["https://a"], vec![], None, 3);
        let outcome = agent.resolve("ab", None, None).await;
        assert!(!outcome.matched());
        assert_eq!(outcome.llm.llm_call_status, LlmCallStatus::NotNeeded);
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits() {
        let (agent, search, _, _) = agent(vec!["https://a"], vec![], None, 3);
        agent
            .cache
            .put(&LookupResult {
                query: "MFR-9".to_string(),
                pack_qty: Some(24),
                uom: Some("CS".to_string()),
                ..LookupResult::default()
            })
            .unwrap();

        let outcome = agent.resolve("whatever thing", None, Some("MFR-9")).await;
        assert_eq!(outcome.pack_qty, Some(24));
        assert_eq!(outcome.uom.as_deref(), Some("CS"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_search_results_caches_negative() {
        let (agent, search, _, _) = agent(vec![], vec![], None, 3);
        let outcome = agent.resolve("Nitrile Gloves Large", None, None).await;
        assert!(!outcome.matched());
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        // Negative row persisted: a second resolve is a cache hit.
        let outcome = agent.resolve("Nitrile Gloves Large", None, None).await;
        assert_eq!(outcome.llm.llm_call_reason.as_deref(), Some("cache hit"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn regex_first_resolution_avoids_llm() {
        let (agent, _, _, llm) = agent(
            vec!["https://shop.example"],
            vec![("https://shop.example", "Nitrile gloves, sold as 24/CS online")],
            None,
            3,
        );
        let outcome = agent.resolve("Nitrile Gloves Large", None, None).await;
        assert_eq!(outcome.pack_qty, Some(24));
        assert_eq!(outcome.uom.as_deref(), Some("CS"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            outcome.llm.llm_call_reason.as_deref(),
            Some("regex extraction successful")
        );

        let cached = agent.cache.get("nitrile gloves large").unwrap().unwrap();
        assert!(!cached.llm_used);
        assert_eq!(cached.pack_qty, Some(24));
    }

    #[tokio::test]
    async fn llm_resolves_when_regex_inconclusive() {
        let (agent, _, _, llm) = agent(
            vec!["https://shop.example"],
            // "bulk pack available" yields a UOM token but no quantity.
            vec![("https://shop.example", "bulk pack available, ships fast")],
            Some(UomAnswer {
                uom: Some("CS".to_string()),
                pack_quantity: Some(12),
                evidence_text: Some("case of 12".to_string()),
                confidence: LlmConfidence::High,
            }),
            3,
        );
        let outcome = agent.resolve("Mystery Widget Deluxe", None, None).await;
        assert_eq!(outcome.pack_qty, Some(12));
        assert_eq!(outcome.uom.as_deref(), Some("CS"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.llm.llm_call_used);

        let cached = agent.cache.get("Mystery Widget Deluxe").unwrap().unwrap();
        assert!(cached.llm_used);
    }

    #[tokio::test]
    async fn low_confidence_llm_answer_is_discarded() {
        let (agent, _, _, _) = agent(
            vec!["https://shop.example"],
            vec![("https://shop.example", "bulk pack available, ships fast")],
            Some(UomAnswer {
                uom: Some("CS".to_string()),
                pack_quantity: Some(12),
                evidence_text: None,
                confidence: LlmConfidence::Low,
            }),
            3,
        );
        let outcome = agent.resolve("Mystery Widget Deluxe", None, None).await;
        // The call succeeded, but the answer is not trusted.
        assert!(outcome.llm.llm_call_used);
        assert!(!outcome.matched());

        let cached = agent.cache.get("Mystery Widget Deluxe").unwrap().unwrap();
        assert!(cached.llm_used);
        assert!(cached.pack_qty.is_none());
    }

    #[tokio::test]
    async fn exhausted_budget_skips_llm() {
        let (agent, _, _, llm) = agent(
            vec!["https://shop.example"],
            vec![("https://shop.example", "bulk pack available, ships fast")],
            Some(UomAnswer {
                uom: Some("CS".to_string()),
                pack_quantity: Some(12),
                evidence_text: None,
                confidence: LlmConfidence::High,
            }),
            0,
        );
        let outcome = agent.resolve("Mystery Widget Deluxe", None, None).await;
        assert!(!outcome.matched());
        assert_eq!(outcome.llm.llm_call_status, LlmCallStatus::SkippedRateLimit);
        assert_eq!(
            outcome.llm.llm_call_reason.as_deref(),
            Some("per-document LLM budget exhausted")
        );
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        // Snippets still cached for a later run with budget.
        let cached = agent.cache.get("Mystery Widget Deluxe").unwrap().unwrap();
        assert_eq!(cached.evidence_snippets.len(), 1);
    }
}
