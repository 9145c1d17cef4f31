// src/llm.rs
//
// LLM collaborator: structured UOM/pack resolution over evidence
// snippets, plus the document-level extraction fallback. Every outcome
// is a tagged `LlmCallResult` so callers handle all states explicitly.
// All network attempts go through the shared rate limiter.

use crate::config::{LimitsSection, LlmSection};
use crate::line_items::RawLineItem;
use crate::lookup::EvidenceSnippet;
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const RESOLVE_SYSTEM_PROMPT: &str = r#"You are a product-data extraction assistant.
You are given a product description and snippet(s) from product/supplier pages.
Extract the unit-of-measure (UOM) and pack quantity ONLY if they are explicitly
stated in the snippets. Do NOT guess. If the evidence is ambiguous or
conflicting, set confidence to "none" and return nulls.

Respond with ONLY this JSON (no markdown, no extra text):
{"uom": <string or null>, "pack_quantity": <integer or null>,
 "evidence_text": <exact quote from snippet or null>,
 "confidence": "high"|"medium"|"low"|"none"}"#;

const EXTRACT_SYSTEM_PROMPT: &str = r#"You are an invoice data extraction assistant.
Given raw text extracted from an invoice (possibly garbled OCR output, HTML
tables, or Markdown), extract the supplier and line items and return ONLY valid
JSON matching this schema exactly:

{
  "supplier_name": "Full legal company name of the supplier/vendor (not the buyer), or empty string",
  "line_items": [
    {
      "description": "string (merge multi-line descriptions into one)",
      "mpn": "string or null",
      "sku": "string or null",
      "quantity": number or null,
      "uom_raw": "unit of measure exactly as written (e.g. CS, EA, BX, RL, PK) or null",
      "unit_price": number or null,
      "amount": number or null
    }
  ]
}

Rules:
- Extract ONLY actual product line items. STRICTLY IGNORE subtotals, tax,
  freight, shipping, discounts, and page footers.
- If a description continues on a line without a price/qty, merge it into the
  previous item's description.
- Use null for fields you cannot determine.
- Return ONLY the JSON object, no markdown fences, no commentary."#;

/// Cap on text sent for document extraction, to stay inside context limits.
const MAX_EXTRACT_CHARS: usize = 12_000;
/// Snippets included in a resolve prompt.
const MAX_PROMPT_SNIPPETS: usize = 3;
/// Per-snippet character cap in the prompt.
const MAX_SNIPPET_CHARS: usize = 500;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmCallStatus {
    Success,
    SkippedRateLimit,
    #[serde(rename = "failed_429")]
    Failed429,
    FailedOther,
    NotNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmConfidence {
    High,
    Medium,
    Low,
    None,
}

fn default_confidence() -> LlmConfidence {
    LlmConfidence::None
}

/// Structured answer for a UOM/pack resolution call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UomAnswer {
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub pack_quantity: Option<u32>,
    #[serde(default)]
    pub evidence_text: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: LlmConfidence,
}

impl UomAnswer {
    /// Low/none self-reported confidence is treated as unresolved.
    pub fn is_trustworthy(&self) -> bool {
        matches!(self.confidence, LlmConfidence::High | LlmConfidence::Medium)
    }
}

/// Outcome of one LLM resolution attempt chain. The status alone
/// determines whether `data` may be used.
#[derive(Debug, Clone, Serialize)]
pub struct LlmCallResult {
    pub status: LlmCallStatus,
    pub data: Option<UomAnswer>,
    pub reason: Option<String>,
    pub attempts: u32,
}

impl LlmCallResult {
    pub fn not_needed(reason: &str) -> Self {
        Self {
            status: LlmCallStatus::NotNeeded,
            data: None,
            reason: Some(reason.to_string()),
            attempts: 0,
        }
    }

    pub fn skipped_rate_limit(reason: &str, attempts: u32) -> Self {
        Self {
            status: LlmCallStatus::SkippedRateLimit,
            data: None,
            reason: Some(reason.to_string()),
            attempts,
        }
    }

    pub fn failed_other(reason: String, attempts: u32) -> Self {
        Self {
            status: LlmCallStatus::FailedOther,
            data: None,
            reason: Some(reason),
            attempts,
        }
    }

    pub fn to_evidence(&self) -> LlmEvidence {
        LlmEvidence {
            llm_call_used: self.status == LlmCallStatus::Success,
            llm_call_reason: self.reason.clone(),
            llm_call_status: self.status,
            llm_call_attempts: self.attempts,
        }
    }
}

/// LLM call metadata recorded on each enriched item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmEvidence {
    pub llm_call_used: bool,
    pub llm_call_reason: Option<String>,
    pub llm_call_status: LlmCallStatus,
    pub llm_call_attempts: u32,
}

impl Default for LlmEvidence {
    fn default() -> Self {
        Self {
            llm_call_used: false,
            llm_call_reason: None,
            llm_call_status: LlmCallStatus::NotNeeded,
            llm_call_attempts: 0,
        }
    }
}

/// Document-level fallback extraction result. The LLM only returns the
/// supplier and items; `used` is set by the caller side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocExtraction {
    #[serde(default)]
    pub supplier_name: String,
    #[serde(default)]
    pub line_items: Vec<RawLineItem>,
    #[serde(default)]
    pub used: bool,
}

// ---------------------------------------------------------------------------
// Per-document call budget
// ---------------------------------------------------------------------------

/// LLM call budget for one document run. Every attempt that acquires a
/// rate-limiter token consumes one unit.
pub struct LlmBudget {
    max: u32,
    used: AtomicU32,
}

impl LlmBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            used: AtomicU32::new(0),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used.load(Ordering::SeqCst))
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn try_consume(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| {
                if u < self.max { Some(u + 1) } else { None }
            })
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Collaborator trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Resolve UOM/pack from evidence snippets for one product.
    async fn resolve_uom(
        &self,
        description: &str,
        mpn: Option<&str>,
        snippets: &[EvidenceSnippet],
        budget: &LlmBudget,
    ) -> LlmCallResult;

    /// Full-document structured extraction fallback. Failures are folded
    /// into `used = false`, never propagated.
    async fn extract_document(&self, raw_text: &str, doc_name: &str) -> DocExtraction;
}

// ---------------------------------------------------------------------------
// HTTP implementation (OpenAI-style chat completions)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

enum ChatError {
    RateLimited(String),
    Other(String),
}

pub struct HttpLlmClient {
    client: Client,
    llm: LlmSection,
    limits: LimitsSection,
    limiter: Arc<RateLimiter>,
}

impl HttpLlmClient {
    pub fn new(llm: LlmSection, limits: LimitsSection, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: Client::new(),
            llm,
            limits,
            limiter,
        }
    }

    fn api_key(&self) -> String {
        std::env::var(&self.llm.api_key_env).unwrap_or_else(|_| "local".to_string())
    }

    fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.acquire_timeout_secs)
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, ChatError> {
        let request = ChatRequest {
            model: self.llm.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: self.llm.temperature,
        };

        let url = format!("{}/chat/completions", self.llm.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Other(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::RateLimited(format!("LLM API 429: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Other(format!("LLM API error {status}: {body}")));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Other(e.to_string()))?;
        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ChatError::Other("Empty response from LLM".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn resolve_uom(
        &self,
        description: &str,
        mpn: Option<&str>,
        snippets: &[EvidenceSnippet],
        budget: &LlmBudget,
    ) -> LlmCallResult {
        if snippets.is_empty() {
            return LlmCallResult::not_needed("no snippets provided");
        }
        if self.limiter.daily_remaining() == 0 {
            return LlmCallResult::skipped_rate_limit("daily LLM budget exhausted", 0);
        }

        let mut user = format!("Product description: {description}\n");
        if let Some(mpn) = mpn {
            user.push_str(&format!("Manufacturer Part Number: {mpn}\n"));
        }
        user.push_str("\nSnippets:\n");
        for snippet in snippets.iter().take(MAX_PROMPT_SNIPPETS) {
            user.push_str(&format!(
                "Source: {}\n{}\n---\n",
                snippet.url,
                truncate_chars(&snippet.snippet, MAX_SNIPPET_CHARS)
            ));
        }

        for attempt in 1..=self.limits.max_retries {
            if budget.remaining() == 0 {
                return LlmCallResult::skipped_rate_limit(
                    "per-document LLM budget exhausted",
                    attempt - 1,
                );
            }
            if !self.limiter.acquire(self.acquire_timeout()).await {
                return LlmCallResult::skipped_rate_limit(
                    "rate limit not available within timeout",
                    attempt,
                );
            }
            // Token acquired: this attempt counts against the document budget.
            budget.try_consume();

            match self.chat(RESOLVE_SYSTEM_PROMPT, &user).await {
                Ok(content) => match parse_json_payload::<UomAnswer>(&content) {
                    Ok(answer) => {
                        return LlmCallResult {
                            status: LlmCallStatus::Success,
                            data: Some(answer),
                            reason: None,
                            attempts: attempt,
                        };
                    }
                    Err(e) => {
                        return LlmCallResult::failed_other(
                            format!("unparseable LLM response: {e}"),
                            attempt,
                        );
                    }
                },
                Err(ChatError::RateLimited(msg)) => {
                    warn!(
                        attempt,
                        max = self.limits.max_retries,
                        error = %msg,
                        "LLM 429, backing off"
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(ChatError::Other(msg)) => {
                    return LlmCallResult::failed_other(msg, attempt);
                }
            }
        }

        LlmCallResult {
            status: LlmCallStatus::Failed429,
            data: None,
            reason: Some(format!(
                "exhausted {} retries on rate limit",
                self.limits.max_retries
            )),
            attempts: self.limits.max_retries,
        }
    }

    async fn extract_document(&self, raw_text: &str, doc_name: &str) -> DocExtraction {
        let text = truncate_chars(raw_text, MAX_EXTRACT_CHARS);
        let user = format!("Extract invoice data from the following text:\n\n{text}");

        for attempt in 1..=self.limits.max_retries {
            if self.limiter.daily_remaining() == 0 {
                warn!(doc = %doc_name, "Daily LLM budget exhausted, skipping document fallback");
                return DocExtraction::default();
            }
            if !self.limiter.acquire(self.acquire_timeout()).await {
                warn!(doc = %doc_name, "Rate limiter timeout, skipping document fallback");
                return DocExtraction::default();
            }

            match self.chat(EXTRACT_SYSTEM_PROMPT, &user).await {
                Ok(content) => match parse_json_payload::<DocExtraction>(&content) {
                    Ok(mut extraction) => {
                        extraction.line_items.retain(|i| i.description.len() >= 3);
                        extraction.used = true;
                        info!(
                            doc = %doc_name,
                            supplier = %extraction.supplier_name,
                            items = extraction.line_items.len(),
                            "Document LLM fallback extracted"
                        );
                        return extraction;
                    }
                    Err(e) => {
                        warn!(doc = %doc_name, error = %e, "LLM returned invalid JSON");
                        return DocExtraction::default();
                    }
                },
                Err(ChatError::RateLimited(msg)) => {
                    warn!(
                        doc = %doc_name,
                        attempt,
                        error = %msg,
                        "LLM 429 during document fallback, backing off"
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(ChatError::Other(msg)) => {
                    warn!(doc = %doc_name, error = %msg, "LLM document fallback failed");
                    return DocExtraction::default();
                }
            }
        }

        warn!(doc = %doc_name, "Exhausted retries during document fallback");
        DocExtraction::default()
    }
}

// ---------------------------------------------------------------------------
// Response plumbing
// ---------------------------------------------------------------------------

/// Exponential backoff, capped at 60 s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(60))
}

/// Truncate to at most `max` bytes without splitting a char.
fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Strip markdown fences and extract the outermost JSON object from a
/// response that may carry surrounding prose or reasoning text.
fn extract_json_object(s: &str) -> Result<&str, Box<dyn std::error::Error + Send + Sync>> {
    let trimmed = s
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let start = trimmed.find('{').ok_or("No '{' found in LLM response")?;
    let end = trimmed.rfind('}').ok_or("No '}' found in LLM response")?;
    if end <= start {
        return Err("Malformed JSON in LLM response".into());
    }
    Ok(&trimmed[start..=end])
}

fn parse_json_payload<T: serde::de::DeserializeOwned>(
    content: &str,
) -> Result<T, Box<dyn std::error::Error + Send + Sync>> {
    let json_str = extract_json_object(content)?;
    Ok(serde_json::from_str(json_str)?)
}
