// src/pipeline.rs
//
// Per-document orchestration state machine:
//   Extraction → LineItemParsing → SupplierDetection → QualityGate
//   → [DocumentLlmFallback]? → PerItemEnrichment → OutputAssembly → Persist
//
// A content-hash manifest gates reprocessing. Any stage error writes an
// error artifact to the failed directory and leaves the manifest
// untouched, so the next run retries the document. A failure in one
// document never affects others.

use crate::config::{self, Config};
use crate::line_items::{self, Extraction, RawLineItem};
use crate::llm::{LlmClient, LlmEvidence};
use crate::lookup::cache::LookupCache;
use crate::lookup::{
    EvidenceSnippet, LookupAgent, ResolveOutcome, SearchProvider, SnippetFetcher,
};
use crate::price::compute_price_per_base_unit;
use crate::scoring::{EvidenceFlags, compute_confidence, should_escalate};
use crate::supplier;
use crate::uom::{UomParse, parse_uom_and_pack};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info};

/// Header blocks inspected for supplier candidates.
const SUPPLIER_SCAN_BLOCKS: usize = 15;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One fully enriched line item, assembled once and owned by the
/// document result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedLineItem {
    pub supplier_name: String,
    pub description: String,
    pub sku: Option<String>,
    pub mpn: Option<String>,
    pub quantity: Option<f64>,
    pub uom_raw: Option<String>,
    pub unit_price: Option<f64>,
    pub amount: Option<f64>,
    pub original_uom: Option<String>,
    pub detected_pack_quantity: Option<u32>,
    pub canonical_base_uom: String,
    pub price_per_base_unit: Option<f64>,
    pub confidence_score: f64,
    pub escalation_flag: bool,
    pub evidence: Evidence,
}

impl Default for EnrichedLineItem {
    fn default() -> Self {
        Self {
            supplier_name: String::new(),
            description: String::new(),
            sku: None,
            mpn: None,
            quantity: None,
            uom_raw: None,
            unit_price: None,
            amount: None,
            original_uom: None,
            detected_pack_quantity: None,
            canonical_base_uom: config::CANONICAL_BASE_UOM.to_string(),
            price_per_base_unit: None,
            confidence_score: 0.0,
            escalation_flag: false,
            evidence: Evidence::default(),
        }
    }
}

/// Exact text spans and lookup/LLM metadata backing the detected values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    pub uom_evidence_text: Option<String>,
    pub pack_evidence_text: Option<String>,
    pub lookup_sources: Vec<EvidenceSnippet>,
    #[serde(flatten)]
    pub llm: LlmEvidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStats {
    pub num_items: usize,
    pub num_escalations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub file: String,
    pub supplier_name: String,
    pub line_items: Vec<EnrichedLineItem>,
    pub stats: DocumentStats,
}

/// One document ready for processing.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub name: String,
    pub content_hash: String,
    pub extraction: Extraction,
}

impl DocumentInput {
    /// Load an extraction-result JSON file produced by the external
    /// extractor. The content hash covers the raw bytes.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let bytes = fs::read(path)?;
        let extraction: Extraction = serde_json::from_slice(&bytes)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or("document path has no stem")?
            .to_string();
        Ok(Self {
            name,
            content_hash: content_hash(&bytes),
            extraction,
        })
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extraction,
    LineItemParsing,
    SupplierDetection,
    QualityGate,
    DocumentLlmFallback,
    PerItemEnrichment,
    OutputAssembly,
    Persist,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::LineItemParsing => "line_item_parsing",
            Stage::SupplierDetection => "supplier_detection",
            Stage::QualityGate => "quality_gate",
            Stage::DocumentLlmFallback => "document_llm_fallback",
            Stage::PerItemEnrichment => "per_item_enrichment",
            Stage::OutputAssembly => "output_assembly",
            Stage::Persist => "persist",
        }
    }
}

#[derive(Debug, Error)]
#[error("{stage}: {message}")]
pub struct StageError {
    pub stage: &'static str,
    pub message: String,
}

impl StageError {
    fn new(stage: Stage, message: impl std::fmt::Display) -> Self {
        Self {
            stage: stage.name(),
            message: message.to_string(),
        }
    }
}

/// What happened to one document.
#[derive(Debug)]
pub enum ProcessOutcome {
    Completed(DocumentResult),
    AlreadyProcessed,
    Failed { stage: &'static str },
}

#[derive(Debug, Serialize)]
struct DebugReport {
    file: String,
    stages: Map<String, Value>,
}

impl DebugReport {
    fn new(name: &str) -> Self {
        Self {
            file: name.to_string(),
            stages: Map::new(),
        }
    }

    fn set_stage(&mut self, stage: Stage) {
        self.stages
            .insert("current_stage".to_string(), json!(stage.name()));
    }

    fn record(&mut self, key: &str, value: Value) {
        self.stages.insert(key.to_string(), value);
    }

    fn push_to(&mut self, key: &str, value: Value) {
        self.stages
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("debug key holds an array")
            .push(value);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Pipeline {
    cfg: Config,
    cache: Arc<LookupCache>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn SnippetFetcher>,
    llm: Arc<dyn LlmClient>,
    manifest_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        cfg: Config,
        cache: Arc<LookupCache>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn SnippetFetcher>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            cfg,
            cache,
            search,
            fetcher,
            llm,
            manifest_lock: Mutex::new(()),
        }
    }

    /// Process one document end-to-end. Always yields an artifact: a
    /// result on success, an error file on failure, or a skip when the
    /// manifest already maps this document to this content hash.
    pub async fn process_document(&self, doc: &DocumentInput, force: bool) -> ProcessOutcome {
        if !force {
            let _guard = self.manifest_lock.lock().expect("manifest lock poisoned");
            let manifest = self.load_manifest();
            if manifest.get(&doc.name) == Some(&doc.content_hash) {
                info!(doc = %doc.name, "Already processed (hash match), skipping");
                return ProcessOutcome::AlreadyProcessed;
            }
        }

        let mut debug = DebugReport::new(&doc.name);
        match self.run(doc, &mut debug).await {
            Ok(result) => {
                info!(
                    doc = %doc.name,
                    items = result.stats.num_items,
                    escalations = result.stats.num_escalations,
                    "Document processed"
                );
                ProcessOutcome::Completed(result)
            }
            Err(stage_error) => {
                error!(doc = %doc.name, stage = stage_error.stage, error = %stage_error.message, "Document failed");
                let artifact = json!({
                    "file": doc.name,
                    "stage": stage_error.stage,
                    "error": stage_error.message,
                    "partial_debug": serde_json::to_value(&debug).unwrap_or(Value::Null),
                });
                let path = self.cfg.dirs.failed.join(format!("{}.error.json", doc.name));
                if let Err(e) = atomic_write_json(&path, &artifact) {
                    error!(doc = %doc.name, error = %e, "Failed to write error artifact");
                }
                ProcessOutcome::Failed {
                    stage: stage_error.stage,
                }
            }
        }
    }

    async fn run(
        &self,
        doc: &DocumentInput,
        debug: &mut DebugReport,
    ) -> Result<DocumentResult, StageError> {
        // ── Stage 1: extraction intake ──────────────────────────────────
        debug.set_stage(Stage::Extraction);
        let extraction = &doc.extraction;
        if extraction.tables.is_empty() && extraction.text_blocks.is_empty() {
            return Err(StageError::new(
                Stage::Extraction,
                "extraction produced no tables and no text blocks",
            ));
        }
        debug.record(
            "extraction",
            json!({
                "method": extraction.method,
                "num_tables": extraction.tables.len(),
                "num_text_blocks": extraction.text_blocks.len(),
            }),
        );

        // ── Stage 2: line items ─────────────────────────────────────────
        debug.set_stage(Stage::LineItemParsing);
        let (mut raw_items, items_debug) = line_items::extract_line_items(extraction);
        debug.record("line_items", items_debug);
        info!(doc = %doc.name, count = raw_items.len(), "Parsed raw line items");

        // ── Stage 3: supplier detection ─────────────────────────────────
        debug.set_stage(Stage::SupplierDetection);
        let candidates =
            supplier::extract_supplier_candidates(&extraction.text_blocks, SUPPLIER_SCAN_BLOCKS);
        let mut supplier_name = candidates
            .first()
            .map(|c| supplier::normalize_supplier(c).1)
            .unwrap_or_default();
        debug.record(
            "supplier",
            json!({"candidates": candidates, "normalised": supplier_name}),
        );

        // ── Stage 4: quality gate ───────────────────────────────────────
        debug.set_stage(Stage::QualityGate);
        let supplier_bad = supplier_looks_bad(&supplier_name);
        let items_bad = items_look_bad(&raw_items);
        let needs_llm = raw_items.is_empty() || supplier_bad || items_bad;

        if needs_llm {
            let reason = if raw_items.is_empty() {
                "no items"
            } else if supplier_bad {
                "bad supplier"
            } else {
                "low quality items"
            };
            info!(
                doc = %doc.name,
                reason,
                items = raw_items.len(),
                supplier = %supplier_name,
                "Quality gate triggered, trying document LLM fallback"
            );

            debug.set_stage(Stage::DocumentLlmFallback);
            let raw_text = flatten_extraction_text(extraction);
            let fallback = if raw_text.trim().is_empty() {
                Default::default()
            } else {
                self.llm.extract_document(&raw_text, &doc.name).await
            };
            debug.record(
                "llm_fallback",
                json!({
                    "triggered": true,
                    "reason": reason,
                    "used": fallback.used,
                    "items_returned": fallback.line_items.len(),
                    "supplier_returned": fallback.supplier_name,
                }),
            );
            // Replace deterministic results only with something better.
            if fallback.used && !fallback.line_items.is_empty() {
                raw_items = fallback.line_items;
            }
            if fallback.used && !fallback.supplier_name.is_empty() {
                supplier_name = fallback.supplier_name;
            }
        }

        // ── Stage 5: per-item enrichment ────────────────────────────────
        debug.set_stage(Stage::PerItemEnrichment);
        let agent = LookupAgent::new(
            self.cache.clone(),
            self.search.clone(),
            self.fetcher.clone(),
            self.llm.clone(),
            self.cfg.limits.max_calls_per_doc,
        );
        let mut queries_done: HashMap<String, ResolveOutcome> = HashMap::new();

        let mut final_items = Vec::with_capacity(raw_items.len());
        for raw in &raw_items {
            let item = self
                .enrich_item(raw, &supplier_name, &agent, &mut queries_done, debug)
                .await;
            final_items.push(item);
        }

        // ── Stage 6: output assembly ────────────────────────────────────
        debug.set_stage(Stage::OutputAssembly);
        let num_escalations = final_items.iter().filter(|i| i.escalation_flag).count();
        let result = DocumentResult {
            file: doc.name.clone(),
            supplier_name,
            stats: DocumentStats {
                num_items: final_items.len(),
                num_escalations,
            },
            line_items: final_items,
        };

        // ── Stage 7: persist ────────────────────────────────────────────
        debug.set_stage(Stage::Persist);
        let out = &self.cfg.dirs.output;
        atomic_write_json(&out.join(format!("{}.json", doc.name)), &result)
            .map_err(|e| StageError::new(Stage::Persist, e))?;
        atomic_write_json(&out.join(format!("{}.debug.json", doc.name)), &debug)
            .map_err(|e| StageError::new(Stage::Persist, e))?;

        {
            let _guard = self.manifest_lock.lock().expect("manifest lock poisoned");
            let mut manifest = self.load_manifest();
            manifest.insert(doc.name.clone(), doc.content_hash.clone());
            self.save_manifest(&manifest)
                .map_err(|e| StageError::new(Stage::Persist, e))?;
        }

        Ok(result)
    }

    /// Enrich one raw item: UOM parse → deduplicated lookup → price →
    /// confidence score. Enrichment failures degrade to missing
    /// evidence, never to a document failure.
    async fn enrich_item(
        &self,
        raw: &RawLineItem,
        supplier_name: &str,
        agent: &LookupAgent,
        queries_done: &mut HashMap<String, ResolveOutcome>,
        debug: &mut DebugReport,
    ) -> EnrichedLineItem {
        // Parse UOM from the dedicated field first, then the description.
        let mut parse = UomParse::default();
        for source in [raw.uom_raw.as_deref(), Some(raw.description.as_str())]
            .into_iter()
            .flatten()
        {
            let attempt = parse_uom_and_pack(source);
            if attempt.original_uom.is_some() {
                parse = attempt;
                break;
            }
        }

        let mut original_uom = parse.original_uom.clone();
        let mut pack_qty = parse.detected_pack_quantity;
        let canonical_uom = parse.canonical_uom.clone();

        let mut flags = EvidenceFlags::default();
        let mut lookup_sources: Vec<EvidenceSnippet> = Vec::new();
        let mut llm_evidence = LlmEvidence::default();

        let is_each = canonical_uom
            .as_deref()
            .map(crate::uom::is_each_uom)
            .unwrap_or(false);
        let has_handle = raw.sku.as_deref().is_some_and(|s| !s.trim().is_empty())
            || raw.mpn.as_deref().is_some_and(|m| !m.trim().is_empty())
            || raw.description.len() > 5;
        let needs_lookup = ((!is_each && pack_qty.is_none())
            || canonical_uom.is_none()
            || (pack_qty.is_none() && raw.quantity.is_some()))
            && has_handle;

        if needs_lookup {
            if let Some(query) = LookupAgent::build_query(
                &raw.description,
                raw.sku.as_deref(),
                raw.mpn.as_deref(),
            ) {
                let key = LookupCache::normalize_query(&query);
                let outcome = match queries_done.get(&key).cloned() {
                    Some(prior) => prior,
                    None => {
                        let fresh = agent
                            .resolve(&raw.description, raw.sku.as_deref(), raw.mpn.as_deref())
                            .await;
                        queries_done.insert(key, fresh.clone());
                        fresh
                    }
                };

                if pack_qty.is_none() {
                    pack_qty = outcome.pack_qty;
                }
                if original_uom.is_none() {
                    original_uom = outcome.uom.clone();
                }
                flags.lookup_match = outcome.matched();
                lookup_sources = outcome.lookup_sources;
                llm_evidence = outcome.llm;
            }
        }

        let (price, price_trace) = compute_price_per_base_unit(
            raw.unit_price,
            raw.amount,
            raw.quantity,
            original_uom.as_deref(),
            pack_qty,
        );

        let mut item = EnrichedLineItem {
            supplier_name: supplier_name.to_string(),
            description: raw.description.clone(),
            sku: raw.sku.clone(),
            mpn: raw.mpn.clone(),
            quantity: raw.quantity,
            uom_raw: raw.uom_raw.clone(),
            unit_price: raw.unit_price,
            amount: raw.amount,
            original_uom,
            detected_pack_quantity: pack_qty,
            price_per_base_unit: price,
            evidence: Evidence {
                uom_evidence_text: parse.evidence_text,
                pack_evidence_text: parse.pack_evidence_text,
                lookup_sources,
                llm: llm_evidence,
            },
            ..EnrichedLineItem::default()
        };

        let (score, breakdown) = compute_confidence(&item, &flags);
        item.confidence_score = score;
        item.escalation_flag = should_escalate(score, &item);

        debug.push_to(
            "price_computations",
            serde_json::to_value(&price_trace).unwrap_or(Value::Null),
        );
        debug.push_to(
            "confidence_breakdowns",
            serde_json::to_value(&breakdown).unwrap_or(Value::Null),
        );

        item
    }

    fn load_manifest(&self) -> HashMap<String, String> {
        fs::read_to_string(self.cfg.manifest_file())
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save_manifest(
        &self,
        manifest: &HashMap<String, String>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        atomic_write_json(&self.cfg.manifest_file(), manifest)
    }
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

/// True if the supplier string is clearly wrong (too short, or carrying
/// markup artifacts).
fn supplier_looks_bad(supplier: &str) -> bool {
    if supplier.len() < config::GATE_MIN_SUPPLIER_LEN {
        return true;
    }
    config::GATE_BAD_SUPPLIER_PATTERNS
        .iter()
        .any(|p| supplier.contains(p))
}

/// True if most extracted items look like extraction noise.
fn items_look_bad(items: &[RawLineItem]) -> bool {
    if items.is_empty() {
        return true;
    }

    let mut short_desc = 0usize;
    let mut no_uom = 0usize;
    let mut noise = 0usize;

    for item in items {
        if item.description.len() < config::GATE_SHORT_DESC_LEN {
            short_desc += 1;
        }
        if item.uom_raw.is_none() {
            no_uom += 1;
        }
        if item.description.starts_with('_')
            || item.description.starts_with("10.")
            || item.description.contains("____")
        {
            noise += 1;
        }
    }

    let threshold = items.len() as f64 * config::GATE_NOISE_RATIO;
    if short_desc as f64 > threshold && no_uom as f64 > threshold {
        return true;
    }
    noise > 0
}

/// Flatten tables and text blocks into one text body for the LLM.
fn flatten_extraction_text(extraction: &Extraction) -> String {
    let mut parts: Vec<String> = Vec::new();
    for table in &extraction.tables {
        for row in table {
            parts.push(row.join(" | "));
        }
    }
    for block in &extraction.text_blocks {
        parts.push(block.clone());
    }
    parts.join("\n")
}

// ---------------------------------------------------------------------------
// Atomic persistence
// ---------------------------------------------------------------------------

/// Write JSON atomically: serialise into a temp file in the target
/// directory, then rename over the destination.
fn atomic_write_json<T: Serialize>(
    path: &Path,
    data: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = NamedTempFile::new_in(parent)?;
    fs::write(tmp.path(), serde_json::to_string_pretty(data)?)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
