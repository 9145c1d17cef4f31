// src/scoring.rs
//
// Explainable confidence scoring. Each component adds or deducts from a
// base score; the breakdown is kept alongside the final score for the
// debug artifact.

use crate::config;
use crate::pipeline::EnrichedLineItem;
use crate::uom::{is_pack_uom, normalize_uom_code};
use serde::Serialize;

const BASE_SCORE: f64 = 0.50;

const W_HAS_DESCRIPTION: f64 = 0.10;
const W_HAS_QUANTITY: f64 = 0.05;
const W_HAS_UNIT_PRICE: f64 = 0.05;
const W_HAS_AMOUNT: f64 = 0.05;
const W_UOM_EXPLICIT: f64 = 0.10;
const W_PACK_EXPLICIT: f64 = 0.10;
const W_LOOKUP_MATCH: f64 = 0.10;
const W_SUPPLIER_NORMALISED: f64 = 0.05;
const W_HAS_MPN: f64 = 0.05;
const W_CONFLICTING_EVIDENCE: f64 = -0.15;
const W_OCR_LOW_CONFIDENCE: f64 = -0.10;
const W_COLUMN_AMBIGUITY: f64 = -0.10;
const W_MISSING_PACK_FOR_PRICE: f64 = -0.20;
const W_PRICE_NULL: f64 = -0.10;

/// Boolean evidence signals gathered during enrichment.
#[derive(Debug, Clone, Default)]
pub struct EvidenceFlags {
    pub lookup_match: bool,
    pub conflicting: bool,
    pub ocr_low: bool,
    pub column_ambiguity: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreDelta {
    pub name: &'static str,
    pub delta: f64,
}

/// Per-component contributions, for auditability. Explanatory only;
/// nothing downstream consumes it.
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceBreakdown {
    pub base: f64,
    pub components: Vec<ScoreDelta>,
    pub score: f64,
}

/// True when the item has a pack-type UOM but no pack quantity, which
/// makes the base-unit price unknowable.
fn pack_qty_blocks_price(item: &EnrichedLineItem) -> bool {
    match &item.original_uom {
        Some(raw) => {
            is_pack_uom(&normalize_uom_code(raw)) && item.detected_pack_quantity.is_none()
        }
        None => false,
    }
}

/// Compute `(score, breakdown)` for one enriched item. Pure.
pub fn compute_confidence(
    item: &EnrichedLineItem,
    flags: &EvidenceFlags,
) -> (f64, ConfidenceBreakdown) {
    let mut score = BASE_SCORE;
    let mut components = Vec::new();

    let mut apply = |name: &'static str, condition: bool, delta: f64| {
        if condition {
            score += delta;
            components.push(ScoreDelta { name, delta });
        }
    };

    apply("has_description", !item.description.is_empty(), W_HAS_DESCRIPTION);
    apply("has_quantity", item.quantity.is_some(), W_HAS_QUANTITY);
    apply("has_unit_price", item.unit_price.is_some(), W_HAS_UNIT_PRICE);
    apply("has_amount", item.amount.is_some(), W_HAS_AMOUNT);
    apply("uom_explicit_inline", item.original_uom.is_some(), W_UOM_EXPLICIT);
    apply(
        "pack_explicit_inline",
        item.detected_pack_quantity.is_some(),
        W_PACK_EXPLICIT,
    );
    apply(
        "supplier_normalised",
        !item.supplier_name.is_empty(),
        W_SUPPLIER_NORMALISED,
    );
    apply("has_mpn", item.mpn.is_some(), W_HAS_MPN);
    apply("lookup_evidence_match", flags.lookup_match, W_LOOKUP_MATCH);

    apply("conflicting_evidence", flags.conflicting, W_CONFLICTING_EVIDENCE);
    apply("ocr_low_confidence", flags.ocr_low, W_OCR_LOW_CONFIDENCE);
    apply("column_ambiguity", flags.column_ambiguity, W_COLUMN_AMBIGUITY);

    apply(
        "missing_uom_pack_for_price",
        pack_qty_blocks_price(item),
        W_MISSING_PACK_FOR_PRICE,
    );
    apply("price_null", item.price_per_base_unit.is_none(), W_PRICE_NULL);

    let clamped = (score.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0;
    let breakdown = ConfidenceBreakdown {
        base: BASE_SCORE,
        components,
        score: clamped,
    };
    (clamped, breakdown)
}

/// True if the item must be reviewed by a human.
///
/// An unknowable price (pack UOM, unknown pack qty) escalates no matter
/// how high the raw score is.
pub fn should_escalate(score: f64, item: &EnrichedLineItem) -> bool {
    if score < config::CONFIDENCE_THRESHOLD {
        return true;
    }
    pack_qty_blocks_price(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_item() -> EnrichedLineItem {
        EnrichedLineItem {
            description: "Nitrile Gloves Large".to_string(),
            ..EnrichedLineItem::default()
        }
    }

    #[test]
    fn score_stays_in_unit_interval() {
        // All positives on.
        let mut item = base_item();
        item.quantity = Some(5.0);
        item.unit_price = Some(24.99);
        item.amount = Some(124.95);
        item.original_uom = Some("CS".to_string());
        item.detected_pack_quantity = Some(25);
        item.supplier_name = "Grainger".to_string();
        item.mpn = Some("MFR-1".to_string());
        item.price_per_base_unit = Some(0.9996);
        let flags = EvidenceFlags {
            lookup_match: true,
            ..EvidenceFlags::default()
        };
        let (score, _) = compute_confidence(&item, &flags);
        assert!(score <= 1.0);
        assert!(score >= 0.0);

        // All negatives on.
        let item = EnrichedLineItem::default();
        let flags = EvidenceFlags {
            conflicting: true,
            ocr_low: true,
            column_ambiguity: true,
            ..EvidenceFlags::default()
        };
        let (score, _) = compute_confidence(&item, &flags);
        assert!(score >= 0.0);
    }

    #[test]
    fn breakdown_names_every_applied_delta() {
        let mut item = base_item();
        item.unit_price = Some(24.99);
        item.original_uom = Some("CS".to_string());
        item.detected_pack_quantity = Some(25);
        item.price_per_base_unit = Some(0.9996);
        let (score, breakdown) = compute_confidence(&item, &EvidenceFlags::default());
        let names: Vec<&str> = breakdown.components.iter().map(|c| c.name).collect();
        assert!(names.contains(&"has_description"));
        assert!(names.contains(&"has_unit_price"));
        assert!(names.contains(&"uom_explicit_inline"));
        assert!(names.contains(&"pack_explicit_inline"));
        assert!(!names.contains(&"price_null"));
        assert_eq!(breakdown.score, score);
        // 0.50 + 0.10 + 0.05 + 0.10 + 0.10
        assert_eq!(score, 0.85);
    }

    #[test]
    fn pack_uom_without_qty_deducts_and_escalates() {
        let mut item = base_item();
        item.unit_price = Some(24.99);
        item.quantity = Some(2.0);
        item.amount = Some(49.98);
        item.original_uom = Some("CS".to_string());
        item.supplier_name = "Grainger".to_string();
        item.mpn = Some("MFR-1".to_string());
        // pack qty unknown → price unknowable
        let (score, breakdown) = compute_confidence(&item, &EvidenceFlags::default());
        let names: Vec<&str> = breakdown.components.iter().map(|c| c.name).collect();
        assert!(names.contains(&"missing_uom_pack_for_price"));
        // Escalates regardless of where the score landed.
        assert!(should_escalate(score, &item));
    }

    #[test]
    fn low_score_escalates() {
        let item = EnrichedLineItem::default();
        let (score, _) = compute_confidence(&item, &EvidenceFlags::default());
        assert!(score < config::CONFIDENCE_THRESHOLD);
        assert!(should_escalate(score, &item));
    }

    #[test]
    fn good_item_does_not_escalate() {
        let mut item = base_item();
        item.unit_price = Some(24.99);
        item.original_uom = Some("CS".to_string());
        item.detected_pack_quantity = Some(25);
        item.price_per_base_unit = Some(0.9996);
        let (score, _) = compute_confidence(&item, &EvidenceFlags::default());
        assert!(score >= config::CONFIDENCE_THRESHOLD);
        assert!(!should_escalate(score, &item));
    }

    #[test]
    fn raw_alias_counts_as_pack_uom() {
        let mut item = base_item();
        item.unit_price = Some(10.0);
        item.original_uom = Some("CASE".to_string());
        let (score, _) = compute_confidence(&item, &EvidenceFlags::default());
        assert!(should_escalate(score, &item));
    }
}
