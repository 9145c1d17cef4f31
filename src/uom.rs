// src/uom.rs
//
// UOM detection, pack-quantity extraction, and normalisation.
// All logic is deterministic (regex / rules). No I/O, no LLM.

use crate::config;
use lazy_static::lazy_static;
use regex::Regex;

/// Result of parsing UOM / pack info from a text fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UomParse {
    /// Raw UOM token as found in the text.
    pub original_uom: Option<String>,
    /// Mapped via the alias table.
    pub canonical_uom: Option<String>,
    pub detected_pack_quantity: Option<u32>,
    /// Substring that matched.
    pub evidence_text: Option<String>,
    /// Substring the pack quantity came from.
    pub pack_evidence_text: Option<String>,
}

lazy_static! {
    // Common OCR misreads, applied in order. Digit/letter confusions only
    // fire in numeric context.
    static ref OCR_FIXES: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\bC4SE\b").unwrap(), "CASE"),
        (Regex::new(r"(?i)\bCA5E\b").unwrap(), "CASE"),
        (Regex::new(r"(?i)\bB0X\b").unwrap(), "BOX"),
        // "P K10" → "PK10"
        (Regex::new(r"(?i)\bP\s*K\s*(\d+)").unwrap(), "PK$1"),
        // "E A" → "EA"
        (Regex::new(r"(?i)\bE\s*A\b").unwrap(), "EA"),
        // "1O" → "10" (letter O)
        (Regex::new(r"\b1O\b").unwrap(), "10"),
        // "I2" → "12"
        (Regex::new(r"\bI(\d)\b").unwrap(), "1$1"),
        // "2O" → "20"
        (Regex::new(r"\b(\d)O\b").unwrap(), "${1}0"),
        // "2l" → "21"
        (Regex::new(r"\b(\d)l\b").unwrap(), "${1}1"),
        // "2S" → "25"
        (Regex::new(r"\b(\d)S\b").unwrap(), "${1}5"),
    ];

    static ref WHITESPACE_RE: Regex = Regex::new(r"[^\S\n]+").unwrap();

    // Pack patterns, most specific first: (pattern, qty group, uom group).
    // First match wins; the ordering is a fixed tie-break.
    static ref PACK_PATTERNS: Vec<(Regex, usize, usize)> = vec![
        // "25/CS", "100/CASE", "12/BX"
        (Regex::new(r"\b(\d+)\s*/\s*([A-Za-z]{2,})\b").unwrap(), 1, 2),
        // "PK10", "PK 10", "PACK10"
        (Regex::new(r"(?i)\b(PK|PACK|PKG)\s*(\d+)\b").unwrap(), 2, 1),
        // "case of 12", "box of 24", "pack of 10"
        (Regex::new(r"(?i)\b(CASE|BOX|PACK|PACKAGE|PKG)\s+OF\s+(\d+)\b").unwrap(), 2, 1),
        // "(10 per pack)", "(6 per case)"
        (
            Regex::new(r"(?i)\(?\s*(\d+)\s+PER\s+(PACK|CASE|BOX|PACKAGE|PKG|ROLL|BAG)\s*\)?")
                .unwrap(),
            1,
            2,
        ),
        // "1000 EA", "50 EACH"
        (Regex::new(r"(?i)\b(\d+)\s+(EA|EACH|UNIT|PC|PCS|PIECE|PIECES)\b").unwrap(), 1, 2),
        // "CS 12", UOM followed by qty
        (Regex::new(r"(?i)\b(CS|CASE|BX|BOX|PK|PACK|PKG)\s+(\d+)\b").unwrap(), 2, 1),
    ];

    // Standalone UOM token (no pack qty). Longest aliases first so "PIECES"
    // wins over "PC".
    static ref UOM_ONLY_RE: Regex = {
        let mut keys: Vec<&str> = config::UOM_ALIASES.iter().map(|(k, _)| *k).collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()));
        Regex::new(&format!(r"(?i)\b({})\b", keys.join("|"))).unwrap()
    };
}

/// Apply OCR-noise corrections and normalise whitespace (newlines kept).
fn clean_ocr(text: &str) -> String {
    let mut cleaned = WHITESPACE_RE.replace_all(text, " ").to_string();
    cleaned = cleaned.trim().trim_end_matches('.').to_string();
    for (pat, repl) in OCR_FIXES.iter() {
        cleaned = pat.replace_all(&cleaned, *repl).to_string();
    }
    cleaned
}

/// Map a raw UOM string to its canonical short code via the alias table.
/// Unknown tokens pass through upper-cased.
pub fn normalize_uom_code(raw: &str) -> String {
    let key = raw.trim().to_uppercase();
    config::UOM_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(key)
}

pub fn is_pack_uom(canonical: &str) -> bool {
    config::PACK_UOMS.contains(&canonical)
}

pub fn is_each_uom(canonical: &str) -> bool {
    config::EACH_UOMS.contains(&canonical)
}

/// Extract UOM and pack quantity from `text`.
///
/// Fields that could not be determined remain `None`. Empty or
/// whitespace-only input yields an all-unset result.
pub fn parse_uom_and_pack(text: &str) -> UomParse {
    if text.trim().is_empty() {
        return UomParse::default();
    }

    let cleaned = clean_ocr(text);

    // Pack patterns first (they also yield a UOM).
    for (pat, qty_grp, uom_grp) in PACK_PATTERNS.iter() {
        let Some(caps) = pat.captures(&cleaned) else {
            continue;
        };
        let Ok(qty) = caps[*qty_grp].parse::<u32>() else {
            continue;
        };
        let raw_uom = caps[*uom_grp].to_uppercase();
        let canonical = normalize_uom_code(&raw_uom);
        let matched = caps[0].to_string();
        return UomParse {
            original_uom: Some(raw_uom),
            canonical_uom: Some(canonical),
            detected_pack_quantity: Some(qty),
            evidence_text: Some(matched.clone()),
            pack_evidence_text: Some(matched),
        };
    }

    // Fallback: standalone UOM token, no pack qty detected.
    if let Some(caps) = UOM_ONLY_RE.captures(&cleaned) {
        let raw_uom = caps[1].to_uppercase();
        let canonical = normalize_uom_code(&raw_uom);
        let matched = caps[0].to_string();
        let mut result = UomParse {
            original_uom: Some(raw_uom),
            canonical_uom: Some(canonical.clone()),
            detected_pack_quantity: None,
            evidence_text: Some(matched.clone()),
            pack_evidence_text: None,
        };
        // An each-type UOM implies a pack of one.
        if is_each_uom(&canonical) {
            result.detected_pack_quantity = Some(1);
            result.pack_evidence_text = Some(matched);
        }
        return result;
    }

    UomParse::default()
}
