// src/supplier.rs
//
// Supplier-name candidate harvesting and deterministic normalisation.

use crate::config;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COMPANY_ANCHOR_RE: Regex =
        Regex::new(r"(?i)\b(LLC|INC\.?|L\.L\.C\.?|LTD\.?|CORP\.?|COMPANY)\b").unwrap();
    static ref DOMAIN_RE: Regex = Regex::new(r"(?i)\b([\w\-]+)\.(?:com|net|org|co)\b").unwrap();
    static ref PHONE_RE: Regex = Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap();
    static ref NUMERIC_LINE_RE: Regex = Regex::new(r"^[\d\s/\-\.]+$").unwrap();
    static ref FORMATTING_PREFIX_RE: Regex = Regex::new(r"^[\[\]!<>()]+").unwrap();
    static ref FIELD_LABEL_RE: Regex =
        Regex::new(r"(?i)^(cust|ship|bill|sold|remit|invoice|order|date|page|po|job)\b").unwrap();
    static ref TRAILING_PIPE_RE: Regex = Regex::new(r"\|.*$").unwrap();
    static ref HTML_COMMENT_RE: Regex = Regex::new(r"<!--.*-->").unwrap();
}

/// Heuristically pull supplier-name candidates from the first header
/// text blocks. Anchor keywords (LLC/INC/LTD) rank highest, then domain
/// names, then cleaned header lines.
pub fn extract_supplier_candidates(text_blocks: &[String], max_blocks: usize) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();

    // Pass 1: anchor search.
    for block in text_blocks.iter().take(max_blocks) {
        let line = block.trim();
        if line.split_whitespace().count() < 15 && COMPANY_ANCHOR_RE.is_match(line) {
            let mut clean_line = TRAILING_PIPE_RE.replace(line, "").trim().to_string();
            clean_line = HTML_COMMENT_RE.replace_all(&clean_line, "").trim().to_string();
            if clean_line.len() > 3 {
                candidates.insert(0, clean_line);
            }
        }

        if let Some(caps) = DOMAIN_RE.captures(line) {
            let domain = caps[1].replace('-', " ");
            let lower = domain.to_lowercase();
            let generic = [
                "gmail", "yahoo", "hotmail", "invoice", "sales", "info", "orders", "remit", "www",
            ];
            if domain.len() > 2 && !generic.contains(&lower.as_str()) {
                candidates.push(domain.to_uppercase());
            }
        }
    }

    // Pass 2: header-line cleaning.
    for block in text_blocks.iter().take(max_blocks) {
        let line = block.trim();
        if line.len() < 3 {
            continue;
        }
        if line.starts_with("<!--") || line.starts_with('#') {
            continue;
        }
        if line.starts_with('|') || line.starts_with("---") {
            continue;
        }
        if FORMATTING_PREFIX_RE.is_match(line) {
            continue;
        }
        if PHONE_RE.is_match(line) {
            continue;
        }
        if NUMERIC_LINE_RE.is_match(line) {
            continue;
        }
        if line.len() < 5 && !line.contains(':') {
            continue;
        }
        if FIELD_LABEL_RE.is_match(line) {
            continue;
        }
        if line.split_whitespace().count() > 8 {
            continue;
        }
        if !candidates.iter().any(|c| c == line) {
            candidates.push(line.to_string());
        }
    }

    candidates
}

/// Return `(raw_name, normalised_name)`.
///
/// Resolution order: exact alias lookup, then progressively shorter
/// word prefixes, then known-supplier containment. Unknown names pass
/// through unchanged.
pub fn normalize_supplier(raw_name: &str) -> (String, String) {
    let key = raw_name.trim().to_uppercase();

    let alias_lookup = |k: &str| -> Option<&'static str> {
        config::SUPPLIER_ALIASES
            .iter()
            .find(|(alias, _)| *alias == k)
            .map(|(_, canonical)| *canonical)
    };

    if let Some(canonical) = alias_lookup(&key) {
        return (raw_name.to_string(), canonical.to_string());
    }

    // Progressively shorter prefixes: "GALA JANITORIAL SUPPLIES" → "GALA JANITORIAL" → "GALA".
    let words: Vec<&str> = key.split_whitespace().collect();
    for word_count in (1..words.len()).rev() {
        let prefix = words[..word_count].join(" ");
        if let Some(canonical) = alias_lookup(&prefix) {
            return (raw_name.to_string(), canonical.to_string());
        }
    }

    // Known supplier appearing inside a longer string
    // (e.g. "Remit to Staples Advantage" → "Staples").
    for known in config::KNOWN_SUPPLIERS {
        if key.contains(&known.to_uppercase()) {
            return (raw_name.to_string(), known.to_string());
        }
    }

    (raw_name.to_string(), raw_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_alias_resolves() {
        let (_, normalised) = normalize_supplier("SYSCO");
        assert_eq!(normalised, "Sysco");
        let (_, normalised) = normalize_supplier("usfoods");
        assert_eq!(normalised, "US Foods");
    }

    #[test]
    fn prefix_alias_resolves() {
        let (_, normalised) = normalize_supplier("GALA JANITORIAL SUPPLIES LLC");
        assert_eq!(normalised, "Gala Janitorial Supplies");
    }

    #[test]
    fn known_supplier_inside_longer_string() {
        let (_, normalised) = normalize_supplier("Remit to Staples Advantage");
        assert_eq!(normalised, "Staples");
    }

    #[test]
    fn unknown_passes_through() {
        let (raw, normalised) = normalize_supplier("Acme Widget Co");
        assert_eq!(raw, "Acme Widget Co");
        assert_eq!(normalised, "Acme Widget Co");
    }

    #[test]
    fn anchor_lines_rank_first() {
        let blocks = vec![
            "Invoice #5521".to_string(),
            "123 Main Street".to_string(),
            "Gala Janitorial Supplies LLC".to_string(),
        ];
        let candidates = extract_supplier_candidates(&blocks, 15);
        assert_eq!(candidates[0], "Gala Janitorial Supplies LLC");
    }

    #[test]
    fn markup_and_labels_skipped() {
        let blocks = vec![
            "<!-- image -->".to_string(),
            "## Header".to_string(),
            "| cell | cell |".to_string(),
            "Ship To: somewhere".to_string(),
            "555-123-4567".to_string(),
            "Uline".to_string(),
        ];
        let candidates = extract_supplier_candidates(&blocks, 15);
        assert_eq!(candidates, vec!["Uline".to_string()]);
    }

    #[test]
    fn domain_names_harvested() {
        let blocks = vec!["orders@fastenal.com".to_string()];
        let candidates = extract_supplier_candidates(&blocks, 15);
        assert!(candidates.iter().any(|c| c == "FASTENAL"));
    }
}
