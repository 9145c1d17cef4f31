// src/line_items.rs
//
// Line-item extraction from raw tables / text blocks:
// - column-role heuristics over header cells (best-effort, not exact)
// - continuation-row merging (description rows with no qty/price)
// - non-line-item filtering (subtotal, tax, freight, ...)
// - markdown pipe-table detection inside text blocks
// - regex text-line fallback

use crate::config;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;

/// One raw invoice line item, as produced by the external extractor or
/// parsed here. Immutable input to enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLineItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub uom_raw: Option<String>,
    pub unit_price: Option<f64>,
    pub amount: Option<f64>,
    pub sku: Option<String>,
    pub mpn: Option<String>,
}

/// Output of the external extraction collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub tables: Vec<Vec<Vec<String>>>,
    #[serde(default)]
    pub text_blocks: Vec<String>,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ColRole {
    Description,
    Quantity,
    Uom,
    UnitPrice,
    Amount,
    Sku,
    Mpn,
}

/// Column-identification keywords per role. Fuzzy by design: headers are
/// matched exact-first, then by containment, longest keyword first.
const COL_PATTERNS: &[(ColRole, &[&str])] = &[
    (
        ColRole::Description,
        &["desc", "description", "item", "product", "material", "name", "particulars"],
    ),
    (
        ColRole::Quantity,
        &["qty", "quantity", "qnty", "ordered", "shipped", "units"],
    ),
    (ColRole::Uom, &["uom", "um", "unit", "measure", "u/m", "pack"]),
    (
        ColRole::UnitPrice,
        &["unit price", "unit cost", "price", "rate", "unit", "each"],
    ),
    (
        ColRole::Amount,
        &["amount", "total", "ext", "extension", "extended", "line total", "net"],
    ),
    (
        ColRole::Sku,
        &["sku", "item #", "item no", "item number", "stock", "catalog", "cat #", "cat no"],
    ),
    (
        ColRole::Mpn,
        &["mpn", "mfg", "mfr", "manufacturer", "part", "part #", "part no", "mfg #", "mfr part"],
    ),
];

lazy_static! {
    static ref HTML_COMMENT_RE: Regex = Regex::new(r"<!--.*?-->").unwrap();
    static ref MD_HEADER_RE: Regex = Regex::new(r"^\s*#{1,6}\s+").unwrap();
    static ref MULTI_WS_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref NON_NUMERIC_RE: Regex = Regex::new(r"[^\d.\-]").unwrap();
    static ref PIPE_SEPARATOR_RE: Regex = Regex::new(r"^[\s\-:|]+$").unwrap();
    static ref DECIMAL_RE: Regex = Regex::new(r"\d+\.\d{2}").unwrap();
    // "desc...  qty  [uom]  price" free-text line shape
    static ref TEXT_LINE_RE: Regex = Regex::new(
        r"^(?P<desc>.{10,}?)\s+(?P<qty>\d+(?:\.\d+)?)\s+(?:(?P<uom>[A-Za-z]{1,6})\s+)?(?P<price>\d+(?:,\d{3})*\.\d{2})",
    )
    .unwrap();
}

/// Strip markdown noise from a cell value.
fn clean_cell_value(text: &str) -> String {
    let mut cleaned = HTML_COMMENT_RE.replace_all(text, "").to_string();
    cleaned = MD_HEADER_RE.replace(&cleaned, "").to_string();
    cleaned = cleaned.trim_matches(|c| c == '|' || c == ' ').to_string();
    cleaned = MULTI_WS_RE.replace_all(&cleaned, " ").trim().to_string();
    cleaned.trim_end_matches('.').to_string()
}

/// True if `text` looks like a subtotal / tax / other non-item line.
pub fn is_non_item(text: &str) -> bool {
    let lower = text.to_lowercase();
    config::NON_ITEM_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Parse a numeric value out of a cell string, ignoring currency symbols
/// and thousand separators.
fn parse_number(val: &str) -> Option<f64> {
    let cleaned = NON_NUMERIC_RE.replace_all(val.trim(), "").to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == "-" {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn safe_get<'a>(row: &'a [String], idx: Option<usize>) -> Option<&'a str> {
    let idx = idx?;
    let val = row.get(idx)?;
    if val.trim().is_empty() { None } else { Some(val.as_str()) }
}

/// Map semantic column roles to header indices.
fn identify_columns(header: &[String]) -> HashMap<ColRole, usize> {
    let mut mapping: HashMap<ColRole, usize> = HashMap::new();

    // Longest keywords first so "item #" is tried before "item".
    let mut sorted_patterns: Vec<(&str, ColRole)> = Vec::new();
    for (role, keywords) in COL_PATTERNS {
        for kw in *keywords {
            sorted_patterns.push((kw, *role));
        }
    }
    sorted_patterns.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    for (idx, cell) in header.iter().enumerate() {
        let cell_lower = cell.to_lowercase().trim().to_string();

        let mut found = false;
        for (kw, role) in &sorted_patterns {
            if mapping.contains_key(role) {
                continue;
            }
            if cell_lower == *kw {
                mapping.insert(*role, idx);
                found = true;
                break;
            }
        }

        if !found {
            for (kw, role) in &sorted_patterns {
                if mapping.contains_key(role) {
                    continue;
                }
                if cell_lower.contains(kw) {
                    // "item #" / "material no." are id columns, not descriptions.
                    if (*kw == "item" || *kw == "material")
                        && (cell_lower.contains('#')
                            || cell_lower.contains("no.")
                            || cell_lower.contains("number"))
                    {
                        continue;
                    }
                    mapping.insert(*role, idx);
                    break;
                }
            }
        }
    }

    mapping
}

/// Scan the top rows of a table for the most plausible header row.
fn find_header_row(table: &[Vec<String>], max_rows: usize) -> (usize, HashMap<ColRole, usize>) {
    let mut best_idx = 0;
    let mut best_map: HashMap<ColRole, usize> = HashMap::new();
    let mut best_score: i32 = -1;

    for (i, row) in table.iter().take(max_rows).enumerate() {
        let col_map = identify_columns(row);
        let mut score = col_map.len() as i32;
        if col_map.contains_key(&ColRole::Description) {
            score += 2;
        }
        if score > best_score {
            best_map = col_map;
            best_idx = i;
            best_score = score;
        }
    }

    (best_idx, best_map)
}

/// Parse tables into raw line items. Returns the items plus debug info
/// (column mappings, row counts) for the debug artifact.
pub fn extract_from_tables(tables: &[Vec<Vec<String>>]) -> (Vec<RawLineItem>, Value) {
    let mut all_items: Vec<RawLineItem> = Vec::new();
    let mut tables_processed = 0usize;
    let mut column_mappings: Vec<Value> = Vec::new();

    for table in tables {
        if table.len() < 2 {
            continue;
        }
        tables_processed += 1;

        let (header_idx, mut col_map) = find_header_row(table, 6);
        column_mappings.push(json!({
            "header": table[header_idx],
            "header_row_index": header_idx,
            "roles_found": col_map.len(),
        }));

        if !col_map.contains_key(&ColRole::Description) {
            debug!(header = ?table[header_idx], "no description column identified, using first");
            col_map.insert(ColRole::Description, 0);
        }

        let desc_idx = col_map.get(&ColRole::Description).copied();
        let qty_idx = col_map.get(&ColRole::Quantity).copied();
        let uom_idx = col_map.get(&ColRole::Uom).copied();
        let uprice_idx = col_map.get(&ColRole::UnitPrice).copied();
        let amount_idx = col_map.get(&ColRole::Amount).copied();
        let sku_idx = col_map.get(&ColRole::Sku).copied();
        let mpn_idx = col_map.get(&ColRole::Mpn).copied();

        // Continuation rows may only merge into items of this table.
        let table_start = all_items.len();

        for row in table.iter().skip(header_idx + 1) {
            if row.iter().all(|c| c.trim().is_empty()) {
                continue;
            }

            let desc = clean_cell_value(safe_get(row, desc_idx).unwrap_or(""));
            if desc.is_empty() {
                continue;
            }
            if is_non_item(&desc) {
                continue;
            }

            let qty = safe_get(row, qty_idx).and_then(|v| parse_number(&clean_cell_value(v)));
            let uom_raw = safe_get(row, uom_idx)
                .map(clean_cell_value)
                .filter(|v| !v.is_empty());
            let unit_price =
                safe_get(row, uprice_idx).and_then(|v| parse_number(&clean_cell_value(v)));
            let amount = safe_get(row, amount_idx).and_then(|v| parse_number(&clean_cell_value(v)));
            let sku = safe_get(row, sku_idx)
                .map(clean_cell_value)
                .filter(|v| !v.is_empty());
            let mpn = safe_get(row, mpn_idx)
                .map(clean_cell_value)
                .filter(|v| !v.is_empty());

            // Continuation row: description but no qty and no price.
            if qty.is_none() && unit_price.is_none() && amount.is_none() {
                if all_items.len() > table_start {
                    let prev = all_items.last_mut().expect("checked non-empty");
                    prev.description = format!("{} {}", prev.description, desc).trim().to_string();
                    if prev.sku.is_none() {
                        prev.sku = sku;
                    }
                    if prev.mpn.is_none() {
                        prev.mpn = mpn;
                    }
                    continue;
                }
            }

            all_items.push(RawLineItem {
                description: desc,
                quantity: qty,
                uom_raw,
                unit_price,
                amount,
                sku,
                mpn,
            });
        }
    }

    let items = merge_orphaned_descriptions(all_items);
    let debug_info = json!({
        "tables_processed": tables_processed,
        "column_mappings": column_mappings,
    });
    (items, debug_info)
}

/// Fallback: parse line items out of raw text blocks. First tries pipe
/// tables embedded in the text, then regex line matching.
pub fn extract_from_text(text_blocks: &[String]) -> (Vec<RawLineItem>, Value) {
    let combined = text_blocks.join("\n");

    let pipe_tables = detect_pipe_tables(&combined);
    if !pipe_tables.is_empty() {
        let (items, tbl_debug) = extract_from_tables(&pipe_tables);
        if !items.is_empty() {
            let debug_info = json!({
                "method": "pipe_table_from_text",
                "pipe_tables_found": pipe_tables.len(),
                "tables": tbl_debug,
            });
            return (items, debug_info);
        }
    }

    let mut all_items: Vec<RawLineItem> = Vec::new();
    let mut matched_lines: Vec<String> = Vec::new();

    for line in combined.lines() {
        let line = clean_cell_value(line);
        if line.is_empty() {
            continue;
        }
        if is_non_item(&line) {
            continue;
        }

        if let Some(caps) = TEXT_LINE_RE.captures(&line) {
            let desc = clean_cell_value(&caps["desc"]);
            let qty = parse_number(&caps["qty"]);
            let uom = caps.name("uom").map(|m| m.as_str().trim().to_uppercase());
            let price = parse_number(&caps["price"]);

            matched_lines.push(line.clone());
            all_items.push(RawLineItem {
                description: desc,
                quantity: qty,
                uom_raw: uom,
                unit_price: price,
                amount: None,
                sku: None,
                mpn: None,
            });
        } else if !all_items.is_empty() && !DECIMAL_RE.is_match(&line) && line.len() > 3 {
            // Wrapped description line: fold into the previous item.
            let prev = all_items.last_mut().expect("checked non-empty");
            prev.description = format!("{} {}", prev.description, line).trim().to_string();
        }
    }

    let items = merge_orphaned_descriptions(all_items);
    let debug_info = json!({
        "method": "text_heuristic",
        "matched_lines": matched_lines,
    });
    (items, debug_info)
}

/// Detect markdown pipe tables embedded in text and parse them.
fn detect_pipe_tables(text: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut current: Vec<String> = Vec::new();

    let flush = |current: &mut Vec<String>, tables: &mut Vec<Vec<Vec<String>>>| {
        if current.len() >= 2 {
            let table = parse_pipe_rows(current);
            if table.len() >= 2 {
                tables.push(table);
            }
        }
        current.clear();
    };

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.starts_with('|') && stripped.ends_with('|') && stripped.matches('|').count() >= 3
        {
            current.push(stripped.to_string());
        } else if is_pipe_separator(stripped) && !current.is_empty() {
            current.push(stripped.to_string());
        } else {
            flush(&mut current, &mut tables);
        }
    }
    flush(&mut current, &mut tables);

    tables
}

/// True for separator rows like `|---|---|`.
fn is_pipe_separator(line: &str) -> bool {
    let stripped = line.trim().trim_matches('|').trim();
    !stripped.is_empty() && PIPE_SEPARATOR_RE.is_match(stripped)
}

fn parse_pipe_rows(lines: &[String]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for line in lines {
        if is_pipe_separator(line) {
            continue;
        }
        let mut cells: Vec<&str> = line.split('|').collect();
        if cells.first().is_some_and(|c| c.trim().is_empty()) {
            cells.remove(0);
        }
        if cells.last().is_some_and(|c| c.trim().is_empty()) {
            cells.pop();
        }
        let cleaned: Vec<String> = cells.iter().map(|c| clean_cell_value(c)).collect();
        if cleaned.iter().any(|c| !c.is_empty()) {
            rows.push(cleaned);
        }
    }
    rows
}

/// Merge rows that carry only a description into the item above them.
/// Those rows are continuation lines, never standalone items.
fn merge_orphaned_descriptions(items: Vec<RawLineItem>) -> Vec<RawLineItem> {
    let mut merged: Vec<RawLineItem> = Vec::new();
    for item in items {
        let is_orphan = !item.description.is_empty()
            && item.quantity.is_none()
            && item.unit_price.is_none()
            && item.amount.is_none()
            && item.mpn.is_none();

        if is_orphan && !merged.is_empty() {
            let prev = merged.last_mut().expect("checked non-empty");
            prev.description =
                format!("{} {}", prev.description, item.description).trim().to_string();
            if prev.sku.is_none() {
                prev.sku = item.sku;
            }
            if prev.uom_raw.is_none() {
                prev.uom_raw = item.uom_raw;
            }
        } else {
            merged.push(item);
        }
    }
    merged
}

/// Main entrypoint: parse line items from an extraction result.
pub fn extract_line_items(extraction: &Extraction) -> (Vec<RawLineItem>, Value) {
    if !extraction.tables.is_empty() {
        let (items, tbl_debug) = extract_from_tables(&extraction.tables);
        if !items.is_empty() {
            return (items, json!({"method": "tables", "tables": tbl_debug}));
        }
    }

    if !extraction.text_blocks.is_empty() {
        let (items, txt_debug) = extract_from_text(&extraction.text_blocks);
        if !items.is_empty() {
            return (items, json!({"method": "text_fallback", "text": txt_debug}));
        }
    }

    (Vec::new(), json!({"method": "none"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn non_items_detected() {
        for text in [
            "Subtotal",
            "SUBTOTAL",
            "Sub Total",
            "Total",
            "Grand Total",
            "Sales Tax",
            "GST",
            "Freight",
            "Shipping",
            "Discount",
            "Round Off",
            "Payment",
            "Balance Due",
            "Invoice Total",
        ] {
            assert!(is_non_item(text), "{text:?} should be flagged as non-item");
        }
    }

    #[test]
    fn real_items_pass_filter() {
        for text in [
            "Nitrile Gloves Large",
            "Paper Towels 25/CS",
            "Cleaning Solution 1 GAL",
            "Widget A-100",
        ] {
            assert!(!is_non_item(text), "{text:?} should not be flagged");
        }
    }

    #[test]
    fn continuation_row_merged() {
        let t = table(&[
            &["Description", "Qty", "UOM", "Unit Price", "Amount"],
            &["Nitrile Gloves Large", "5", "CS", "24.99", "124.95"],
            &["Blue, Powder-Free", "", "", "", ""],
            &["Paper Towels", "10", "EA", "3.50", "35.00"],
        ]);
        let (items, _) = extract_from_tables(&[t]);
        assert_eq!(items.len(), 2);
        assert!(items[0].description.contains("Blue, Powder-Free"));
        assert_eq!(items[1].description, "Paper Towels");
    }

    #[test]
    fn non_items_filtered_from_table() {
        let t = table(&[
            &["Description", "Qty", "Unit Price", "Amount"],
            &["Widget A", "2", "10.00", "20.00"],
            &["Subtotal", "", "", "20.00"],
            &["Tax", "", "", "1.60"],
            &["Total", "", "", "21.60"],
        ]);
        let (items, _) = extract_from_tables(&[t]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Widget A");
    }

    #[test]
    fn empty_and_tiny_tables_handled() {
        let (items, _) = extract_from_tables(&[Vec::new()]);
        assert!(items.is_empty());

        let (items, _) = extract_from_tables(&[table(&[&["Header1", "Header2"]])]);
        assert!(items.is_empty());
    }

    #[test]
    fn alternate_header_names_map() {
        let t = table(&[
            &["Particulars", "Qnty", "U/M", "Rate", "Extension"],
            &["Mop Head Industrial", "3", "EA", "8.50", "25.50"],
        ]);
        let (items, _) = extract_from_tables(&[t]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Mop Head Industrial");
        assert_eq!(items[0].quantity, Some(3.0));
        assert_eq!(items[0].uom_raw.as_deref(), Some("EA"));
    }

    #[test]
    fn sku_and_mpn_extracted() {
        let t = table(&[
            &["SKU", "Description", "Qty", "MFG #", "Price", "Amount"],
            &["SK-001", "Bolt 1/4-20", "100", "MFR-B14", "0.10", "10.00"],
        ]);
        let (items, _) = extract_from_tables(&[t]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sku.as_deref(), Some("SK-001"));
        assert_eq!(items[0].mpn.as_deref(), Some("MFR-B14"));
    }

    #[test]
    fn text_line_parsing() {
        let blocks = vec![
            "Invoice #12345".to_string(),
            "Widget Alpha Model X-200A    2    EA    15.99".to_string(),
            "Gadget Beta ZZ-100B          1         29.95".to_string(),
            "Subtotal                                        61.93".to_string(),
        ];
        let (items, _) = extract_from_text(&blocks);
        assert!(!items.is_empty());
        assert!(items[0].description.contains("Widget"));
        let descs: Vec<&str> = items.iter().map(|i| i.description.as_str()).collect();
        assert!(!descs.iter().any(|d| d.contains("Subtotal")));
    }

    #[test]
    fn pipe_tables_detected_in_text() {
        let blocks = vec![
            "| Description | Qty | Unit Price | Amount |".to_string(),
            "|---|---|---|---|".to_string(),
            "| Trash Liners 33gal | 4 | 18.00 | 72.00 |".to_string(),
        ]
        .join("\n")
        .split('\n')
        .map(String::from)
        .collect::<Vec<_>>();
        let (items, debug_info) = extract_from_text(&blocks);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Trash Liners 33gal");
        assert_eq!(debug_info["method"], "pipe_table_from_text");
    }

    #[test]
    fn orphan_descriptions_merge_upward() {
        let items = vec![
            RawLineItem {
                description: "Heavy Duty Drill".to_string(),
                quantity: Some(2.0),
                unit_price: Some(45.0),
                ..RawLineItem::default()
            },
            RawLineItem {
                description: "18v Lithium".to_string(),
                ..RawLineItem::default()
            },
        ];
        let merged = merge_orphaned_descriptions(items);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].description, "Heavy Duty Drill 18v Lithium");
    }

    #[test]
    fn parse_number_strips_currency_noise() {
        assert_eq!(parse_number("$1,234.56"), Some(1234.56));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("-"), None);
        assert_eq!(parse_number("n/a"), None);
    }
}
