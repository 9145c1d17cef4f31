// src/price.rs
//
// Deterministic price-per-base-unit computation with a transparent
// formula trace.

use crate::uom::{is_each_uom, is_pack_uom, normalize_uom_code};
use serde::Serialize;

/// Debug trace describing which formula produced the result.
#[derive(Debug, Clone, Serialize)]
pub struct PriceTrace {
    pub formula: String,
    pub result: Option<f64>,
}

/// Round to 6 decimal places so results are stable in tests and storage.
fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Compute the price per base unit (EA) for one line item.
///
/// Candidate price is the direct unit price, else amount/quantity. A
/// pack-type UOM divides the candidate by the pack quantity; an unknown
/// pack quantity yields `None`; a pack size is never guessed.
pub fn compute_price_per_base_unit(
    unit_price: Option<f64>,
    amount: Option<f64>,
    quantity: Option<f64>,
    original_uom: Option<&str>,
    pack_qty: Option<u32>,
) -> (Option<f64>, PriceTrace) {
    let (candidate, formula) = match (unit_price, amount, quantity) {
        (Some(up), _, _) => (up, format!("unit_price={up}")),
        (None, Some(amt), Some(qty)) if qty > 0.0 => {
            (amt / qty, format!("amount({amt})/qty({qty})"))
        }
        _ => {
            return (
                None,
                PriceTrace {
                    formula: "insufficient data".to_string(),
                    result: None,
                },
            );
        }
    };

    if let Some(raw) = original_uom {
        let canonical = normalize_uom_code(raw);

        if is_each_uom(&canonical) {
            let result = round6(candidate);
            return (
                Some(result),
                PriceTrace {
                    formula,
                    result: Some(result),
                },
            );
        }

        if is_pack_uom(&canonical) {
            return match pack_qty {
                Some(pq) if pq > 0 => {
                    let result = round6(candidate / pq as f64);
                    (
                        Some(result),
                        PriceTrace {
                            formula: format!("({formula})/{pq}(pack_qty)"),
                            result: Some(result),
                        },
                    )
                }
                _ => (
                    None,
                    PriceTrace {
                        formula: format!("{formula} — pack UOM but pack_qty unknown"),
                        result: None,
                    },
                ),
            };
        }
    }

    // No usable UOM: treat the candidate as per-unit, flagged as an assumption.
    let result = round6(candidate);
    (
        Some(result),
        PriceTrace {
            formula: format!("{formula} (no UOM, assume per-unit)"),
            result: Some(result),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_uom_passes_unit_price_through() {
        let (price, trace) =
            compute_price_per_base_unit(Some(3.50), None, Some(10.0), Some("EA"), Some(1));
        assert_eq!(price, Some(3.50));
        assert_eq!(trace.formula, "unit_price=3.5");
    }

    #[test]
    fn pack_uom_divides_by_pack_qty() {
        let (price, trace) =
            compute_price_per_base_unit(Some(24.99), None, None, Some("CS"), Some(25));
        assert_eq!(price, Some(0.9996));
        assert!(trace.formula.contains("25(pack_qty)"));
    }

    #[test]
    fn pack_uom_without_pack_qty_is_null() {
        let (price, trace) =
            compute_price_per_base_unit(Some(24.99), None, None, Some("CS"), None);
        assert_eq!(price, None);
        assert!(trace.formula.contains("pack_qty unknown"));
    }

    #[test]
    fn amount_over_quantity_when_no_unit_price() {
        let (price, _) =
            compute_price_per_base_unit(None, Some(35.00), Some(10.0), Some("EA"), Some(1));
        assert_eq!(price, Some(3.50));
    }

    #[test]
    fn zero_quantity_is_insufficient() {
        let (price, trace) =
            compute_price_per_base_unit(None, Some(35.00), Some(0.0), Some("EA"), None);
        assert_eq!(price, None);
        assert_eq!(trace.formula, "insufficient data");
    }

    #[test]
    fn no_price_fields_is_insufficient() {
        let (price, trace) = compute_price_per_base_unit(None, None, None, None, None);
        assert_eq!(price, None);
        assert_eq!(trace.formula, "insufficient data");
    }

    #[test]
    fn missing_uom_assumes_per_unit() {
        let (price, trace) = compute_price_per_base_unit(Some(9.99), None, None, None, None);
        assert_eq!(price, Some(9.99));
        assert!(trace.formula.contains("assume per-unit"));
    }

    #[test]
    fn raw_alias_is_normalised_before_classification() {
        // "CASE" must behave exactly like "CS".
        let (price, _) =
            compute_price_per_base_unit(Some(12.00), None, None, Some("CASE"), Some(12));
        assert_eq!(price, Some(1.0));
    }

    #[test]
    fn results_round_to_six_decimals() {
        let (price, _) = compute_price_per_base_unit(Some(10.0), None, None, Some("CS"), Some(3));
        assert_eq!(price, Some(3.333333));
    }
}
