//! Row-count reconciliation between source extraction and loaded target

use serde_json::json;

use crate::model::ValidationResult;

use super::LoadSummary;

/// PASS iff `target_count == round(source_count * expected_ratio)`.
/// The failure details carry the signed difference and the observed ratio.
pub fn validate_row_counts(summaries: &[LoadSummary]) -> Vec<ValidationResult> {
    summaries
        .iter()
        .map(|summary| {
            let expected = (summary.source_count as f64 * summary.expected_ratio).round() as i64;
            let actual = summary.target_count as i64;
            let difference = actual - expected;
            let observed_ratio = if summary.source_count == 0 {
                if actual == 0 {
                    summary.expected_ratio
                } else {
                    f64::INFINITY
                }
            } else {
                actual as f64 / summary.source_count as f64
            };

            let check_name = format!("row_count:{}", summary.target_table);
            let details = json!({
                "mapping_id": summary.mapping_id,
                "source_count": summary.source_count,
                "target_count": summary.target_count,
                "expected_ratio": summary.expected_ratio,
                "expected_count": expected,
                "difference": difference,
                "ratio": observed_ratio,
            });

            if difference == 0 {
                ValidationResult::pass(check_name, details)
            } else {
                ValidationResult::fail(check_name, details)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValidationStatus;

    fn summary(source: u64, target: u64, ratio: f64) -> LoadSummary {
        LoadSummary {
            mapping_id: "map_fact_filing".to_string(),
            target_table: "fact_filing".to_string(),
            source_count: source,
            target_count: target,
            expected_ratio: ratio,
        }
    }

    #[test]
    fn test_exact_match_passes() {
        let results = validate_row_counts(&[summary(100, 100, 1.0)]);
        assert_eq!(results[0].status, ValidationStatus::Pass);
    }

    #[test]
    fn test_shortfall_fails_with_difference() {
        let results = validate_row_counts(&[summary(100, 97, 1.0)]);
        assert_eq!(results[0].status, ValidationStatus::Fail);
        assert_eq!(results[0].details["difference"], -3);
        assert_eq!(results[0].details["ratio"], 0.97);
    }

    #[test]
    fn test_expected_ratio_applies() {
        // A filtering mapping expected to keep half its input
        let results = validate_row_counts(&[summary(200, 100, 0.5)]);
        assert_eq!(results[0].status, ValidationStatus::Pass);

        let results = validate_row_counts(&[summary(200, 120, 0.5)]);
        assert_eq!(results[0].status, ValidationStatus::Fail);
        assert_eq!(results[0].details["difference"], 20);
    }

    #[test]
    fn test_empty_source_and_target_passes() {
        let results = validate_row_counts(&[summary(0, 0, 1.0)]);
        assert_eq!(results[0].status, ValidationStatus::Pass);
    }
}
