//! Fact pipeline tests: FK resolution, orphan reporting, load atomicity

mod helpers;

use helpers::*;

use taxdw_etl::extract::MemoryExtractor;
use taxdw_etl::model::{ValidationStatus, UNKNOWN_KEY};
use taxdw_etl::sink::Sink;

/// Scenario C: ten filings, one referencing an unknown party. The load
/// succeeds, the referential-integrity validator reports the orphan, and
/// the run fails overall.
#[tokio::test]
async fn orphan_fact_surfaces_through_validation() {
    let (sink, sequence, audit) = memory_seams();
    let manifest = manifest(vec![party_mapping(), filing_mapping()], vec![]);

    let parties = vec![party_row("P-1", "Alpha Holdings"), party_row("P-2", "Beta Ltd")];
    let mut filings: Vec<_> = (0..9)
        .map(|i| {
            filing_row(
                &format!("F-{i}"),
                if i % 2 == 0 { "P-1" } else { "P-2" },
                "2025-06-15",
                100.0 + i as f64,
            )
        })
        .collect();
    filings.push(filing_row("F-9", "P-404", "2025-06-15", 42.0));

    let extractor = MemoryExtractor::new()
        .with_table("l2_party", parties)
        .with_table("l2_filing", filings);

    let report = engine(extractor, &sink, &sequence, &audit)
        .run(&manifest)
        .await
        .unwrap();

    // Every row loaded; the miss did not abort the load
    assert_eq!(sink.count("fact_filing").await.unwrap(), 10);

    let orphan_check = report
        .validation
        .referential_integrity
        .iter()
        .find(|r| r.check_name == "referential:fact_filing.party_key")
        .unwrap();
    assert_eq!(orphan_check.status, ValidationStatus::Fail);
    assert_eq!(orphan_check.details["orphan_records"], 1);
    assert_eq!(report.status, ValidationStatus::Fail);
}

/// FK total coverage: every loaded fact row carries a key that is either a
/// current surrogate or the sentinel, never absent.
#[tokio::test]
async fn every_fact_row_carries_a_resolved_or_sentinel_key() {
    let (sink, sequence, audit) = memory_seams();
    let manifest = manifest(vec![party_mapping(), filing_mapping()], vec![]);

    let extractor = MemoryExtractor::new()
        .with_table("l2_party", vec![party_row("P-1", "Alpha")])
        .with_table(
            "l2_filing",
            vec![
                filing_row("F-1", "P-1", "2025-06-15", 10.0),
                filing_row("F-2", "P-MISSING", "2025-06-15", 20.0),
            ],
        );

    engine(extractor, &sink, &sequence, &audit)
        .run(&manifest)
        .await
        .unwrap();

    let current = sink.fetch_current_dimension("dim_party").await.unwrap();
    let known: Vec<i64> = current.iter().map(|r| r.surrogate_key).collect();

    let rows = sink.fetch_rows("fact_filing").await.unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let key = row["party_key"].as_i64().unwrap();
        assert!(
            key == UNKNOWN_KEY || known.contains(&key),
            "key {key} is neither current nor sentinel"
        );
    }
}

/// Date keys land as YYYYMMDD integers inside the calendar range
#[tokio::test]
async fn date_keys_convert_and_validate() {
    let (sink, sequence, audit) = memory_seams();
    let manifest = manifest(vec![party_mapping(), filing_mapping()], vec![]);

    let mut undated = filing_row("F-2", "P-1", "2025-06-15", 5.0);
    undated.set("filing_date", serde_json::Value::Null);

    let extractor = MemoryExtractor::new()
        .with_table("l2_party", vec![party_row("P-1", "Alpha")])
        .with_table(
            "l2_filing",
            vec![filing_row("F-1", "P-1", "2025-06-15", 10.0), undated],
        );

    let report = engine(extractor, &sink, &sequence, &audit)
        .run(&manifest)
        .await
        .unwrap();

    let rows = sink.fetch_rows("fact_filing").await.unwrap();
    let keys: Vec<i64> = rows
        .iter()
        .map(|r| r["filing_date_key"].as_i64().unwrap())
        .collect();
    assert!(keys.contains(&20250615));
    assert!(keys.contains(&0), "null date maps to key 0");

    let calendar_check = report
        .validation
        .business_rules
        .iter()
        .find(|r| r.check_name == "calendar_range:fact_filing.filing_date_key")
        .unwrap();
    assert_eq!(
        calendar_check.status,
        ValidationStatus::Pass,
        "the null-date key is always inside the range"
    );
}

/// A failing chunk mid-swap must leave the previous load visible and mark
/// the mapping failed, without failing sibling mappings' committed work.
#[tokio::test]
async fn interrupted_full_reload_is_atomic() {
    let (sink, sequence, audit) = memory_seams();
    let mut fact = filing_mapping();
    fact.chunk_size = 2;
    let manifest = manifest(vec![party_mapping(), fact], vec![]);

    let filings: Vec<_> = (0..6)
        .map(|i| filing_row(&format!("F-{i}"), "P-1", "2025-06-15", i as f64))
        .collect();

    let extractor = MemoryExtractor::new()
        .with_table("l2_party", vec![party_row("P-1", "Alpha")])
        .with_table("l2_filing", filings.clone());
    engine(extractor, &sink, &sequence, &audit)
        .run(&manifest)
        .await
        .unwrap();
    assert_eq!(sink.count("fact_filing").await.unwrap(), 6);

    // Second run dies on the second chunk
    sink.fail_swap_at_chunk("fact_filing", 1).await;
    let extractor = MemoryExtractor::new()
        .with_table("l2_party", vec![party_row("P-1", "Alpha")])
        .with_table("l2_filing", filings);
    let report = engine(extractor, &sink, &sequence, &audit)
        .run(&manifest)
        .await
        .unwrap();

    assert_eq!(report.status, ValidationStatus::Fail);
    assert_eq!(
        sink.count("fact_filing").await.unwrap(),
        6,
        "interrupted swap must not leave a half-loaded table"
    );

    let failed = report
        .executions
        .iter()
        .find(|r| r.mapping_id == "map_fact_filing")
        .unwrap();
    assert_eq!(failed.status, taxdw_etl::model::ExecutionStatus::Failed);
    assert!(failed.error_message.as_deref().unwrap().contains("chunk"));

    // The dimension sibling committed normally in the same run
    let dimension = report
        .executions
        .iter()
        .find(|r| r.mapping_id == "map_dim_party")
        .unwrap();
    assert_eq!(dimension.status, taxdw_etl::model::ExecutionStatus::Succeeded);
}
