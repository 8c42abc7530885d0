//! End-to-end import scenarios over the in-memory adapters

mod common;

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use efd_import::config::ImportConfig;
use efd_import::framework::{ImportWorker, JobRecord, JobStatus, SliceResult};
use efd_import::ledger::{
    CounterpartyRow, Destination, Family, ImportScope, LedgerRecord, FINAL_CONSUMER,
    UNIDENTIFIED_SUPPLIER,
};
use efd_import::memory::{MemoryMaterializer, MemorySink, MemorySource};

use common::*;

fn amount(raw: &str) -> BigDecimal {
    BigDecimal::from_str(raw).unwrap()
}

fn with_line_budget(lines: u64) -> ImportConfig {
    ImportConfig {
        slice_line_budget: lines,
        ..config()
    }
}

/// Contributions-layout file mixing registries, goods and a freight aggregate
fn mixed_file() -> Vec<u8> {
    let goods_in = goods("0", "F1", 1, "1.500,00");
    let goods_out = goods("1", "", 2, "200,00");
    let goods_late = goods("0", "F1", 3, "10,00");
    let freight_first = freight(900);
    let freight_second = freight(901);

    file(&[
        HEADER_CONTRIB,
        PARTNER,
        &goods_in,
        &goods_out,
        &freight_first,
        FREIGHT_PIS,
        FREIGHT_COFINS,
        &goods_late,
        &freight_second,
        FREIGHT_PIS,
        "|9999|11|",
    ])
}

async fn ledger_rows(harness: &Harness, family: Family) -> Vec<LedgerRecord> {
    let mut rows = harness.sink.ledger(family).await;
    rows.sort_by_key(LedgerRecord::dedup_key);
    rows
}

async fn counterparty_rows(harness: &Harness) -> Vec<CounterpartyRow> {
    let mut rows = harness.sink.counterparties().await;
    rows.sort_by(|a, b| a.code.cmp(&b.code));
    rows
}

#[tokio::test]
async fn test_header_and_movement_example() {
    let header = "|0000|003|0||01012024|31012024|EMPRESA X|12345678000190|...";
    let movement = format!("|C100|0|1||55|00|1|1||05012024||1500,00|{}", "0|".repeat(16));
    let body = file(&[header, &movement]);
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let rows = harness.sink.ledger(Family::Goods).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, amount("1500.00"));
    assert_eq!(rows[0].counterparty_code, UNIDENTIFIED_SUPPLIER);
    assert_eq!(rows[0].period, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
}

#[tokio::test]
async fn test_completed_job_bookkeeping() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let job = harness.reload(&job).await;
    assert_eq!(job.progress, 100);
    assert_eq!(job.bytes_processed, body.len() as i64);
    assert_eq!(job.chunk_number, 1);
    assert_eq!(job.total_lines_processed, 11);
    assert!(job.counts.checkpoint.is_none());
    assert!(job.counts.downstream_error.is_none());
    assert_eq!(job.counts.lines_by_tag.get("C100"), Some(&3));
    assert_eq!(job.counts.lines_by_tag.get("9999"), Some(&1));
    assert_eq!(job.counts.inserted.get("goods_movements"), Some(&3));
    assert_eq!(job.counts.inserted.get("freight_documents"), Some(&2));
    assert_eq!(harness.materializer.calls().await, vec![job.id]);
}

#[tokio::test]
async fn test_resume_matches_single_slice() {
    let body = mixed_file();

    let single = HarnessBuilder::new(body.clone()).build();
    let job = single.job(body.len()).await;
    assert_eq!(single.run(&job).await, JobStatus::Completed);

    for budget in [1, 2, 3, 5] {
        let sliced = HarnessBuilder::new(body.clone())
            .config(with_line_budget(budget))
            .build();
        let job = sliced.job(body.len()).await;
        assert_eq!(sliced.run(&job).await, JobStatus::Completed);

        let job = sliced.reload(&job).await;
        assert!(job.chunk_number > 1, "budget {} should need several slices", budget);
        assert_eq!(job.total_lines_processed, 11);
        assert_eq!(job.progress, 100);

        for family in Family::ALL {
            assert_eq!(
                ledger_rows(&sliced, family).await,
                ledger_rows(&single, family).await,
                "family {:?} differs with a budget of {} lines",
                family,
                budget
            );
        }
        assert_eq!(counterparty_rows(&sliced).await, counterparty_rows(&single).await);
    }
}

#[tokio::test]
async fn test_undeclared_partner_resolves_the_same_after_resume() {
    let undeclared = goods("0", "F9", 1, "10,00");
    let declared = goods("0", "F1", 2, "20,00");
    let body = file(&[HEADER_CONTRIB, PARTNER, &undeclared, &declared]);

    let single = HarnessBuilder::new(body.clone()).build();
    let job = single.job(body.len()).await;
    assert_eq!(single.run(&job).await, JobStatus::Completed);

    let expected = ledger_rows(&single, Family::Goods).await;
    let codes: Vec<&str> = expected
        .iter()
        .map(|row| row.counterparty_code.as_str())
        .collect();
    assert!(codes.contains(&UNIDENTIFIED_SUPPLIER));
    assert!(codes.contains(&"F1"));

    for budget in [1, 2, 3] {
        let sliced = HarnessBuilder::new(body.clone())
            .config(with_line_budget(budget))
            .build();
        let job = sliced.job(body.len()).await;
        assert_eq!(sliced.run(&job).await, JobStatus::Completed);
        assert_eq!(
            ledger_rows(&sliced, Family::Goods).await,
            expected,
            "budget {} resolved partners differently",
            budget
        );
    }
}

#[tokio::test]
async fn test_aggregate_survives_slice_boundary() {
    let first = freight(900);
    let goods_line = goods("0", "", 1, "10,00");
    let body = file(&[HEADER_CONTRIB, &first, FREIGHT_PIS, FREIGHT_COFINS, &goods_line]);

    // Cut after the primary record and again between the two sub-totals
    let harness = HarnessBuilder::new(body.clone())
        .config(with_line_budget(2))
        .build();
    let job = harness.job(body.len()).await;
    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let rows = harness.sink.ledger(Family::Freight).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, amount("300.00"));
    assert_eq!(rows[0].icms, amount("36.00"));
    assert_eq!(rows[0].pis, amount("4.95"));
    assert_eq!(rows[0].cofins, amount("22.80"));
}

#[tokio::test]
async fn test_checkpoint_holds_open_aggregate() {
    let first = freight(900);
    let body = file(&[HEADER_CONTRIB, &first, FREIGHT_PIS, FREIGHT_COFINS]);
    let harness = HarnessBuilder::new(body.clone())
        .config(with_line_budget(2))
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(
        harness.scheduler.run_slice(job.id).await.unwrap(),
        SliceResult::Continue
    );

    let job = harness.reload(&job).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.chunk_number, 1);
    assert_eq!(job.bytes_processed as u64, offset_after(&body, 2));
    assert!(job.progress < 100);
    assert!(harness.sink.ledger(Family::Freight).await.is_empty());

    let checkpoint = job.counts.checkpoint.expect("cutoff should leave a checkpoint");
    let pending = checkpoint["pending"].as_array().expect("pending slots");
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_unterminated_aggregate_is_flushed_at_end_of_input() {
    let first = freight(900);
    let body = file(&[HEADER_CONTRIB, &first, FREIGHT_PIS]);
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let rows = harness.sink.ledger(Family::Freight).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pis, amount("4.95"));
    assert_eq!(rows[0].cofins, amount("0"));
}

#[tokio::test]
async fn test_movements_before_header_are_never_written() {
    let early = goods("0", "", 1, "10,00");
    let late = goods("0", "", 2, "20,00");
    let body = file(&[&early, HEADER_CONTRIB, &late]);
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let rows = harness.sink.ledger(Family::Goods).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].document_number, "2");
    assert_eq!(harness.reload(&job).await.counts.dropped, 1);
}

#[tokio::test]
async fn test_sentinel_counterparties() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;
    harness.run(&job).await;

    let codes: Vec<String> = counterparty_rows(&harness)
        .await
        .into_iter()
        .map(|row| row.code)
        .collect();
    assert_eq!(
        codes,
        vec![
            "CONSUMIDOR_FINAL".to_string(),
            "F1".to_string(),
            "FORNECEDOR_NAO_IDENTIFICADO".to_string(),
        ]
    );

    let goods = harness.sink.ledger(Family::Goods).await;
    let outbound = goods
        .iter()
        .find(|row| row.document_number == "2")
        .expect("outbound document");
    assert_eq!(outbound.counterparty_code, FINAL_CONSUMER);
    assert!(goods
        .iter()
        .filter(|row| row.document_number != "2")
        .all(|row| row.counterparty_code == "F1"));

    // Sentinels are flushed before the movements that reference them
    let log = harness.sink.write_log().await;
    assert_eq!(log.first(), Some(&Destination::Counterparties));
}

#[tokio::test]
async fn test_quota_halts_once_every_family_is_full() {
    let first = goods("0", "", 1, "10,00");
    let second = goods("0", "", 2, "20,00");
    let third = goods("0", "", 3, "30,00");
    let service_line = service();
    let body = file(&[
        HEADER_ICMS,
        &first,
        UTILITY_ICMS,
        &service_line,
        &second,
        &third,
    ]);
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness
        .enqueue(
            JobRecord::new(uuid::Uuid::new_v4(), FILE, body.len() as i64)
                .with_scope(ImportScope::Movements)
                .with_record_limit(1),
        )
        .await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    assert_eq!(harness.sink.ledger(Family::Goods).await.len(), 1);
    assert_eq!(harness.sink.ledger(Family::Utility).await.len(), 1);
    assert_eq!(harness.sink.ledger(Family::Service).await.len(), 1);

    let job = harness.reload(&job).await;
    assert_eq!(job.bytes_processed as u64, offset_after(&body, 4));
    assert_eq!(job.counts.emitted.get(&Family::Goods), Some(&1));
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn test_quota_counts_across_slices() {
    let lines: Vec<String> = (1..=5).map(|n| goods("0", "", n, "10,00")).collect();
    let mut all: Vec<&str> = vec![HEADER_CONTRIB];
    all.extend(lines.iter().map(String::as_str));
    let body = file(&all);

    let harness = HarnessBuilder::new(body.clone())
        .config(with_line_budget(2))
        .build();
    let job = harness
        .enqueue(
            JobRecord::new(uuid::Uuid::new_v4(), FILE, body.len() as i64).with_record_limit(3),
        )
        .await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let goods = harness.sink.ledger(Family::Goods).await;
    assert_eq!(goods.len(), 3);
    assert_eq!(harness.reload(&job).await.counts.emitted.get(&Family::Goods), Some(&3));
}

#[tokio::test]
async fn test_scope_excludes_other_families() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness
        .enqueue(
            JobRecord::new(uuid::Uuid::new_v4(), FILE, body.len() as i64)
                .with_scope(ImportScope::Transport),
        )
        .await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    assert!(harness.sink.ledger(Family::Goods).await.is_empty());
    assert_eq!(harness.sink.ledger(Family::Freight).await.len(), 2);
    assert_eq!(harness.reload(&job).await.counts.dropped, 0);
}

#[tokio::test]
async fn test_cancellation_stops_without_further_writes() {
    let lines: Vec<String> = (1..=5).map(|n| goods("0", "", n, "10,00")).collect();
    let mut all: Vec<&str> = vec![HEADER_CONTRIB];
    all.extend(lines.iter().map(String::as_str));
    let body = file(&all);

    let harness = HarnessBuilder::new(body.clone())
        .config(ImportConfig {
            batch_size: 1,
            cancel_check_interval: 1,
            ..config()
        })
        .build();
    let job = harness.job(body.len()).await;
    harness.jobs.cancel_after_checks(job.id, 3).await;

    assert_eq!(harness.run(&job).await, JobStatus::Cancelled);

    // Header plus two documents were processed and flushed before the check
    assert_eq!(harness.sink.ledger(Family::Goods).await.len(), 2);
    let job = harness.reload(&job).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(harness.materializer.calls().await.is_empty());

    assert_eq!(
        harness.scheduler.run_slice(job.id).await.unwrap(),
        SliceResult::Finished(JobStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_transport_error_retries_from_checkpoint() {
    let body = mixed_file();
    let resume_at = offset_after(&body, 3);
    let source = MemorySource::new()
        .with_file(FILE, body.clone())
        .fail_at(FILE, resume_at, 10, 1);

    let harness = HarnessBuilder::new(body.clone())
        .config(with_line_budget(3))
        .source(source)
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let reopened = harness
        .source
        .opens()
        .await
        .into_iter()
        .filter(|(_, offset)| *offset == resume_at)
        .count();
    assert_eq!(reopened, 2);

    let reference = HarnessBuilder::new(body.clone()).build();
    let reference_job = reference.job(body.len()).await;
    reference.run(&reference_job).await;
    for family in Family::ALL {
        assert_eq!(
            ledger_rows(&harness, family).await,
            ledger_rows(&reference, family).await
        );
    }
}

#[tokio::test]
async fn test_transport_retries_are_bounded() {
    let body = mixed_file();
    let resume_at = offset_after(&body, 3);
    let source = MemorySource::new()
        .with_file(FILE, body.clone())
        .fail_at(FILE, resume_at, 10, 100);

    let harness = HarnessBuilder::new(body.clone())
        .config(ImportConfig {
            max_transport_retries: 2,
            ..with_line_budget(3)
        })
        .source(source)
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Failed);

    let job = harness.reload(&job).await;
    let message = job.error_message.expect("failure message");
    assert!(message.contains("3 times"), "unexpected message: {}", message);
    assert_eq!(job.chunk_number, 1);
}

#[tokio::test]
async fn test_transport_error_without_checkpoint_fails() {
    let body = mixed_file();
    let source = MemorySource::new()
        .with_file(FILE, body.clone())
        .fail_at(FILE, 0, 10, 1);

    let harness = HarnessBuilder::new(body.clone()).source(source).build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Failed);
    assert!(harness.reload(&job).await.error_message.is_some());
}

#[tokio::test]
async fn test_missing_source_fails_job() {
    let harness = HarnessBuilder::new(Vec::new())
        .source(MemorySource::new())
        .build();
    let job = harness.job(100).await;

    assert_eq!(harness.run(&job).await, JobStatus::Failed);
    let message = harness.reload(&job).await.error_message.unwrap();
    assert!(message.contains(FILE));
}

#[tokio::test]
async fn test_fallback_insert_without_constraint() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone())
        .sink(MemorySink::new().without_constraint(Destination::Ledger(Family::Goods)))
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);
    assert_eq!(harness.sink.ledger(Family::Goods).await.len(), 3);
    assert_eq!(
        harness
            .sink
            .upsert_attempts(Destination::Ledger(Family::Goods))
            .await,
        1
    );
}

#[tokio::test]
async fn test_destination_failure_fails_job() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone())
        .sink(MemorySink::new().failing(Destination::Ledger(Family::Goods)))
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Failed);

    let job = harness.reload(&job).await;
    let message = job.error_message.expect("failure message");
    assert!(message.contains("goods_movements"), "unexpected message: {}", message);
    assert!(job.progress < 100);

    // What was read before the failing flush is kept
    assert_eq!(job.total_lines_processed, 11);
    assert_eq!(job.bytes_processed, body.len() as i64);
    assert_eq!(job.counts.lines_by_tag.get("C100"), Some(&3));
    assert!(job.counts.checkpoint.is_none());
}

#[tokio::test]
async fn test_destination_failure_in_later_slice_keeps_earlier_progress() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone())
        .config(with_line_budget(3))
        .sink(MemorySink::new().failing(Destination::Ledger(Family::Goods)))
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Failed);

    let job = harness.reload(&job).await;
    assert_eq!(job.chunk_number, 0);
    assert_eq!(job.total_lines_processed, 3);
    assert_eq!(job.bytes_processed, offset_after(&body, 3) as i64);
    assert!(job.progress > 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_destination_connection_retries_from_checkpoint() {
    let body = mixed_file();
    let retry_delay = ImportConfig::default().retry_delay();
    let harness = HarnessBuilder::new(body.clone())
        .config(ImportConfig {
            transport_retry_delay_ms: ImportConfig::default().transport_retry_delay_ms,
            ..with_line_budget(2)
        })
        .sink(MemorySink::new().disconnecting(Destination::Ledger(Family::Goods), 1))
        .build();
    let job = harness.job(body.len()).await;

    let started = tokio::time::Instant::now();
    assert_eq!(harness.run(&job).await, JobStatus::Completed);
    assert!(started.elapsed() >= retry_delay);

    let job = harness.reload(&job).await;
    assert!(job.error_message.is_none());

    let reference = HarnessBuilder::new(body.clone()).build();
    let reference_job = reference.job(body.len()).await;
    reference.run(&reference_job).await;
    for family in Family::ALL {
        assert_eq!(
            ledger_rows(&harness, family).await,
            ledger_rows(&reference, family).await
        );
    }
}

#[tokio::test]
async fn test_materialization_failure_is_not_fatal() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone())
        .materializer(MemoryMaterializer::failing())
        .build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let job = harness.reload(&job).await;
    assert_eq!(job.progress, 100);
    assert!(job.counts.downstream_error.is_some());
    assert!(job.error_message.is_none());
}

#[tokio::test]
async fn test_registered_establishment_becomes_active_branch() {
    let movement = goods("0", "", 1, "10,00");
    let body = file(&[
        HEADER_ICMS,
        "|0140|E1|FILIAL CENTRO|12.345.678/0002-71|SP|123|3550308|3550308|",
        "|C010|12345678000271|1|",
        &movement,
    ]);
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;

    assert_eq!(harness.run(&job).await, JobStatus::Completed);

    let branches = harness.branches.all(job.company_id).await;
    assert_eq!(branches.len(), 1);
    let (document, branch_id) = &branches[0];
    assert_eq!(document, "12345678000271");

    let spec = harness
        .branches
        .spec(job.company_id, document)
        .await
        .expect("branch spec");
    assert_eq!(spec.name.as_deref(), Some("FILIAL CENTRO"));

    let rows = harness.sink.ledger(Family::Goods).await;
    assert_eq!(rows[0].branch_id, Some(*branch_id));
}

#[tokio::test]
async fn test_finished_jobs_are_left_alone() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;
    harness.run(&job).await;
    let saves = harness.jobs.saves().await;

    assert_eq!(
        harness.scheduler.run_slice(job.id).await.unwrap(),
        SliceResult::Finished(JobStatus::Completed)
    );
    assert_eq!(harness.jobs.saves().await, saves);
    assert_eq!(harness.materializer.calls().await.len(), 1);
}

#[tokio::test]
async fn test_worker_claims_pending_jobs() {
    let body = mixed_file();
    let harness = HarnessBuilder::new(body.clone()).build();
    let job = harness.job(body.len()).await;
    let worker = ImportWorker::new(harness.scheduler.clone());

    assert_eq!(
        worker.run_once().await.unwrap(),
        Some((job.id, JobStatus::Completed))
    );
    assert_eq!(worker.run_once().await.unwrap(), None);
}
