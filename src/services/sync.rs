//! The sync job: pulls every configured stage from Knack into Postgres.
//!
//! - One sync-log row per run; a run resumed from a checkpoint reuses it.
//! - Each page is written in its own transaction, then the checkpoint is saved.
//! - The stop flag is checked between batches; an interrupted run keeps its
//!   checkpoint and is recorded as failed.

use crate::client::RecordSource;
use crate::config::Config;
use crate::db::models::sync_type;
use crate::models::knack::{KnackRecord, fields};
use crate::models::questions::QuestionCatalogue;
use crate::services::checkpoint::{self, Checkpoint, Stage};
use crate::services::establishments::{self, EstablishmentIndex};
use crate::services::interrupt::StopFlag;
use crate::services::{enrollment, responses, statistics, students, sync_log};
use chrono::{NaiveDate, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

pub const INTERRUPTED: &str = "interrupted";

/// Result of writing one page of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: u64,
    pub skipped: u64,
    /// Academic years that received score rows.
    pub academic_years: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEnd {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: i64,
    pub processed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed(RunSummary),
    Interrupted { run_id: i64 },
}

enum TxError {
    Batch(String),
    Db(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(e: diesel::result::Error) -> Self {
        TxError::Db(e)
    }
}

/// Run `f` in a transaction, rolling back when it returns an error.
pub fn in_transaction<T>(
    conn: &mut PgConnection,
    f: impl FnOnce(&mut PgConnection) -> Result<T, String>,
) -> Result<T, String> {
    conn.transaction::<T, TxError, _>(|c| f(c).map_err(TxError::Batch))
        .map_err(|e| match e {
            TxError::Batch(s) => s,
            TxError::Db(e) => format!("transaction failed: {}", e),
        })
}

fn knack_object(stage: Stage) -> Option<&'static str> {
    match stage {
        Stage::Establishments => Some(fields::ESTABLISHMENT_OBJECT),
        Stage::Staff => Some(fields::STAFF_OBJECT),
        Stage::Students => Some(fields::VESPA_OBJECT),
        Stage::QuestionResponses => Some(fields::QUESTIONNAIRE_OBJECT),
        Stage::Enrollments | Stage::Statistics => None,
    }
}

/// Page through one Knack object starting at the checkpoint's saved page.
///
/// `handle` writes one page; `persist` stores the checkpoint after each page.
#[allow(clippy::too_many_arguments)]
pub fn page_through<S, H, P>(
    source: &S,
    stage: Stage,
    object: &str,
    rows_per_page: NonZeroU32,
    checkpoint: &mut Checkpoint,
    stop: &StopFlag,
    mut handle: H,
    mut persist: P,
) -> Result<StageEnd, String>
where
    S: RecordSource + ?Sized,
    H: FnMut(&[KnackRecord]) -> Result<BatchOutcome, String>,
    P: FnMut(&Checkpoint) -> Result<(), String>,
{
    let mut page = checkpoint.resume_page(stage);
    if page > 1 {
        info!("{}: resuming at page {}", stage, page);
    }
    loop {
        if stop.is_stopped() {
            return Ok(StageEnd::Interrupted);
        }

        let fetched = source
            .fetch_page(object, page, rows_per_page)
            .map_err(|e| format!("fetch {} page {} failed: {}", stage, page, e))?;
        let outcome = handle(&fetched.records)?;

        checkpoint.academic_years.extend(outcome.academic_years);
        checkpoint.record_batch(stage, page + 1, outcome.processed, outcome.skipped);
        persist(checkpoint)?;
        info!(
            "{}: page {}/{} done ({} processed, {} skipped)",
            stage, page, fetched.total_pages, outcome.processed, outcome.skipped
        );

        if fetched.is_last() || fetched.records.is_empty() {
            return Ok(StageEnd::Completed);
        }
        page += 1;
    }
}

/// Rebuild statistics for each year. Every year is redone on resume, so the
/// stage's counts restart instead of adding to an interrupted attempt.
pub fn recompute_years<F>(
    years: &[String],
    checkpoint: &mut Checkpoint,
    stop: &StopFlag,
    mut recompute: F,
) -> Result<StageEnd, String>
where
    F: FnMut(&str) -> Result<u64, String>,
{
    checkpoint.reset_counts(Stage::Statistics);
    for year in years {
        if stop.is_stopped() {
            return Ok(StageEnd::Interrupted);
        }
        let rows = recompute(year)?;
        checkpoint.record_batch(Stage::Statistics, 1, rows, 0);
    }
    Ok(StageEnd::Completed)
}

struct SyncJob<'a, S: RecordSource + ?Sized> {
    conn: &'a mut PgConnection,
    source: &'a S,
    config: &'a Config,
    catalogue: &'a QuestionCatalogue,
    stop: &'a StopFlag,
    today: NaiveDate,
}

impl<S: RecordSource + ?Sized> SyncJob<'_, S> {
    fn run_stage(&mut self, stage: Stage, checkpoint: &mut Checkpoint) -> Result<StageEnd, String> {
        let config = self.config;
        let persist = |cp: &Checkpoint| checkpoint::save(&config.checkpoint_file, cp);

        match stage {
            Stage::Establishments | Stage::Staff | Stage::Students | Stage::QuestionResponses => {
                let object = knack_object(stage).ok_or_else(|| format!("{} has no source object", stage))?;
                let rows = config
                    .batch_sizes
                    .for_stage(stage)
                    .ok_or_else(|| format!("{} has no batch size", stage))?;
                // Reloaded per stage so rows written by the establishments stage are visible.
                let index = match stage {
                    Stage::Establishments => EstablishmentIndex::default(),
                    _ => {
                        let index = EstablishmentIndex::load(self.conn)?;
                        if index.is_empty() {
                            warn!("{}: no establishments in the database; connected records will be skipped", stage);
                        }
                        index
                    }
                };
                let conn = &mut *self.conn;
                let (catalogue, today) = (self.catalogue, self.today);
                page_through(
                    self.source,
                    stage,
                    object,
                    rows,
                    checkpoint,
                    self.stop,
                    |records| {
                        in_transaction(conn, |c| match stage {
                            Stage::Establishments => establishments::process_establishment_batch(c, records),
                            Stage::Staff => establishments::process_staff_batch(c, records, &index),
                            Stage::Students => students::process_batch(c, records, &index, today),
                            _ => responses::process_batch(c, records, catalogue, &index, today),
                        })
                    },
                    persist,
                )
            }
            Stage::Enrollments => {
                if self.stop.is_stopped() {
                    return Ok(StageEnd::Interrupted);
                }
                let inserted = in_transaction(self.conn, enrollment::backfill)?;
                checkpoint.record_batch(stage, 1, inserted, 0);
                Ok(StageEnd::Completed)
            }
            Stage::Statistics => {
                let years: Vec<String> = if checkpoint.academic_years.is_empty() {
                    statistics::scored_years(self.conn)?
                } else {
                    checkpoint.academic_years.iter().cloned().collect()
                };
                let conn = &mut *self.conn;
                recompute_years(&years, checkpoint, self.stop, |year| {
                    let (school, national) = in_transaction(conn, |c| statistics::recompute_year(c, year))?;
                    Ok((school + national) as u64)
                })
            }
        }
    }

    fn run_stages(&mut self, checkpoint: &mut Checkpoint) -> Result<StageEnd, String> {
        let config = self.config;
        for &stage in &config.stages {
            if checkpoint.is_complete(stage) {
                info!("{}: already completed in this run; skipping", stage);
                continue;
            }
            if self.stop.is_stopped() {
                return Ok(StageEnd::Interrupted);
            }
            info!("{}: starting", stage);
            let started = Instant::now();
            match self.run_stage(stage, checkpoint)? {
                StageEnd::Interrupted => return Ok(StageEnd::Interrupted),
                StageEnd::Completed => {
                    checkpoint.complete_stage(stage);
                    checkpoint::save(&config.checkpoint_file, checkpoint)?;
                    let counts = checkpoint.counts.get(&stage).copied().unwrap_or_default();
                    info!(
                        "{}: finished in {:.1}s ({} processed, {} skipped)",
                        stage,
                        started.elapsed().as_secs_f64(),
                        counts.processed,
                        counts.skipped
                    );
                }
            }
        }
        Ok(StageEnd::Completed)
    }
}

fn open_run(conn: &mut PgConnection, config: &Config) -> Result<Checkpoint, String> {
    let path = config.checkpoint_file.as_path();
    if let Some(cp) = checkpoint::load(path)? {
        sync_log::reopen(conn, cp.run_id)?;
        info!(
            "Resuming sync run {} started {} ({} stages already complete)",
            cp.run_id,
            cp.started_at.to_rfc3339(),
            cp.completed_stages.len()
        );
        return Ok(cp);
    }
    let started_at = Utc::now();
    let kind = if config.runs_all_stages() {
        sync_type::FULL
    } else {
        sync_type::PARTIAL
    };
    let run_id = sync_log::start(conn, kind, started_at)?;
    let cp = Checkpoint::new(run_id, started_at);
    checkpoint::save(path, &cp)?;
    info!("Started {} sync run {}", kind, run_id);
    Ok(cp)
}

/// One pass over the configured stages.
pub fn run_once<S: RecordSource + ?Sized>(
    conn: &mut PgConnection,
    source: &S,
    config: &Config,
    catalogue: &QuestionCatalogue,
    stop: &StopFlag,
) -> Result<RunEnd, String> {
    let mut cp = open_run(conn, config)?;
    let run_id = cp.run_id;
    let result = SyncJob {
        conn: &mut *conn,
        source,
        config,
        catalogue,
        stop,
        today: Utc::now().date_naive(),
    }
    .run_stages(&mut cp);

    match result {
        Ok(StageEnd::Completed) => {
            sync_log::complete(conn, run_id, cp.total_processed(), cp.metadata())?;
            checkpoint::clear(&config.checkpoint_file)?;
            info!(
                "Sync run {} completed: {} processed, {} skipped",
                run_id,
                cp.total_processed(),
                cp.total_skipped()
            );
            Ok(RunEnd::Completed(RunSummary {
                run_id,
                processed: cp.total_processed(),
                skipped: cp.total_skipped(),
            }))
        }
        Ok(StageEnd::Interrupted) => {
            checkpoint::save(&config.checkpoint_file, &cp)?;
            sync_log::fail(conn, run_id, INTERRUPTED, cp.total_processed(), cp.metadata())?;
            warn!(
                "Sync run {} interrupted; progress saved to {}",
                run_id,
                config.checkpoint_file.display()
            );
            Ok(RunEnd::Interrupted { run_id })
        }
        Err(e) => {
            // The checkpoint on disk already reflects the last committed batch.
            if let Err(log_err) = sync_log::fail(conn, run_id, &e, cp.total_processed(), cp.metadata()) {
                error!("{}", log_err);
            }
            Err(e)
        }
    }
}

/// Sleep up to `total`, waking early when a stop is requested.
fn sleep_unless_stopped(total: Duration, stop: &StopFlag) {
    const SLICE: Duration = Duration::from_millis(250);
    let deadline = Instant::now() + total;
    while !stop.is_stopped() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}

/// Run once, or repeatedly on `SYNC_INTERVAL_SECS` with a steady cadence.
/// In scheduled mode a failed run is logged and retried on the next tick.
pub fn run<S: RecordSource + ?Sized>(
    conn: &mut PgConnection,
    source: &S,
    config: &Config,
    catalogue: &QuestionCatalogue,
    stop: &StopFlag,
) -> Result<(), String> {
    let Some(interval) = config.sync_interval else {
        return match run_once(conn, source, config, catalogue, stop)? {
            RunEnd::Completed(_) => Ok(()),
            RunEnd::Interrupted { run_id } => Err(interrupted_message(run_id, &config.checkpoint_file)),
        };
    };

    info!("Scheduled sync every {}s", interval.as_secs());
    loop {
        let tick_start = Instant::now();
        match run_once(conn, source, config, catalogue, stop) {
            Ok(RunEnd::Completed(summary)) => info!(
                "Run {} took {}s ({} processed, {} skipped); next run in {}s",
                summary.run_id,
                tick_start.elapsed().as_secs(),
                summary.processed,
                summary.skipped,
                interval.saturating_sub(tick_start.elapsed()).as_secs()
            ),
            Ok(RunEnd::Interrupted { run_id }) => return Err(interrupted_message(run_id, &config.checkpoint_file)),
            Err(e) => error!("Sync run failed: {}", e),
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            sleep_unless_stopped(interval - elapsed, stop);
        }
        if stop.is_stopped() {
            info!("Stop requested between runs; exiting");
            return Ok(());
        }
    }
}

fn interrupted_message(run_id: i64, checkpoint_file: &Path) -> String {
    format!(
        "sync run {} {}; rerun to resume from {}",
        run_id,
        INTERRUPTED,
        checkpoint_file.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KnackClientError;
    use crate::models::knack::RecordPage;
    use std::cell::RefCell;

    /// Serves `total` pages of two records each and records the pages asked for.
    struct FakeSource {
        total: u32,
        requested: RefCell<Vec<u32>>,
        fail_on: Option<u32>,
    }

    impl FakeSource {
        fn new(total: u32) -> Self {
            FakeSource {
                total,
                requested: RefCell::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    impl RecordSource for FakeSource {
        fn fetch_page(&self, _object: &str, page: u32, _rows: NonZeroU32) -> Result<RecordPage, KnackClientError> {
            self.requested.borrow_mut().push(page);
            if self.fail_on == Some(page) {
                return Err(KnackClientError::Http {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
            let records = (0..2)
                .map(|i| KnackRecord {
                    id: format!("p{}r{}", page, i),
                    ..KnackRecord::default()
                })
                .collect();
            Ok(RecordPage {
                total_pages: self.total,
                current_page: page,
                total_records: self.total * 2,
                records,
            })
        }
    }

    fn rows() -> NonZeroU32 {
        NonZeroU32::new(2).unwrap()
    }

    fn fresh() -> Checkpoint {
        Checkpoint::new(7, Utc::now())
    }

    fn one_each(records: &[KnackRecord]) -> Result<BatchOutcome, String> {
        Ok(BatchOutcome {
            processed: records.len() as u64 - 1,
            skipped: 1,
            academic_years: BTreeSet::from(["2025/2026".to_string()]),
        })
    }

    #[test]
    fn pages_until_last_and_persists_each_batch() {
        let source = FakeSource::new(3);
        let mut cp = fresh();
        let mut saved = Vec::new();

        let end = page_through(&source, Stage::Students, "object_10", rows(), &mut cp, &StopFlag::new(), one_each, |c| {
            saved.push(c.resume_page(Stage::Students));
            Ok(())
        })
        .unwrap();

        assert_eq!(end, StageEnd::Completed);
        assert_eq!(*source.requested.borrow(), vec![1, 2, 3]);
        assert_eq!(saved, vec![2, 3, 4]);
        let counts = cp.counts[&Stage::Students];
        assert_eq!((counts.processed, counts.skipped), (3, 3));
        assert!(cp.academic_years.contains("2025/2026"));
    }

    #[test]
    fn stop_between_batches_then_resume_at_next_page() {
        let source = FakeSource::new(4);
        let stop = StopFlag::new();
        let mut cp = fresh();

        let end = page_through(
            &source,
            Stage::Staff,
            "object_5",
            rows(),
            &mut cp,
            &stop,
            |records| {
                if source.requested.borrow().len() == 2 {
                    stop.request_stop();
                }
                one_each(records)
            },
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(end, StageEnd::Interrupted);
        assert_eq!(cp.resume_page(Stage::Staff), 3);

        // A resumed run asks for page 3 first.
        let resumed = FakeSource::new(4);
        let end = page_through(&resumed, Stage::Staff, "object_5", rows(), &mut cp, &StopFlag::new(), one_each, |_| Ok(()))
            .unwrap();
        assert_eq!(end, StageEnd::Completed);
        assert_eq!(*resumed.requested.borrow(), vec![3, 4]);
        assert_eq!(cp.counts[&Stage::Staff].processed, 4);
    }

    #[test]
    fn stop_before_first_page_fetches_nothing() {
        let source = FakeSource::new(2);
        let stop = StopFlag::new();
        stop.request_stop();
        let mut cp = fresh();
        let end = page_through(&source, Stage::Establishments, "object_2", rows(), &mut cp, &stop, one_each, |_| Ok(()))
            .unwrap();
        assert_eq!(end, StageEnd::Interrupted);
        assert!(source.requested.borrow().is_empty());
        assert!(cp.current.is_none());
    }

    #[test]
    fn failed_batch_leaves_checkpoint_at_last_committed_page() {
        let mut source = FakeSource::new(5);
        source.fail_on = Some(3);
        let mut cp = fresh();
        let err = page_through(&source, Stage::Students, "object_10", rows(), &mut cp, &StopFlag::new(), one_each, |_| Ok(()))
            .unwrap_err();
        assert!(err.contains("page 3"), "{}", err);
        assert_eq!(cp.resume_page(Stage::Students), 3);
    }

    #[test]
    fn handler_error_is_not_recorded() {
        let source = FakeSource::new(2);
        let mut cp = fresh();
        let mut persisted = 0;
        let err = page_through(
            &source,
            Stage::QuestionResponses,
            "object_29",
            rows(),
            &mut cp,
            &StopFlag::new(),
            |_| Err("upsert question responses failed: boom".to_string()),
            |_| {
                persisted += 1;
                Ok(())
            },
        )
        .unwrap_err();
        assert!(err.starts_with("upsert question responses failed"));
        assert_eq!(persisted, 0);
        assert_eq!(cp.resume_page(Stage::QuestionResponses), 1);
    }

    #[test]
    fn resumed_statistics_count_each_year_once() {
        let years = vec!["2024/2025".to_string(), "2025/2026".to_string()];
        let stop = StopFlag::new();
        let mut cp = fresh();

        let end = recompute_years(&years, &mut cp, &stop, |_| {
            stop.request_stop();
            Ok(18)
        })
        .unwrap();
        assert_eq!(end, StageEnd::Interrupted);
        assert_eq!(cp.counts[&Stage::Statistics].processed, 18);

        let end = recompute_years(&years, &mut cp, &StopFlag::new(), |_| Ok(18)).unwrap();
        assert_eq!(end, StageEnd::Completed);
        assert_eq!(cp.counts[&Stage::Statistics].processed, 36);
    }

    #[test]
    fn every_paged_stage_has_an_object() {
        for stage in Stage::ALL {
            let paged = !matches!(stage, Stage::Enrollments | Stage::Statistics);
            assert_eq!(knack_object(stage).is_some(), paged, "{}", stage);
        }
    }

    #[test]
    fn sleep_returns_early_when_stopped() {
        let stop = StopFlag::new();
        stop.request_stop();
        let started = Instant::now();
        sleep_unless_stopped(Duration::from_secs(30), &stop);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
