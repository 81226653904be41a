//! Copies the embedded store into a `ReplicaSink`.
//!
//! Full mode rebuilds the destination: schema, benchmarks, providers, code
//! rows, then indexes. Resume mode only finishes the code rows. It takes
//! the destination's code row count as an offset into the source's
//! `(npi, hcpcs_code)` order, and checks that the destination's last row is
//! the source row just before that offset before sending anything.

use anyhow::{Result, bail};
use indicatif::ProgressBar;
use std::fmt;
use tracing::info;

use crate::{
    common::{ITEM_COUNTER, apply_bar_style, format_count},
    constants::{CODE_REPLICA_BATCH, PROVIDER_REPLICA_BATCH},
    replica::{ReplicaSink, check_batch_size},
    retry::{RetryPolicy, with_retry},
    store::{CodeKey, EmbeddedStore, Table, TableCounts},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Full,
    Resume,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMode::Full => f.write_str("full"),
            ReplicationMode::Resume => f.write_str("resume"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub mode: ReplicationMode,
    pub provider_batch: usize,
    pub code_batch: usize,
    pub retry: RetryPolicy,
}

impl ReplicationOptions {
    pub fn new(mode: ReplicationMode) -> Self {
        Self {
            mode,
            provider_batch: PROVIDER_REPLICA_BATCH,
            code_batch: CODE_REPLICA_BATCH,
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_batch_size(Table::Providers, self.provider_batch)?;
        check_batch_size(Table::CodeBreakdown, self.code_batch)?;
        check_batch_size(Table::Benchmarks, self.provider_batch)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub benchmarks_sent: usize,
    pub providers_sent: usize,
    pub codes_skipped: i64,
    pub codes_sent: usize,
}

pub async fn replicate<S: ReplicaSink>(
    store: &EmbeddedStore,
    sink: &S,
    opts: &ReplicationOptions,
) -> Result<ReplicationReport> {
    opts.validate()?;
    let source = store.table_counts()?;
    info!(
        "Replicating {} providers, {} code rows, {} benchmarks ({} mode)",
        format_count(source.providers as usize),
        format_count(source.code_breakdown as usize),
        source.benchmarks,
        opts.mode
    );

    let mut report = ReplicationReport::default();
    let resume_after = match opts.mode {
        ReplicationMode::Full => {
            info!("Step 1/4: recreating destination tables");
            with_retry(opts.retry, "recreate schema", move || sink.recreate_schema()).await?;
            info!("Step 2/4: benchmarks");
            report.benchmarks_sent = copy_benchmarks(store, sink, opts).await?;
            info!("Step 3/4: providers");
            report.providers_sent = copy_providers(store, sink, opts).await?;
            None
        }
        ReplicationMode::Resume => {
            let (skipped, after) = resume_point(store, sink, &source, opts).await?;
            report.codes_skipped = skipped;
            after
        }
    };

    info!("Step 4/4: code breakdown rows");
    report.codes_sent =
        copy_codes(store, sink, opts, &source, report.codes_skipped, resume_after).await?;

    info!("Building destination indexes");
    with_retry(opts.retry, "create indexes", move || sink.create_indexes()).await?;
    Ok(report)
}

async fn copy_benchmarks<S: ReplicaSink>(
    store: &EmbeddedStore,
    sink: &S,
    opts: &ReplicationOptions,
) -> Result<usize> {
    let benchmarks: Vec<_> = store.benchmarks()?.into_values().collect();
    for chunk in benchmarks.chunks(opts.provider_batch) {
        with_retry(opts.retry, "insert benchmarks", move || {
            sink.insert_benchmarks(chunk)
        })
        .await?;
    }
    Ok(benchmarks.len())
}

async fn copy_providers<S: ReplicaSink>(
    store: &EmbeddedStore,
    sink: &S,
    opts: &ReplicationOptions,
) -> Result<usize> {
    let total = store.table_counts()?.providers;
    let progress = ProgressBar::new(total as u64);
    progress.set_prefix("PROVIDERS");
    apply_bar_style(&progress, ITEM_COUNTER);

    let mut sent = 0usize;
    let mut after: Option<String> = None;
    loop {
        let page = store.provider_page(after.as_deref(), opts.provider_batch)?;
        if page.is_empty() {
            break;
        }
        let rows = page.as_slice();
        with_retry(opts.retry, "insert provider batch", move || {
            sink.insert_providers(rows)
        })
        .await?;
        sent += page.len();
        progress.set_position(sent as u64);
        after = page.last().map(|row| row.npi.clone());
    }
    progress.finish_and_clear();
    Ok(sent)
}

/// Checks the destination is a clean prefix of the source and returns the
/// number of code rows already present plus the key to continue after.
async fn resume_point<S: ReplicaSink>(
    store: &EmbeddedStore,
    sink: &S,
    source: &TableCounts,
    opts: &ReplicationOptions,
) -> Result<(i64, Option<CodeKey>)> {
    for table in [Table::Providers, Table::Benchmarks] {
        let dest = with_retry(opts.retry, "count destination rows", move || {
            sink.count_rows(table)
        })
        .await?;
        if dest != source.get(table) {
            bail!(
                "Cannot resume: destination {table} has {dest} rows but the source has {}. Run a full migration.",
                source.get(table)
            );
        }
    }

    let existing = with_retry(opts.retry, "count destination rows", move || {
        sink.count_rows(Table::CodeBreakdown)
    })
    .await?;
    if existing == 0 {
        info!("Destination has no code rows; resuming from the start");
        return Ok((0, None));
    }
    if existing > source.code_breakdown {
        bail!(
            "Cannot resume: destination has {existing} code rows but the source only has {}",
            source.code_breakdown
        );
    }

    let expected = store.code_key_at(existing - 1)?;
    let actual = with_retry(opts.retry, "read last destination code row", move || {
        sink.last_code_key()
    })
    .await?;
    if expected.is_none() || expected != actual {
        bail!(
            "Cannot resume: the destination's {existing} code rows are not a prefix of the source \
             (expected last row {expected:?}, found {actual:?})"
        );
    }
    info!(
        "Resuming after {} existing code rows",
        format_count(existing as usize)
    );
    Ok((existing, expected))
}

async fn copy_codes<S: ReplicaSink>(
    store: &EmbeddedStore,
    sink: &S,
    opts: &ReplicationOptions,
    source: &TableCounts,
    already_present: i64,
    mut after: Option<CodeKey>,
) -> Result<usize> {
    let progress = ProgressBar::new(source.code_breakdown as u64);
    progress.set_prefix("CODES");
    apply_bar_style(&progress, ITEM_COUNTER);
    progress.set_position(already_present as u64);

    let mut sent = 0usize;
    loop {
        let page = store.code_page(after.as_ref(), opts.code_batch)?;
        if page.is_empty() {
            break;
        }
        let rows = page.as_slice();
        with_retry(opts.retry, "insert code batch", move || sink.insert_codes(rows)).await?;
        sent += page.len();
        progress.inc(page.len() as u64);
        after = page.last().map(|row| row.key());
    }
    progress.finish_and_clear();
    Ok(sent)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCheck {
    pub table: Table,
    pub source: i64,
    pub destination: i64,
}

impl TableCheck {
    pub fn matches(&self) -> bool {
        self.source == self.destination
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub checks: Vec<TableCheck>,
}

impl VerificationReport {
    pub fn all_match(&self) -> bool {
        self.checks.iter().all(TableCheck::matches)
    }
}

/// Recounts both sides and prints the comparison. Never changes either store.
pub async fn verify_replica<S: ReplicaSink>(
    store: &EmbeddedStore,
    sink: &S,
    retry: RetryPolicy,
) -> Result<VerificationReport> {
    let source = store.table_counts()?;
    let mut checks = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
        let destination =
            with_retry(retry, "count destination rows", move || sink.count_rows(table)).await?;
        checks.push(TableCheck {
            table,
            source: source.get(table),
            destination,
        });
    }
    let report = VerificationReport { checks };
    print_verification(&report);
    Ok(report)
}

fn print_verification(report: &VerificationReport) {
    let border = "+------------------+-----------------+-----------------+----------+";
    println!();
    println!("{border}");
    println!(
        "| {:<16} | {:>15} | {:>15} | {:<8} |",
        "TABLE", "SOURCE", "DESTINATION", "STATUS"
    );
    println!("{border}");
    for check in &report.checks {
        println!(
            "| {:<16} | {:>15} | {:>15} | {:<8} |",
            check.table.name(),
            format_count(check.source as usize),
            format_count(check.destination.max(0) as usize),
            if check.matches() { "OK" } else { "MISMATCH" }
        );
    }
    println!("{border}");
    if !report.all_match() {
        println!("Row counts differ. Nothing was changed; rerun in resume mode or full mode.");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::SpecialtyBenchmark,
        package::{
            package_store,
            tests::{options, sample_extract, stage_dataset},
        },
        store::{CodeRow, ProviderRow},
    };
    use anyhow::anyhow;
    use std::{sync::Mutex, time::Duration};

    #[derive(Default)]
    struct MemoryTables {
        benchmarks: Vec<SpecialtyBenchmark>,
        providers: Vec<ProviderRow>,
        codes: Vec<CodeRow>,
        indexed: bool,
        code_failures_left: u32,
        /// Batches that commit but whose acknowledgement never arrives.
        lost_acks_left: u32,
    }

    #[derive(Default)]
    struct MemorySink {
        tables: Mutex<MemoryTables>,
    }

    impl MemorySink {
        fn with<T>(&self, f: impl FnOnce(&mut MemoryTables) -> T) -> T {
            let mut guard = self.tables.lock().expect("lock");
            f(&mut guard)
        }
    }

    impl ReplicaSink for MemorySink {
        async fn recreate_schema(&self) -> Result<()> {
            self.with(|t| {
                t.benchmarks.clear();
                t.providers.clear();
                t.codes.clear();
                t.indexed = false;
            });
            Ok(())
        }

        async fn insert_benchmarks(&self, rows: &[SpecialtyBenchmark]) -> Result<()> {
            self.with(|t| {
                for row in rows {
                    if !t.benchmarks.iter().any(|b| b.specialty == row.specialty) {
                        t.benchmarks.push(row.clone());
                    }
                }
            });
            Ok(())
        }

        async fn insert_providers(&self, rows: &[ProviderRow]) -> Result<()> {
            self.with(|t| {
                for row in rows {
                    if !t.providers.iter().any(|p| p.npi == row.npi) {
                        t.providers.push(row.clone());
                    }
                }
            });
            Ok(())
        }

        async fn insert_codes(&self, rows: &[CodeRow]) -> Result<()> {
            self.with(|t| {
                if t.code_failures_left > 0 {
                    t.code_failures_left -= 1;
                    return Err(anyhow!("connection reset by peer"));
                }
                for row in rows {
                    if !t.codes.iter().any(|c| c.key() == row.key()) {
                        t.codes.push(row.clone());
                    }
                }
                if t.lost_acks_left > 0 {
                    t.lost_acks_left -= 1;
                    return Err(anyhow!("connection closed before the commit was acknowledged"));
                }
                Ok(())
            })
        }

        async fn count_rows(&self, table: Table) -> Result<i64> {
            Ok(self.with(|t| match table {
                Table::Providers => t.providers.len(),
                Table::CodeBreakdown => t.codes.len(),
                Table::Benchmarks => t.benchmarks.len(),
            }) as i64)
        }

        async fn last_code_key(&self) -> Result<Option<CodeKey>> {
            Ok(self.with(|t| t.codes.iter().map(CodeRow::key).max()))
        }

        async fn create_indexes(&self) -> Result<()> {
            self.with(|t| t.indexed = true);
            Ok(())
        }
    }

    fn source() -> (tempfile::TempDir, EmbeddedStore) {
        let dir = tempfile::tempdir().expect("tmp");
        let paths = stage_dataset(dir.path(), &sample_extract());
        package_store(&paths, &options()).expect("package");
        let store = EmbeddedStore::open(&paths.store_path).expect("open");
        (dir, store)
    }

    fn opts(mode: ReplicationMode) -> ReplicationOptions {
        ReplicationOptions {
            mode,
            provider_batch: 4,
            code_batch: 5,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
            },
        }
    }

    fn all_codes(store: &EmbeddedStore) -> Vec<CodeRow> {
        store.code_page(None, 10_000).expect("codes")
    }

    #[tokio::test]
    async fn full_mode_copies_everything() {
        let (_dir, store) = source();
        let sink = MemorySink::default();

        let report = replicate(&store, &sink, &opts(ReplicationMode::Full))
            .await
            .expect("replicate");
        assert_eq!(report.providers_sent, 20);
        assert_eq!(report.benchmarks_sent, 1);
        assert_eq!(report.codes_skipped, 0);

        sink.with(|t| {
            assert!(t.indexed);
            assert_eq!(t.codes, all_codes(&store));
            assert_eq!(t.providers, store.provider_page(None, 100).expect("providers"));
        });
        let verification = verify_replica(&store, &sink, RetryPolicy::default())
            .await
            .expect("verify");
        assert!(verification.all_match());
    }

    #[tokio::test]
    async fn resume_from_a_prefix_matches_a_full_run() {
        let (_dir, store) = source();
        let full = MemorySink::default();
        replicate(&store, &full, &opts(ReplicationMode::Full))
            .await
            .expect("full");

        let codes = all_codes(&store);
        for k in [0usize, 1, 7, codes.len() - 1, codes.len()] {
            let partial = MemorySink::default();
            replicate(&store, &partial, &opts(ReplicationMode::Full))
                .await
                .expect("seed");
            partial.with(|t| {
                t.codes.truncate(k);
                t.indexed = false;
            });

            let report = replicate(&store, &partial, &opts(ReplicationMode::Resume))
                .await
                .expect("resume");
            assert_eq!(report.codes_skipped, k as i64);
            assert_eq!(report.codes_sent, codes.len() - k);
            assert_eq!(report.providers_sent, 0);

            let resumed = partial.with(|t| t.codes.clone());
            let expected = full.with(|t| t.codes.clone());
            assert_eq!(resumed, expected, "resumed from {k}");
            assert!(partial.with(|t| t.indexed));
        }
    }

    #[tokio::test]
    async fn non_prefix_destination_is_rejected() {
        let (_dir, store) = source();
        let sink = MemorySink::default();
        replicate(&store, &sink, &opts(ReplicationMode::Full))
            .await
            .expect("seed");
        // Ten rows with the fourth missing: the count says 9, but row 9 of
        // the source is not the destination's last row.
        sink.with(|t| {
            t.codes.truncate(10);
            t.codes.remove(3);
        });

        let err = replicate(&store, &sink, &opts(ReplicationMode::Resume))
            .await
            .expect_err("must refuse");
        assert!(err.to_string().contains("not a prefix"), "{err}");
        assert_eq!(sink.with(|t| t.codes.len()), 9);
    }

    #[tokio::test]
    async fn resume_requires_a_finished_provider_load() {
        let (_dir, store) = source();
        let sink = MemorySink::default();
        let err = replicate(&store, &sink, &opts(ReplicationMode::Resume))
            .await
            .expect_err("empty destination");
        assert!(err.to_string().contains("Run a full migration"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_insert_failures_are_retried() {
        let (_dir, store) = source();
        let sink = MemorySink::default();
        sink.with(|t| t.code_failures_left = 2);

        replicate(&store, &sink, &opts(ReplicationMode::Full))
            .await
            .expect("replicate");
        assert_eq!(sink.with(|t| t.codes.len()), all_codes(&store).len());

        sink.with(|t| t.code_failures_left = 3);
        let err = replicate(&store, &sink, &opts(ReplicationMode::Full))
            .await
            .expect_err("exhausted");
        assert!(format!("{err:#}").contains("after 3 attempts"), "{err:#}");
    }

    #[tokio::test(start_paused = true)]
    async fn resent_batches_after_a_lost_acknowledgement_add_nothing() {
        let (_dir, store) = source();
        let sink = MemorySink::default();
        sink.with(|t| t.lost_acks_left = 2);

        let report = replicate(&store, &sink, &opts(ReplicationMode::Full))
            .await
            .expect("replicate");
        let codes = all_codes(&store);
        assert_eq!(report.codes_sent, codes.len());
        sink.with(|t| assert_eq!(t.codes, codes));

        let verification = verify_replica(&store, &sink, RetryPolicy::default())
            .await
            .expect("verify");
        assert!(verification.all_match());
    }

    #[tokio::test]
    async fn verification_reports_mismatches_without_repairing() {
        let (_dir, store) = source();
        let sink = MemorySink::default();
        replicate(&store, &sink, &opts(ReplicationMode::Full))
            .await
            .expect("replicate");
        sink.with(|t| {
            t.codes.pop();
        });

        let report = verify_replica(&store, &sink, RetryPolicy::default())
            .await
            .expect("verify");
        assert!(!report.all_match());
        let mismatched: Vec<Table> = report
            .checks
            .iter()
            .filter(|c| !c.matches())
            .map(|c| c.table)
            .collect();
        assert_eq!(mismatched, vec![Table::CodeBreakdown]);
        assert_eq!(
            sink.with(|t| t.codes.len()) as i64,
            store.table_counts().expect("counts").code_breakdown - 1
        );
    }

    #[test]
    fn oversized_batches_fail_validation() {
        let mut opts = opts(ReplicationMode::Full);
        opts.provider_batch = 10_000;
        assert!(opts.validate().is_err());
    }
}
