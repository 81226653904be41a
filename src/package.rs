use anyhow::{Context, Result};
use indicatif::ProgressBar;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    common::{ITEM_COUNTER, apply_bar_style, format_count},
    paths::StoragePaths,
    records::{count_record_files, read_benchmarks, read_provider_records},
    store::{EmbeddedStore, Table, TableCounts, TopProvider},
};

#[derive(Debug, Clone)]
pub struct PackageOptions {
    pub batch_size: usize,
    pub progress_every: usize,
    pub size_budget_mib: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageReport {
    pub providers: usize,
    pub code_rows: usize,
    pub benchmarks: usize,
    pub verification: StoreVerification,
}

pub fn package_store(paths: &StoragePaths, opts: &PackageOptions) -> Result<PackageReport> {
    // Both inputs are checked before the previous store is removed.
    let benchmarks = read_benchmarks(&paths.benchmarks_path)?;
    let records = read_provider_records(&paths.records_dir)?;
    let total = count_record_files(&paths.records_dir)?;
    info!(
        "Packaging {} provider records and {} benchmarks into {}",
        format_count(total),
        benchmarks.len(),
        paths.store_path.display()
    );

    let mut store = EmbeddedStore::create(&paths.store_path)?;
    let progress = ProgressBar::new(total as u64);
    progress.set_prefix("PACKAGE");
    apply_bar_style(&progress, ITEM_COUNTER);
    progress.enable_steady_tick(Duration::from_millis(250));

    let batch_size = opts.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut providers = 0usize;
    let mut code_rows = 0usize;
    let mut next_log = opts.progress_every.max(1);
    for record in records {
        batch.push(record?);
        if batch.len() == batch_size {
            code_rows += store.insert_provider_batch(&batch)?;
            providers += batch.len();
            progress.set_position(providers as u64);
            batch.clear();
            if providers >= next_log {
                info!("Packaged {} / {} providers", format_count(providers), format_count(total));
                next_log += opts.progress_every.max(1);
            }
        }
    }
    if !batch.is_empty() {
        code_rows += store.insert_provider_batch(&batch)?;
        providers += batch.len();
        progress.set_position(providers as u64);
    }
    progress.finish_and_clear();

    store.insert_benchmarks(&benchmarks)?;
    info!("Building indexes on {}", paths.store_path.display());
    store.create_indexes()?;
    let verification = verify_store(&store, opts.size_budget_mib)?;

    Ok(PackageReport {
        providers,
        code_rows,
        benchmarks: benchmarks.len(),
        verification,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreVerification {
    pub counts: TableCounts,
    pub top_provider: Option<TopProvider>,
    pub size_bytes: u64,
    pub over_budget: bool,
}

/// Recounts the packaged store and reports its size against the budget.
/// Exceeding the budget is a warning only.
pub fn verify_store(store: &EmbeddedStore, size_budget_mib: u64) -> Result<StoreVerification> {
    let counts = store.table_counts()?;
    let top_provider = store.top_payment_provider()?;
    let size_bytes = store
        .file_size_bytes()
        .context("Failed sizing the packaged store")?;
    let over_budget = size_bytes > size_budget_mib * 1024 * 1024;
    if over_budget {
        warn!(
            "Store {} is {} MiB, over the {} MiB budget",
            store.path().display(),
            size_bytes / (1024 * 1024),
            size_budget_mib
        );
    }

    let verification = StoreVerification {
        counts,
        top_provider,
        size_bytes,
        over_budget,
    };
    print_store_verification(store, &verification);
    Ok(verification)
}

fn print_store_verification(store: &EmbeddedStore, verification: &StoreVerification) {
    let border = "+--------------------------------+------------------------------------------+";
    println!();
    println!("{border}");
    println!("| {:<30} | {:<40} |", "STORE", store.path().display());
    println!("{border}");
    for table in Table::ALL {
        println!(
            "| {:<30} | {:<40} |",
            format!("{table} rows"),
            format_count(verification.counts.get(table) as usize)
        );
    }
    println!(
        "| {:<30} | {:<40} |",
        "File size (MiB)",
        format!(
            "{:.1}{}",
            verification.size_bytes as f64 / (1024.0 * 1024.0),
            if verification.over_budget { " (over budget)" } else { "" }
        )
    );
    let top = match &verification.top_provider {
        Some(top) => format!("{} {} ${:.2}", top.npi, top.name, top.total_payment.dollars()),
        None => "-".to_string(),
    };
    println!("| {:<30} | {:<40} |", "Top payment provider", top);
    println!("{border}");
    println!();
}
