use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::constants::{
    CODE_REPLICA_BATCH, DEFAULT_DATASET_URL, MIN_PROVIDERS_PER_BENCHMARK, PACKAGE_BATCH_SIZE,
    PACKAGE_PROGRESS_EVERY, PROVIDER_REPLICA_BATCH, RETRY_BASE_DELAY_SECS, RETRY_MAX_ATTEMPTS,
    SCORE_PAGE_SIZE, STORE_SIZE_BUDGET_MIB,
};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "provider_pipeline")]
#[command(
    about = "Aggregate the provider x service claims extract, score providers, and replicate the store",
    long_about = None
)]
pub struct Args {
    /// Pipeline data directory (raw extract, records, benchmarks, SQLite store).
    #[arg(long, global = true, env = "PIPELINE_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the raw extract into <data-dir>/raw.
    Fetch(FetchArgs),
    /// Aggregate the raw extract into per-provider records and specialty benchmarks.
    Ingest(IngestArgs),
    /// Build the single-file SQLite store from records and benchmarks.
    Package(PackageArgs),
    /// Compute RevenueScore for every provider in the store.
    Score(ScoreArgs),
    /// Ingest, package, and score in one go.
    Run(RunArgs),
    /// Copy the store into Postgres (full rebuild, or --resume the code rows).
    Migrate(MigrateArgs),
    /// Compare row counts between the store and Postgres without changing either.
    Verify(VerifyArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct FetchArgs {
    #[arg(long, default_value = DEFAULT_DATASET_URL)]
    pub url: String,

    /// Re-download even if the file already exists.
    #[arg(long)]
    pub force: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct IngestArgs {
    /// Raw extract path. Defaults to <data-dir>/raw/<file name of the dataset URL>.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// JSON object mapping raw provider type labels to canonical specialties.
    /// Replaces the built-in table.
    #[arg(long)]
    pub specialty_map: Option<PathBuf>,

    /// Field delimiter of the extract (a single ASCII character; `\t` for tab).
    #[arg(long, default_value = ",")]
    pub delimiter: String,

    /// Stop after this many data rows (smoke runs).
    #[arg(long)]
    pub limit_rows: Option<u64>,

    #[arg(long, default_value_t = MIN_PROVIDERS_PER_BENCHMARK)]
    pub min_providers: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PackageArgs {
    /// Providers per insert transaction.
    #[arg(long, default_value_t = PACKAGE_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, default_value_t = PACKAGE_PROGRESS_EVERY)]
    pub progress_every: usize,

    /// Warn when the finished store is larger than this.
    #[arg(long, default_value_t = STORE_SIZE_BUDGET_MIB)]
    pub size_budget_mib: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ScoreArgs {
    /// Providers per page (and per update transaction).
    #[arg(long, default_value_t = SCORE_PAGE_SIZE)]
    pub page_size: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub ingest: IngestArgs,

    #[command(flatten)]
    pub package: PackageArgs,

    #[command(flatten)]
    pub score: ScoreArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ReplicaArgs {
    /// Destination connection string.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, default_value_t = RETRY_MAX_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Base retry delay; attempt n waits n times this long.
    #[arg(long, default_value_t = RETRY_BASE_DELAY_SECS)]
    pub retry_delay_secs: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub replica: ReplicaArgs,

    /// Keep providers and benchmarks and continue the code rows from the
    /// destination's current row count.
    #[arg(long)]
    pub resume: bool,

    #[arg(long, default_value_t = PROVIDER_REPLICA_BATCH)]
    pub provider_batch: usize,

    #[arg(long, default_value_t = CODE_REPLICA_BATCH)]
    pub code_batch: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub replica: ReplicaArgs,
}
