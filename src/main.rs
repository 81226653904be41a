mod benchmark;
mod cli;
mod codes;
mod common;
mod constants;
mod ingest;
mod model;
mod package;
mod paths;
mod records;
mod replica;
mod replicate;
mod retry;
mod score;
mod specialty;
mod store;

use anyhow::{Context, Result, bail};
use clap::Parser;
use reqwest::Client;
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};

use cli::{
    Args, Command, FetchArgs, IngestArgs, MigrateArgs, PackageArgs, ReplicaArgs, ScoreArgs,
    VerifyArgs,
};
use common::{download_file, file_name_from_url, format_count};
use constants::DEFAULT_DATASET_URL;
use ingest::{IngestOptions, ingest_file, print_ingest_summary};
use package::{PackageOptions, package_store};
use paths::{StoragePaths, file_present_nonempty};
use replica::PgSink;
use replicate::{ReplicationMode, ReplicationOptions, replicate, verify_replica};
use retry::{RetryPolicy, with_retry};
use specialty::SpecialtyMap;
use store::EmbeddedStore;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let paths = StoragePaths::new(&args.data_dir);

    let result = match args.cmd {
        Command::Fetch(cmd) => run_fetch(&paths, cmd).await.context("fetch failed"),
        Command::Ingest(cmd) => run_ingest(&paths, &cmd).context("ingest failed"),
        Command::Package(cmd) => run_package(&paths, &cmd).context("package failed"),
        Command::Score(cmd) => run_score(&paths, &cmd).context("score failed"),
        Command::Run(cmd) => run_ingest(&paths, &cmd.ingest)
            .context("ingest failed")
            .and_then(|_| run_package(&paths, &cmd.package).context("package failed"))
            .and_then(|_| run_score(&paths, &cmd.score).context("score failed")),
        Command::Migrate(cmd) => run_migrate(&paths, &cmd).await.context("migrate failed"),
        Command::Verify(cmd) => run_verify(&paths, &cmd).await.context("verify failed"),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            println!("FAILED: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn default_input_path(paths: &StoragePaths, url: &str) -> Result<PathBuf> {
    Ok(paths.raw_dir.join(file_name_from_url(url)?))
}

async fn run_fetch(paths: &StoragePaths, args: FetchArgs) -> Result<()> {
    paths
        .ensure_dirs()
        .with_context(|| format!("Failed creating {}", paths.data_dir.display()))?;
    let output_path = default_input_path(paths, &args.url)?;
    if file_present_nonempty(&output_path) && !args.force {
        info!(
            "Using existing extract {} (pass --force to re-download)",
            output_path.display()
        );
        return Ok(());
    }

    let client = Client::builder()
        .user_agent("provider-pipeline/0.1")
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("Failed creating HTTP client")?;
    info!("Downloading {} to {}", args.url, output_path.display());
    download_file(&client, &args.url, &output_path).await
}

fn parse_delimiter(raw: &str) -> Result<u8> {
    match raw {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        other if other.len() == 1 && other.is_ascii() => Ok(other.as_bytes()[0]),
        other => bail!("Delimiter must be a single ASCII character, got {other:?}"),
    }
}

fn run_ingest(paths: &StoragePaths, args: &IngestArgs) -> Result<()> {
    let input_path = match &args.input {
        Some(path) => path.clone(),
        None => default_input_path(paths, DEFAULT_DATASET_URL)?,
    };
    let specialty_map = match &args.specialty_map {
        Some(path) => SpecialtyMap::from_json_file(path)?,
        None => SpecialtyMap::default(),
    };
    let opts = IngestOptions {
        delimiter: parse_delimiter(&args.delimiter)?,
        limit_rows: args.limit_rows,
    };

    info!(
        "Step 1/3: aggregating {} ({} specialty mappings)",
        input_path.display(),
        specialty_map.len()
    );
    let output = ingest_file(&input_path, &specialty_map, &opts)?;
    print_ingest_summary(&output.stats);

    info!("Step 2/3: building specialty benchmarks");
    let benchmarks = benchmark::build_benchmarks(&output.specialties, args.min_providers);
    benchmark::print_benchmark_table(&benchmarks);

    info!("Step 3/3: writing provider records");
    paths
        .ensure_dirs()
        .with_context(|| format!("Failed creating {}", paths.data_dir.display()))?;
    records::write_provider_records(&paths.records_dir, &output.providers)?;
    records::write_benchmarks(&paths.benchmarks_path, &benchmarks)?;
    info!(
        "Wrote {} provider records and {} benchmarks",
        format_count(output.providers.len()),
        benchmarks.len()
    );
    Ok(())
}

fn run_package(paths: &StoragePaths, args: &PackageArgs) -> Result<()> {
    let opts = PackageOptions {
        batch_size: args.batch_size,
        progress_every: args.progress_every,
        size_budget_mib: args.size_budget_mib,
    };
    let report = package_store(paths, &opts)?;
    info!(
        "Packaged {} providers, {} code rows, {} benchmarks",
        format_count(report.providers),
        format_count(report.code_rows),
        report.benchmarks
    );
    Ok(())
}

fn run_score(paths: &StoragePaths, args: &ScoreArgs) -> Result<()> {
    let mut store = EmbeddedStore::open(&paths.store_path)?;
    let report = score::score_store(&mut store, args.page_size)?;
    score::print_score_report(&report);
    Ok(())
}

fn retry_policy(args: &ReplicaArgs) -> RetryPolicy {
    RetryPolicy {
        max_attempts: args.retry_attempts,
        base_delay: Duration::from_secs(args.retry_delay_secs),
    }
}

async fn connect_replica(args: &ReplicaArgs) -> Result<PgSink> {
    let Some(url) = args.database_url.as_deref() else {
        bail!("DATABASE_URL is not set. Pass --database-url or set it in the environment.");
    };
    with_retry(retry_policy(args), "connect to destination", || {
        PgSink::connect(url)
    })
    .await
}

async fn run_migrate(paths: &StoragePaths, args: &MigrateArgs) -> Result<()> {
    let store = EmbeddedStore::open(&paths.store_path)?;
    let mode = if args.resume {
        ReplicationMode::Resume
    } else {
        ReplicationMode::Full
    };
    let opts = ReplicationOptions {
        provider_batch: args.provider_batch,
        code_batch: args.code_batch,
        retry: retry_policy(&args.replica),
        ..ReplicationOptions::new(mode)
    };
    opts.validate()?;

    let sink = connect_replica(&args.replica).await?;
    let report = replicate(&store, &sink, &opts).await?;
    info!(
        "Sent {} benchmarks, {} providers, {} code rows ({} already present)",
        report.benchmarks_sent,
        format_count(report.providers_sent),
        format_count(report.codes_sent),
        format_count(report.codes_skipped as usize)
    );

    let verification = verify_replica(&store, &sink, opts.retry).await?;
    if !verification.all_match() {
        bail!("Destination row counts do not match the source");
    }
    Ok(())
}

async fn run_verify(paths: &StoragePaths, args: &VerifyArgs) -> Result<()> {
    let store = EmbeddedStore::open(&paths.store_path)?;
    let sink = connect_replica(&args.replica).await?;
    let verification = verify_replica(&store, &sink, retry_policy(&args.replica)).await?;
    if !verification.all_match() {
        bail!("Destination row counts do not match the source");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiters_accept_tab_spellings() {
        assert_eq!(parse_delimiter(",").expect("comma"), b',');
        assert_eq!(parse_delimiter("\\t").expect("tab"), b'\t');
        assert_eq!(parse_delimiter("|").expect("pipe"), b'|');
        assert!(parse_delimiter("||").is_err());
        assert!(parse_delimiter("§").is_err());
    }
}
