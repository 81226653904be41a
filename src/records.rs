//! Per-entity record files and the benchmark file.
//!
//! Layout: `records/<first 3 id chars>/<id>.json`, one serialized
//! `ProviderAggregate` per file, plus a single `benchmarks.json` keyed by
//! canonical specialty.

use anyhow::{Context, Result, bail};
use indicatif::ProgressBar;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

use crate::{
    common::{ITEM_COUNTER, apply_bar_style, write_atomic},
    constants::SHARD_PREFIX_LEN,
    model::{ProviderAggregate, SpecialtyBenchmark},
};

pub fn shard_dir(root: &Path, npi: &str) -> PathBuf {
    let prefix: String = npi.chars().take(SHARD_PREFIX_LEN).collect();
    root.join(prefix)
}

pub fn record_path(root: &Path, npi: &str) -> PathBuf {
    shard_dir(root, npi).join(format!("{npi}.json"))
}

/// Writes every provider into a staging directory next to `root`, then
/// swaps it in, so an interrupted run leaves the previous tree untouched.
pub fn write_provider_records(root: &Path, providers: &[ProviderAggregate]) -> Result<usize> {
    let staging = staging_dir(root);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("Failed clearing stale {}", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed creating {}", staging.display()))?;

    let progress = ProgressBar::new(providers.len() as u64);
    progress.set_prefix("RECORDS");
    apply_bar_style(&progress, ITEM_COUNTER);

    let mut current_shard: Option<PathBuf> = None;
    for provider in providers {
        let shard = shard_dir(&staging, &provider.npi);
        if current_shard.as_deref() != Some(shard.as_path()) {
            fs::create_dir_all(&shard)
                .with_context(|| format!("Failed creating {}", shard.display()))?;
            current_shard = Some(shard);
        }

        let path = record_path(&staging, &provider.npi);
        let file =
            File::create(&path).with_context(|| format!("Failed creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, provider)
            .with_context(|| format!("Failed serializing {}", provider.npi))?;
        writer
            .flush()
            .with_context(|| format!("Failed writing {}", path.display()))?;
        progress.inc(1);
    }
    progress.finish_and_clear();

    if root.exists() {
        fs::remove_dir_all(root)
            .with_context(|| format!("Failed removing previous {}", root.display()))?;
    }
    fs::rename(&staging, root).with_context(|| {
        format!(
            "Failed moving {} into place at {}",
            staging.display(),
            root.display()
        )
    })?;
    info!(
        "Wrote {} provider records under {}",
        providers.len(),
        root.display()
    );
    Ok(providers.len())
}

fn staging_dir(root: &Path) -> PathBuf {
    let mut name = root
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".staging");
    root.with_file_name(name)
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed listing {}", dir.display()))? {
        let entry = entry.with_context(|| format!("Failed listing {}", dir.display()))?;
        let path = entry.path();
        let keep = if want_dirs {
            path.is_dir()
        } else {
            path.extension().is_some_and(|ext| ext == "json")
        };
        if keep {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Iterates record files in shard order, then file-name order.
pub struct RecordReader {
    shards: std::vec::IntoIter<PathBuf>,
    files: std::vec::IntoIter<PathBuf>,
}

impl Iterator for RecordReader {
    type Item = Result<ProviderAggregate>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(path) = self.files.next() {
                return Some(read_record(&path));
            }
            let shard = self.shards.next()?;
            match sorted_entries(&shard, false) {
                Ok(files) => self.files = files.into_iter(),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn read_record(path: &Path) -> Result<ProviderAggregate> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed parsing {}", path.display()))
}

pub fn read_provider_records(root: &Path) -> Result<RecordReader> {
    if !root.is_dir() {
        bail!(
            "Provider records not found at {}. Run ingest first.",
            root.display()
        );
    }
    Ok(RecordReader {
        shards: sorted_entries(root, true)?.into_iter(),
        files: Vec::new().into_iter(),
    })
}

pub fn count_record_files(root: &Path) -> Result<usize> {
    let mut total = 0;
    for shard in sorted_entries(root, true)? {
        total += sorted_entries(&shard, false)?.len();
    }
    Ok(total)
}

pub fn write_benchmarks(
    path: &Path,
    benchmarks: &BTreeMap<String, SpecialtyBenchmark>,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(benchmarks).context("Failed serializing benchmarks")?;
    write_atomic(path, &bytes)
}

pub fn read_benchmarks(path: &Path) -> Result<BTreeMap<String, SpecialtyBenchmark>> {
    if !path.is_file() {
        bail!(
            "Benchmark file not found at {}. Run ingest first.",
            path.display()
        );
    }
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed parsing {}", path.display()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Cents, CodeBreakdown, EmBreakdown, ProgramMetrics};

    pub(crate) fn provider(npi: &str, specialty: Option<&str>) -> ProviderAggregate {
        let codes = vec![
            CodeBreakdown {
                code: "99213".to_string(),
                services: 40.0,
                payment: Cents(300_000),
                beneficiaries: 30,
            },
            CodeBreakdown {
                code: "99214".to_string(),
                services: 60.0,
                payment: Cents(700_000),
                beneficiaries: 45,
            },
        ];
        let mut top_codes = codes.clone();
        top_codes.reverse();
        ProviderAggregate {
            npi: npi.to_string(),
            last_org_name: "Rivera".to_string(),
            first_name: "Sam".to_string(),
            credentials: "MD".to_string(),
            specialty: specialty.unwrap_or("Chiropractic").to_string(),
            specialty_group: specialty.map(str::to_string),
            state: "OH".to_string(),
            city: "Dayton".to_string(),
            total_services: 100.0,
            total_payment: Cents(1_000_000),
            total_beneficiaries: 45,
            em: EmBreakdown {
                levels: [0.0, 0.0, 40.0, 60.0, 0.0],
                total: 100.0,
            },
            programs: [ProgramMetrics::default(); 4],
            top_codes,
            codes,
            revenue_score: None,
        }
    }

    #[test]
    fn records_are_sharded_and_read_back_in_id_order() {
        let dir = tempfile::tempdir().expect("tmp");
        let root = dir.path().join("records");
        let providers = vec![
            provider("1230000001", Some("Cardiology")),
            provider("1230000002", None),
            provider("4560000001", Some("Cardiology")),
        ];
        write_provider_records(&root, &providers).expect("write");

        assert!(root.join("123").join("1230000002.json").is_file());
        assert!(root.join("456").join("4560000001.json").is_file());
        assert!(!staging_dir(&root).exists());
        assert_eq!(count_record_files(&root).expect("count"), 3);

        let read: Vec<ProviderAggregate> = read_provider_records(&root)
            .expect("reader")
            .collect::<Result<_>>()
            .expect("records");
        assert_eq!(read, providers);
    }

    #[test]
    fn rewriting_replaces_the_previous_tree() {
        let dir = tempfile::tempdir().expect("tmp");
        let root = dir.path().join("records");
        write_provider_records(&root, &[provider("9990000001", None)]).expect("first");
        write_provider_records(&root, &[provider("1110000001", None)]).expect("second");
        assert!(!root.join("999").exists());
        assert_eq!(count_record_files(&root).expect("count"), 1);
    }

    #[test]
    fn missing_inputs_are_reported() {
        let dir = tempfile::tempdir().expect("tmp");
        assert!(read_provider_records(&dir.path().join("records")).is_err());
        assert!(read_benchmarks(&dir.path().join("benchmarks.json")).is_err());
    }
}
