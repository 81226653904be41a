use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::info;

/// Counter segment for bars that count items rather than bytes.
pub const ITEM_COUNTER: &str = "{pos}/{len} {per_sec}";

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `bytes` next to `path` and renames into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    let tmp_path = tmp_sibling(path);
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed moving {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn file_name_from_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let file_name = trimmed
        .rsplit('/')
        .next()
        .map(|name| name.split(['?', '#']).next().unwrap_or(name))
        .filter(|name| !name.is_empty())
        .context("Could not derive filename from URL")?;
    Ok(file_name.to_string())
}

pub async fn download_file(client: &Client, url: &str, output_path: &Path) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }

    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Download request failed for {url}"))?
        .error_for_status()
        .with_context(|| format!("Download failed for {url}"))?;

    let tmp_path = tmp_sibling(output_path);
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;

    let progress = ProgressBar::new(response.content_length().unwrap_or(0));
    progress.set_prefix("FETCH");
    apply_bar_style(&progress, "{binary_bytes}/{binary_total_bytes} {binary_bytes_per_sec}");

    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed reading download stream")?
    {
        file.write_all(&chunk)
            .with_context(|| format!("Failed writing {}", tmp_path.display()))?;
        progress.inc(chunk.len() as u64);
    }
    file.flush()
        .with_context(|| format!("Failed flushing {}", tmp_path.display()))?;
    drop(file);
    progress.finish_and_clear();

    fs::rename(&tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving {} into place at {}",
            tmp_path.display(),
            output_path.display()
        )
    })?;
    info!("Download complete: {}", output_path.display());
    Ok(())
}

pub fn apply_bar_style(progress: &ProgressBar, counter: &str) {
    let template = format!(
        "{{spinner:.green}} {{prefix:.bold}} [{{elapsed_precise}}] [{{bar:32.cyan/blue}}] \
{counter} ({{percent}}%) eta {{eta_precise}} {{msg}}"
    );
    if let Ok(style) = ProgressStyle::with_template(&template) {
        progress.set_style(style.progress_chars("=> "));
    }
}

pub fn format_count(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_get_thousands_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(1_234_567), "1,234,567");
    }

    #[test]
    fn url_file_names_drop_query_strings() {
        assert_eq!(
            file_name_from_url("https://example.org/a/extract.csv?x=1").expect("name"),
            "extract.csv"
        );
        assert!(file_name_from_url("  ").is_err());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, b"{}").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "{}");
        assert!(!tmp_sibling(&path).exists());
    }
}
