use std::path::{Path, PathBuf};

use crate::constants::{BENCHMARKS_FILE_NAME, RECORDS_DIR_NAME, STORE_FILE_NAME};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub raw_dir: PathBuf,
    pub records_dir: PathBuf,
    pub benchmarks_path: PathBuf,
    pub store_path: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let raw_dir = data_dir.join("raw");
        let records_dir = data_dir.join(RECORDS_DIR_NAME);
        let benchmarks_path = data_dir.join(BENCHMARKS_FILE_NAME);
        let store_path = data_dir.join(STORE_FILE_NAME);

        Self {
            data_dir,
            raw_dir,
            records_dir,
            benchmarks_path,
            store_path,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.raw_dir)?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}
