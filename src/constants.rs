pub const DEFAULT_DATASET_URL: &str = "https://data.cms.gov/sites/default/files/2025-04/MUP_PHY_R25_P05_V20_D23_Prov_Svc.csv";

pub const RECORDS_DIR_NAME: &str = "records";
pub const BENCHMARKS_FILE_NAME: &str = "benchmarks.json";
pub const STORE_FILE_NAME: &str = "providers.sqlite";

/// Identifier length; rows whose identifier has any other length are skipped.
pub const PROVIDER_ID_LEN: usize = 10;
/// Shard directory name length, taken from the start of the identifier.
pub const SHARD_PREFIX_LEN: usize = 3;

pub const TOP_CODES_PER_PROVIDER: usize = 20;
pub const MIN_PROVIDERS_PER_BENCHMARK: usize = 10;
/// Programs with a lower specialty adoption rate are ignored when scoring.
pub const MIN_PROGRAM_ADOPTION: f64 = 0.01;

pub const LOGGED_PARSE_ERRORS: usize = 5;
pub const SAMPLED_UNMAPPED_LABELS: usize = 20;
pub const INGEST_PROGRESS_EVERY: u64 = 1_000_000;

pub const PACKAGE_BATCH_SIZE: usize = 5_000;
pub const PACKAGE_PROGRESS_EVERY: usize = 50_000;
pub const STORE_SIZE_BUDGET_MIB: u64 = 2_048;

pub const SCORE_PAGE_SIZE: usize = 10_000;

pub const PROVIDER_REPLICA_BATCH: usize = 500;
pub const CODE_REPLICA_BATCH: usize = 5_000;
/// Postgres caps bind parameters per statement at u16::MAX.
pub const MAX_BIND_PARAMS: usize = 65_535;
pub const RETRY_MAX_ATTEMPTS: u32 = 5;
pub const RETRY_BASE_DELAY_SECS: u64 = 2;
