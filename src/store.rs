//! The single-file SQLite store shared by the packager, the scorer, and
//! the replication source.
//!
//! Two write paths exist and are kept apart: `insert_provider_batch`
//! writes whole provider records (provider row plus code rows), while
//! `apply_score_patches` only ever touches `providers.revenue_score`.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    codes::{EM_LEVEL_COUNT, PROGRAM_COUNT},
    common::delete_if_exists,
    model::{Cents, CodeBreakdown, ProgramMetrics, ProviderAggregate, SpecialtyBenchmark},
};

/// Column order shared by every provider read and write, in both stores.
pub const PROVIDER_COLUMNS: [&str; 27] = [
    "npi",
    "last_org_name",
    "first_name",
    "credentials",
    "specialty",
    "specialty_group",
    "state",
    "city",
    "total_services",
    "total_payment_cents",
    "total_beneficiaries",
    "em_level1",
    "em_level2",
    "em_level3",
    "em_level4",
    "em_level5",
    "em_total",
    "ccm_services",
    "ccm_payment_cents",
    "rpm_services",
    "rpm_payment_cents",
    "bhi_services",
    "bhi_payment_cents",
    "awv_services",
    "awv_payment_cents",
    "top_codes",
    "revenue_score",
];

pub const CODE_COLUMNS: [&str; 5] = [
    "npi",
    "hcpcs_code",
    "services",
    "payment_cents",
    "beneficiaries",
];

pub const BENCHMARK_COLUMNS: [&str; 13] = [
    "specialty",
    "provider_count",
    "avg_beneficiaries",
    "avg_payment",
    "avg_revenue_per_beneficiary",
    "avg_services",
    "pct_level3",
    "pct_level4",
    "pct_level5",
    "ccm_adoption",
    "rpm_adoption",
    "bhi_adoption",
    "awv_adoption",
];

const SCHEMA_SQL: &str = "
CREATE TABLE providers (
    npi TEXT PRIMARY KEY,
    last_org_name TEXT NOT NULL,
    first_name TEXT NOT NULL,
    credentials TEXT NOT NULL,
    specialty TEXT NOT NULL,
    specialty_group TEXT,
    state TEXT NOT NULL,
    city TEXT NOT NULL,
    total_services REAL NOT NULL,
    total_payment_cents INTEGER NOT NULL,
    total_beneficiaries INTEGER NOT NULL,
    em_level1 REAL NOT NULL,
    em_level2 REAL NOT NULL,
    em_level3 REAL NOT NULL,
    em_level4 REAL NOT NULL,
    em_level5 REAL NOT NULL,
    em_total REAL NOT NULL,
    ccm_services REAL NOT NULL,
    ccm_payment_cents INTEGER NOT NULL,
    rpm_services REAL NOT NULL,
    rpm_payment_cents INTEGER NOT NULL,
    bhi_services REAL NOT NULL,
    bhi_payment_cents INTEGER NOT NULL,
    awv_services REAL NOT NULL,
    awv_payment_cents INTEGER NOT NULL,
    top_codes TEXT NOT NULL,
    revenue_score INTEGER
);
CREATE TABLE code_breakdown (
    npi TEXT NOT NULL,
    hcpcs_code TEXT NOT NULL,
    services REAL NOT NULL,
    payment_cents INTEGER NOT NULL,
    beneficiaries INTEGER NOT NULL
);
CREATE TABLE benchmarks (
    specialty TEXT PRIMARY KEY,
    provider_count INTEGER NOT NULL,
    avg_beneficiaries REAL NOT NULL,
    avg_payment REAL NOT NULL,
    avg_revenue_per_beneficiary REAL NOT NULL,
    avg_services REAL NOT NULL,
    pct_level3 REAL NOT NULL,
    pct_level4 REAL NOT NULL,
    pct_level5 REAL NOT NULL,
    ccm_adoption REAL NOT NULL,
    rpm_adoption REAL NOT NULL,
    bhi_adoption REAL NOT NULL,
    awv_adoption REAL NOT NULL
);
";

const INDEX_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_providers_specialty_group ON providers(specialty_group);
CREATE INDEX IF NOT EXISTS idx_providers_state ON providers(state);
CREATE INDEX IF NOT EXISTS idx_providers_total_payment ON providers(total_payment_cents);
CREATE INDEX IF NOT EXISTS idx_providers_revenue_score ON providers(revenue_score);
CREATE UNIQUE INDEX IF NOT EXISTS idx_code_breakdown_npi_code ON code_breakdown(npi, hcpcs_code);
CREATE INDEX IF NOT EXISTS idx_code_breakdown_code ON code_breakdown(hcpcs_code);
ANALYZE;
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Providers,
    CodeBreakdown,
    Benchmarks,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Providers, Table::CodeBreakdown, Table::Benchmarks];

    pub fn name(self) -> &'static str {
        match self {
            Table::Providers => "providers",
            Table::CodeBreakdown => "code_breakdown",
            Table::Benchmarks => "benchmarks",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub providers: i64,
    pub code_breakdown: i64,
    pub benchmarks: i64,
}

impl TableCounts {
    pub fn get(&self, table: Table) -> i64 {
        match table {
            Table::Providers => self.providers,
            Table::CodeBreakdown => self.code_breakdown,
            Table::Benchmarks => self.benchmarks,
        }
    }
}

/// One element of the `top_codes` JSON column. Money uses the same unit as
/// the `*_cents` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopCodeEntry {
    pub code: String,
    pub services: f64,
    pub payment_cents: i64,
    pub beneficiaries: i64,
}

impl From<&CodeBreakdown> for TopCodeEntry {
    fn from(code: &CodeBreakdown) -> Self {
        Self {
            code: code.code.clone(),
            services: code.services,
            payment_cents: code.payment.0,
            beneficiaries: code.beneficiaries,
        }
    }
}

/// A provider row as stored: flat columns, code list as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRow {
    pub npi: String,
    pub last_org_name: String,
    pub first_name: String,
    pub credentials: String,
    pub specialty: String,
    pub specialty_group: Option<String>,
    pub state: String,
    pub city: String,
    pub total_services: f64,
    pub total_payment: Cents,
    pub total_beneficiaries: i64,
    pub em_levels: [f64; EM_LEVEL_COUNT],
    pub em_total: f64,
    pub programs: [ProgramMetrics; PROGRAM_COUNT],
    pub top_codes: String,
    pub revenue_score: Option<i64>,
}

impl ProviderRow {
    pub fn from_aggregate(provider: &ProviderAggregate) -> Result<Self> {
        let entries: Vec<TopCodeEntry> =
            provider.top_codes.iter().map(TopCodeEntry::from).collect();
        let top_codes = serde_json::to_string(&entries)
            .with_context(|| format!("Failed serializing top codes for {}", provider.npi))?;
        Ok(Self {
            npi: provider.npi.clone(),
            last_org_name: provider.last_org_name.clone(),
            first_name: provider.first_name.clone(),
            credentials: provider.credentials.clone(),
            specialty: provider.specialty.clone(),
            specialty_group: provider.specialty_group.clone(),
            state: provider.state.clone(),
            city: provider.city.clone(),
            total_services: provider.total_services,
            total_payment: provider.total_payment,
            total_beneficiaries: provider.total_beneficiaries,
            em_levels: provider.em.levels,
            em_total: provider.em.total,
            programs: provider.programs,
            top_codes,
            revenue_score: provider.revenue_score.map(i64::from),
        })
    }

    fn from_sql(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut em_levels = [0.0; EM_LEVEL_COUNT];
        for (idx, level) in em_levels.iter_mut().enumerate() {
            *level = row.get(11 + idx)?;
        }
        let mut programs = [ProgramMetrics::default(); PROGRAM_COUNT];
        for (idx, program) in programs.iter_mut().enumerate() {
            program.services = row.get(17 + idx * 2)?;
            program.payment = Cents(row.get(18 + idx * 2)?);
        }
        Ok(Self {
            npi: row.get(0)?,
            last_org_name: row.get(1)?,
            first_name: row.get(2)?,
            credentials: row.get(3)?,
            specialty: row.get(4)?,
            specialty_group: row.get(5)?,
            state: row.get(6)?,
            city: row.get(7)?,
            total_services: row.get(8)?,
            total_payment: Cents(row.get(9)?),
            total_beneficiaries: row.get(10)?,
            em_levels,
            em_total: row.get(16)?,
            programs,
            top_codes: row.get(25)?,
            revenue_score: row.get(26)?,
        })
    }

    pub fn em_share(&self, level: usize) -> f64 {
        if self.em_total > 0.0 {
            self.em_levels[level - 1] / self.em_total
        } else {
            0.0
        }
    }
}

/// Sort key of the code table: `(npi, hcpcs_code)` in byte order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CodeKey {
    pub npi: String,
    pub hcpcs_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeRow {
    pub npi: String,
    pub hcpcs_code: String,
    pub services: f64,
    pub payment: Cents,
    pub beneficiaries: i64,
}

impl CodeRow {
    pub fn key(&self) -> CodeKey {
        CodeKey {
            npi: self.npi.clone(),
            hcpcs_code: self.hcpcs_code.clone(),
        }
    }

    fn from_sql(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            npi: row.get(0)?,
            hcpcs_code: row.get(1)?,
            services: row.get(2)?,
            payment: Cents(row.get(3)?),
            beneficiaries: row.get(4)?,
        })
    }
}

/// Targeted update of one provider's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScorePatch<'a> {
    pub npi: &'a str,
    pub revenue_score: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopProvider {
    pub npi: String,
    pub name: String,
    pub total_payment: Cents,
}

pub struct EmbeddedStore {
    conn: Connection,
    path: PathBuf,
}

impl EmbeddedStore {
    /// Replaces any existing store at `path` with an empty one tuned for a
    /// single-writer bulk load.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating {}", parent.display()))?;
        }
        delete_if_exists(path)?;
        for suffix in ["-journal", "-wal", "-shm"] {
            let mut sibling = path.as_os_str().to_os_string();
            sibling.push(suffix);
            delete_if_exists(Path::new(&sibling))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed creating store {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = OFF;
            PRAGMA synchronous = OFF;
            PRAGMA temp_store = MEMORY;
            PRAGMA cache_size = -200000;
            PRAGMA locking_mode = EXCLUSIVE;
            ",
        )
        .context("Failed applying bulk-load pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed creating store schema")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!(
                "Embedded store not found at {}. Run package first.",
                path.display()
            );
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening store {}", path.display()))?;
        conn.execute_batch("PRAGMA temp_store = MEMORY; PRAGMA cache_size = -200000;")
            .context("Failed applying store pragmas")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full record write: provider rows and all of their code rows, in one
    /// transaction.
    pub fn insert_provider_batch(&mut self, providers: &[ProviderAggregate]) -> Result<usize> {
        if providers.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> = (1..=PROVIDER_COLUMNS.len())
            .map(|idx| format!("?{idx}"))
            .collect();
        let provider_sql = format!(
            "INSERT INTO providers ({}) VALUES ({})",
            PROVIDER_COLUMNS.join(", "),
            placeholders.join(", ")
        );

        let tx = self
            .conn
            .transaction()
            .context("Failed starting provider batch transaction")?;
        let mut code_rows = 0usize;
        {
            let mut provider_stmt = tx
                .prepare(&provider_sql)
                .context("Failed preparing provider insert statement")?;
            let mut code_stmt = tx
                .prepare(
                    "INSERT INTO code_breakdown (npi, hcpcs_code, services, payment_cents, beneficiaries)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("Failed preparing code breakdown insert statement")?;

            for provider in providers {
                let row = ProviderRow::from_aggregate(provider)?;
                let [ccm, rpm, bhi, awv] = row.programs;
                provider_stmt
                    .execute(params![
                        row.npi,
                        row.last_org_name,
                        row.first_name,
                        row.credentials,
                        row.specialty,
                        row.specialty_group,
                        row.state,
                        row.city,
                        row.total_services,
                        row.total_payment.0,
                        row.total_beneficiaries,
                        row.em_levels[0],
                        row.em_levels[1],
                        row.em_levels[2],
                        row.em_levels[3],
                        row.em_levels[4],
                        row.em_total,
                        ccm.services,
                        ccm.payment.0,
                        rpm.services,
                        rpm.payment.0,
                        bhi.services,
                        bhi.payment.0,
                        awv.services,
                        awv.payment.0,
                        row.top_codes,
                        row.revenue_score,
                    ])
                    .with_context(|| format!("Failed inserting provider {}", provider.npi))?;

                for code in &provider.codes {
                    insert_code(&mut code_stmt, &provider.npi, code)?;
                    code_rows += 1;
                }
            }
        }
        tx.commit()
            .context("Failed committing provider batch transaction")?;
        Ok(code_rows)
    }

    pub fn insert_benchmarks(
        &mut self,
        benchmarks: &BTreeMap<String, SpecialtyBenchmark>,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed starting benchmark transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO benchmarks (
                        specialty, provider_count, avg_beneficiaries, avg_payment,
                        avg_revenue_per_beneficiary, avg_services,
                        pct_level3, pct_level4, pct_level5,
                        ccm_adoption, rpm_adoption, bhi_adoption, awv_adoption
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .context("Failed preparing benchmark insert statement")?;
            for b in benchmarks.values() {
                let [ccm, rpm, bhi, awv] = b.program_adoption;
                stmt.execute(params![
                    b.specialty,
                    b.provider_count,
                    b.avg_beneficiaries,
                    b.avg_payment,
                    b.avg_revenue_per_beneficiary,
                    b.avg_services,
                    b.pct_level3,
                    b.pct_level4,
                    b.pct_level5,
                    ccm,
                    rpm,
                    bhi,
                    awv,
                ])
                .with_context(|| format!("Failed inserting benchmark {}", b.specialty))?;
            }
        }
        tx.commit()
            .context("Failed committing benchmark transaction")?;
        Ok(())
    }

    /// Score patch path: updates `revenue_score` and nothing else.
    pub fn apply_score_patches(&mut self, patches: &[ScorePatch<'_>]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("Failed starting score transaction")?;
        let mut updated = 0usize;
        {
            let mut stmt = tx
                .prepare("UPDATE providers SET revenue_score = ?1 WHERE npi = ?2")
                .context("Failed preparing score update statement")?;
            for patch in patches {
                updated += stmt
                    .execute(params![patch.revenue_score, patch.npi])
                    .with_context(|| format!("Failed scoring provider {}", patch.npi))?;
            }
        }
        tx.commit().context("Failed committing score transaction")?;
        Ok(updated)
    }

    /// Builds secondary indexes and refreshes planner statistics. Run once,
    /// after every insert.
    pub fn create_indexes(&self) -> Result<()> {
        self.conn
            .execute_batch(INDEX_SQL)
            .context("Failed creating store indexes")
    }

    pub fn table_counts(&self) -> Result<TableCounts> {
        let count = |table: Table| -> Result<i64> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .with_context(|| format!("Failed counting {table}"))
        };
        Ok(TableCounts {
            providers: count(Table::Providers)?,
            code_breakdown: count(Table::CodeBreakdown)?,
            benchmarks: count(Table::Benchmarks)?,
        })
    }

    pub fn top_payment_provider(&self) -> Result<Option<TopProvider>> {
        self.conn
            .query_row(
                "SELECT npi, first_name, last_org_name, total_payment_cents
                 FROM providers
                 ORDER BY total_payment_cents DESC, npi
                 LIMIT 1",
                [],
                |row| {
                    let first: String = row.get(1)?;
                    let last: String = row.get(2)?;
                    let name = match (first.trim(), last.trim()) {
                        ("", last) => last.to_string(),
                        (first, last) => format!("{first} {last}").trim().to_string(),
                    };
                    Ok(TopProvider {
                        npi: row.get(0)?,
                        name,
                        total_payment: Cents(row.get(3)?),
                    })
                },
            )
            .optional()
            .context("Failed reading top payment provider")
    }

    /// Keyset page of providers ordered by identifier.
    pub fn provider_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<ProviderRow>> {
        let sql = format!(
            "SELECT {} FROM providers WHERE npi > ?1 ORDER BY npi LIMIT ?2",
            PROVIDER_COLUMNS.join(", ")
        );
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .context("Failed preparing provider page query")?;
        let rows = stmt
            .query_map(params![after.unwrap_or(""), limit as i64], ProviderRow::from_sql)
            .context("Failed querying provider page")?;
        let mut out = Vec::with_capacity(limit);
        for row in rows {
            out.push(row.context("Failed reading provider row")?);
        }
        Ok(out)
    }

    pub fn distinct_code_counts(&self) -> Result<HashMap<String, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT npi, COUNT(DISTINCT hcpcs_code) FROM code_breakdown GROUP BY npi")
            .context("Failed preparing distinct code count query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed querying distinct code counts")?;
        let mut out = HashMap::new();
        for row in rows {
            let (npi, count) = row.context("Failed reading distinct code count")?;
            out.insert(npi, count);
        }
        Ok(out)
    }

    pub fn benchmarks(&self) -> Result<BTreeMap<String, SpecialtyBenchmark>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT specialty, provider_count, avg_beneficiaries, avg_payment,
                        avg_revenue_per_beneficiary, avg_services,
                        pct_level3, pct_level4, pct_level5,
                        ccm_adoption, rpm_adoption, bhi_adoption, awv_adoption
                 FROM benchmarks
                 ORDER BY specialty",
            )
            .context("Failed preparing benchmark query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SpecialtyBenchmark {
                    specialty: row.get(0)?,
                    provider_count: row.get(1)?,
                    avg_beneficiaries: row.get(2)?,
                    avg_payment: row.get(3)?,
                    avg_revenue_per_beneficiary: row.get(4)?,
                    avg_services: row.get(5)?,
                    pct_level3: row.get(6)?,
                    pct_level4: row.get(7)?,
                    pct_level5: row.get(8)?,
                    program_adoption: [row.get(9)?, row.get(10)?, row.get(11)?, row.get(12)?],
                })
            })
            .context("Failed querying benchmarks")?;
        let mut out = BTreeMap::new();
        for row in rows {
            let benchmark = row.context("Failed reading benchmark row")?;
            out.insert(benchmark.specialty.clone(), benchmark);
        }
        Ok(out)
    }

    /// Key of the code row at `offset` in `(npi, hcpcs_code)` order.
    pub fn code_key_at(&self, offset: i64) -> Result<Option<CodeKey>> {
        self.conn
            .query_row(
                "SELECT npi, hcpcs_code FROM code_breakdown
                 ORDER BY npi, hcpcs_code
                 LIMIT 1 OFFSET ?1",
                [offset],
                |row| {
                    Ok(CodeKey {
                        npi: row.get(0)?,
                        hcpcs_code: row.get(1)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("Failed reading code row at offset {offset}"))
    }

    /// Next page of code rows strictly after `after` (from the start when
    /// `None`), in `(npi, hcpcs_code)` order.
    pub fn code_page(&self, after: Option<&CodeKey>, limit: usize) -> Result<Vec<CodeRow>> {
        let (npi, code) = match after {
            Some(key) => (key.npi.as_str(), key.hcpcs_code.as_str()),
            None => ("", ""),
        };
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT npi, hcpcs_code, services, payment_cents, beneficiaries
                 FROM code_breakdown
                 WHERE (npi, hcpcs_code) > (?1, ?2)
                 ORDER BY npi, hcpcs_code
                 LIMIT ?3",
            )
            .context("Failed preparing code page query")?;
        let rows = stmt
            .query_map(params![npi, code, limit as i64], CodeRow::from_sql)
            .context("Failed querying code page")?;
        let mut out = Vec::with_capacity(limit);
        for row in rows {
            out.push(row.context("Failed reading code row")?);
        }
        Ok(out)
    }

    pub fn file_size_bytes(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)
            .with_context(|| format!("Failed reading metadata for {}", self.path.display()))?
            .len())
    }
}

fn insert_code(
    stmt: &mut rusqlite::Statement<'_>,
    npi: &str,
    code: &CodeBreakdown,
) -> Result<()> {
    stmt.execute(params![
        npi,
        code.code,
        code.services,
        code.payment.0,
        code.beneficiaries,
    ])
    .with_context(|| format!("Failed inserting code {} for {npi}", code.code))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tests::provider;

    fn store_with(providers: &[ProviderAggregate]) -> (tempfile::TempDir, EmbeddedStore) {
        let dir = tempfile::tempdir().expect("tmp");
        let mut store = EmbeddedStore::create(&dir.path().join("providers.sqlite")).expect("create");
        store.insert_provider_batch(providers).expect("insert");
        store.create_indexes().expect("indexes");
        (dir, store)
    }

    #[test]
    fn provider_rows_survive_the_store() {
        let input = provider("1000000001", Some("Cardiology"));
        let (_dir, store) = store_with(std::slice::from_ref(&input));

        let rows = store.provider_page(None, 10).expect("page");
        assert_eq!(rows, vec![ProviderRow::from_aggregate(&input).expect("row")]);
        let counts = store.table_counts().expect("counts");
        assert_eq!(counts.providers, 1);
        assert_eq!(counts.code_breakdown, 2);
        assert_eq!(counts.benchmarks, 0);
    }

    #[test]
    fn score_patch_changes_only_the_score() {
        let (_dir, mut store) = store_with(&[
            provider("1000000001", Some("Cardiology")),
            provider("1000000002", None),
        ]);
        let before = store.provider_page(None, 10).expect("before");

        let updated = store
            .apply_score_patches(&[
                ScorePatch {
                    npi: "1000000002",
                    revenue_score: 73,
                },
                ScorePatch {
                    npi: "9999999999",
                    revenue_score: 10,
                },
            ])
            .expect("patch");
        assert_eq!(updated, 1);

        let after = store.provider_page(None, 10).expect("after");
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1].revenue_score, Some(73));
        let mut unscored = after[1].clone();
        unscored.revenue_score = None;
        assert_eq!(unscored, before[1]);
    }

    #[test]
    fn code_pages_follow_key_order() {
        let (_dir, store) = store_with(&[
            provider("2000000001", None),
            provider("1000000001", None),
        ]);
        let first = store.code_page(None, 3).expect("first");
        let keys: Vec<(String, String)> = first
            .iter()
            .map(|r| (r.npi.clone(), r.hcpcs_code.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("1000000001".to_string(), "99213".to_string()),
                ("1000000001".to_string(), "99214".to_string()),
                ("2000000001".to_string(), "99213".to_string()),
            ]
        );
        let rest = store.code_page(Some(&first[2].key()), 3).expect("rest");
        assert_eq!(rest.len(), 1);
        assert_eq!(store.code_key_at(3).expect("at"), Some(rest[0].key()));
        assert_eq!(store.code_key_at(4).expect("past end"), None);
        assert_eq!(
            store.distinct_code_counts().expect("counts")["2000000001"],
            2
        );
    }

    /// Provider whose code payments are awkward fractions of a dollar.
    fn provider_with_cents(npi: &str, seed: i64) -> ProviderAggregate {
        let mut out = provider(npi, Some("Cardiology"));
        out.codes = (0..12)
            .map(|i| CodeBreakdown {
                code: format!("C{i:04}"),
                services: 1.0,
                payment: Cents((seed * 7_919 + i * 104_729) % 5_000_000 + 1),
                beneficiaries: 11,
            })
            .collect();
        out.total_payment = out.codes.iter().map(|c| c.payment).sum();
        out.top_codes = out.codes.iter().take(3).cloned().collect();
        out
    }

    #[test]
    fn code_payments_sum_to_the_provider_total_in_sql() {
        let providers: Vec<ProviderAggregate> = (0..200)
            .map(|i| provider_with_cents(&format!("{:010}", 1_000_000_000 + i), i))
            .collect();
        let (_dir, store) = store_with(&providers);

        let mismatched: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM providers p
                 WHERE p.total_payment_cents <>
                       (SELECT SUM(c.payment_cents) FROM code_breakdown c WHERE c.npi = p.npi)",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(mismatched, 0);
    }

    #[test]
    fn top_codes_use_the_code_table_unit() {
        let (_dir, store) = store_with(&[provider("1000000001", None)]);
        let row = &store.provider_page(None, 1).expect("page")[0];
        let entries: Vec<TopCodeEntry> = serde_json::from_str(&row.top_codes).expect("json");
        assert_eq!(entries.len(), 2);

        for entry in &entries {
            let stored: i64 = store
                .conn
                .query_row(
                    "SELECT payment_cents FROM code_breakdown WHERE npi = ?1 AND hcpcs_code = ?2",
                    params![row.npi, entry.code],
                    |r| r.get(0),
                )
                .expect("code row");
            assert_eq!(entry.payment_cents, stored, "code {}", entry.code);
        }
        assert_eq!(entries[0].payment_cents, 700_000);
    }

    #[test]
    fn em_share_is_zero_without_volume() {
        let mut row = ProviderRow::from_aggregate(&provider("1000000001", None)).expect("row");
        assert_eq!(row.em_share(4), 0.6);
        row.em_levels = [0.0; EM_LEVEL_COUNT];
        row.em_total = 0.0;
        assert_eq!(row.em_share(4), 0.0);
    }

    #[test]
    fn create_replaces_an_existing_store() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("providers.sqlite");
        {
            let mut store = EmbeddedStore::create(&path).expect("create");
            store
                .insert_provider_batch(&[provider("1000000001", None)])
                .expect("insert");
        }
        let store = EmbeddedStore::create(&path).expect("recreate");
        assert_eq!(store.table_counts().expect("counts"), TableCounts::default());
    }
}
