//! Destination side of replication: the networked Postgres copy of the
//! three store tables.

use anyhow::{Context, Result, ensure};
use sqlx::{
    PgPool, Postgres, QueryBuilder,
    postgres::PgPoolOptions,
};
use std::time::Duration;

use crate::{
    constants::MAX_BIND_PARAMS,
    model::SpecialtyBenchmark,
    store::{
        BENCHMARK_COLUMNS, CODE_COLUMNS, CodeKey, CodeRow, PROVIDER_COLUMNS, ProviderRow, Table,
    },
};

/// Where replicated rows go. Each insert call must be atomic: a batch is
/// either fully committed or not at all, which is what lets resume mode
/// treat the destination row count as an offset. Inserts must also ignore
/// rows whose key is already present, so re-sending a batch whose commit
/// succeeded but whose acknowledgement was lost adds nothing.
#[allow(async_fn_in_trait)]
pub trait ReplicaSink {
    async fn recreate_schema(&self) -> Result<()>;
    async fn insert_benchmarks(&self, rows: &[SpecialtyBenchmark]) -> Result<()>;
    async fn insert_providers(&self, rows: &[ProviderRow]) -> Result<()>;
    async fn insert_codes(&self, rows: &[CodeRow]) -> Result<()>;
    async fn count_rows(&self, table: Table) -> Result<i64>;
    /// Largest `(npi, hcpcs_code)` present, in byte order.
    async fn last_code_key(&self) -> Result<Option<CodeKey>>;
    async fn create_indexes(&self) -> Result<()>;
}

pub fn columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Providers => &PROVIDER_COLUMNS,
        Table::CodeBreakdown => &CODE_COLUMNS,
        Table::Benchmarks => &BENCHMARK_COLUMNS,
    }
}

/// Rejects batch sizes whose multi-row insert would exceed the
/// per-statement bind parameter limit.
pub fn check_batch_size(table: Table, batch_size: usize) -> Result<()> {
    ensure!(batch_size > 0, "{table} batch size must be at least 1");
    let params = batch_size * columns(table).len();
    ensure!(
        params <= MAX_BIND_PARAMS,
        "{table} batch of {batch_size} rows needs {params} bind parameters; the limit is {MAX_BIND_PARAMS}"
    );
    Ok(())
}

/// Key columns each destination table is declared with, used to make
/// re-sent batches a no-op.
fn key_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Providers => &["npi"],
        Table::CodeBreakdown => &["npi", "hcpcs_code"],
        Table::Benchmarks => &["specialty"],
    }
}

fn conflict_clause(table: Table) -> String {
    format!(" ON CONFLICT ({}) DO NOTHING", key_columns(table).join(", "))
}

const PG_SCHEMA_SQL: &str = r#"
DROP TABLE IF EXISTS code_breakdown;
DROP TABLE IF EXISTS providers;
DROP TABLE IF EXISTS benchmarks;
CREATE TABLE benchmarks (
    specialty TEXT PRIMARY KEY,
    provider_count BIGINT NOT NULL,
    avg_beneficiaries DOUBLE PRECISION NOT NULL,
    avg_payment DOUBLE PRECISION NOT NULL,
    avg_revenue_per_beneficiary DOUBLE PRECISION NOT NULL,
    avg_services DOUBLE PRECISION NOT NULL,
    pct_level3 DOUBLE PRECISION NOT NULL,
    pct_level4 DOUBLE PRECISION NOT NULL,
    pct_level5 DOUBLE PRECISION NOT NULL,
    ccm_adoption DOUBLE PRECISION NOT NULL,
    rpm_adoption DOUBLE PRECISION NOT NULL,
    bhi_adoption DOUBLE PRECISION NOT NULL,
    awv_adoption DOUBLE PRECISION NOT NULL
);
CREATE TABLE providers (
    npi TEXT COLLATE "C" PRIMARY KEY,
    last_org_name TEXT NOT NULL,
    first_name TEXT NOT NULL,
    credentials TEXT NOT NULL,
    specialty TEXT NOT NULL,
    specialty_group TEXT,
    state TEXT NOT NULL,
    city TEXT NOT NULL,
    total_services DOUBLE PRECISION NOT NULL,
    total_payment_cents BIGINT NOT NULL,
    total_beneficiaries BIGINT NOT NULL,
    em_level1 DOUBLE PRECISION NOT NULL,
    em_level2 DOUBLE PRECISION NOT NULL,
    em_level3 DOUBLE PRECISION NOT NULL,
    em_level4 DOUBLE PRECISION NOT NULL,
    em_level5 DOUBLE PRECISION NOT NULL,
    em_total DOUBLE PRECISION NOT NULL,
    ccm_services DOUBLE PRECISION NOT NULL,
    ccm_payment_cents BIGINT NOT NULL,
    rpm_services DOUBLE PRECISION NOT NULL,
    rpm_payment_cents BIGINT NOT NULL,
    bhi_services DOUBLE PRECISION NOT NULL,
    bhi_payment_cents BIGINT NOT NULL,
    awv_services DOUBLE PRECISION NOT NULL,
    awv_payment_cents BIGINT NOT NULL,
    top_codes TEXT NOT NULL,
    revenue_score BIGINT
);
CREATE TABLE code_breakdown (
    npi TEXT COLLATE "C" NOT NULL,
    hcpcs_code TEXT COLLATE "C" NOT NULL,
    services DOUBLE PRECISION NOT NULL,
    payment_cents BIGINT NOT NULL,
    beneficiaries BIGINT NOT NULL,
    PRIMARY KEY (npi, hcpcs_code)
);
"#;

const PG_INDEX_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_providers_specialty_group ON providers(specialty_group);
CREATE INDEX IF NOT EXISTS idx_providers_state ON providers(state);
CREATE INDEX IF NOT EXISTS idx_providers_total_payment ON providers(total_payment_cents);
CREATE INDEX IF NOT EXISTS idx_providers_revenue_score ON providers(revenue_score);
CREATE INDEX IF NOT EXISTS idx_code_breakdown_code ON code_breakdown(hcpcs_code);
ANALYZE providers;
ANALYZE code_breakdown;
ANALYZE benchmarks;
";

pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("Failed to connect to the destination database")?;
        Ok(Self { pool })
    }

    fn insert_builder(table: Table) -> QueryBuilder<'static, Postgres> {
        QueryBuilder::new(format!(
            "INSERT INTO {table} ({}) ",
            columns(table).join(", ")
        ))
    }
}

impl ReplicaSink for PgSink {
    async fn recreate_schema(&self) -> Result<()> {
        sqlx::raw_sql(PG_SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to recreate destination tables")?;
        Ok(())
    }

    async fn insert_benchmarks(&self, rows: &[SpecialtyBenchmark]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut query_builder = Self::insert_builder(Table::Benchmarks);
        query_builder.push_values(rows, |mut b, row| {
            let [ccm, rpm, bhi, awv] = row.program_adoption;
            b.push_bind(row.specialty.clone())
                .push_bind(row.provider_count)
                .push_bind(row.avg_beneficiaries)
                .push_bind(row.avg_payment)
                .push_bind(row.avg_revenue_per_beneficiary)
                .push_bind(row.avg_services)
                .push_bind(row.pct_level3)
                .push_bind(row.pct_level4)
                .push_bind(row.pct_level5)
                .push_bind(ccm)
                .push_bind(rpm)
                .push_bind(bhi)
                .push_bind(awv);
        });
        query_builder.push(conflict_clause(Table::Benchmarks));
        query_builder
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to insert benchmarks")?;
        Ok(())
    }

    async fn insert_providers(&self, rows: &[ProviderRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut query_builder = Self::insert_builder(Table::Providers);
        query_builder.push_values(rows, |mut b, row| {
            let [ccm, rpm, bhi, awv] = row.programs;
            b.push_bind(row.npi.clone())
                .push_bind(row.last_org_name.clone())
                .push_bind(row.first_name.clone())
                .push_bind(row.credentials.clone())
                .push_bind(row.specialty.clone())
                .push_bind(row.specialty_group.clone())
                .push_bind(row.state.clone())
                .push_bind(row.city.clone())
                .push_bind(row.total_services)
                .push_bind(row.total_payment.0)
                .push_bind(row.total_beneficiaries);
            for level in row.em_levels {
                b.push_bind(level);
            }
            b.push_bind(row.em_total);
            for program in [ccm, rpm, bhi, awv] {
                b.push_bind(program.services).push_bind(program.payment.0);
            }
            b.push_bind(row.top_codes.clone())
                .push_bind(row.revenue_score);
        });
        query_builder.push(conflict_clause(Table::Providers));
        query_builder
            .build()
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to insert {} provider rows", rows.len()))?;
        Ok(())
    }

    async fn insert_codes(&self, rows: &[CodeRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut query_builder = Self::insert_builder(Table::CodeBreakdown);
        query_builder.push_values(rows, |mut b, row| {
            b.push_bind(row.npi.clone())
                .push_bind(row.hcpcs_code.clone())
                .push_bind(row.services)
                .push_bind(row.payment.0)
                .push_bind(row.beneficiaries);
        });
        query_builder.push(conflict_clause(Table::CodeBreakdown));
        query_builder
            .build()
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to insert {} code rows", rows.len()))?;
        Ok(())
    }

    async fn count_rows(&self, table: Table) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count destination {table}"))
    }

    async fn last_code_key(&self) -> Result<Option<CodeKey>> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT npi, hcpcs_code FROM code_breakdown
             ORDER BY npi DESC, hcpcs_code DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read the last destination code row")?;
        Ok(row.map(|(npi, hcpcs_code)| CodeKey { npi, hcpcs_code }))
    }

    async fn create_indexes(&self) -> Result<()> {
        sqlx::raw_sql(PG_INDEX_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to create destination indexes")?;
        Ok(())
    }
}
