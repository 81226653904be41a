//! Streaming ingest of the per-provider × per-code claims extract.
//!
//! The whole extract (about 1.2M providers and 8 to 10M code rows) is folded
//! into in-memory accumulators in one pass. Peak memory is the scale ceiling
//! of this stage: if the input outgrows one machine, replace the provider
//! map with an external sort-merge (partition rows by identifier, sort each
//! partition, then merge-aggregate while streaming) and keep everything
//! downstream of `Aggregator::finish` unchanged.

use anyhow::{Context, Result, bail};
use csv::StringRecord;
use indicatif::ProgressBar;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::Path,
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    codes::{PROGRAM_COUNT, ProgramGroup, em_level, program_for},
    common::{apply_bar_style, format_count},
    constants::{
        INGEST_PROGRESS_EVERY, LOGGED_PARSE_ERRORS, PROVIDER_ID_LEN, SAMPLED_UNMAPPED_LABELS,
        TOP_CODES_PER_PROVIDER,
    },
    model::{Cents, CodeBreakdown, EmBreakdown, ProgramMetrics, ProviderAggregate},
    specialty::SpecialtyMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceField {
    Npi = 0,
    LastOrgName = 1,
    FirstName = 2,
    Credentials = 3,
    ProviderType = 4,
    State = 5,
    City = 6,
    Code = 7,
    Beneficiaries = 8,
    Services = 9,
    AvgPayment = 10,
}

const FIELD_COUNT: usize = 11;

impl SourceField {
    pub const ALL: [SourceField; FIELD_COUNT] = [
        SourceField::Npi,
        SourceField::LastOrgName,
        SourceField::FirstName,
        SourceField::Credentials,
        SourceField::ProviderType,
        SourceField::State,
        SourceField::City,
        SourceField::Code,
        SourceField::Beneficiaries,
        SourceField::Services,
        SourceField::AvgPayment,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            SourceField::Npi => "Rndrng_NPI",
            SourceField::LastOrgName => "Rndrng_Prvdr_Last_Org_Name",
            SourceField::FirstName => "Rndrng_Prvdr_First_Name",
            SourceField::Credentials => "Rndrng_Prvdr_Crdntls",
            SourceField::ProviderType => "Rndrng_Prvdr_Type",
            SourceField::State => "Rndrng_Prvdr_State_Abrvtn",
            SourceField::City => "Rndrng_Prvdr_City",
            SourceField::Code => "HCPCS_Cd",
            SourceField::Beneficiaries => "Tot_Benes",
            SourceField::Services => "Tot_Srvcs",
            SourceField::AvgPayment => "Avg_Mdcr_Pymt_Amt",
        }
    }

    /// Index into `ALL` and into `ColumnIndex::positions`.
    fn slot(self) -> usize {
        self as usize
    }
}

/// Positions of the required columns, resolved by header name.
#[derive(Debug, Clone)]
pub struct ColumnIndex {
    positions: [usize; FIELD_COUNT],
}

impl ColumnIndex {
    pub fn resolve(headers: &StringRecord) -> Result<Self> {
        let by_name: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().trim_start_matches('\u{feff}'), idx))
            .collect();

        let mut positions = [0usize; FIELD_COUNT];
        let mut missing = Vec::new();
        for field in SourceField::ALL {
            match by_name.get(field.column_name()) {
                Some(idx) => positions[field.slot()] = *idx,
                None => missing.push(field.column_name()),
            }
        }
        if !missing.is_empty() {
            bail!(
                "Input header is missing required column(s): {}",
                missing.join(", ")
            );
        }
        Ok(Self { positions })
    }

    pub fn position(&self, field: SourceField) -> usize {
        self.positions[field.slot()]
    }
}

#[derive(Debug, Error)]
pub enum RowError {
    #[error("line {line}: unreadable record: {message}")]
    Unreadable { line: u64, message: String },
    #[error("line {line}: missing field {column}")]
    MissingField { line: u64, column: &'static str },
    #[error("line {line}: invalid {column} value {value:?}")]
    InvalidNumber {
        line: u64,
        column: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub npi: String,
    pub last_org_name: String,
    pub first_name: String,
    pub credentials: String,
    pub provider_type: String,
    pub state: String,
    pub city: String,
    pub code: String,
    pub beneficiaries: i64,
    pub services: f64,
    pub avg_payment: f64,
}

fn field<'r>(
    record: &'r StringRecord,
    index: &ColumnIndex,
    source_field: SourceField,
    line: u64,
) -> Result<&'r str, RowError> {
    record
        .get(index.position(source_field))
        .map(str::trim)
        .ok_or(RowError::MissingField {
            line,
            column: source_field.column_name(),
        })
}

fn number(
    record: &StringRecord,
    index: &ColumnIndex,
    source_field: SourceField,
    line: u64,
) -> Result<f64, RowError> {
    let raw = field(record, index, source_field, line)?;
    let cleaned: String = raw.chars().filter(|c| *c != ',' && *c != '$').collect();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(RowError::InvalidNumber {
            line,
            column: source_field.column_name(),
            value: raw.to_string(),
        }),
    }
}

/// Parses one data row. `Ok(None)` means the identifier cannot be a
/// provider key and the row is skipped without being counted as malformed.
pub fn parse_row(
    record: &StringRecord,
    index: &ColumnIndex,
    line: u64,
) -> Result<Option<SourceRow>, RowError> {
    let npi = field(record, index, SourceField::Npi, line)?;
    if npi.chars().count() != PROVIDER_ID_LEN {
        return Ok(None);
    }

    let text = |source_field| field(record, index, source_field, line).map(str::to_string);
    Ok(Some(SourceRow {
        npi: npi.to_string(),
        last_org_name: text(SourceField::LastOrgName)?,
        first_name: text(SourceField::FirstName)?,
        credentials: text(SourceField::Credentials)?,
        provider_type: text(SourceField::ProviderType)?,
        state: text(SourceField::State)?,
        city: text(SourceField::City)?,
        code: text(SourceField::Code)?,
        beneficiaries: number(record, index, SourceField::Beneficiaries, line)?.round() as i64,
        services: number(record, index, SourceField::Services, line)?,
        avg_payment: number(record, index, SourceField::AvgPayment, line)?,
    }))
}

#[derive(Debug, Clone, Default)]
struct CodeAccumulator {
    services: f64,
    payment: Cents,
    beneficiaries: i64,
}

#[derive(Debug, Clone)]
struct ProviderAccumulator {
    last_org_name: String,
    first_name: String,
    credentials: String,
    provider_type: String,
    state: String,
    city: String,
    total_services: f64,
    total_payment: Cents,
    max_beneficiaries: i64,
    codes: HashMap<String, CodeAccumulator>,
}

impl ProviderAccumulator {
    fn from_row(row: &SourceRow) -> Self {
        Self {
            last_org_name: row.last_org_name.clone(),
            first_name: row.first_name.clone(),
            credentials: row.credentials.clone(),
            provider_type: row.provider_type.clone(),
            state: row.state.clone(),
            city: row.city.clone(),
            total_services: 0.0,
            total_payment: Cents::default(),
            max_beneficiaries: 0,
            codes: HashMap::new(),
        }
    }
}

/// Running totals for one canonical specialty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecialtyAccumulator {
    pub provider_count: i64,
    pub beneficiaries: i64,
    pub payment: Cents,
    pub services: f64,
    pub em_level3: f64,
    pub em_level4: f64,
    pub em_level5: f64,
    pub em_total: f64,
    pub program_providers: [i64; PROGRAM_COUNT],
}

impl SpecialtyAccumulator {
    pub fn add_provider(&mut self, provider: &ProviderAggregate) {
        self.provider_count += 1;
        self.beneficiaries += provider.total_beneficiaries;
        self.payment += provider.total_payment;
        self.services += provider.total_services;
        self.em_level3 += provider.em.level(3);
        self.em_level4 += provider.em.level(4);
        self.em_level5 += provider.em.level(5);
        self.em_total += provider.em.total;
        for group in ProgramGroup::ALL {
            if provider.program(group).is_billed() {
                self.program_providers[group.index()] += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestStats {
    pub rows_read: u64,
    pub rows_aggregated: u64,
    pub skipped_invalid_id: u64,
    pub malformed_rows: u64,
    /// Malformed rows that were written to the log.
    pub logged_errors: u64,
    pub providers: u64,
    pub code_rows: u64,
    pub unmapped_providers: u64,
    /// First few distinct raw specialty labels with no canonical mapping.
    pub unmapped_labels: BTreeSet<String>,
    pub specialties: u64,
}

#[derive(Debug)]
pub struct AggregateOutput {
    /// Sorted by identifier.
    pub providers: Vec<ProviderAggregate>,
    pub specialties: BTreeMap<String, SpecialtyAccumulator>,
    pub stats: IngestStats,
}

pub struct Aggregator<'m> {
    specialty_map: &'m SpecialtyMap,
    providers: HashMap<String, ProviderAccumulator>,
    stats: IngestStats,
}

impl<'m> Aggregator<'m> {
    pub fn new(specialty_map: &'m SpecialtyMap) -> Self {
        Self {
            specialty_map,
            providers: HashMap::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn add(&mut self, row: SourceRow) {
        let payment = Cents::from_dollars(row.avg_payment * row.services);
        let provider = self
            .providers
            .entry(row.npi.clone())
            .or_insert_with(|| ProviderAccumulator::from_row(&row));

        provider.total_services += row.services;
        provider.total_payment += payment;

        let code = provider.codes.entry(row.code).or_default();
        code.services += row.services;
        code.payment += payment;
        code.beneficiaries += row.beneficiaries;
        // Compared against the per-code total so repeated code rows (one per
        // place of service) still agree with the breakdown table.
        if code.beneficiaries > provider.max_beneficiaries {
            provider.max_beneficiaries = code.beneficiaries;
        }
        self.stats.rows_aggregated += 1;
    }

    pub fn record_invalid_id(&mut self) {
        self.stats.skipped_invalid_id += 1;
    }

    /// Counts a skipped row and logs it while under the logging cap.
    pub fn record_malformed(&mut self, err: &RowError) {
        self.stats.malformed_rows += 1;
        if self.stats.logged_errors < LOGGED_PARSE_ERRORS as u64 {
            self.stats.logged_errors += 1;
            warn!("Skipping malformed row: {err}");
        }
    }

    pub fn finish(self) -> AggregateOutput {
        let Aggregator {
            specialty_map,
            providers,
            mut stats,
        } = self;

        let mut entries: Vec<(String, ProviderAccumulator)> = providers.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut specialties: BTreeMap<String, SpecialtyAccumulator> = BTreeMap::new();
        let mut out = Vec::with_capacity(entries.len());
        for (npi, acc) in entries {
            let provider = finalize_provider(npi, acc, specialty_map);
            stats.code_rows += provider.codes.len() as u64;
            match &provider.specialty_group {
                Some(group) => specialties
                    .entry(group.clone())
                    .or_default()
                    .add_provider(&provider),
                None => {
                    stats.unmapped_providers += 1;
                    if stats.unmapped_labels.len() < SAMPLED_UNMAPPED_LABELS {
                        stats.unmapped_labels.insert(provider.specialty.clone());
                    }
                }
            }
            out.push(provider);
        }
        stats.providers = out.len() as u64;
        stats.specialties = specialties.len() as u64;
        if stats.unmapped_providers > 0 {
            let labels: Vec<&str> = stats.unmapped_labels.iter().map(String::as_str).collect();
            warn!(
                "{} providers have no canonical specialty; unmapped labels include: {}",
                format_count(stats.unmapped_providers as usize),
                labels.join(", ")
            );
        }

        AggregateOutput {
            providers: out,
            specialties,
            stats,
        }
    }
}

fn finalize_provider(
    npi: String,
    acc: ProviderAccumulator,
    specialty_map: &SpecialtyMap,
) -> ProviderAggregate {
    let mut codes: Vec<CodeBreakdown> = acc
        .codes
        .into_iter()
        .map(|(code, totals)| CodeBreakdown {
            code,
            services: totals.services,
            payment: totals.payment,
            beneficiaries: totals.beneficiaries,
        })
        .collect();
    codes.sort_by(|a, b| a.code.cmp(&b.code));

    let mut em = EmBreakdown::default();
    let mut programs = [ProgramMetrics::default(); PROGRAM_COUNT];
    for code in &codes {
        if let Some(level) = em_level(&code.code) {
            em.levels[level - 1] += code.services;
            em.total += code.services;
        }
        if let Some(group) = program_for(&code.code) {
            let metrics = &mut programs[group.index()];
            metrics.services += code.services;
            metrics.payment += code.payment;
        }
    }

    let mut top_codes = codes.clone();
    top_codes.sort_by(|a, b| b.payment.cmp(&a.payment).then_with(|| a.code.cmp(&b.code)));
    top_codes.truncate(TOP_CODES_PER_PROVIDER);

    let specialty_group = specialty_map
        .canonical(&acc.provider_type)
        .map(str::to_string);

    ProviderAggregate {
        npi,
        last_org_name: acc.last_org_name,
        first_name: acc.first_name,
        credentials: acc.credentials,
        specialty: acc.provider_type,
        specialty_group,
        state: acc.state,
        city: acc.city,
        total_services: acc.total_services,
        total_payment: acc.total_payment,
        total_beneficiaries: acc.max_beneficiaries,
        em,
        programs,
        top_codes,
        codes,
        revenue_score: None,
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub delimiter: u8,
    pub limit_rows: Option<u64>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            limit_rows: None,
        }
    }
}

pub fn ingest_file(
    input_path: &Path,
    specialty_map: &SpecialtyMap,
    opts: &IngestOptions,
) -> Result<AggregateOutput> {
    if !input_path.is_file() {
        bail!("Input file not found at {}", input_path.display());
    }
    let file_len = fs::metadata(input_path)
        .with_context(|| format!("Failed reading metadata for {}", input_path.display()))?
        .len();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(opts.delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(input_path)
        .with_context(|| format!("Failed opening input {}", input_path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed reading header from {}", input_path.display()))?
        .clone();
    let index = ColumnIndex::resolve(&headers)
        .with_context(|| format!("Invalid input header in {}", input_path.display()))?;
    info!(
        "Resolved {} required columns in {}",
        FIELD_COUNT,
        input_path.display()
    );

    let progress = ProgressBar::new(file_len);
    progress.set_prefix("INGEST");
    apply_bar_style(&progress, "{binary_bytes}/{binary_total_bytes}");
    progress.enable_steady_tick(Duration::from_millis(250));

    let mut aggregator = Aggregator::new(specialty_map);
    let mut rows_read = 0u64;
    let mut record = StringRecord::new();
    loop {
        if opts.limit_rows.is_some_and(|limit| rows_read >= limit) {
            info!("Stopping after --limit-rows={rows_read}");
            break;
        }

        let line = reader.position().line() + 1;
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) if matches!(err.kind(), csv::ErrorKind::Utf8 { .. }) => {
                rows_read += 1;
                aggregator.record_malformed(&RowError::Unreadable {
                    line,
                    message: err.to_string(),
                });
                continue;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed reading {}", input_path.display()));
            }
        }
        rows_read += 1;

        let line = record.position().map(|p| p.line()).unwrap_or(line);
        match parse_row(&record, &index, line) {
            Ok(Some(row)) => aggregator.add(row),
            Ok(None) => aggregator.record_invalid_id(),
            Err(err) => aggregator.record_malformed(&err),
        }

        if rows_read % 10_000 == 0 {
            progress.set_position(reader.position().byte());
        }
        if rows_read % INGEST_PROGRESS_EVERY == 0 {
            info!(
                "Read {} rows ({} providers so far)",
                format_count(rows_read as usize),
                format_count(aggregator.providers.len())
            );
        }
    }
    progress.finish_with_message(format!("{} rows", format_count(rows_read as usize)));

    let mut output = aggregator.finish();
    output.stats.rows_read = rows_read;
    let unlogged = output.stats.malformed_rows - output.stats.logged_errors;
    if unlogged > 0 {
        warn!("{unlogged} more malformed rows were skipped without logging");
    }
    Ok(output)
}

pub fn print_ingest_summary(stats: &IngestStats) {
    let border = "+--------------------------------------------+--------------------------+";
    println!();
    println!("{border}");
    println!("| {:<42} | {:<24} |", "INGEST SUMMARY", "");
    println!("{border}");
    let rows = [
        ("Rows read", stats.rows_read),
        ("Rows aggregated", stats.rows_aggregated),
        ("Skipped (identifier not 10 chars)", stats.skipped_invalid_id),
        ("Skipped (malformed)", stats.malformed_rows),
        ("Providers", stats.providers),
        ("Provider x code rows", stats.code_rows),
        ("Providers without canonical specialty", stats.unmapped_providers),
        ("Canonical specialties seen", stats.specialties),
    ];
    for (label, value) in rows {
        println!("| {:<42} | {:<24} |", label, format_count(value as usize));
    }
    println!("{border}");
    if !stats.unmapped_labels.is_empty() {
        println!("Unmapped specialty labels (sample):");
        for label in &stats.unmapped_labels {
            println!("  {label}");
        }
    }
    println!();
}
