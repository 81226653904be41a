//! RevenueScore: a 0 to 100 composite of five sub-scores, each compared with
//! the provider's specialty benchmark.
//!
//! Every ratio guards its denominator. The fallbacks are:
//! * E&M coding: no E&M volume scores 50; a benchmark share of 0 counts as
//!   ratio 1.0.
//! * Program utilization: no program with ≥ 1% specialty adoption scores 50.
//! * Revenue efficiency and patient volume: a zero beneficiary count, zero
//!   benchmark average, or zero expected payment scores 50.
//! * Providers whose specialty has no benchmark use `FALLBACK_BENCHMARK`.

use anyhow::Result;
use indicatif::ProgressBar;
use std::collections::BTreeMap;
use tracing::info;

use crate::{
    codes::ProgramGroup,
    common::{ITEM_COUNTER, apply_bar_style, format_count},
    constants::MIN_PROGRAM_ADOPTION,
    model::SpecialtyBenchmark,
    store::{EmbeddedStore, ProviderRow, ScorePatch},
};

const NEUTRAL: f64 = 50.0;
const E_M_RATIO_CAP: f64 = 1.2;
const EFFICIENCY_RATIO_CAP: f64 = 1.5;
const EFFICIENCY_SCALE: f64 = 66.7;

const WEIGHT_EM: f64 = 0.25;
const WEIGHT_PROGRAMS: f64 = 0.25;
const WEIGHT_EFFICIENCY: f64 = 0.20;
const WEIGHT_DIVERSITY: f64 = 0.15;
const WEIGHT_VOLUME: f64 = 0.15;

/// Stand-in for specialties too small to benchmark.
pub const FALLBACK_BENCHMARK: SpecialtyBenchmark = SpecialtyBenchmark {
    specialty: String::new(),
    provider_count: 0,
    avg_beneficiaries: 250.0,
    avg_payment: 75_000.0,
    avg_revenue_per_beneficiary: 300.0,
    avg_services: 1_500.0,
    pct_level3: 0.45,
    pct_level4: 0.40,
    pct_level5: 0.08,
    program_adoption: [0.05, 0.02, 0.01, 0.10],
};

fn ratio_or_one(value: f64, baseline: f64) -> f64 {
    if baseline > 0.0 { value / baseline } else { 1.0 }
}

pub fn em_coding_score(provider: &ProviderRow, benchmark: &SpecialtyBenchmark) -> f64 {
    if provider.em_total <= 0.0 {
        return NEUTRAL;
    }
    let level4 = ratio_or_one(provider.em_share(4), benchmark.pct_level4).min(E_M_RATIO_CAP);
    let level5 = ratio_or_one(provider.em_share(5), benchmark.pct_level5).min(E_M_RATIO_CAP);
    let combined = 0.6 * level4 + 0.4 * level5;
    (combined * (100.0 / E_M_RATIO_CAP)).clamp(0.0, 100.0)
}

pub fn program_utilization_score(provider: &ProviderRow, benchmark: &SpecialtyBenchmark) -> f64 {
    let mut relevant = 0.0;
    let mut billed = 0.0;
    for group in ProgramGroup::ALL {
        if benchmark.adoption(group) < MIN_PROGRAM_ADOPTION {
            continue;
        }
        relevant += group.score_weight();
        if provider.programs[group.index()].is_billed() {
            billed += group.score_weight();
        }
    }
    if relevant <= 0.0 {
        return NEUTRAL;
    }
    (billed / relevant * 100.0).clamp(0.0, 100.0)
}

pub fn revenue_efficiency_score(provider: &ProviderRow, benchmark: &SpecialtyBenchmark) -> f64 {
    if benchmark.avg_beneficiaries <= 0.0 || provider.total_beneficiaries <= 0 {
        return NEUTRAL;
    }
    let expected = benchmark.avg_payment
        * (provider.total_beneficiaries as f64 / benchmark.avg_beneficiaries);
    if expected <= 0.0 {
        return NEUTRAL;
    }
    let ratio = (provider.total_payment.dollars() / expected).min(EFFICIENCY_RATIO_CAP);
    (ratio * EFFICIENCY_SCALE).clamp(0.0, 100.0)
}

pub fn service_diversity_score(distinct_codes: i64) -> f64 {
    match distinct_codes {
        n if n >= 20 => 100.0,
        n if n >= 15 => 85.0,
        n if n >= 10 => 70.0,
        n if n >= 6 => 55.0,
        n if n >= 3 => 35.0,
        _ => 15.0,
    }
}

pub fn patient_volume_score(provider: &ProviderRow, benchmark: &SpecialtyBenchmark) -> f64 {
    if provider.total_beneficiaries <= 0 || benchmark.avg_revenue_per_beneficiary <= 0.0 {
        return NEUTRAL;
    }
    let actual = provider.total_payment.dollars() / provider.total_beneficiaries as f64;
    let ratio = (actual / benchmark.avg_revenue_per_beneficiary).min(EFFICIENCY_RATIO_CAP);
    (ratio * EFFICIENCY_SCALE).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubScores {
    pub em_coding: f64,
    pub program_utilization: f64,
    pub revenue_efficiency: f64,
    pub service_diversity: f64,
    pub patient_volume: f64,
}

impl SubScores {
    pub fn compute(
        provider: &ProviderRow,
        benchmark: &SpecialtyBenchmark,
        distinct_codes: i64,
    ) -> Self {
        Self {
            em_coding: em_coding_score(provider, benchmark),
            program_utilization: program_utilization_score(provider, benchmark),
            revenue_efficiency: revenue_efficiency_score(provider, benchmark),
            service_diversity: service_diversity_score(distinct_codes),
            patient_volume: patient_volume_score(provider, benchmark),
        }
    }

    pub fn composite(&self) -> u8 {
        let weighted = WEIGHT_EM * self.em_coding
            + WEIGHT_PROGRAMS * self.program_utilization
            + WEIGHT_EFFICIENCY * self.revenue_efficiency
            + WEIGHT_DIVERSITY * self.service_diversity
            + WEIGHT_VOLUME * self.patient_volume;
        if weighted.is_nan() {
            return NEUTRAL as u8;
        }
        weighted.round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    pub scored: u64,
    pub fallback_benchmark_used: u64,
    /// Bucket `i` holds scores in `[10i, 10i + 9]`; 100 lands in the last.
    pub histogram: [u64; 10],
    pub mean: f64,
}

/// Scores every provider in identifier order, one transaction per page.
pub fn score_store(store: &mut EmbeddedStore, page_size: usize) -> Result<ScoreReport> {
    let distinct_codes = store.distinct_code_counts()?;
    let benchmarks = store.benchmarks()?;
    let total = store.table_counts()?.providers;
    info!(
        "Scoring {} providers against {} benchmarks",
        format_count(total as usize),
        benchmarks.len()
    );

    let progress = ProgressBar::new(total as u64);
    progress.set_prefix("SCORE");
    apply_bar_style(&progress, ITEM_COUNTER);

    let mut report = ScoreReport {
        scored: 0,
        fallback_benchmark_used: 0,
        histogram: [0; 10],
        mean: 0.0,
    };
    let fallback = FALLBACK_BENCHMARK;
    let mut score_sum = 0u64;
    let mut after: Option<String> = None;
    loop {
        let page = store.provider_page(after.as_deref(), page_size.max(1))?;
        if page.is_empty() {
            break;
        }

        let patches: Vec<ScorePatch<'_>> = page
            .iter()
            .map(|provider| {
                let benchmark = match lookup_benchmark(&benchmarks, provider) {
                    Some(benchmark) => benchmark,
                    None => {
                        report.fallback_benchmark_used += 1;
                        &fallback
                    }
                };
                let distinct = distinct_codes.get(&provider.npi).copied().unwrap_or(0);
                let score = SubScores::compute(provider, benchmark, distinct).composite();
                report.histogram[usize::from(score / 10).min(9)] += 1;
                score_sum += u64::from(score);
                ScorePatch {
                    npi: &provider.npi,
                    revenue_score: score,
                }
            })
            .collect();
        store.apply_score_patches(&patches)?;

        report.scored += page.len() as u64;
        progress.set_position(report.scored);
        after = page.last().map(|provider| provider.npi.clone());
    }
    progress.finish_and_clear();

    if report.scored > 0 {
        report.mean = score_sum as f64 / report.scored as f64;
    }
    Ok(report)
}

fn lookup_benchmark<'b>(
    benchmarks: &'b BTreeMap<String, SpecialtyBenchmark>,
    provider: &ProviderRow,
) -> Option<&'b SpecialtyBenchmark> {
    provider
        .specialty_group
        .as_deref()
        .and_then(|group| benchmarks.get(group))
}

pub fn print_score_report(report: &ScoreReport) {
    let border = "+-----------+------------+------------------------------------------+";
    let widest = report.histogram.iter().copied().max().unwrap_or(0).max(1);
    println!();
    println!("{border}");
    println!("| {:<9} | {:>10} | {:<40} |", "SCORE", "PROVIDERS", "");
    println!("{border}");
    for (bucket, count) in report.histogram.iter().enumerate() {
        let low = bucket * 10;
        let high = if bucket == 9 { 100 } else { low + 9 };
        let bar = "#".repeat((*count * 40 / widest) as usize);
        println!(
            "| {:<9} | {:>10} | {:<40} |",
            format!("{low:>3}-{high:<3}"),
            format_count(*count as usize),
            bar
        );
    }
    println!("{border}");
    println!(
        "Scored {} providers, mean score {:.1} ({} used the fallback benchmark)",
        format_count(report.scored as usize),
        report.mean,
        format_count(report.fallback_benchmark_used as usize)
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{Cents, ProgramMetrics},
        package::{
            package_store,
            tests::{options, sample_extract, stage_dataset},
        },
    };

    fn row() -> ProviderRow {
        ProviderRow {
            npi: "1000000001".to_string(),
            last_org_name: "Kim".to_string(),
            first_name: "Lee".to_string(),
            credentials: "MD".to_string(),
            specialty: "Internal Medicine".to_string(),
            specialty_group: Some("Internal Medicine".to_string()),
            state: "OH".to_string(),
            city: "Akron".to_string(),
            total_services: 500.0,
            total_payment: Cents::from_dollars(50_000.0),
            total_beneficiaries: 100,
            em_levels: [0.0; 5],
            em_total: 0.0,
            programs: [ProgramMetrics::default(); 4],
            top_codes: "[]".to_string(),
            revenue_score: None,
        }
    }

    fn benchmark() -> SpecialtyBenchmark {
        SpecialtyBenchmark {
            specialty: "Internal Medicine".to_string(),
            provider_count: 40,
            avg_beneficiaries: 100.0,
            avg_payment: 50_000.0,
            avg_revenue_per_beneficiary: 500.0,
            avg_services: 400.0,
            pct_level3: 0.5,
            pct_level4: 0.3,
            pct_level5: 0.1,
            program_adoption: [0.2, 0.0, 0.005, 0.4],
        }
    }

    #[test]
    fn payment_at_expectation_scores_sixty_seven() {
        let score = revenue_efficiency_score(&row(), &benchmark());
        assert!((score - 66.7).abs() < 1e-9, "{score}");
        assert_eq!(score.round(), 67.0);
    }

    #[test]
    fn efficiency_ratio_is_capped() {
        let mut provider = row();
        provider.total_payment = Cents::from_dollars(500_000.0);
        assert!((revenue_efficiency_score(&provider, &benchmark()) - 100.0).abs() < 1e-9);
        assert!((patient_volume_score(&provider, &benchmark()) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn empty_provider_hits_neutral_fallbacks() {
        let mut provider = row();
        provider.total_beneficiaries = 0;
        provider.total_payment = Cents(0);
        let bench = benchmark();

        assert_eq!(em_coding_score(&provider, &bench), 50.0);
        assert_eq!(revenue_efficiency_score(&provider, &bench), 50.0);
        assert_eq!(patient_volume_score(&provider, &bench), 50.0);

        let mut no_programs = bench.clone();
        no_programs.program_adoption = [0.0; 4];
        assert_eq!(program_utilization_score(&provider, &no_programs), 50.0);

        let scores = SubScores::compute(&provider, &no_programs, 0);
        // 0.25*50 + 0.25*50 + 0.2*50 + 0.15*15 + 0.15*50
        assert_eq!(scores.composite(), 45);
    }

    #[test]
    fn zero_benchmark_shares_count_as_parity() {
        let mut provider = row();
        provider.em_levels = [0.0, 0.0, 50.0, 30.0, 20.0];
        provider.em_total = 100.0;
        let mut bench = benchmark();
        bench.pct_level4 = 0.0;
        bench.pct_level5 = 0.0;
        let score = em_coding_score(&provider, &bench);
        assert!((score - 100.0 / 1.2).abs() < 1e-9, "{score}");
    }

    #[test]
    fn only_relevant_programs_count() {
        let mut provider = row();
        provider.programs[ProgramGroup::ChronicCareManagement.index()] = ProgramMetrics {
            services: 12.0,
            payment: Cents(50_400),
        };
        // BHI is below 1% adoption, so billing it changes nothing.
        provider.programs[ProgramGroup::BehavioralHealthIntegration.index()].services = 3.0;
        let score = program_utilization_score(&provider, &benchmark());
        assert!((score - 25.0 / 65.0 * 100.0).abs() < 1e-9, "{score}");
    }

    #[test]
    fn diversity_steps() {
        let steps: Vec<f64> = [0, 2, 3, 6, 10, 15, 19, 20, 300]
            .into_iter()
            .map(service_diversity_score)
            .collect();
        assert_eq!(steps, vec![15.0, 15.0, 35.0, 55.0, 70.0, 85.0, 85.0, 100.0, 100.0]);
    }

    #[test]
    fn composite_stays_in_range_for_extremes() {
        let bench = benchmark();
        let mut high = row();
        high.total_payment = Cents::from_dollars(1e12);
        high.em_levels = [0.0, 0.0, 0.0, 5e8, 5e8];
        high.em_total = 1e9;
        for program in &mut high.programs {
            program.services = 1.0;
        }
        assert_eq!(SubScores::compute(&high, &bench, 1_000).composite(), 100);

        let mut low = row();
        low.total_payment = Cents(0);
        low.em_levels = [1e6, 0.0, 0.0, 0.0, 0.0];
        low.em_total = 1e6;
        let score = SubScores::compute(&low, &bench, 0).composite();
        // Only the diversity floor of 15 contributes.
        assert_eq!(score, 2);
    }

    #[test]
    fn repackaging_and_rescoring_is_idempotent() {
        let dir = tempfile::tempdir().expect("tmp");
        let paths = stage_dataset(dir.path(), &sample_extract());

        let mut runs = Vec::new();
        for _ in 0..2 {
            package_store(&paths, &options()).expect("package");
            let mut store = EmbeddedStore::open(&paths.store_path).expect("open");
            let report = score_store(&mut store, 7).expect("score");
            assert_eq!(report.scored, 20);
            assert_eq!(report.histogram.iter().sum::<u64>(), 20);
            assert_eq!(report.fallback_benchmark_used, 8);

            let rows = store.provider_page(None, 100).expect("rows");
            assert!(rows.iter().all(|r| matches!(r.revenue_score, Some(0..=100))));
            let scores: Vec<(String, Option<i64>)> =
                rows.into_iter().map(|r| (r.npi, r.revenue_score)).collect();
            runs.push((store.table_counts().expect("counts"), scores));
        }
        assert_eq!(runs[0], runs[1]);
    }
}
