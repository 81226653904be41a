use std::collections::BTreeMap;

use crate::{
    codes::{PROGRAM_COUNT, ProgramGroup},
    common::format_count,
    ingest::SpecialtyAccumulator,
    model::SpecialtyBenchmark,
};

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Derives one benchmark per canonical specialty with at least
/// `min_providers` providers. Smaller specialties are dropped.
pub fn build_benchmarks(
    accumulators: &BTreeMap<String, SpecialtyAccumulator>,
    min_providers: usize,
) -> BTreeMap<String, SpecialtyBenchmark> {
    accumulators
        .iter()
        .filter(|(_, acc)| acc.provider_count >= min_providers as i64)
        .map(|(specialty, acc)| {
            let providers = acc.provider_count as f64;
            let payment = acc.payment.dollars();
            let mut program_adoption = [0.0; PROGRAM_COUNT];
            for (slot, count) in program_adoption.iter_mut().zip(acc.program_providers) {
                *slot = ratio(count as f64, providers);
            }
            let benchmark = SpecialtyBenchmark {
                specialty: specialty.clone(),
                provider_count: acc.provider_count,
                avg_beneficiaries: ratio(acc.beneficiaries as f64, providers),
                avg_payment: ratio(payment, providers),
                avg_revenue_per_beneficiary: ratio(payment, acc.beneficiaries as f64),
                avg_services: ratio(acc.services, providers),
                pct_level3: ratio(acc.em_level3, acc.em_total),
                pct_level4: ratio(acc.em_level4, acc.em_total),
                pct_level5: ratio(acc.em_level5, acc.em_total),
                program_adoption,
            };
            (specialty.clone(), benchmark)
        })
        .collect()
}

pub fn print_benchmark_table(benchmarks: &BTreeMap<String, SpecialtyBenchmark>) {
    let mut rows: Vec<&SpecialtyBenchmark> = benchmarks.values().collect();
    rows.sort_by(|a, b| {
        b.provider_count
            .cmp(&a.provider_count)
            .then_with(|| a.specialty.cmp(&b.specialty))
    });

    let border = "+------------------------------------+-----------+------------+--------------+--------+--------+--------+";
    println!();
    println!("{border}");
    println!(
        "| {:<34} | {:>9} | {:>10} | {:>12} | {:>6} | {:>6} | {:>6} |",
        "SPECIALTY", "PROVIDERS", "AVG BENES", "AVG PAYMENT", "L3 %", "L4 %", "L5 %"
    );
    println!("{border}");
    for row in &rows {
        println!(
            "| {:<34} | {:>9} | {:>10.1} | {:>12.2} | {:>6.1} | {:>6.1} | {:>6.1} |",
            truncate(&row.specialty, 34),
            format_count(row.provider_count as usize),
            row.avg_beneficiaries,
            row.avg_payment,
            row.pct_level3 * 100.0,
            row.pct_level4 * 100.0,
            row.pct_level5 * 100.0,
        );
    }
    println!("{border}");
    let adoption: Vec<String> = ProgramGroup::ALL
        .iter()
        .map(|group| {
            let adopting = rows
                .iter()
                .filter(|row| row.adoption(*group) > 0.0)
                .count();
            format!("{} in {adopting}", group.column_prefix())
        })
        .collect();
    println!(
        "{} specialties benchmarked; programs billed: {}",
        rows.len(),
        adoption.join(", ")
    );
    println!();
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}
