use serde::{Deserialize, Serialize};
use std::{
    iter::Sum,
    ops::{Add, AddAssign},
};

use crate::codes::{EM_LEVEL_COUNT, PROGRAM_COUNT, ProgramGroup};

/// Money in integer cents.
///
/// Payments are accumulated and stored in cents so that a provider's code
/// rows sum to its total exactly, in memory and in both stores. Dollars are
/// only used for score ratios and printed reports.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub fn from_dollars(dollars: f64) -> Self {
        Cents((dollars * 100.0).round() as i64)
    }

    pub fn dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Cents {
    type Output = Cents;

    fn add(self, rhs: Cents) -> Cents {
        Cents(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) {
        self.0 += rhs.0;
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        iter.fold(Cents::default(), Add::add)
    }
}

/// One provider × billing code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBreakdown {
    pub code: String,
    pub services: f64,
    pub payment: Cents,
    pub beneficiaries: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmBreakdown {
    /// Service counts for levels 1 through 5.
    pub levels: [f64; EM_LEVEL_COUNT],
    pub total: f64,
}

impl EmBreakdown {
    pub fn level(&self, level: usize) -> f64 {
        self.levels[level - 1]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramMetrics {
    pub services: f64,
    pub payment: Cents,
}

impl ProgramMetrics {
    pub fn is_billed(&self) -> bool {
        self.services > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAggregate {
    pub npi: String,
    pub last_org_name: String,
    pub first_name: String,
    pub credentials: String,
    /// Provider type label exactly as supplied by the source.
    pub specialty: String,
    /// Canonical specialty, `None` when the label has no mapping.
    pub specialty_group: Option<String>,
    pub state: String,
    pub city: String,
    pub total_services: f64,
    pub total_payment: Cents,
    /// Largest per-code beneficiary count; per-code populations overlap.
    pub total_beneficiaries: i64,
    pub em: EmBreakdown,
    pub programs: [ProgramMetrics; PROGRAM_COUNT],
    /// Highest-payment codes, a truncated read cache of `codes`.
    pub top_codes: Vec<CodeBreakdown>,
    /// Every code billed, sorted by code.
    pub codes: Vec<CodeBreakdown>,
    #[serde(default)]
    pub revenue_score: Option<u8>,
}

impl ProviderAggregate {
    pub fn program(&self, group: ProgramGroup) -> &ProgramMetrics {
        &self.programs[group.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialtyBenchmark {
    pub specialty: String,
    pub provider_count: i64,
    pub avg_beneficiaries: f64,
    pub avg_payment: f64,
    pub avg_revenue_per_beneficiary: f64,
    pub avg_services: f64,
    pub pct_level3: f64,
    pub pct_level4: f64,
    pub pct_level5: f64,
    /// Fraction of the specialty's providers billing each program, in
    /// `ProgramGroup::ALL` order.
    pub program_adoption: [f64; PROGRAM_COUNT],
}

impl SpecialtyBenchmark {
    pub fn adoption(&self, group: ProgramGroup) -> f64 {
        self.program_adoption[group.index()]
    }
}
