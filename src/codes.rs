//! Billing code families the pipeline derives metrics from.
//!
//! E&M office visits come in five severity levels, each with a new-patient
//! (`9920n`) and an established-patient (`9921n`) code. Program groups are
//! fixed code-membership sets whose billing indicates the provider runs that
//! care-management service line.

pub const EM_LEVEL_COUNT: usize = 5;

const EM_LEVEL_CODES: [[&str; 2]; EM_LEVEL_COUNT] = [
    ["99201", "99211"],
    ["99202", "99212"],
    ["99203", "99213"],
    ["99204", "99214"],
    ["99205", "99215"],
];

/// 1-based E&M level for `code`, if it is an office visit code.
pub fn em_level(code: &str) -> Option<usize> {
    EM_LEVEL_CODES
        .iter()
        .position(|codes| codes.contains(&code))
        .map(|idx| idx + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramGroup {
    ChronicCareManagement,
    RemotePatientMonitoring,
    BehavioralHealthIntegration,
    AnnualWellnessVisit,
}

pub const PROGRAM_COUNT: usize = 4;

impl ProgramGroup {
    pub const ALL: [ProgramGroup; PROGRAM_COUNT] = [
        ProgramGroup::ChronicCareManagement,
        ProgramGroup::RemotePatientMonitoring,
        ProgramGroup::BehavioralHealthIntegration,
        ProgramGroup::AnnualWellnessVisit,
    ];

    pub fn index(self) -> usize {
        match self {
            ProgramGroup::ChronicCareManagement => 0,
            ProgramGroup::RemotePatientMonitoring => 1,
            ProgramGroup::BehavioralHealthIntegration => 2,
            ProgramGroup::AnnualWellnessVisit => 3,
        }
    }

    /// Column prefix used in both stores (`ccm_services`, `ccm_payment`, ...).
    pub fn column_prefix(self) -> &'static str {
        match self {
            ProgramGroup::ChronicCareManagement => "ccm",
            ProgramGroup::RemotePatientMonitoring => "rpm",
            ProgramGroup::BehavioralHealthIntegration => "bhi",
            ProgramGroup::AnnualWellnessVisit => "awv",
        }
    }

    pub fn codes(self) -> &'static [&'static str] {
        match self {
            ProgramGroup::ChronicCareManagement => {
                &["99490", "99491", "99487", "99489", "99439", "99437", "G0506"]
            }
            ProgramGroup::RemotePatientMonitoring => &["99453", "99454", "99457", "99458", "99091"],
            ProgramGroup::BehavioralHealthIntegration => {
                &["99484", "99492", "99493", "99494", "G0323"]
            }
            ProgramGroup::AnnualWellnessVisit => &["G0438", "G0439", "G0468"],
        }
    }

    /// Points awarded in program utilization scoring.
    pub fn score_weight(self) -> f64 {
        match self {
            ProgramGroup::ChronicCareManagement => 25.0,
            ProgramGroup::RemotePatientMonitoring => 20.0,
            ProgramGroup::BehavioralHealthIntegration => 15.0,
            ProgramGroup::AnnualWellnessVisit => 40.0,
        }
    }
}

pub fn program_for(code: &str) -> Option<ProgramGroup> {
    ProgramGroup::ALL
        .into_iter()
        .find(|group| group.codes().contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn em_levels_cover_new_and_established_visits() {
        assert_eq!(em_level("99211"), Some(1));
        assert_eq!(em_level("99204"), Some(4));
        assert_eq!(em_level("99215"), Some(5));
        assert_eq!(em_level("99216"), None);
        assert_eq!(em_level("G0438"), None);
    }

    #[test]
    fn program_sets_do_not_overlap() {
        for group in ProgramGroup::ALL {
            for code in group.codes() {
                assert_eq!(program_for(code), Some(group), "code {code}");
                assert_eq!(em_level(code), None, "code {code} is also E&M");
            }
        }
        assert_eq!(ProgramGroup::ALL.map(|g| g.index()), [0, 1, 2, 3]);
    }
}
