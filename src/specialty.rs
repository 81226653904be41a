use anyhow::{Context, Result, ensure};
use std::{collections::HashMap, fs, path::Path};

/// Raw source provider-type label → canonical specialty name.
///
/// Passed into the ingestor so the table can be swapped per run
/// (`--specialty-map`) or built by hand in tests.
#[derive(Debug, Clone)]
pub struct SpecialtyMap {
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
}

const DEFAULT_MAPPINGS: &[(&str, &str)] = &[
    ("Internal Medicine", "Internal Medicine"),
    ("Family Practice", "Family Medicine"),
    ("Family Medicine", "Family Medicine"),
    ("General Practice", "Family Medicine"),
    ("Geriatric Medicine", "Geriatric Medicine"),
    ("Preventive Medicine", "Preventive Medicine"),
    ("Hospitalist", "Hospitalist"),
    ("Nurse Practitioner", "Nurse Practitioner"),
    ("Physician Assistant", "Physician Assistant"),
    ("Certified Clinical Nurse Specialist", "Nurse Practitioner"),
    ("Cardiology", "Cardiology"),
    ("Interventional Cardiology", "Cardiology"),
    ("Cardiac Electrophysiology", "Cardiology"),
    ("Advanced Heart Failure and Transplant Cardiology", "Cardiology"),
    ("Endocrinology", "Endocrinology"),
    ("Gastroenterology", "Gastroenterology"),
    ("Nephrology", "Nephrology"),
    ("Pulmonary Disease", "Pulmonology"),
    ("Critical Care (Intensivists)", "Pulmonology"),
    ("Rheumatology", "Rheumatology"),
    ("Infectious Disease", "Infectious Disease"),
    ("Allergy/ Immunology", "Allergy & Immunology"),
    ("Allergy/Immunology", "Allergy & Immunology"),
    ("Hematology-Oncology", "Oncology"),
    ("Medical Oncology", "Oncology"),
    ("Hematology", "Oncology"),
    ("Neurology", "Neurology"),
    ("Psychiatry", "Psychiatry"),
    ("Geriatric Psychiatry", "Psychiatry"),
    ("Neuropsychiatry", "Psychiatry"),
    ("Clinical Psychologist", "Behavioral Health"),
    ("Psychologist, Clinical", "Behavioral Health"),
    ("Licensed Clinical Social Worker", "Behavioral Health"),
    ("Obstetrics & Gynecology", "Obstetrics & Gynecology"),
    ("Obstetrics/Gynecology", "Obstetrics & Gynecology"),
    ("Gynecological Oncology", "Obstetrics & Gynecology"),
    ("Dermatology", "Dermatology"),
    ("Ophthalmology", "Ophthalmology"),
    ("Optometry", "Optometry"),
    ("Otolaryngology", "Otolaryngology"),
    ("Urology", "Urology"),
    ("Orthopedic Surgery", "Orthopedic Surgery"),
    ("Sports Medicine", "Orthopedic Surgery"),
    ("General Surgery", "General Surgery"),
    ("Vascular Surgery", "Vascular Surgery"),
    ("Physical Medicine and Rehabilitation", "Physical Medicine & Rehabilitation"),
    ("Pain Management", "Pain Management"),
    ("Interventional Pain Management", "Pain Management"),
    ("Podiatry", "Podiatry"),
    ("Emergency Medicine", "Emergency Medicine"),
    ("Pediatric Medicine", "Pediatrics"),
    ("Osteopathic Manipulative Medicine", "Family Medicine"),
];

impl Default for SpecialtyMap {
    fn default() -> Self {
        Self::from_pairs(
            DEFAULT_MAPPINGS
                .iter()
                .map(|(raw, canonical)| (raw.to_string(), canonical.to_string())),
        )
    }
}

impl SpecialtyMap {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut exact = HashMap::new();
        let mut folded = HashMap::new();
        for (raw, canonical) in pairs {
            let raw = raw.trim().to_string();
            let canonical = canonical.trim().to_string();
            if raw.is_empty() || canonical.is_empty() {
                continue;
            }
            folded.insert(raw.to_lowercase(), canonical.clone());
            exact.insert(raw, canonical);
        }
        Self { exact, folded }
    }

    /// Loads a JSON object of `{"raw label": "canonical name"}` pairs.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed reading specialty map {}", path.display()))?;
        let pairs: HashMap<String, String> = serde_json::from_str(&text)
            .with_context(|| format!("Failed parsing specialty map {}", path.display()))?;
        let map = Self::from_pairs(pairs);
        ensure!(
            !map.is_empty(),
            "Specialty map {} contains no usable mappings",
            path.display()
        );
        Ok(map)
    }

    pub fn canonical(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        self.exact
            .get(raw)
            .or_else(|| self.folded.get(&raw.to_lowercase()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_trimmed_then_case_insensitive() {
        let map = SpecialtyMap::default();
        assert_eq!(map.canonical("Family Practice"), Some("Family Medicine"));
        assert_eq!(map.canonical("  family practice "), Some("Family Medicine"));
        assert_eq!(map.canonical("Chiropractic"), None);
        assert_eq!(map.canonical(""), None);
    }

    #[test]
    fn json_file_replaces_the_builtin_table() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("map.json");
        fs::write(&path, r#"{"Chiropractic": "Chiropractic", "  ": "ignored"}"#).expect("write");

        let map = SpecialtyMap::from_json_file(&path).expect("load");
        assert_eq!(map.len(), 1);
        assert_eq!(map.canonical("chiropractic"), Some("Chiropractic"));
        assert_eq!(map.canonical("Internal Medicine"), None);
    }

    #[test]
    fn malformed_json_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("map.json");
        fs::write(&path, "[1, 2]").expect("write");
        assert!(SpecialtyMap::from_json_file(&path).is_err());
    }
}
