//! Deterministic eligibility rules applied to every extracted draft.
//!
//! Hard gates run in order and stop at the first failure:
//! 1. degree held, and not a diploma/certificate-only qualification
//! 2. some connection to the origin country
//!
//! The registry gate and the experience signals only ever add flags.

use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::pipeline::registry::InstitutionMatch;
use crate::pipeline::types::CandidateDraft;

pub const FLAG_REGISTRY_MISS: &str = "possible missing registry variant";
pub const FLAG_NEW_GRADUATE: &str = "may be student/new graduate";
pub const FLAG_LIMITED_EXPERIENCE: &str = "limited experience";

/// What counts as "from" the origin country.
#[derive(Debug, Clone)]
pub struct OriginProfile {
    /// Lowercased names and abbreviations matched exactly.
    identity_tokens: Vec<&'static str>,
    /// Country name, major cities and provinces, matched on word boundaries.
    location_pattern: Regex,
}

impl OriginProfile {
    pub fn south_africa() -> Self {
        Self {
            identity_tokens: vec![
                "south africa",
                "south african",
                "republic of south africa",
                "sa",
                "rsa",
                "za",
                "zaf",
                "mzansi",
            ],
            location_pattern: Regex::new(
                r"(?i)\b(south africa|johannesburg|joburg|jhb|cape town|durban|pretoria|tshwane|port elizabeth|gqeberha|bloemfontein|east london|pietermaritzburg|polokwane|mbombela|nelspruit|kimberley|soweto|sandton|centurion|midrand|randburg|roodepoort|stellenbosch|potchefstroom|rustenburg|makhanda|grahamstown|gauteng|western cape|eastern cape|northern cape|kwazulu[- ]natal|kzn|free state|limpopo|mpumalanga|north west)\b",
            )
            .unwrap(),
        }
    }

    pub fn is_identity(&self, text: &str) -> bool {
        let t = text
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
            .replace('.', "");
        self.identity_tokens.iter().any(|tok| *tok == t)
    }

    pub fn location_matches(&self, text: &str) -> bool {
        self.is_identity(text) || self.location_pattern.is_match(text)
    }
}

/// Which origin signals fired for a draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OriginSignals {
    pub country_list: bool,
    pub degree_country: bool,
    pub current_location: bool,
    pub institution: bool,
}

impl OriginSignals {
    pub fn any(&self) -> bool {
        self.country_list || self.degree_country || self.current_location || self.institution
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Flag,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
    /// Soft flags, persisted with the candidate. Empty on reject.
    pub flags: Vec<String>,
    pub signals: OriginSignals,
}

impl Verdict {
    /// Audit context carrying the inputs the decision was made on.
    pub fn context(&self, draft: &CandidateDraft, registry: &InstitutionMatch) -> serde_json::Value {
        json!({
            "has_degree": draft.has_degree,
            "qualification_type": draft.qualification_type.as_str(),
            "institution": draft.institution,
            "registry_match": registry,
            "degree_country": draft.degree_country,
            "countries": draft.countries,
            "current_location": draft.current_location,
            "signals": self.signals,
            "years_experience": draft.years_experience,
            "flags": self.flags,
        })
    }
}

pub struct EligibilityGate {
    origin: OriginProfile,
}

impl EligibilityGate {
    pub fn new(origin: OriginProfile) -> Self {
        Self { origin }
    }

    pub fn evaluate(&self, draft: &CandidateDraft, registry: &InstitutionMatch) -> Verdict {
        let signals = self.origin_signals(draft, registry);

        // Gate 1: degree
        if !draft.has_degree {
            return reject("no degree", signals);
        }
        if draft.qualification_type.is_sub_degree() {
            return reject(
                &format!("{}-only qualification", draft.qualification_type.as_str()),
                signals,
            );
        }

        // Gate 2: origin connection
        if !signals.any() {
            return reject("no South African connection", signals);
        }

        // Gate 3: registry (soft)
        let mut flags = Vec::new();
        let has_institution = draft
            .institution
            .as_deref()
            .is_some_and(|i| !i.trim().is_empty());
        if has_institution && registry.is_none() {
            flags.push(FLAG_REGISTRY_MISS.to_string());
        }

        if draft.years_experience < 1.0 {
            flags.push(FLAG_NEW_GRADUATE.to_string());
        } else if draft.years_experience < 2.0 {
            flags.push(FLAG_LIMITED_EXPERIENCE.to_string());
        }

        if flags.is_empty() {
            Verdict {
                decision: Decision::Pass,
                reason: "all gates passed".into(),
                flags,
                signals,
            }
        } else {
            Verdict {
                decision: Decision::Flag,
                reason: flags.join("; "),
                flags,
                signals,
            }
        }
    }

    fn origin_signals(&self, draft: &CandidateDraft, registry: &InstitutionMatch) -> OriginSignals {
        OriginSignals {
            country_list: draft.countries.iter().any(|c| self.origin.is_identity(c)),
            degree_country: draft
                .degree_country
                .as_deref()
                .is_some_and(|c| self.origin.is_identity(c)),
            current_location: draft
                .current_location
                .as_deref()
                .is_some_and(|l| self.origin.location_matches(l)),
            institution: registry.is_confident(),
        }
    }
}

fn reject(reason: &str, signals: OriginSignals) -> Verdict {
    Verdict {
        decision: Decision::Reject,
        reason: reason.to_string(),
        flags: Vec::new(),
        signals,
    }
}
