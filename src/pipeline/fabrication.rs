//! Fabricated / placeholder name screening.
//!
//! A static blocklist plus a couple of structural patterns. Deterministic,
//! so every rejection can be explained from the audit trail alone.

use std::collections::HashSet;

use regex::Regex;

/// Names that extraction has been seen to invent or copy from templates.
const KNOWN_FABRICATED: &[&str] = &[
    "john smith",
    "jane smith",
    "john doe",
    "jane doe",
    "sarah johnson",
    "michael johnson",
    "emily johnson",
    "david smith",
    "mary smith",
    "james smith",
    "joe bloggs",
    "lorem ipsum",
];

/// Template labels that occasionally come back as the "name".
const PLACEHOLDER_PHRASES: &[&str] = &[
    "name",
    "candidate",
    "candidate name",
    "full name",
    "your name",
    "applicant",
    "applicant name",
    "first name",
    "last name",
    "first name last name",
    "name surname",
    "firstname lastname",
    "name and surname",
    "unknown",
    "not provided",
    "n/a",
    "na",
    "none",
];

/// Lowercase, trim, collapse internal whitespace.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Result of screening one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screening {
    Pass,
    Reject(String),
}

impl Screening {
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}

pub struct FabricationScreen {
    blocklist: HashSet<&'static str>,
    placeholders: HashSet<&'static str>,
    placeholder_prefix: Regex,
}

impl Default for FabricationScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricationScreen {
    pub fn new() -> Self {
        Self {
            blocklist: KNOWN_FABRICATED.iter().copied().collect(),
            placeholders: PLACEHOLDER_PHRASES.iter().copied().collect(),
            placeholder_prefix: Regex::new(r"^(test|sample|example|dummy|fake|placeholder)\b")
                .unwrap(),
        }
    }

    pub fn screen(&self, name: &str) -> Screening {
        let normalized = normalize_name(name);

        if self.blocklist.contains(normalized.as_str()) {
            return Screening::Reject(format!("known fabricated name '{normalized}'"));
        }
        if normalized.chars().count() < 3 {
            return Screening::Reject("name shorter than 3 characters".into());
        }
        if self.placeholder_prefix.is_match(&normalized) {
            return Screening::Reject(format!("placeholder prefix in '{normalized}'"));
        }
        let bare = normalized.trim_matches(|c: char| !c.is_alphanumeric() && c != '/');
        if self.placeholders.contains(bare) {
            return Screening::Reject(format!("placeholder phrase '{normalized}'"));
        }
        Screening::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklisted_names_rejected_in_any_case() {
        let screen = FabricationScreen::new();
        assert!(screen.screen("John Smith").is_reject());
        assert!(screen.screen("  SARAH   johnson ").is_reject());
        assert!(screen.screen("jane doe").is_reject());
    }

    #[test]
    fn short_names_rejected() {
        let screen = FabricationScreen::new();
        assert_eq!(
            screen.screen(" Al "),
            Screening::Reject("name shorter than 3 characters".into())
        );
        assert!(screen.screen("X").is_reject());
    }

    #[test]
    fn placeholder_prefixes_rejected() {
        let screen = FabricationScreen::new();
        for name in ["Test Candidate", "sample person", "Example Name", "dummy", "Fake Teacher", "Placeholder"] {
            assert!(screen.screen(name).is_reject(), "{name}");
        }
    }

    #[test]
    fn prefix_must_be_a_whole_word() {
        let screen = FabricationScreen::new();
        assert_eq!(screen.screen("Testament Nkosi"), Screening::Pass);
        assert_eq!(screen.screen("Fakhri Ahmed"), Screening::Pass);
    }

    #[test]
    fn bare_placeholder_phrases_rejected() {
        let screen = FabricationScreen::new();
        for name in ["Candidate Name", "FULL NAME", "Name Surname", "[Your Name]", "N/A"] {
            assert!(screen.screen(name).is_reject(), "{name}");
        }
    }

    #[test]
    fn real_names_pass() {
        let screen = FabricationScreen::new();
        for name in [
            "Nomvula Dlamini",
            "Pieter van der Merwe",
            "Ayesha Patel",
            "Li Na",
            "John Smithers",
            "Thabo Mokoena",
            "Jan Jansen",
        ] {
            assert_eq!(screen.screen(name), Screening::Pass, "{name}");
        }
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_name("  Mary \t Ann\nJones "), "mary ann jones");
    }
}
