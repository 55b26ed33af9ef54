//! Institution name normalization and registry matching.

use serde::Serialize;

/// Shortest variant allowed to match as a substring of the input.
const MIN_CONTAINED_LEN: usize = 4;
/// Shortest input allowed to match as a substring of a variant.
const MIN_BROAD_INPUT_LEN: usize = 6;

/// Lowercase, punctuation to spaces, collapse whitespace, drop a leading "the ".
pub fn normalize_institution(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.strip_prefix("the ") {
        Some(rest) => rest.to_string(),
        None => collapsed,
    }
}

/// How strongly an institution name matched the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "canonical", rename_all = "snake_case")]
pub enum InstitutionMatch {
    /// Normalized input equals a variant.
    Exact(String),
    /// Input contains a variant ("university of cape town faculty of education").
    Contained(String),
    /// A variant contains the input ("witwatersrand").
    Broad(String),
    None,
}

impl InstitutionMatch {
    /// Strong enough to count as a national-origin connection.
    pub fn is_confident(&self) -> bool {
        matches!(self, Self::Exact(_) | Self::Contained(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn canonical(&self) -> Option<&str> {
        match self {
            Self::Exact(c) | Self::Contained(c) | Self::Broad(c) => Some(c),
            Self::None => None,
        }
    }
}

/// Find the best match for `input` among `(canonical, variant)` pairs.
///
/// Variants are expected to be normalized already. Exact beats contained,
/// contained beats broad; among contained matches the longest variant wins.
pub fn best_match<'a, I>(input: &str, entries: I) -> InstitutionMatch
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let needle = normalize_institution(input);
    if needle.is_empty() {
        return InstitutionMatch::None;
    }

    let mut contained: Option<(&str, usize)> = None;
    let mut broad: Option<&str> = None;

    for (canonical, variant) in entries {
        if variant == needle {
            return InstitutionMatch::Exact(canonical.to_string());
        }
        if variant.len() >= MIN_CONTAINED_LEN && contains_words(&needle, variant) {
            if contained.is_none_or(|(_, len)| variant.len() > len) {
                contained = Some((canonical, variant.len()));
            }
        } else if broad.is_none()
            && needle.len() >= MIN_BROAD_INPUT_LEN
            && contains_words(variant, &needle)
        {
            broad = Some(canonical);
        }
    }

    if let Some((canonical, _)) = contained {
        InstitutionMatch::Contained(canonical.to_string())
    } else if let Some(canonical) = broad {
        InstitutionMatch::Broad(canonical.to_string())
    } else {
        InstitutionMatch::None
    }
}

/// Substring test aligned to word boundaries, so "wits" never hits "witsieshoek".
fn contains_words(haystack: &str, needle: &str) -> bool {
    let padded_hay = format!(" {haystack} ");
    let padded_needle = format!(" {needle} ");
    padded_hay.contains(&padded_needle)
}
