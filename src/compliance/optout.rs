//! Opt-out keyword detection.

use regex::{Regex, RegexBuilder};

use super::ComplianceError;

/// Detects opt-out requests in inbound message bodies.
///
/// Keywords match as whole words, case-insensitively. Multi-word keywords
/// ("opt out") tolerate any run of whitespace between words.
#[derive(Debug, Clone)]
pub struct OptOutDetector {
    pattern: Option<Regex>,
}

impl OptOutDetector {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Result<Self, ComplianceError> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(|k| {
                k.split_whitespace()
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(r"\s+")
            })
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }

        let pattern = RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// Check whether the body requests an opt-out.
    pub fn is_opt_out(&self, body: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(body))
    }

    /// The first keyword found, as written in the body.
    pub fn matched<'a>(&self, body: &'a str) -> Option<&'a str> {
        self.pattern.as_ref()?.find(body).map(|m| m.as_str())
    }
}
