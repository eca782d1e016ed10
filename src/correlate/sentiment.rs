//! Reply sentiment classification.

use regex::{Regex, RegexBuilder};

use crate::store::Sentiment;

/// Classifies the sentiment of an inbound reply.
pub trait SentimentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Sentiment;
}

const POSITIVE: &[&str] = &[
    "yes", "yeah", "yep", "sure", "interested", "ok", "okay", "great", "sounds good",
    "call me", "tell me more", "love", "thanks", "thank you", "please", "absolutely",
    "definitely",
];

const NEGATIVE: &[&str] = &[
    "no", "nope", "not interested", "no thanks", "no thank you", "wrong number", "never",
    "scam", "spam", "leave me alone", "go away", "don't", "dont", "annoying", "hate",
];

/// Keyword-counting classifier.
///
/// Counts whole-word keyword hits; more positive than negative is positive,
/// more negative is negative, anything else (ties included) neutral. Phrases
/// win over the words inside them, so "not interested" counts once, as
/// negative.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    pattern: Option<Regex>,
}

impl KeywordClassifier {
    pub fn new<S: AsRef<str>>(positive: &[S], negative: &[S]) -> Result<Self, regex::Error> {
        let groups: Vec<String> = [("neg", alternation(negative)), ("pos", alternation(positive))]
            .into_iter()
            .filter(|(_, alt)| !alt.is_empty())
            .map(|(name, alt)| format!("(?P<{name}>{alt})"))
            .collect();

        if groups.is_empty() {
            return Ok(Self { pattern: None });
        }

        let pattern = RegexBuilder::new(&format!(r"\b(?:{})\b", groups.join("|")))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// Classifier with the built-in keyword sets.
    pub fn with_defaults() -> Result<Self, regex::Error> {
        Self::new(POSITIVE, NEGATIVE)
    }

    /// Positive and negative hit counts.
    pub fn score(&self, text: &str) -> (usize, usize) {
        let Some(pattern) = &self.pattern else {
            return (0, 0);
        };
        pattern
            .captures_iter(text)
            .fold((0, 0), |(pos, neg), caps| {
                if caps.name("neg").is_some() {
                    (pos, neg + 1)
                } else {
                    (pos + 1, neg)
                }
            })
    }
}

impl SentimentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Sentiment {
        let (pos, neg) = self.score(text);
        match pos.cmp(&neg) {
            std::cmp::Ordering::Greater => Sentiment::Positive,
            std::cmp::Ordering::Less => Sentiment::Negative,
            std::cmp::Ordering::Equal => Sentiment::Neutral,
        }
    }
}

/// Longest keywords first so phrases beat their own words.
fn alternation<S: AsRef<str>>(keywords: &[S]) -> String {
    let mut words: Vec<String> = keywords
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
    words.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    words.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c() -> KeywordClassifier {
        KeywordClassifier::with_defaults().unwrap()
    }

    #[test]
    fn test_positive_negative_neutral() {
        assert_eq!(c().classify("Yes, sounds good. Call me!"), Sentiment::Positive);
        assert_eq!(c().classify("No. Wrong number."), Sentiment::Negative);
        assert_eq!(c().classify("who is this"), Sentiment::Neutral);
    }

    #[test]
    fn test_tie_is_neutral() {
        assert_eq!(c().score("yes no"), (1, 1));
        assert_eq!(c().classify("yes no"), Sentiment::Neutral);
    }

    #[test]
    fn test_phrase_beats_inner_word() {
        assert_eq!(c().score("Not interested"), (0, 1));
        assert_eq!(c().score("no thanks"), (0, 1));
        assert_eq!(c().classify("not interested"), Sentiment::Negative);
    }

    #[test]
    fn test_whole_words_only() {
        // "know" and "nothing" must not count as "no".
        assert_eq!(c().score("I know nothing"), (0, 0));
    }

    #[test]
    fn test_custom_sets() {
        let k = KeywordClassifier::new(&["si"], &[] as &[&str]).unwrap();
        assert_eq!(k.classify("Si!"), Sentiment::Positive);
        assert_eq!(k.classify("no"), Sentiment::Neutral);
    }
}
