//! Resolution error classification
//!
//! The resolution tool only reports failures as free text. This module turns
//! that text into a [`ResolutionError`] through an ordered rule table: the
//! first rule whose pattern matches decides the outcome, and text that matches
//! nothing is an `ExternalFailure`. Operators can prepend their own rules from
//! configuration.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::{ResolutionError, RestrictionKind};

/// What a matching rule turns the failure into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    NotFound,
    CredentialsRequired,
    AccessBlocked,
    SessionExpired,
}

/// A configured rule: case-insensitive regex plus outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: String,
    pub outcome: RuleOutcome,
}

/// Built-in rules. Order matters: an expired session usually also mentions
/// cookies, so it has to be checked before the generic sign-in gate.
const DEFAULT_RULES: &[(&str, RuleOutcome)] = &[
    (
        r"cookies are no longer valid|session (has )?expired|expired session",
        RuleOutcome::SessionExpired,
    ),
    (
        r"sign in to confirm|use --cookies|login required|confirm your age|age[- ]restricted|members[- ]only|join this channel",
        RuleOutcome::CredentialsRequired,
    ),
    (
        r"not available in your country|blocked it in your country|geo[- ]?restrict|uploader has not made this video available|http error 403",
        RuleOutcome::AccessBlocked,
    ),
    (
        r"video unavailable|does not exist|private video|has been removed|incomplete youtube id|http error 404",
        RuleOutcome::NotFound,
    ),
];

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    outcome: RuleOutcome,
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<CompiledRule>,
}

impl ErrorClassifier {
    /// Built-in rules preceded by `extra` rules.
    pub fn with_rules(extra: &[ClassificationRule]) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(extra.len() + DEFAULT_RULES.len());
        for rule in extra {
            rules.push(CompiledRule {
                regex: compile(&rule.pattern)?,
                outcome: rule.outcome,
            });
        }
        for (pattern, outcome) in DEFAULT_RULES {
            rules.push(CompiledRule {
                regex: compile(pattern)?,
                outcome: *outcome,
            });
        }
        Ok(Self { rules })
    }

    /// Rule outcome for `message`, if any rule matches
    pub fn outcome(&self, message: &str) -> Option<RuleOutcome> {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(message))
            .map(|rule| rule.outcome)
    }

    /// Turn a failure message from the resolution tool into an error
    pub fn classify(&self, message: &str) -> ResolutionError {
        let message = message.trim().to_string();
        match self.outcome(&message) {
            Some(RuleOutcome::NotFound) => ResolutionError::NotFound { message },
            Some(RuleOutcome::CredentialsRequired) => ResolutionError::Restricted {
                kind: RestrictionKind::CredentialsRequired,
                message,
            },
            Some(RuleOutcome::AccessBlocked) => ResolutionError::Restricted {
                kind: RestrictionKind::AccessBlocked,
                message,
            },
            Some(RuleOutcome::SessionExpired) => ResolutionError::Restricted {
                kind: RestrictionKind::SessionExpired,
                message,
            },
            None => ResolutionError::ExternalFailure { message },
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_rules(&[]).expect("built-in classification rules are valid")
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ERROR: [youtube] abc: Video unavailable", Some(RuleOutcome::NotFound))]
    #[case("ERROR: [youtube] abc: Private video. Sign in if you've been granted access", Some(RuleOutcome::NotFound))]
    #[case(
        "ERROR: [youtube] abc: Sign in to confirm your age. This video may be inappropriate",
        Some(RuleOutcome::CredentialsRequired)
    )]
    #[case(
        "ERROR: [youtube] abc: Sign in to confirm you're not a bot. Use --cookies-from-browser",
        Some(RuleOutcome::CredentialsRequired)
    )]
    #[case(
        "ERROR: The uploader has not made this video available in your country",
        Some(RuleOutcome::AccessBlocked)
    )]
    #[case(
        "WARNING: The provided YouTube account cookies are no longer valid. Sign in to confirm",
        Some(RuleOutcome::SessionExpired)
    )]
    #[case("ERROR: unable to download webpage: timed out", None)]
    fn test_default_rules(#[case] message: &str, #[case] expected: Option<RuleOutcome>) {
        let classifier = ErrorClassifier::default();
        assert_eq!(classifier.outcome(message), expected);
    }

    #[test]
    fn test_extra_rules_take_precedence() {
        let classifier = ErrorClassifier::with_rules(&[ClassificationRule {
            pattern: "video unavailable".to_string(),
            outcome: RuleOutcome::AccessBlocked,
        }])
        .unwrap();

        assert_eq!(
            classifier.classify("Video unavailable"),
            ResolutionError::Restricted {
                kind: RestrictionKind::AccessBlocked,
                message: "Video unavailable".to_string(),
            }
        );
    }

    #[test]
    fn test_unmatched_is_external_failure() {
        let classifier = ErrorClassifier::default();
        assert!(matches!(
            classifier.classify("  something odd happened \n"),
            ResolutionError::ExternalFailure { message } if message == "something odd happened"
        ));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let result = ErrorClassifier::with_rules(&[ClassificationRule {
            pattern: "(unclosed".to_string(),
            outcome: RuleOutcome::NotFound,
        }]);
        assert!(result.is_err());
    }
}
