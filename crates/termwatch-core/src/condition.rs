//! Trigger conditions and the pure matcher.
//!
//! Matching is total: malformed regexes, unsupported flags and
//! unknown condition types all degrade to a non-match with a warning.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text condition evaluated against a captured viewport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Substring present.
    Contains { pattern: String },
    /// Regex matches somewhere in the text.
    Regex {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
    },
    /// Substring absent.
    NotContains { pattern: String },
    /// Any `type` this build does not know. Never matches.
    #[serde(other)]
    Unsupported,
}

impl TriggerCondition {
    /// The configured pattern, if the condition carries one.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            Self::Contains { pattern }
            | Self::Regex { pattern, .. }
            | Self::NotContains { pattern } => Some(pattern),
            Self::Unsupported => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("invalid regex {pattern:?}: {detail}")]
    InvalidRegex { pattern: String, detail: String },

    #[error("unsupported regex flag {0:?}")]
    UnsupportedFlag(char),
}

/// Compile a regex using JS-style flag letters.
///
/// `i`, `m`, `s`, `x` and `u` map onto [`RegexBuilder`] options; `g` and `y`
/// have no meaning for a presence test and are ignored.
pub fn compile_regex(pattern: &str, flags: Option<&str>) -> Result<Regex, ConditionError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.unwrap_or_default().chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'u' => {
                builder.unicode(true);
            }
            'g' | 'y' => {}
            c if c.is_whitespace() => {}
            other => return Err(ConditionError::UnsupportedFlag(other)),
        }
    }
    builder.build().map_err(|e| ConditionError::InvalidRegex {
        pattern: pattern.to_string(),
        detail: e.to_string(),
    })
}

/// A condition prepared for repeated evaluation.
///
/// Regexes compile once here; an invalid or unsupported condition warns once
/// and then never matches.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    source: TriggerCondition,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    NotContains(String),
    Regex(Regex),
    Never,
}

impl CompiledCondition {
    pub fn compile(condition: &TriggerCondition) -> Self {
        let matcher = match condition {
            TriggerCondition::Contains { pattern } => Matcher::Contains(pattern.clone()),
            TriggerCondition::NotContains { pattern } => Matcher::NotContains(pattern.clone()),
            TriggerCondition::Regex { pattern, flags } => {
                match compile_regex(pattern, flags.as_deref()) {
                    Ok(re) => Matcher::Regex(re),
                    Err(e) => {
                        tracing::warn!("watcher condition treated as non-match: {e}");
                        Matcher::Never
                    }
                }
            }
            TriggerCondition::Unsupported => {
                tracing::warn!("unsupported watcher condition type, treated as non-match");
                Matcher::Never
            }
        };
        Self {
            source: condition.clone(),
            matcher,
        }
    }

    /// The condition this was compiled from.
    pub fn source(&self) -> &TriggerCondition {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Contains(pattern) => text.contains(pattern.as_str()),
            Matcher::NotContains(pattern) => !text.contains(pattern.as_str()),
            Matcher::Regex(re) => re.is_match(text),
            Matcher::Never => false,
        }
    }
}

/// Evaluate `condition` against `text` once. Callers evaluating the same
/// condition repeatedly should hold a [`CompiledCondition`].
pub fn match_condition(condition: &TriggerCondition, text: &str) -> bool {
    CompiledCondition::compile(condition).is_match(text)
}
