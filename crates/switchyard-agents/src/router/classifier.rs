//! Pattern-based query classification

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use switchyard_core::{Error, GENERAL_CATEGORY, Result};

/// Built-in rule table, in tie-break order. `code` precedes `technical`,
/// whose broad vocabulary would otherwise claim requests for code.
const DEFAULT_RULES: &[(&str, &[&str])] = &[
    (
        "code",
        &[
            r"\b(write|create|implement|build|develop)\s+(code|function|script|program)\b",
            r"\b(how to code|coding|snippet|example code)\b",
            r"```|\bdef\b|\bfunction\b|\bclass\b",
        ],
    ),
    (
        "technical",
        &[
            r"\b(api|code|function|class|method|algorithm|debug|error|exception)\b",
            r"\b(programming|software|development|implementation)\b",
            r"\b(python|java|javascript|typescript|c\+\+|rust|go)\b",
        ],
    ),
    (
        "medical",
        &[
            r"\b(patient|doctor|medical|disease|treatment|symptom|diagnosis)\b",
            r"\b(medicine|healthcare|clinical|hospital|pharmacy)\b",
        ],
    ),
    (
        "legal",
        &[
            r"\b(law|legal|court|judge|attorney|lawyer|contract|regulation)\b",
            r"\b(lawsuit|litigation|statute|compliance|jurisdiction)\b",
        ],
    ),
];

#[derive(Debug, Clone)]
struct CategoryRule {
    name: String,
    patterns: Vec<Regex>,
}

/// Result of classifying one query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub category: String,
    /// True when nothing matched and the query fell through to `general`
    pub fallback: bool,
}

/// Ordered category -> patterns table. The first category with any matching
/// pattern wins.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<CategoryRule>,
}

impl Classifier {
    /// Empty table: every query classifies as `general`
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut classifier = Self::new();
        for (name, patterns) in DEFAULT_RULES {
            // Built-in patterns are known to compile
            if let Err(e) = classifier.add_category(name, patterns) {
                tracing::error!("Invalid built-in pattern for '{}': {}", name, e);
            }
        }
        classifier
    }

    /// Add a category, or replace the patterns of an existing one in place
    pub fn add_category<S: AsRef<str>>(&mut self, name: &str, patterns: &[S]) -> Result<()> {
        let compiled = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::Config(format!("invalid pattern for category '{}': {}", name, e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        match self.rules.iter_mut().find(|r| r.name == name) {
            Some(rule) => rule.patterns = compiled,
            None => self.rules.push(CategoryRule {
                name: name.to_string(),
                patterns: compiled,
            }),
        }
        Ok(())
    }

    pub fn remove_category(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.rules.len() != before
    }

    pub fn categories(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn classify(&self, query: &str) -> Result<Classification> {
        if query.trim().is_empty() {
            return Err(Error::Classification("query is empty".to_string()));
        }

        let matched = self
            .rules
            .iter()
            .find(|rule| rule.patterns.iter().any(|p| p.is_match(query)));

        Ok(match matched {
            Some(rule) => Classification {
                category: rule.name.clone(),
                fallback: false,
            },
            None => Classification {
                category: GENERAL_CATEGORY.to_string(),
                fallback: true,
            },
        })
    }
}
